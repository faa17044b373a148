//-
// Copyright (c) 2026, the berth authors
//
// This file is part of berth.
//
// berth is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// berth is distributed  in the hope that  it will be  useful, but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// berth. If not, see <http://www.gnu.org/licenses/>.

//! Message-mutating commands: APPEND, STORE, COPY, MOVE, EXPUNGE, and
//! UID EXPUNGE.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset};

use super::{CmdResult, Session};
use crate::command::sequence::SeqSet;
use crate::command::StoreCommand;
use crate::model::{Flag, FlagSet, MessageId, Uid};
use crate::response::{
    compress_uid_set, FetchItem, RespCode, Response,
};
use crate::support::error::Error;

impl Session {
    pub(super) async fn cmd_append(
        &mut self,
        mailbox: &str,
        flags: FlagSet,
        date: Option<DateTime<FixedOffset>>,
        literal: Vec<u8>,
    ) -> CmdResult {
        let user = Arc::clone(self.authenticated()?);
        let _guard = user.lock.write().await;

        match user.append(mailbox, &flags, date, &literal) {
            Ok((validity, uid)) => Ok(Response::ok_code(
                RespCode::AppendUid {
                    validity: validity.get(),
                    uid: uid.get(),
                },
                "APPEND",
            )),
            Err(Error::NxMailbox) => Err(Response::no_code(
                RespCode::TryCreate,
                "No such mailbox",
            )),
            Err(e) => Err(self.map_error(e)),
        }
    }

    pub(super) async fn cmd_store(
        &mut self,
        store: StoreCommand,
        uid_mode: bool,
    ) -> CmdResult {
        let user = Arc::clone(self.authenticated()?);
        let (mailbox, read_only) = self.in_selected(|selected| {
            Ok((selected.mailbox.clone(), selected.read_only))
        })?;

        if read_only {
            return Err(Response::no("Mailbox is read-only"));
        }

        let targets = self.resolve_targets(&store.set, uid_mode)?;
        if targets.is_empty() {
            return Ok(Response::ok("STORE"));
        }

        let results = {
            let _guard = user.lock.write().await;
            user.store_flags(
                self.session_id,
                &mailbox,
                &targets,
                store.action,
                &store.flags,
            )
            .map_err(|e| self.map_error(e))?
        };

        // Our own mutation applies to the snapshot immediately.
        let mut responses = Vec::new();
        if let Some(ref mut selected) = self.selected {
            for (uid, flags) in results {
                let recent = selected
                    .snapshot
                    .get_by_uid(uid)
                    .map(|(_, row)| row.recent)
                    .unwrap_or(false);
                let mut flags = flags;
                if recent {
                    flags.insert(Flag::Recent);
                }
                selected.snapshot.update_flags(uid, flags.clone());

                if !store.silent {
                    if let Some(seq) = selected.snapshot.seq_of_uid(uid) {
                        let mut items = vec![FetchItem::Flags(flags)];
                        if uid_mode {
                            items.push(FetchItem::Uid(uid.get()));
                        }
                        responses.push(Response::Fetch {
                            seq: seq.get(),
                            items,
                        });
                    }
                }
            }
        }

        for response in &responses {
            self.send_untagged(response).await;
        }

        Ok(Response::ok("STORE"))
    }

    pub(super) async fn cmd_copy(
        &mut self,
        set: SeqSet,
        mailbox: &str,
        uid_mode: bool,
    ) -> CmdResult {
        let user = Arc::clone(self.authenticated()?);
        self.in_selected(|_| Ok(()))?;

        let targets = self.resolve_targets(&set, uid_mode)?;
        if targets.is_empty() {
            return Ok(Response::ok("COPY"));
        }

        let result = {
            let _guard = user.lock.write().await;
            user.copy_messages(&targets, mailbox)
                .map_err(|e| self.map_error(e))?
        };

        match result {
            None => Err(Response::no_code(
                RespCode::TryCreate,
                "No such mailbox",
            )),
            Some(copy) => Ok(Response::ok_code(
                RespCode::CopyUid {
                    validity: copy.uid_validity.get(),
                    src: compress_uid_set(&copy.src_uids),
                    dst: compress_uid_set(&copy.dst_uids),
                },
                "COPY",
            )),
        }
    }

    pub(super) async fn cmd_move(
        &mut self,
        set: SeqSet,
        mailbox: &str,
        uid_mode: bool,
    ) -> CmdResult {
        let user = Arc::clone(self.authenticated()?);
        let (src, read_only) = self.in_selected(|selected| {
            Ok((selected.mailbox.clone(), selected.read_only))
        })?;

        if read_only {
            return Err(Response::no("Mailbox is read-only"));
        }

        let targets = self.resolve_targets(&set, uid_mode)?;
        if targets.is_empty() {
            return Ok(Response::ok("MOVE"));
        }

        let result = {
            let _guard = user.lock.write().await;
            user.move_messages(self.session_id, &src, &targets, mailbox)
                .map_err(|e| self.map_error(e))?
        };

        let Some(moved) = result else {
            return Err(Response::no_code(
                RespCode::TryCreate,
                "No such mailbox",
            ));
        };

        // COPYUID for MOVE goes out untagged, ahead of the expunges.
        self.send_untagged(&Response::ok_code(
            RespCode::CopyUid {
                validity: moved.uid_validity.get(),
                src: compress_uid_set(&moved.src_uids),
                dst: compress_uid_set(&moved.dst_uids),
            },
            "moved",
        ))
        .await;

        let uids = targets.iter().map(|&(uid, _)| uid).collect::<Vec<_>>();
        self.expunge_own(&uids).await;

        Ok(Response::ok("MOVE"))
    }

    pub(super) async fn cmd_expunge(
        &mut self,
        filter: Option<Vec<Uid>>,
    ) -> CmdResult {
        let user = Arc::clone(self.authenticated()?);
        let (mailbox, read_only) = self.in_selected(|selected| {
            Ok((selected.mailbox.clone(), selected.read_only))
        })?;

        if read_only {
            return Err(Response::no("Mailbox is read-only"));
        }

        let expunged = {
            let _guard = user.lock.write().await;
            user.expunge_mailbox(
                self.session_id,
                &mailbox,
                filter.as_deref(),
            )
            .map_err(|e| self.map_error(e))?
        };

        self.expunge_own(&expunged).await;

        Ok(Response::ok("EXPUNGE"))
    }

    pub(super) async fn cmd_uid_expunge(&mut self, set: SeqSet) -> CmdResult {
        let uids = self.in_selected(|selected| {
            Ok(selected.snapshot.resolve_uid_set(&set))
        })?;
        self.cmd_expunge(Some(uids)).await
    }

    /// Applies this session's own expunges to its snapshot, emitting the
    /// responses in descending seqnum order.
    pub(super) async fn expunge_own(&mut self, uids: &[Uid]) {
        let mut lines = Vec::new();

        if let Some(ref mut selected) = self.selected {
            let mut uids = uids.to_vec();
            uids.sort_unstable_by(|a, b| b.cmp(a));

            for uid in uids {
                if let Some(seq) = selected.snapshot.expunge_uid(uid) {
                    lines.push(Response::Expunge(seq.get()));
                }
            }

            // The shrink is communicated by the EXPUNGE lines themselves;
            // the reported counters just track the new reality.
            selected.reported_exists = selected.snapshot.len();
            selected.reported_recent = selected.snapshot.recent_count();
        }

        for line in &lines {
            self.send_untagged(line).await;
        }
    }

    /// Resolves a sequence or UID set against the current snapshot into
    /// `(uid, message)` pairs, ascending.
    pub(super) fn resolve_targets(
        &self,
        set: &SeqSet,
        uid_mode: bool,
    ) -> Result<Vec<(Uid, MessageId)>, Response> {
        match self.selected.as_ref() {
            None => Err(Response::bad("No mailbox selected")),
            Some(selected) => {
                if uid_mode {
                    Ok(selected
                        .snapshot
                        .resolve_uid_set(set)
                        .into_iter()
                        .filter_map(|uid| {
                            selected
                                .snapshot
                                .get_by_uid(uid)
                                .map(|(_, row)| (uid, row.id))
                        })
                        .collect())
                } else {
                    let seqs = selected
                        .snapshot
                        .resolve_seq_set(set)
                        .map_err(|e| self.map_error(e))?;
                    Ok(seqs
                        .into_iter()
                        .filter_map(|seq| {
                            selected
                                .snapshot
                                .get_by_seq(seq)
                                .map(|row| (row.uid, row.id))
                        })
                        .collect())
                }
            },
        }
    }
}
