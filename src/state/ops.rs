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

//! Mailbox and message operations invoked by session command handlers.
//!
//! Callers hold the user lock (write mode for anything in here that
//! mutates) before invoking these; the functions themselves only take the
//! database mutex.

use chrono::{DateTime, FixedOffset, Utc};

use super::snapshot::Snapshot;
use super::updates::MailboxUpdate;
use super::User;
use crate::command::StoreAction;
use crate::connector::MessageData;
use crate::db::{MailboxEntry, MessageEntry};
use crate::model::{
    Flag, FlagSet, MessageId, RemoteMessageId, Uid, UidValidity,
};
use crate::support::error::Error;

/// Everything SELECT/EXAMINE needs to answer and to seed the session.
pub struct SelectedInit {
    pub mailbox: MailboxEntry,
    pub snapshot: Snapshot,
    pub read_only: bool,
}

/// Result of COPY/MOVE for the `COPYUID` response code. The two UID lists
/// correspond pairwise.
pub struct CopyResult {
    pub uid_validity: UidValidity,
    pub src_uids: Vec<Uid>,
    pub dst_uids: Vec<Uid>,
}

impl User {
    /// Builds a fresh snapshot of the mailbox. In read-write mode the
    /// `\Recent` markers are cleared in the same transaction that reads
    /// the rows, so this session is the only one that sees them.
    pub fn select_mailbox(
        &self,
        name: &str,
        read_only: bool,
    ) -> Result<SelectedInit, Error> {
        let name = self.normalize_mailbox_name(name);
        let mut db = self.db.lock().unwrap();

        db.write(|tx| {
            let mailbox =
                tx.mailbox_by_name(&name)?.ok_or(Error::NxMailbox)?;

            if mailbox
                .attributes
                .contains(&Flag::Keyword("\\Noselect".to_owned()))
            {
                return Err(Error::MailboxUnselectable);
            }

            let rows = tx.snapshot_rows(mailbox.id)?;
            if !read_only {
                tx.clear_recent(mailbox.id)?;
            }

            Ok(SelectedInit {
                mailbox,
                snapshot: Snapshot::new(rows),
                read_only,
            })
        })
    }

    pub fn status_mailbox(
        &self,
        name: &str,
    ) -> Result<(MailboxEntry, u32, u32, u32), Error> {
        let name = self.normalize_mailbox_name(name);
        let mut db = self.db.lock().unwrap();

        db.read(|tx| {
            let mailbox =
                tx.mailbox_by_name(&name)?.ok_or(Error::NxMailbox)?;
            let messages = tx.message_count(mailbox.id)?;
            let recent = tx.recent_count(mailbox.id)?;
            let unseen = tx.unseen_count(mailbox.id)?;
            Ok((mailbox, messages, recent, unseen))
        })
    }

    pub fn list_mailboxes(&self) -> Result<Vec<MailboxEntry>, Error> {
        self.db.lock().unwrap().read(|tx| tx.all_mailboxes())
    }

    pub fn create_mailbox_by_name(&self, name: &str) -> Result<(), Error> {
        let name = self.normalize_mailbox_name(name);
        if name.len() > self.config.limits.max_mailbox_name_len {
            return Err(Error::MailboxNameTooLong);
        }

        {
            let mut db = self.db.lock().unwrap();
            if db.read(|tx| tx.mailbox_by_name(&name))?.is_some() {
                return Err(Error::MailboxExists);
            }
        }

        let data = self.connector.create_mailbox(&self.split_name(&name))?;

        let mut db = self.db.lock().unwrap();
        db.write(|tx| {
            tx.create_mailbox(
                &data.id,
                &name,
                &data.flags,
                &data.permanent_flags,
                &data.attributes,
            )
            .map(|_| ())
        })
    }

    /// Deletes the mailbox, notifying sessions selected on it. Bumps the
    /// global UID-validity when the mailbox holds the current epoch.
    pub fn delete_mailbox_by_name(&self, name: &str) -> Result<(), Error> {
        let name = self.normalize_mailbox_name(name);
        if name == "INBOX" {
            return Err(Error::BadOperationOnInbox);
        }

        let mailbox = {
            let mut db = self.db.lock().unwrap();
            db.read(|tx| tx.mailbox_by_name(&name))?
                .ok_or(Error::NxMailbox)?
        };

        self.connector.delete_mailbox(&mailbox.remote_id)?;

        let orphans = {
            let mut db = self.db.lock().unwrap();
            db.write(|tx| {
                tx.delete_mailbox(mailbox.id)?;
                tx.delete_orphan_messages()
            })?
        };
        self.store.delete(&orphans)?;

        self.broadcast(mailbox.id, None, &[MailboxUpdate::MailboxDeleted]);
        Ok(())
    }

    /// Renames a mailbox. Renaming INBOX is special-cased per RFC 3501:
    /// its messages move to the new mailbox and INBOX is left empty.
    pub fn rename_mailbox_by_name(
        &self,
        origin: u64,
        from: &str,
        to: &str,
    ) -> Result<(), Error> {
        let from = self.normalize_mailbox_name(from);
        let to = self.normalize_mailbox_name(to);

        if to.len() > self.config.limits.max_mailbox_name_len {
            return Err(Error::MailboxNameTooLong);
        }

        {
            let mut db = self.db.lock().unwrap();
            if db.read(|tx| tx.mailbox_by_name(&to))?.is_some() {
                return Err(Error::MailboxExists);
            }
        }

        if from == "INBOX" {
            return self.rename_inbox(origin, &to);
        }

        let mailbox = {
            let mut db = self.db.lock().unwrap();
            db.read(|tx| tx.mailbox_by_name(&from))?
                .ok_or(Error::NxMailbox)?
        };

        self.connector
            .update_mailbox(&mailbox.remote_id, &self.split_name(&to))?;

        let mut db = self.db.lock().unwrap();
        db.write(|tx| tx.rename_mailbox(mailbox.id, &to))
    }

    fn rename_inbox(&self, origin: u64, to: &str) -> Result<(), Error> {
        let inbox = {
            let mut db = self.db.lock().unwrap();
            db.read(|tx| tx.mailbox_by_name("INBOX"))?
                .ok_or(Error::NxMailbox)?
        };

        self.create_mailbox_by_name(to)?;
        let dst = {
            let mut db = self.db.lock().unwrap();
            db.read(|tx| tx.mailbox_by_name(to))?
                .ok_or(Error::NxMailbox)?
        };

        let rows = {
            let mut db = self.db.lock().unwrap();
            db.read(|tx| tx.snapshot_rows(inbox.id))?
        };
        let remote_ids = self.remote_message_ids(
            &rows.iter().map(|r| r.message_id).collect::<Vec<_>>(),
        )?;

        self.connector.move_messages(
            &remote_ids,
            &inbox.remote_id,
            &dst.remote_id,
        )?;

        let (moved, broadcasts) = {
            let mut db = self.db.lock().unwrap();
            db.write(|tx| {
                let placements = rows
                    .iter()
                    .map(|r| (r.message_id, false))
                    .collect::<Vec<_>>();
                let assigned =
                    tx.add_messages_to_mailbox(dst.id, &placements)?;
                tx.remove_uids(
                    inbox.id,
                    &rows.iter().map(|r| r.uid).collect::<Vec<_>>(),
                )?;

                let mut broadcasts = Vec::new();
                for &(message_id, uid) in &assigned {
                    let flags = tx.message_flags(message_id)?;
                    broadcasts.push(MailboxUpdate::Exists {
                        uid,
                        message_id,
                        flags,
                        recent: false,
                    });
                }

                Ok((rows.iter().map(|r| r.uid).collect::<Vec<_>>(), broadcasts))
            })?
        };

        self.broadcast(dst.id, None, &broadcasts);
        self.broadcast(
            inbox.id,
            Some(origin),
            &moved
                .iter()
                .map(|&uid| MailboxUpdate::Expunged { uid })
                .collect::<Vec<_>>(),
        );

        Ok(())
    }

    pub fn set_subscribed_by_name(
        &self,
        name: &str,
        subscribed: bool,
    ) -> Result<(), Error> {
        let name = self.normalize_mailbox_name(name);
        let mut db = self.db.lock().unwrap();

        db.write(|tx| {
            let mailbox =
                tx.mailbox_by_name(&name)?.ok_or(Error::NxMailbox)?;

            if subscribed
                && !mailbox.subscribed
                && tx.subscription_count()?
                    >= self.config.limits.max_subscriptions
            {
                return Err(Error::TooManySubscriptions);
            }

            tx.set_subscribed(mailbox.id, subscribed)
        })
    }

    /// APPEND: create the message at the backend, persist it, assign its
    /// UID, and queue the EXISTS for every session selected on the
    /// mailbox (including the appending one, which picks it up at its
    /// end-of-command flush).
    pub fn append(
        &self,
        name: &str,
        flags: &FlagSet,
        date: Option<DateTime<FixedOffset>>,
        literal: &[u8],
    ) -> Result<(UidValidity, Uid), Error> {
        if literal.len() as u64 > u64::from(self.config.limits.max_message_size)
        {
            return Err(Error::MessageTooLarge);
        }

        let name = self.normalize_mailbox_name(name);
        let mailbox = {
            let mut db = self.db.lock().unwrap();
            db.read(|tx| tx.mailbox_by_name(&name))?
                .ok_or(Error::NxMailbox)?
        };

        let date = date
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|| self.now());

        let message: MessageData = self.connector.create_message(
            &mailbox.remote_id,
            literal,
            flags,
            date,
        )?;

        let message_id = MessageId::new();
        self.store.set(message_id, &mut &literal[..])?;

        let (uid, row_flags) = {
            let mut db = self.db.lock().unwrap();
            db.write(|tx| {
                tx.insert_message(&MessageEntry {
                    id: message_id,
                    remote_id: message.id.clone(),
                    size: literal.len() as u32,
                    internal_date: message.internal_date,
                })?;
                tx.set_message_flags(message_id, &message.flags)?;

                let assigned = tx.add_messages_to_mailbox(
                    mailbox.id,
                    &[(message_id, true)],
                )?;
                let &(_, uid) = assigned.first().ok_or_else(|| {
                    Error::Internal(
                        "append assigned no UID".to_owned(),
                    )
                })?;

                let deleted = message.flags.contains(&Flag::Deleted);
                if deleted {
                    tx.set_deleted(mailbox.id, &[uid], true)?;
                }

                let mut row_flags = tx.message_flags(message_id)?;
                if deleted {
                    row_flags.insert(Flag::Deleted);
                }

                Ok((uid, row_flags))
            })?
        };

        self.broadcast(
            mailbox.id,
            None,
            &[MailboxUpdate::Exists {
                uid,
                message_id,
                flags: row_flags,
                recent: true,
            }],
        );

        Ok((mailbox.uid_validity, uid))
    }

    /// STORE: applies the flag mutation to each target, echoes the deltas
    /// to the backend, and fans the new flag rows out to other sessions.
    /// Returns `(uid, new flags)` per target for the caller's own
    /// responses.
    pub fn store_flags(
        &self,
        origin: u64,
        mailbox: &MailboxEntry,
        targets: &[(Uid, MessageId)],
        action: StoreAction,
        flags: &FlagSet,
    ) -> Result<Vec<(Uid, FlagSet)>, Error> {
        let touches_deleted = flags.contains(&Flag::Deleted);
        let mut results = Vec::new();
        let mut seen_on = Vec::<RemoteMessageId>::new();
        let mut seen_off = Vec::<RemoteMessageId>::new();
        let mut flagged_on = Vec::<RemoteMessageId>::new();
        let mut flagged_off = Vec::<RemoteMessageId>::new();

        {
            let mut db = self.db.lock().unwrap();
            db.write(|tx| {
                for &(uid, message_id) in targets {
                    let entry = tx
                        .message_by_id(message_id)?
                        .ok_or(Error::ExpungedMessage)?;
                    let old = tx.message_flags(message_id)?;

                    let mut new = match action {
                        StoreAction::Replace => flags.clone(),
                        StoreAction::Add => {
                            let mut new = old.clone();
                            new.union_with(flags);
                            new
                        },
                        StoreAction::Remove => {
                            let mut new = old.clone();
                            new.difference_with(flags);
                            new
                        },
                    };
                    new.remove(&Flag::Recent);

                    // \Deleted is mailbox-scoped: it lives on the UID
                    // record, not the shared message flags.
                    let row_deleted = tx
                        .uids_for_message(message_id)?
                        .iter()
                        .find(|&&(m, u, _, _)| m == mailbox.id && u == uid)
                        .map(|&(_, _, _, d)| d)
                        .unwrap_or(false);
                    let deleted_now = match action {
                        StoreAction::Replace => touches_deleted,
                        StoreAction::Add => touches_deleted || row_deleted,
                        StoreAction::Remove => {
                            !touches_deleted && row_deleted
                        },
                    };

                    new.remove(&Flag::Deleted);
                    tx.set_message_flags(message_id, &new)?;
                    tx.set_deleted(mailbox.id, &[uid], deleted_now)?;

                    // Collect backend deltas for the two flags the
                    // connector models.
                    let was_seen = old.contains(&Flag::Seen);
                    let is_seen = new.contains(&Flag::Seen);
                    if was_seen != is_seen {
                        if is_seen {
                            seen_on.push(entry.remote_id.clone());
                        } else {
                            seen_off.push(entry.remote_id.clone());
                        }
                    }

                    let was_flagged = old.contains(&Flag::Flagged);
                    let is_flagged = new.contains(&Flag::Flagged);
                    if was_flagged != is_flagged {
                        if is_flagged {
                            flagged_on.push(entry.remote_id.clone());
                        } else {
                            flagged_off.push(entry.remote_id.clone());
                        }
                    }

                    let mut row_flags = new;
                    if deleted_now {
                        row_flags.insert(Flag::Deleted);
                    }
                    results.push((uid, row_flags));
                }

                Ok(())
            })?;
        }

        if !seen_on.is_empty() {
            self.connector.mark_messages_seen(&seen_on, true)?;
        }
        if !seen_off.is_empty() {
            self.connector.mark_messages_seen(&seen_off, false)?;
        }
        if !flagged_on.is_empty() {
            self.connector.mark_messages_flagged(&flagged_on, true)?;
        }
        if !flagged_off.is_empty() {
            self.connector.mark_messages_flagged(&flagged_off, false)?;
        }

        let updates = results
            .iter()
            .map(|(uid, flags)| MailboxUpdate::FlagsChanged {
                uid: *uid,
                flags: flags.clone(),
            })
            .collect::<Vec<_>>();
        self.broadcast(mailbox.id, Some(origin), &updates);

        Ok(results)
    }

    /// EXPUNGE / UID EXPUNGE: removes messages marked `\Deleted`
    /// (optionally restricted to `filter`), returning the expunged UIDs
    /// in ascending order.
    pub fn expunge_mailbox(
        &self,
        origin: u64,
        mailbox: &MailboxEntry,
        filter: Option<&[Uid]>,
    ) -> Result<Vec<Uid>, Error> {
        let deleted = {
            let mut db = self.db.lock().unwrap();
            db.read(|tx| tx.deleted_uids(mailbox.id))?
        };

        let victims = deleted
            .into_iter()
            .filter(|(uid, _)| {
                filter.map_or(true, |f| f.contains(uid))
            })
            .collect::<Vec<_>>();

        if victims.is_empty() {
            return Ok(Vec::new());
        }

        let message_ids =
            victims.iter().map(|&(_, id)| id).collect::<Vec<_>>();
        let remote_ids = self.remote_message_ids(&message_ids)?;
        self.connector
            .remove_messages_from_mailbox(&remote_ids, &mailbox.remote_id)?;

        let uids = victims.iter().map(|&(uid, _)| uid).collect::<Vec<_>>();
        let orphans = {
            let mut db = self.db.lock().unwrap();
            db.write(|tx| {
                tx.remove_uids(mailbox.id, &uids)?;
                tx.delete_orphan_messages()
            })?
        };
        self.store.delete(&orphans)?;

        let updates = uids
            .iter()
            .map(|&uid| MailboxUpdate::Expunged { uid })
            .collect::<Vec<_>>();
        self.broadcast(mailbox.id, Some(origin), &updates);

        Ok(uids)
    }

    /// COPY: adds the messages to the destination mailbox. Returns `None`
    /// when the destination does not exist (the caller answers with
    /// `[TRYCREATE]`).
    pub fn copy_messages(
        &self,
        items: &[(Uid, MessageId)],
        dst_name: &str,
    ) -> Result<Option<CopyResult>, Error> {
        let dst_name = self.normalize_mailbox_name(dst_name);
        let Some(dst) = ({
            let mut db = self.db.lock().unwrap();
            db.read(|tx| tx.mailbox_by_name(&dst_name))?
        }) else {
            return Ok(None);
        };

        let message_ids =
            items.iter().map(|&(_, id)| id).collect::<Vec<_>>();
        let remote_ids = self.remote_message_ids(&message_ids)?;
        self.connector
            .add_messages_to_mailbox(&remote_ids, &dst.remote_id)?;

        let (assigned, broadcasts) = {
            let mut db = self.db.lock().unwrap();
            db.write(|tx| {
                let placements = items
                    .iter()
                    .map(|&(_, id)| (id, true))
                    .collect::<Vec<_>>();
                let assigned =
                    tx.add_messages_to_mailbox(dst.id, &placements)?;

                let mut broadcasts = Vec::new();
                for &(message_id, uid) in &assigned {
                    let flags = tx.message_flags(message_id)?;
                    broadcasts.push(MailboxUpdate::Exists {
                        uid,
                        message_id,
                        flags,
                        recent: true,
                    });
                }

                Ok((assigned, broadcasts))
            })?
        };

        self.broadcast(dst.id, None, &broadcasts);

        let mut src_uids = Vec::new();
        let mut dst_uids = Vec::new();
        for &(message_id, dst_uid) in &assigned {
            if let Some(&(src_uid, _)) =
                items.iter().find(|&&(_, id)| id == message_id)
            {
                src_uids.push(src_uid);
                dst_uids.push(dst_uid);
            }
        }

        Ok(Some(CopyResult {
            uid_validity: dst.uid_validity,
            src_uids,
            dst_uids,
        }))
    }

    /// MOVE: copy plus removal from the source. The caller expunges the
    /// returned source UIDs from its own snapshot; other sessions learn
    /// through the queue.
    pub fn move_messages(
        &self,
        origin: u64,
        src: &MailboxEntry,
        items: &[(Uid, MessageId)],
        dst_name: &str,
    ) -> Result<Option<CopyResult>, Error> {
        let dst_name = self.normalize_mailbox_name(dst_name);
        let Some(dst) = ({
            let mut db = self.db.lock().unwrap();
            db.read(|tx| tx.mailbox_by_name(&dst_name))?
        }) else {
            return Ok(None);
        };

        let message_ids =
            items.iter().map(|&(_, id)| id).collect::<Vec<_>>();
        let remote_ids = self.remote_message_ids(&message_ids)?;
        self.connector.move_messages(
            &remote_ids,
            &src.remote_id,
            &dst.remote_id,
        )?;

        let (assigned, broadcasts) = {
            let mut db = self.db.lock().unwrap();
            db.write(|tx| {
                let placements = items
                    .iter()
                    .map(|&(_, id)| (id, true))
                    .collect::<Vec<_>>();
                let assigned =
                    tx.add_messages_to_mailbox(dst.id, &placements)?;

                tx.remove_uids(
                    src.id,
                    &items.iter().map(|&(uid, _)| uid).collect::<Vec<_>>(),
                )?;

                let mut broadcasts = Vec::new();
                for &(message_id, uid) in &assigned {
                    let flags = tx.message_flags(message_id)?;
                    broadcasts.push(MailboxUpdate::Exists {
                        uid,
                        message_id,
                        flags,
                        recent: true,
                    });
                }

                Ok((assigned, broadcasts))
            })?
        };

        self.broadcast(dst.id, None, &broadcasts);
        self.broadcast(
            src.id,
            Some(origin),
            &items
                .iter()
                .map(|&(uid, _)| MailboxUpdate::Expunged { uid })
                .collect::<Vec<_>>(),
        );

        let mut src_uids = Vec::new();
        let mut dst_uids = Vec::new();
        for &(message_id, dst_uid) in &assigned {
            if let Some(&(src_uid, _)) =
                items.iter().find(|&&(_, id)| id == message_id)
            {
                src_uids.push(src_uid);
                dst_uids.push(dst_uid);
            }
        }

        Ok(Some(CopyResult {
            uid_validity: dst.uid_validity,
            src_uids,
            dst_uids,
        }))
    }

    pub fn message_literal(&self, id: MessageId) -> Result<Vec<u8>, Error> {
        self.store.get(id)
    }

    pub fn message_meta(&self, id: MessageId) -> Result<MessageEntry, Error> {
        self.db
            .lock()
            .unwrap()
            .read(|tx| tx.message_by_id(id))?
            .ok_or(Error::ExpungedMessage)
    }

    fn remote_message_ids(
        &self,
        ids: &[MessageId],
    ) -> Result<Vec<RemoteMessageId>, Error> {
        let mut db = self.db.lock().unwrap();
        db.read(|tx| {
            ids.iter()
                .map(|&id| {
                    tx.message_by_id(id)?
                        .map(|entry| entry.remote_id)
                        .ok_or(Error::ExpungedMessage)
                })
                .collect()
        })
    }
}
