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

//! Mailbox-level commands: SELECT, EXAMINE, CREATE, DELETE, RENAME,
//! SUBSCRIBE, UNSUBSCRIBE, LIST, LSUB, STATUS, CLOSE, UNSELECT.

use std::sync::Arc;

use super::{CmdResult, Selected, Session};
use crate::command::StatusItem;
use crate::response::{RespCode, Response};

impl Session {
    pub(super) async fn cmd_select(
        &mut self,
        mailbox: &str,
        read_only: bool,
    ) -> CmdResult {
        let user = Arc::clone(self.authenticated()?);

        // Any previous selection ends now, expunge-free, even if the new
        // SELECT fails.
        self.deselect();

        // The guard must span both the snapshot build and the queue
        // registration, or a concurrent mutation could slip between them
        // and never reach this session.
        let init = {
            let _guard = user.lock.write().await;
            let init = user
                .select_mailbox(mailbox, read_only)
                .map_err(|e| self.map_error(e))?;

            let queue = self
                .queue
                .as_ref()
                .expect("authenticated session without queue");
            queue.select(Some(init.mailbox.id));
            init
        };

        let exists = init.snapshot.len();
        let recent = init.snapshot.recent_count();
        let first_unseen = init.snapshot.first_unseen();

        self.send_untagged(&Response::Flags(init.mailbox.flags.clone()))
            .await;
        self.send_untagged(&Response::Exists(exists as u32)).await;
        self.send_untagged(&Response::Recent(recent as u32)).await;
        if let Some(first_unseen) = first_unseen {
            self.send_untagged(&Response::ok_code(
                RespCode::Unseen(first_unseen.get()),
                "first unseen",
            ))
            .await;
        }
        self.send_untagged(&Response::ok_code(
            RespCode::PermanentFlags(init.mailbox.permanent_flags.clone()),
            "flags permitted",
        ))
        .await;
        self.send_untagged(&Response::ok_code(
            RespCode::UidNext(init.mailbox.uid_next),
            "next UID",
        ))
        .await;
        self.send_untagged(&Response::ok_code(
            RespCode::UidValidity(init.mailbox.uid_validity.get()),
            "UIDs valid",
        ))
        .await;

        self.selected = Some(Selected {
            mailbox: init.mailbox,
            snapshot: init.snapshot,
            read_only,
            reported_exists: exists,
            reported_recent: recent,
        });

        Ok(Response::ok_code(
            if read_only {
                RespCode::ReadOnly
            } else {
                RespCode::ReadWrite
            },
            if read_only { "EXAMINE" } else { "SELECT" },
        ))
    }

    pub(super) async fn cmd_create(&mut self, mailbox: &str) -> CmdResult {
        let user = Arc::clone(self.authenticated()?);
        let _guard = user.lock.write().await;

        user.create_mailbox_by_name(mailbox)
            .map_err(|e| self.map_error(e))?;
        Ok(Response::ok("CREATE"))
    }

    pub(super) async fn cmd_delete(&mut self, mailbox: &str) -> CmdResult {
        let user = Arc::clone(self.authenticated()?);
        let _guard = user.lock.write().await;

        user.delete_mailbox_by_name(mailbox)
            .map_err(|e| self.map_error(e))?;

        // If we deleted the mailbox we are selected on, our own session
        // drops straight back to authenticated state.
        if let Some(ref selected) = self.selected {
            let name = user.normalize_mailbox_name(mailbox);
            if selected.mailbox.name == name {
                self.deselect();
            }
        }

        Ok(Response::ok("DELETE"))
    }

    pub(super) async fn cmd_rename(
        &mut self,
        from: &str,
        to: &str,
    ) -> CmdResult {
        let user = Arc::clone(self.authenticated()?);
        let _guard = user.lock.write().await;

        user.rename_mailbox_by_name(self.session_id, from, to)
            .map_err(|e| self.map_error(e))?;
        Ok(Response::ok("RENAME"))
    }

    pub(super) async fn cmd_subscribe(
        &mut self,
        mailbox: &str,
        subscribed: bool,
    ) -> CmdResult {
        let user = Arc::clone(self.authenticated()?);
        let _guard = user.lock.write().await;

        user.set_subscribed_by_name(mailbox, subscribed)
            .map_err(|e| self.map_error(e))?;
        Ok(Response::ok(if subscribed {
            "SUBSCRIBE"
        } else {
            "UNSUBSCRIBE"
        }))
    }

    pub(super) async fn cmd_list(
        &mut self,
        reference: &str,
        pattern: &str,
        lsub: bool,
    ) -> CmdResult {
        let user = Arc::clone(self.authenticated()?);
        let delimiter = self.config.delimiter;

        // An empty pattern asks for the hierarchy delimiter.
        if pattern.is_empty() && !lsub {
            self.send_untagged(&Response::List {
                attrs: vec!["\\Noselect".to_owned()],
                delimiter,
                name: String::new(),
            })
            .await;
            return Ok(Response::ok("LIST"));
        }

        let full_pattern = format!("{}{}", reference, pattern);

        let mailboxes = {
            let _guard = user.lock.read().await;
            user.list_mailboxes().map_err(|e| self.map_error(e))?
        };

        for mailbox in mailboxes {
            if lsub && !mailbox.subscribed {
                continue;
            }
            if !mailbox_pattern_matches(
                full_pattern.as_bytes(),
                mailbox.name.as_bytes(),
                delimiter,
            ) {
                continue;
            }

            let attrs = mailbox
                .attributes
                .iter()
                .map(|flag| flag.to_string())
                .collect::<Vec<_>>();

            let response = if lsub {
                Response::Lsub {
                    attrs,
                    delimiter,
                    name: mailbox.name,
                }
            } else {
                Response::List {
                    attrs,
                    delimiter,
                    name: mailbox.name,
                }
            };
            self.send_untagged(&response).await;
        }

        Ok(Response::ok(if lsub { "LSUB" } else { "LIST" }))
    }

    pub(super) async fn cmd_status(
        &mut self,
        mailbox: &str,
        items: &[StatusItem],
    ) -> CmdResult {
        let user = Arc::clone(self.authenticated()?);

        let (entry, messages, recent, unseen) = {
            let _guard = user.lock.read().await;
            user.status_mailbox(mailbox).map_err(|e| self.map_error(e))?
        };

        let values = items
            .iter()
            .map(|&item| {
                let value = match item {
                    StatusItem::Messages => messages,
                    StatusItem::Recent => recent,
                    StatusItem::UidNext => entry.uid_next,
                    StatusItem::UidValidity => entry.uid_validity.get(),
                    StatusItem::Unseen => unseen,
                };
                (item, value)
            })
            .collect::<Vec<_>>();

        self.send_untagged(&Response::Status {
            mailbox: entry.name,
            items: values,
        })
        .await;

        Ok(Response::ok("STATUS"))
    }

    /// CLOSE: silent expunge, then back to authenticated state.
    pub(super) async fn cmd_close(&mut self) -> CmdResult {
        let user = Arc::clone(self.authenticated()?);
        let (mailbox, read_only) = self.in_selected(|selected| {
            Ok((selected.mailbox.clone(), selected.read_only))
        })?;

        if !read_only {
            let _guard = user.lock.write().await;
            user.expunge_mailbox(self.session_id, &mailbox, None)
                .map_err(|e| self.map_error(e))?;
        }

        self.deselect();
        Ok(Response::ok("CLOSE"))
    }

    /// UNSELECT: back to authenticated state without expunging.
    pub(super) async fn cmd_unselect(&mut self) -> CmdResult {
        self.in_selected(|_| Ok(()))?;
        self.deselect();
        Ok(Response::ok("UNSELECT"))
    }
}

/// IMAP list-pattern matching: `*` matches anything, `%` matches anything
/// except the hierarchy delimiter.
///
/// Only the INBOX segment of a name matches case-insensitively; every
/// other name byte is compared exactly.
pub(super) fn mailbox_pattern_matches(
    pattern: &[u8],
    name: &[u8],
    delimiter: u8,
) -> bool {
    // Stored names carry the canonical upper-case INBOX, so the fold
    // region is exactly its first five bytes.
    let fold_len = if name.eq_ignore_ascii_case(b"INBOX")
        || (name.len() > 5
            && name[..5].eq_ignore_ascii_case(b"INBOX")
            && name[5] == delimiter)
    {
        5
    } else {
        0
    };

    matches_at(pattern, name, delimiter, fold_len)
}

/// `fold_len` counts how many of the remaining name bytes still belong to
/// the leading INBOX segment.
fn matches_at(
    pattern: &[u8],
    name: &[u8],
    delimiter: u8,
    fold_len: usize,
) -> bool {
    match (pattern.first(), name.first()) {
        (None, None) => true,
        (None, Some(_)) => false,
        (Some(b'*'), _) => {
            matches_at(&pattern[1..], name, delimiter, fold_len)
                || (!name.is_empty()
                    && matches_at(
                        pattern,
                        &name[1..],
                        delimiter,
                        fold_len.saturating_sub(1),
                    ))
        },
        (Some(b'%'), _) => {
            matches_at(&pattern[1..], name, delimiter, fold_len)
                || (name.first().is_some_and(|&c| c != delimiter)
                    && matches_at(
                        pattern,
                        &name[1..],
                        delimiter,
                        fold_len.saturating_sub(1),
                    ))
        },
        (Some(_), None) => false,
        (Some(&p), Some(&n)) => {
            let matched = if fold_len > 0 {
                p.eq_ignore_ascii_case(&n)
            } else {
                p == n
            };
            matched
                && matches_at(
                    &pattern[1..],
                    &name[1..],
                    delimiter,
                    fold_len.saturating_sub(1),
                )
        },
    }
}

#[cfg(test)]
mod test {
    use super::mailbox_pattern_matches;

    fn matches(pattern: &str, name: &str) -> bool {
        mailbox_pattern_matches(pattern.as_bytes(), name.as_bytes(), b'/')
    }

    #[test]
    fn literal_patterns() {
        assert!(matches("INBOX", "INBOX"));
        assert!(matches("inbox", "INBOX"));
        assert!(!matches("INBOX", "INBOX/sub"));
    }

    #[test]
    fn only_inbox_folds_case() {
        // Non-INBOX names are case-sensitive.
        assert!(matches("Work", "Work"));
        assert!(!matches("work", "Work"));
        assert!(!matches("WORK", "Work"));
        assert!(!matches("w%", "Work"));

        // The fold covers only the INBOX segment, not its children.
        assert!(matches("inbox/sub", "INBOX/sub"));
        assert!(!matches("inbox/SUB", "INBOX/sub"));
        assert!(matches("iNb%x", "INBOX"));

        // A name that merely starts with the letters of INBOX does not
        // fold past the segment boundary.
        assert!(!matches("inboxes", "INBOXES"));
        assert!(matches("INBOXES", "INBOXES"));
    }

    #[test]
    fn star_spans_hierarchy() {
        assert!(matches("*", "INBOX"));
        assert!(matches("*", "a/b/c"));
        assert!(matches("a/*", "a/b/c"));
        assert!(matches("*c", "a/b/c"));
        assert!(!matches("b/*", "a/b/c"));
    }

    #[test]
    fn percent_stops_at_delimiter() {
        assert!(matches("%", "INBOX"));
        assert!(!matches("%", "a/b"));
        assert!(matches("a/%", "a/b"));
        assert!(!matches("a/%", "a/b/c"));
        assert!(matches("%/%", "a/b"));
    }
}
