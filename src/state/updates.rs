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

//! Pending-update plumbing between the user hub and its sessions.
//!
//! Each session owns one `SessionQueue`. The hub routes per-mailbox
//! changes into the queues of every session selected on the affected
//! mailbox; the session drains its queue at flush points, mutating its
//! snapshot and emitting the matching untagged responses.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::model::{FlagSet, MailboxId, MessageId, Uid, UidValidity};

/// One change to a mailbox another party made, queued for a session.
#[derive(Clone, Debug)]
pub enum MailboxUpdate {
    /// A message appeared.
    Exists {
        uid: Uid,
        message_id: MessageId,
        flags: FlagSet,
        recent: bool,
    },
    /// A message's flags changed.
    FlagsChanged { uid: Uid, flags: FlagSet },
    /// A message was expunged.
    Expunged { uid: Uid },
    /// The mailbox's UID-validity epoch changed.
    UidValidityBumped(UidValidity),
    /// The selected mailbox itself was deleted.
    MailboxDeleted,
}

/// A session's registration with its user hub.
pub struct SessionQueue {
    selected: Mutex<Option<MailboxId>>,
    pending: Mutex<VecDeque<MailboxUpdate>>,
    pub notify: Notify,
}

impl SessionQueue {
    pub fn new() -> Self {
        SessionQueue {
            selected: Mutex::new(None),
            pending: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub fn selected(&self) -> Option<MailboxId> {
        *self.selected.lock().unwrap()
    }

    /// Marks which mailbox this session is selected on. Clears any
    /// updates left over from a previous selection.
    pub fn select(&self, mailbox: Option<MailboxId>) {
        *self.selected.lock().unwrap() = mailbox;
        self.pending.lock().unwrap().clear();
    }

    pub fn push(&self, updates: &[MailboxUpdate]) {
        if updates.is_empty() {
            return;
        }

        let mut pending = self.pending.lock().unwrap();
        pending.extend(updates.iter().cloned());
        drop(pending);

        self.notify.notify_one();
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.lock().unwrap().is_empty()
    }

    pub fn drain(&self) -> Vec<MailboxUpdate> {
        self.pending.lock().unwrap().drain(..).collect()
    }

    /// Puts deferred updates back at the front, preserving their original
    /// order ahead of anything that arrived meanwhile.
    pub fn requeue_front(&self, updates: Vec<MailboxUpdate>) {
        if updates.is_empty() {
            return;
        }

        let mut pending = self.pending.lock().unwrap();
        for update in updates.into_iter().rev() {
            pending.push_front(update);
        }
    }
}

impl Default for SessionQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn drain_and_requeue_preserve_order() {
        let queue = SessionQueue::new();
        queue.push(&[
            MailboxUpdate::Expunged { uid: Uid::u(1) },
            MailboxUpdate::FlagsChanged {
                uid: Uid::u(2),
                flags: FlagSet::new(),
            },
        ]);

        let drained = queue.drain();
        assert_eq!(2, drained.len());
        assert!(!queue.has_pending());

        // Defer the expunge, then receive another update.
        queue.requeue_front(vec![MailboxUpdate::Expunged {
            uid: Uid::u(1),
        }]);
        queue.push(&[MailboxUpdate::Expunged { uid: Uid::u(3) }]);

        let drained = queue.drain();
        assert!(matches!(
            drained[0],
            MailboxUpdate::Expunged { uid } if uid == Uid::u(1),
        ));
        assert!(matches!(
            drained[1],
            MailboxUpdate::Expunged { uid } if uid == Uid::u(3),
        ));
    }

    #[test]
    fn select_clears_stale_updates() {
        let queue = SessionQueue::new();
        queue.select(Some(MailboxId(1)));
        queue.push(&[MailboxUpdate::Expunged { uid: Uid::u(1) }]);
        queue.select(Some(MailboxId(2)));
        assert!(!queue.has_pending());
        assert_eq!(Some(MailboxId(2)), queue.selected());
    }
}
