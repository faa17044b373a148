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

//! The bridge between the IMAP core and the host application's mail
//! backend.
//!
//! The core calls `Connector` methods when a client mutates state; the
//! backend pushes its own changes through the bounded update channel, which
//! the per-user hub drains serially. Backpressure on that channel is the
//! backend's signal to slow down.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::model::{Flag, FlagSet, RemoteMailboxId, RemoteMessageId};
use crate::support::error::Error;

/// Capacity of the connector update channel.
pub const UPDATE_CHANNEL_SIZE: usize = 128;

/// A mailbox as described by the backend.
#[derive(Clone, Debug)]
pub struct MailboxData {
    pub id: RemoteMailboxId,
    /// Hierarchical name: path components, joined by the configured
    /// delimiter for the wire.
    pub name: Vec<String>,
    pub flags: FlagSet,
    pub permanent_flags: FlagSet,
    pub attributes: FlagSet,
}

/// A message as described by the backend.
#[derive(Clone, Debug)]
pub struct MessageData {
    pub id: RemoteMessageId,
    pub flags: FlagSet,
    pub internal_date: DateTime<Utc>,
}

/// A backend-originated change, to be applied to the metadata database and
/// fanned out to live sessions.
#[derive(Clone, Debug)]
pub enum Update {
    MailboxCreated(MailboxData),
    MailboxRenamed {
        id: RemoteMailboxId,
        name: Vec<String>,
    },
    MailboxDeleted {
        id: RemoteMailboxId,
    },
    MessageCreated {
        message: MessageData,
        literal: Vec<u8>,
        mailboxes: Vec<RemoteMailboxId>,
    },
    MessageUpdated {
        id: RemoteMessageId,
        flags: FlagSet,
    },
    MessageDeleted {
        id: RemoteMessageId,
    },
    UidValidityBumped,
}

/// Host-implemented adapter exposing the real mail backend.
///
/// Methods are synchronous and may block; the core invokes them under the
/// per-user serialization lock.
pub trait Connector: Send + Sync + 'static {
    fn create_mailbox(&self, name: &[String]) -> Result<MailboxData, Error>;

    fn update_mailbox(
        &self,
        id: &RemoteMailboxId,
        name: &[String],
    ) -> Result<(), Error>;

    fn delete_mailbox(&self, id: &RemoteMailboxId) -> Result<(), Error>;

    fn create_message(
        &self,
        mailbox: &RemoteMailboxId,
        literal: &[u8],
        flags: &FlagSet,
        date: DateTime<Utc>,
    ) -> Result<MessageData, Error>;

    fn add_messages_to_mailbox(
        &self,
        ids: &[RemoteMessageId],
        mailbox: &RemoteMailboxId,
    ) -> Result<(), Error>;

    fn remove_messages_from_mailbox(
        &self,
        ids: &[RemoteMessageId],
        mailbox: &RemoteMailboxId,
    ) -> Result<(), Error>;

    fn move_messages(
        &self,
        ids: &[RemoteMessageId],
        from: &RemoteMailboxId,
        to: &RemoteMailboxId,
    ) -> Result<(), Error>;

    fn mark_messages_seen(
        &self,
        ids: &[RemoteMessageId],
        seen: bool,
    ) -> Result<(), Error>;

    fn mark_messages_flagged(
        &self,
        ids: &[RemoteMessageId],
        flagged: bool,
    ) -> Result<(), Error>;

    /// Initial pull: the backend announces all existing mailboxes and
    /// messages through the update channel.
    fn sync(&self) -> Result<(), Error>;

    /// Hands over the receiving end of the update channel. Called exactly
    /// once, by the user hub, before `sync`.
    fn updates(&self) -> mpsc::Receiver<Update>;
}

/// A self-contained in-memory connector.
///
/// Useful for tests and as a template for real implementations: it answers
/// every call out of its own maps and mirrors mutations back through the
/// update channel the way a real backend would.
pub struct DummyConnector {
    state: Mutex<DummyState>,
    tx: mpsc::Sender<Update>,
    rx: Mutex<Option<mpsc::Receiver<Update>>>,
}

struct DummyState {
    next_id: u64,
    mailboxes: HashMap<RemoteMailboxId, MailboxData>,
}

impl DummyConnector {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(UPDATE_CHANNEL_SIZE);
        DummyConnector {
            state: Mutex::new(DummyState {
                next_id: 1,
                mailboxes: HashMap::new(),
            }),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Injects a backend-originated update, as tests do to simulate remote
    /// changes.
    pub fn inject(&self, update: Update) {
        let _ = self.tx.try_send(update);
    }

    fn default_flags() -> FlagSet {
        [Flag::Seen, Flag::Flagged, Flag::Deleted, Flag::Answered]
            .into_iter()
            .collect()
    }

    fn next_id(state: &mut DummyState) -> u64 {
        let id = state.next_id;
        state.next_id += 1;
        id
    }
}

impl Default for DummyConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for DummyConnector {
    fn create_mailbox(&self, name: &[String]) -> Result<MailboxData, Error> {
        let mut state = self.state.lock().unwrap();
        let id = RemoteMailboxId(format!(
            "dummy-mbx-{}",
            Self::next_id(&mut state),
        ));
        let data = MailboxData {
            id: id.clone(),
            name: name.to_vec(),
            flags: Self::default_flags(),
            permanent_flags: Self::default_flags(),
            attributes: FlagSet::new(),
        };
        state.mailboxes.insert(id, data.clone());
        Ok(data)
    }

    fn update_mailbox(
        &self,
        id: &RemoteMailboxId,
        name: &[String],
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        match state.mailboxes.get_mut(id) {
            Some(mbx) => {
                mbx.name = name.to_vec();
                Ok(())
            },
            None => Err(Error::Connector("no such mailbox".to_owned())),
        }
    }

    fn delete_mailbox(&self, id: &RemoteMailboxId) -> Result<(), Error> {
        self.state.lock().unwrap().mailboxes.remove(id);
        Ok(())
    }

    fn create_message(
        &self,
        _mailbox: &RemoteMailboxId,
        _literal: &[u8],
        flags: &FlagSet,
        date: DateTime<Utc>,
    ) -> Result<MessageData, Error> {
        let mut state = self.state.lock().unwrap();
        Ok(MessageData {
            id: RemoteMessageId(format!(
                "dummy-msg-{}",
                Self::next_id(&mut state),
            )),
            flags: flags.clone(),
            internal_date: date,
        })
    }

    fn add_messages_to_mailbox(
        &self,
        _ids: &[RemoteMessageId],
        _mailbox: &RemoteMailboxId,
    ) -> Result<(), Error> {
        Ok(())
    }

    fn remove_messages_from_mailbox(
        &self,
        _ids: &[RemoteMessageId],
        _mailbox: &RemoteMailboxId,
    ) -> Result<(), Error> {
        Ok(())
    }

    fn move_messages(
        &self,
        _ids: &[RemoteMessageId],
        _from: &RemoteMailboxId,
        _to: &RemoteMailboxId,
    ) -> Result<(), Error> {
        Ok(())
    }

    fn mark_messages_seen(
        &self,
        _ids: &[RemoteMessageId],
        _seen: bool,
    ) -> Result<(), Error> {
        Ok(())
    }

    fn mark_messages_flagged(
        &self,
        _ids: &[RemoteMessageId],
        _flagged: bool,
    ) -> Result<(), Error> {
        Ok(())
    }

    fn sync(&self) -> Result<(), Error> {
        // Announce INBOX plus anything created before the hub attached.
        let mailboxes = {
            let mut state = self.state.lock().unwrap();
            if !state
                .mailboxes
                .values()
                .any(|m| m.name == ["INBOX".to_owned()])
            {
                let id = RemoteMailboxId(format!(
                    "dummy-mbx-{}",
                    Self::next_id(&mut state),
                ));
                let inbox = MailboxData {
                    id: id.clone(),
                    name: vec!["INBOX".to_owned()],
                    flags: Self::default_flags(),
                    permanent_flags: Self::default_flags(),
                    attributes: FlagSet::new(),
                };
                state.mailboxes.insert(id, inbox);
            }

            state.mailboxes.values().cloned().collect::<Vec<_>>()
        };

        for mailbox in mailboxes {
            let _ = self.tx.try_send(Update::MailboxCreated(mailbox));
        }

        Ok(())
    }

    fn updates(&self) -> mpsc::Receiver<Update> {
        self.rx
            .lock()
            .unwrap()
            .take()
            .expect("updates() may only be called once")
    }
}
