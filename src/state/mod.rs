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

//! Per-user state: the hub owning the metadata database, blob store,
//! connector, and live sessions.
//!
//! All mutating work for a user runs under the hub's `RwLock` held in
//! write mode; bulk readers (FETCH bodies, SEARCH) take it in read mode,
//! which is enough to stop UID-NEXT and UID-VALIDITY races. A serial
//! worker task drains the connector's update stream: each update is
//! persisted in one transaction and then fanned out to every session
//! selected on an affected mailbox.

mod ops;
pub mod search;
pub mod snapshot;
pub mod updates;

pub use ops::{CopyResult, SelectedInit};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use log::{debug, info};

use crate::config::ServerConfig;
use crate::connector::{Connector, MessageData, Update};
use crate::db::{Db, MessageEntry};
use crate::model::{Flag, MailboxId, MessageId, RemoteMailboxId};
use crate::store::Store;
use crate::support::error::Error;
use self::updates::{MailboxUpdate, SessionQueue};

pub struct User {
    pub user_id: String,
    pub username: String,
    password: Vec<u8>,
    pub config: Arc<ServerConfig>,
    pub db: Mutex<Db>,
    pub store: Arc<dyn Store>,
    pub connector: Arc<dyn Connector>,
    /// Per-user serialization lock. Mutations take it in write mode;
    /// FETCH/SEARCH readers in read mode.
    pub lock: tokio::sync::RwLock<()>,
    sessions: Mutex<HashMap<u64, Arc<SessionQueue>>>,
    update_seq: AtomicU64,
}

impl User {
    pub fn new(
        user_id: String,
        username: String,
        password: String,
        config: Arc<ServerConfig>,
        connector: Arc<dyn Connector>,
    ) -> Result<Arc<Self>, Error> {
        let db_path = config.database_dir.join(format!("{}.db", user_id));
        let mut db = Db::open(&db_path)?;

        let seed = (config.uid_validity_generator)();
        db.write(|tx| tx.init_uid_validity(seed))?;

        let store_path = config.data_dir.join(&user_id).join("blobs");
        let store = (config.store_builder)(&store_path)?;

        Ok(Arc::new(User {
            user_id,
            username,
            password: password.into_bytes(),
            config,
            db: Mutex::new(db),
            store,
            connector,
            lock: tokio::sync::RwLock::new(()),
            sessions: Mutex::new(HashMap::new()),
            update_seq: AtomicU64::new(0),
        }))
    }

    /// Attaches the update worker and performs the initial sync.
    pub fn start(self: &Arc<Self>) -> Result<(), Error> {
        let mut rx = self.connector.updates();
        let user = Arc::clone(self);

        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                let _guard = user.lock.write().await;
                let seq = user.update_seq.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(
                    "user {}: applying connector update #{}",
                    user.user_id, seq,
                );

                if let Err(e) = user.apply_connector_update(update) {
                    user.config
                        .reporter
                        .report_error("applying connector update", &e);
                }
            }

            info!("user {}: connector update stream ended", user.user_id);
        });

        self.connector.sync()
    }

    pub fn check_password(&self, password: &str) -> bool {
        let password = password.as_bytes();
        password.len() == self.password.len()
            && openssl::memcmp::eq(password, &self.password)
    }

    pub fn register_session(&self, session_id: u64) -> Arc<SessionQueue> {
        let queue = Arc::new(SessionQueue::new());
        self.sessions
            .lock()
            .unwrap()
            .insert(session_id, Arc::clone(&queue));
        queue
    }

    pub fn deregister_session(&self, session_id: u64) {
        self.sessions.lock().unwrap().remove(&session_id);
    }

    /// Pushes updates to every session selected on `mailbox`, except the
    /// originating session (whose own mutations applied immediately).
    pub(crate) fn broadcast(
        &self,
        mailbox: MailboxId,
        origin: Option<u64>,
        updates: &[MailboxUpdate],
    ) {
        if updates.is_empty() {
            return;
        }

        let sessions = self.sessions.lock().unwrap();
        for (&session_id, queue) in sessions.iter() {
            if Some(session_id) == origin {
                continue;
            }
            if queue.selected() == Some(mailbox) {
                queue.push(updates);
            }
        }
    }

    fn broadcast_all_selected(&self, updates: &[MailboxUpdate]) {
        let sessions = self.sessions.lock().unwrap();
        for queue in sessions.values() {
            if queue.selected().is_some() {
                queue.push(updates);
            }
        }
    }

    /// Applies one backend update: persist, then fan out.
    fn apply_connector_update(&self, update: Update) -> Result<(), Error> {
        match update {
            Update::MailboxCreated(data) => {
                let name = self.join_name(&data.name);
                let mut db = self.db.lock().unwrap();
                db.write(|tx| {
                    if tx.mailbox_by_remote_id(&data.id)?.is_some() {
                        return Ok(());
                    }
                    match tx.create_mailbox(
                        &data.id,
                        &name,
                        &data.flags,
                        &data.permanent_flags,
                        &data.attributes,
                    ) {
                        Ok(_) | Err(Error::MailboxExists) => Ok(()),
                        Err(e) => Err(e),
                    }
                })
            },

            Update::MailboxRenamed { id, name } => {
                let name = self.join_name(&name);
                let mut db = self.db.lock().unwrap();
                db.write(|tx| {
                    let mailbox = tx
                        .mailbox_by_remote_id(&id)?
                        .ok_or(Error::NxMailbox)?;
                    tx.rename_mailbox(mailbox.id, &name)
                })
            },

            Update::MailboxDeleted { id } => {
                let (mailbox_id, orphans) = {
                    let mut db = self.db.lock().unwrap();
                    db.write(|tx| {
                        let Some(mailbox) = tx.mailbox_by_remote_id(&id)?
                        else {
                            return Ok((None, Vec::new()));
                        };
                        tx.delete_mailbox(mailbox.id)?;
                        Ok((
                            Some(mailbox.id),
                            tx.delete_orphan_messages()?,
                        ))
                    })?
                };

                self.store.delete(&orphans)?;
                if let Some(mailbox_id) = mailbox_id {
                    self.broadcast(
                        mailbox_id,
                        None,
                        &[MailboxUpdate::MailboxDeleted],
                    );
                }
                Ok(())
            },

            Update::MessageCreated {
                message,
                literal,
                mailboxes,
            } => self.apply_message_created(message, literal, &mailboxes),

            Update::MessageUpdated { id, flags } => {
                let broadcasts = {
                    let mut db = self.db.lock().unwrap();
                    db.write(|tx| {
                        let Some(entry) = tx.message_by_remote_id(&id)?
                        else {
                            return Ok(Vec::new());
                        };

                        tx.set_message_flags(entry.id, &flags)?;

                        let deleted = flags.contains(&Flag::Deleted);
                        let placements = tx.uids_for_message(entry.id)?;
                        let mut broadcasts = Vec::new();
                        for (mailbox_id, uid, _, _) in placements {
                            tx.set_deleted(mailbox_id, &[uid], deleted)?;
                            let mut row_flags =
                                tx.message_flags(entry.id)?;
                            if deleted {
                                row_flags.insert(Flag::Deleted);
                            }
                            broadcasts.push((
                                mailbox_id,
                                MailboxUpdate::FlagsChanged {
                                    uid,
                                    flags: row_flags,
                                },
                            ));
                        }
                        Ok(broadcasts)
                    })?
                };

                for (mailbox_id, update) in broadcasts {
                    self.broadcast(mailbox_id, None, &[update]);
                }
                Ok(())
            },

            Update::MessageDeleted { id } => {
                let (placements, blob) = {
                    let mut db = self.db.lock().unwrap();
                    db.write(|tx| {
                        let Some(entry) = tx.message_by_remote_id(&id)?
                        else {
                            return Ok((Vec::new(), None));
                        };
                        let placements =
                            tx.remove_message_from_mailboxes(entry.id)?;
                        tx.delete_message(entry.id)?;
                        Ok((placements, Some(entry.id)))
                    })?
                };

                if let Some(blob) = blob {
                    self.store.delete(&[blob])?;
                }
                for (mailbox_id, uid) in placements {
                    self.broadcast(
                        mailbox_id,
                        None,
                        &[MailboxUpdate::Expunged { uid }],
                    );
                }
                Ok(())
            },

            Update::UidValidityBumped => {
                let new = {
                    let mut db = self.db.lock().unwrap();
                    db.write(|tx| {
                        let new = tx.bump_uid_validity()?;
                        tx.set_all_mailbox_uid_validity(new)?;
                        Ok(new)
                    })?
                };

                self.broadcast_all_selected(&[
                    MailboxUpdate::UidValidityBumped(new),
                ]);
                Ok(())
            },
        }
    }

    fn apply_message_created(
        &self,
        message: MessageData,
        literal: Vec<u8>,
        mailboxes: &[RemoteMailboxId],
    ) -> Result<(), Error> {
        // Write the blob first: an orphaned blob is harmless, a UID record
        // without its literal is not.
        let (message_id, created) = {
            let mut db = self.db.lock().unwrap();
            let existing =
                db.read(|tx| tx.message_by_remote_id(&message.id))?;
            match existing {
                Some(entry) => (entry.id, false),
                None => (MessageId::new(), true),
            }
        };

        if created {
            self.store.set(message_id, &mut &literal[..])?;
        }

        let broadcasts = {
            let mut db = self.db.lock().unwrap();
            db.write(|tx| {
                if created {
                    tx.insert_message(&MessageEntry {
                        id: message_id,
                        remote_id: message.id.clone(),
                        size: literal.len() as u32,
                        internal_date: message.internal_date,
                    })?;
                    tx.set_message_flags(message_id, &message.flags)?;
                }

                let deleted = message.flags.contains(&Flag::Deleted);
                let mut broadcasts = Vec::new();

                for remote in mailboxes {
                    let Some(mailbox) = tx.mailbox_by_remote_id(remote)?
                    else {
                        continue;
                    };

                    let assigned = tx.add_messages_to_mailbox(
                        mailbox.id,
                        &[(message_id, true)],
                    )?;

                    for (_, uid) in assigned {
                        if deleted {
                            tx.set_deleted(mailbox.id, &[uid], true)?;
                        }

                        let mut flags = tx.message_flags(message_id)?;
                        if deleted {
                            flags.insert(Flag::Deleted);
                        }

                        broadcasts.push((
                            mailbox.id,
                            MailboxUpdate::Exists {
                                uid,
                                message_id,
                                flags,
                                recent: true,
                            },
                        ));
                    }
                }

                Ok(broadcasts)
            })?
        };

        for (mailbox_id, update) in broadcasts {
            self.broadcast(mailbox_id, None, &[update]);
        }

        Ok(())
    }

    /// Joins hierarchical name components with the configured delimiter.
    pub fn join_name(&self, parts: &[String]) -> String {
        parts.join(&(self.config.delimiter as char).to_string())
    }

    /// Splits a wire-form mailbox name into components.
    pub fn split_name(&self, name: &str) -> Vec<String> {
        name.split(self.config.delimiter as char)
            .map(str::to_owned)
            .collect()
    }

    /// Normalises the INBOX prefix to its canonical upper-case form.
    pub fn normalize_mailbox_name(&self, raw: &str) -> String {
        let mut parts = self.split_name(raw);
        if let Some(first) = parts.first_mut() {
            if first.eq_ignore_ascii_case("INBOX") {
                *first = "INBOX".to_owned();
            }
        }
        self.join_name(&parts)
    }

    /// Timestamp used when APPEND supplies no date.
    pub fn now(&self) -> chrono::DateTime<Utc> {
        Utc::now()
    }
}
