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

//! One IMAP session: reader task, handler task, and the glue between
//! them.
//!
//! The reader parses commands in a loop and publishes them onto a
//! channel. STARTTLS is consumed inside the reader, before the command
//! would be published, because the very next byte has to be read from the
//! upgraded stream. The handler owns all session state; the writer actor
//! (`response::write_responses`) is the single owner of the output
//! stream.

mod auth;
mod fetch;
mod idle;
mod mailboxes;
mod messages;
mod search;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::{mpsc, oneshot};

use crate::command::parser::CommandParser;
use crate::command::{Command, CommandBody, UidCommand};
use crate::config::ServerConfig;
use crate::db::MailboxEntry;
use crate::model::Flag;
use crate::response::{
    render_line, OutputControl, OutputEvent, RespCode, Response,
};
use crate::server::ServerState;
use crate::state::snapshot::{SnapMessage, Snapshot};
use crate::state::updates::{MailboxUpdate, SessionQueue};
use crate::state::User;
use crate::support::async_io::ServerIo;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;

/// Raw TLS record prefixes seen when a client speaks TLS at a plaintext
/// socket.
static TLS_HEADERS: &[[u8; 3]] = &[
    [0x16, 0x03, 0x01],
    [0x16, 0x03, 0x02],
    [0x16, 0x03, 0x03],
    [0x16, 0x03, 0x04],
    [0x16, 0x00, 0x00],
];

/// What the reader hands to the handler per parse attempt.
pub(crate) enum ReaderEvent {
    Command(Command),
    /// Parse failure already recovered from (input dropped to CRLF).
    ParseFailed {
        tag: Option<String>,
        message: String,
    },
}

/// Flags shared between the reader and handler tasks.
pub(crate) struct SessionShared {
    pub authenticated: AtomicBool,
    pub tls_active: AtomicBool,
}

/// Per-command result: the tagged response to send, produced either way.
pub(crate) type CmdResult = Result<Response, Response>;

pub(crate) struct Selected {
    pub mailbox: MailboxEntry,
    pub snapshot: Snapshot,
    pub read_only: bool,
    pub reported_exists: usize,
    pub reported_recent: usize,
}

pub(crate) struct Session {
    pub server: Arc<ServerState>,
    pub config: Arc<ServerConfig>,
    pub log_prefix: LogPrefix,
    pub session_id: u64,
    pub shared: Arc<SessionShared>,
    pub out: mpsc::Sender<OutputEvent>,
    pub user: Option<Arc<User>>,
    pub queue: Option<Arc<SessionQueue>>,
    pub selected: Option<Selected>,
    pub logged_out: bool,
    /// Set when the selected mailbox was deleted under us: the next
    /// command is answered with BYE.
    pub bye_pending: bool,
}

/// Runs the reader task: parse, handle STARTTLS inline, publish.
pub(crate) async fn read_commands(
    io: ServerIo,
    out: mpsc::Sender<OutputEvent>,
    cmd_tx: mpsc::Sender<ReaderEvent>,
    shared: Arc<SessionShared>,
    config: Arc<ServerConfig>,
    log_prefix: LogPrefix,
) {
    let mut parser = CommandParser::new(io.clone())
        .with_continuation(out.clone())
        .with_max_literal(config.limits.max_literal_size);

    loop {
        match parser.parse().await {
            Ok(Command {
                tag: Some(tag),
                body: CommandBody::StartTls,
            }) => {
                if !handle_starttls(
                    &io,
                    &out,
                    &shared,
                    &config,
                    &log_prefix,
                    &tag,
                )
                .await
                {
                    return;
                }
            },

            Ok(Command {
                tag,
                body:
                    CommandBody::Authenticate {
                        mechanism,
                        initial: None,
                    },
            }) if !config.disable_imap_authenticate => {
                // The SASL response arrives on its own line after the
                // continuation prompt; only the reader can consume it.
                if out
                    .send(OutputEvent::Continuation {
                        prompt: String::new(),
                    })
                    .await
                    .is_err()
                {
                    return;
                }

                let initial = match parser.read_line().await {
                    Ok(line) => line,
                    Err(_) => return,
                };

                let command = Command {
                    tag,
                    body: CommandBody::Authenticate {
                        mechanism,
                        initial: Some(initial),
                    },
                };
                if cmd_tx.send(ReaderEvent::Command(command)).await.is_err()
                {
                    return;
                }
            },

            Ok(command) => {
                if cmd_tx.send(ReaderEvent::Command(command)).await.is_err()
                {
                    return;
                }
            },

            Err(e) if e.is_io() => {
                // EOF or a dead connection; nothing to recover.
                return;
            },

            Err(e) => {
                let prefix = parser.raw_prefix();
                if TLS_HEADERS.iter().any(|h| *h == prefix) {
                    error!(
                        "{} TLS handshake detected on plaintext session",
                        log_prefix,
                    );
                    return;
                }

                warn!(
                    "{} failed to parse command {:?}: {}",
                    log_prefix,
                    parser.last_command().unwrap_or(""),
                    e,
                );

                if parser.consume_invalid_input().await.is_err() {
                    return;
                }

                let event = ReaderEvent::ParseFailed {
                    tag: parser.last_tag().map(str::to_owned),
                    message: e.wire_message(),
                };
                if cmd_tx.send(event).await.is_err() {
                    return;
                }
            },
        }
    }
}

/// Performs the STARTTLS exchange. Returns false when the session must be
/// torn down.
async fn handle_starttls(
    io: &ServerIo,
    out: &mpsc::Sender<OutputEvent>,
    shared: &SessionShared,
    config: &ServerConfig,
    log_prefix: &LogPrefix,
    tag: &str,
) -> bool {
    let reject = if shared.tls_active.load(Ordering::SeqCst) {
        Some("TLS already active")
    } else if shared.authenticated.load(Ordering::SeqCst) {
        Some("STARTTLS not allowed after authentication")
    } else if config.tls.is_none() {
        Some("TLS not configured")
    } else {
        None
    };

    if let Some(reason) = reject {
        let line = render_line(Some(tag), &Response::bad(reason));
        return out
            .send(OutputEvent::Line {
                data: line,
                ctl: OutputControl::Flush,
            })
            .await
            .is_ok();
    }

    // The OK must reach the wire before the handshake starts; sync with
    // the writer actor.
    let line = render_line(Some(tag), &Response::ok("Begin TLS negotiation"));
    if out
        .send(OutputEvent::Line {
            data: line,
            ctl: OutputControl::Flush,
        })
        .await
        .is_err()
    {
        return false;
    }

    let (ack_tx, ack_rx) = oneshot::channel();
    if out.send(OutputEvent::Synced(ack_tx)).await.is_err() {
        return false;
    }
    if ack_rx.await.is_err() {
        return false;
    }

    let acceptor = config.tls.as_ref().expect("checked above");
    match io.ssl_accept(acceptor).await {
        Ok(()) => {
            shared.tls_active.store(true, Ordering::SeqCst);
            info!("{} TLS established", log_prefix);
            true
        },
        Err(e) => {
            error!("{} TLS handshake failed: {}", log_prefix, e);
            false
        },
    }
}

impl Session {
    pub fn new(
        server: Arc<ServerState>,
        session_id: u64,
        log_prefix: LogPrefix,
        shared: Arc<SessionShared>,
        out: mpsc::Sender<OutputEvent>,
    ) -> Self {
        let config = Arc::clone(&server.config);
        Session {
            server,
            config,
            log_prefix,
            session_id,
            shared,
            out,
            user: None,
            queue: None,
            selected: None,
            logged_out: false,
            bye_pending: false,
        }
    }

    /// The handler task: greets, then processes reader events until
    /// logout or disconnect.
    pub async fn run(&mut self, mut rx: mpsc::Receiver<ReaderEvent>) {
        self.send_greeting().await;

        while !self.logged_out {
            let Some(event) = rx.recv().await else {
                break;
            };

            match event {
                ReaderEvent::ParseFailed { tag, message } => {
                    self.send_line(
                        tag.as_deref(),
                        &Response::bad(message),
                        OutputControl::Flush,
                    )
                    .await;
                },

                ReaderEvent::Command(command) => {
                    self.handle_command(command, &mut rx).await;
                },
            }
        }

        if let (Some(user), Some(_)) = (&self.user, &self.queue) {
            user.deregister_session(self.session_id);
        }
    }

    async fn send_greeting(&mut self) {
        let version = &self.config.version;
        let text = format!(
            "{} {}.{}.{} ready",
            version.name, version.major, version.minor, version.patch,
        );
        let caps = self.capabilities();
        self.send_line(
            None,
            &Response::ok_code(RespCode::Capability(caps), text),
            OutputControl::Flush,
        )
        .await;
    }

    async fn handle_command(
        &mut self,
        command: Command,
        rx: &mut mpsc::Receiver<ReaderEvent>,
    ) {
        let Command { tag, body } = command;

        // A deleted selected mailbox turns the next command into a BYE.
        if self.bye_pending {
            self.send_line(
                None,
                &Response::bye("Selected mailbox no longer exists"),
                OutputControl::Disconnect,
            )
            .await;
            self.logged_out = true;
            return;
        }

        let Some(tag) = tag else {
            // DONE outside of IDLE.
            self.send_line(
                None,
                &Response::bad("DONE while not idling"),
                OutputControl::Flush,
            )
            .await;
            return;
        };

        let allow_expunge = expunge_permitted(&body);

        let result = match body {
            CommandBody::Capability => self.cmd_capability().await,
            CommandBody::Noop => Ok(Response::ok("NOOP")),
            CommandBody::Check => self.in_selected(|_| Ok(Response::ok("CHECK"))),
            CommandBody::Logout => self.cmd_logout().await,
            CommandBody::StartTls => {
                // Real STARTTLS is consumed by the reader; reaching here
                // means it arrived in a state the reader rejected... or
                // pipelined weirdness. Either way:
                Ok(Response::bad("STARTTLS not available"))
            },
            CommandBody::Login { username, password } => {
                self.cmd_login(&username, &password).await
            },
            CommandBody::Authenticate { mechanism, initial } => {
                self.cmd_authenticate(&mechanism, initial.as_deref()).await
            },
            CommandBody::Select { mailbox } => {
                self.cmd_select(&mailbox, false).await
            },
            CommandBody::Examine { mailbox } => {
                self.cmd_select(&mailbox, true).await
            },
            CommandBody::Create { mailbox } => self.cmd_create(&mailbox).await,
            CommandBody::Delete { mailbox } => self.cmd_delete(&mailbox).await,
            CommandBody::Rename { from, to } => {
                self.cmd_rename(&from, &to).await
            },
            CommandBody::Subscribe { mailbox } => {
                self.cmd_subscribe(&mailbox, true).await
            },
            CommandBody::Unsubscribe { mailbox } => {
                self.cmd_subscribe(&mailbox, false).await
            },
            CommandBody::List { reference, pattern } => {
                self.cmd_list(&reference, &pattern, false).await
            },
            CommandBody::Lsub { reference, pattern } => {
                self.cmd_list(&reference, &pattern, true).await
            },
            CommandBody::Status { mailbox, items } => {
                self.cmd_status(&mailbox, &items).await
            },
            CommandBody::Append {
                mailbox,
                flags,
                date,
                literal,
            } => self.cmd_append(&mailbox, flags, date, literal).await,
            CommandBody::Close => self.cmd_close().await,
            CommandBody::Unselect => self.cmd_unselect().await,
            CommandBody::Expunge => self.cmd_expunge(None).await,
            CommandBody::Search(search) => {
                self.cmd_search(search, false).await
            },
            CommandBody::Fetch(fetch) => self.cmd_fetch(fetch, false).await,
            CommandBody::Store(store) => self.cmd_store(store, false).await,
            CommandBody::Copy { set, mailbox } => {
                self.cmd_copy(set, &mailbox, false).await
            },
            CommandBody::Move { set, mailbox } => {
                self.cmd_move(set, &mailbox, false).await
            },
            CommandBody::Idle => self.cmd_idle(rx).await,
            CommandBody::Done => {
                Ok(Response::bad("DONE while not idling"))
            },
            CommandBody::Uid(uid) => match uid {
                UidCommand::Fetch(fetch) => {
                    self.cmd_fetch(fetch, true).await
                },
                UidCommand::Search(search) => {
                    self.cmd_search(search, true).await
                },
                UidCommand::Store(store) => {
                    self.cmd_store(store, true).await
                },
                UidCommand::Copy { set, mailbox } => {
                    self.cmd_copy(set, &mailbox, true).await
                },
                UidCommand::Move { set, mailbox } => {
                    self.cmd_move(set, &mailbox, true).await
                },
                UidCommand::Expunge(set) => {
                    self.cmd_uid_expunge(set).await
                },
            },
        };

        // Other parties' changes are surfaced at the command boundary,
        // before the tagged line.
        self.flush_updates(allow_expunge).await;

        let response = match result {
            Ok(response) | Err(response) => response,
        };
        let ctl = if response.is_bye() {
            self.logged_out = true;
            OutputControl::Disconnect
        } else {
            OutputControl::Flush
        };

        let tagged_is_bye = response.is_bye();
        if tagged_is_bye {
            // BYE is always untagged; follow with nothing.
            self.send_line(None, &response, ctl).await;
        } else {
            self.send_line(Some(&tag), &response, ctl).await;
        }
    }

    /// Advertised capability set for the current state.
    pub fn capabilities(&self) -> Vec<String> {
        let mut caps = vec![
            "IMAP4rev1".to_owned(),
            "IDLE".to_owned(),
            "UIDPLUS".to_owned(),
            "MOVE".to_owned(),
            "UNSELECT".to_owned(),
        ];

        let authenticated = self.shared.authenticated.load(Ordering::SeqCst);
        if !authenticated {
            if self.config.tls.is_some()
                && !self.shared.tls_active.load(Ordering::SeqCst)
            {
                caps.push("STARTTLS".to_owned());
            }
            if !self.config.disable_imap_authenticate {
                caps.push("AUTH=PLAIN".to_owned());
            }
        }

        caps
    }

    // ---- state helpers ----

    pub fn authenticated(&self) -> Result<&Arc<User>, Response> {
        self.user
            .as_ref()
            .ok_or_else(|| Response::bad("Not authenticated"))
    }

    pub fn in_selected<T>(
        &mut self,
        f: impl FnOnce(&mut Selected) -> Result<T, Response>,
    ) -> Result<T, Response> {
        match self.selected.as_mut() {
            Some(selected) => f(selected),
            None => Err(Response::bad("No mailbox selected")),
        }
    }

    /// Maps an operation error onto the tagged response per the error
    /// taxonomy. Fatal errors become BYE.
    pub fn map_error(&self, e: Error) -> Response {
        match e {
            Error::NxMailbox => Response::no("No such mailbox"),
            Error::MailboxExists => {
                Response::no("Mailbox already exists")
            },
            Error::MailboxReadOnly => {
                Response::no("Mailbox is read-only")
            },
            Error::MailboxUnselectable => {
                Response::no("Mailbox is not selectable")
            },
            Error::BadOperationOnInbox => {
                Response::no("Operation not allowed for INBOX")
            },
            Error::MailboxNameTooLong => {
                Response::no("Mailbox name too long")
            },
            Error::TooManySubscriptions => {
                Response::no("Too many subscriptions")
            },
            Error::NxMessage | Error::ExpungedMessage => {
                Response::no("No such message")
            },
            Error::UnaddressableMessage => {
                Response::bad("Message sequence number out of range")
            },
            Error::MessageTooLarge => {
                Response::no("Message exceeds size limit")
            },
            Error::BadCredentials => {
                Response::no("Invalid credentials")
            },
            Error::BadCharset => Response::no_code(
                RespCode::BadCharset,
                "Unknown charset",
            ),
            Error::Cancelled => Response::no("Operation cancelled"),
            Error::CorruptBlob => {
                self.config
                    .reporter
                    .report_error("reading message blob", &Error::CorruptBlob);
                Response::no("Message data unavailable")
            },
            Error::Connector(ref message) => {
                warn!("{} connector error: {}", self.log_prefix, message);
                Response::no("Backend error")
            },
            Error::Sqlite(ref inner) => {
                error!("{} storage error: {}", self.log_prefix, inner);
                self.config.reporter.report_error("metadata storage", &e);
                Response::no("Storage error")
            },
            Error::Internal(ref message) => {
                error!("{} internal error: {}", self.log_prefix, message);
                self.config.reporter.report_error("session internal", &e);
                Response::bye("Internal server error")
            },
            Error::Io(..) | Error::Ssl(..) | Error::Nix(..) => {
                error!("{} connection error: {}", self.log_prefix, e);
                Response::bye("Connection error")
            },
        }
    }

    // ---- output helpers ----

    pub async fn send_line(
        &self,
        tag: Option<&str>,
        response: &Response,
        ctl: OutputControl,
    ) {
        let _ = self
            .out
            .send(OutputEvent::Line {
                data: render_line(tag, response),
                ctl,
            })
            .await;
    }

    pub async fn send_untagged(&self, response: &Response) {
        self.send_line(None, response, OutputControl::Buffer).await;
    }

    // ---- the flush protocol ----

    /// Applies queued updates from other parties to the snapshot and
    /// emits the corresponding untagged responses.
    ///
    /// EXPUNGE responses (and the mailbox-deleted teardown) are only
    /// emitted when `allow_expunge`; otherwise those updates stay queued
    /// for a later flush point. EXPUNGEs go out in descending seqnum
    /// order so the client's renumbering arithmetic stays valid.
    pub async fn flush_updates(&mut self, allow_expunge: bool) {
        let Some(queue) = self.queue.clone() else {
            return;
        };
        if self.selected.is_none() || !queue.has_pending() {
            return;
        }

        let drained = queue.drain();
        let mut deferred = Vec::new();
        let mut expunge_uids = Vec::new();
        let mut exists_rows = Vec::new();
        let mut flag_changes = Vec::new();
        let mut validity_bump = None;
        let mut mailbox_deleted = false;

        for update in drained {
            match update {
                MailboxUpdate::Expunged { .. }
                | MailboxUpdate::MailboxDeleted
                    if !allow_expunge =>
                {
                    deferred.push(update);
                },
                MailboxUpdate::Expunged { uid } => expunge_uids.push(uid),
                MailboxUpdate::MailboxDeleted => mailbox_deleted = true,
                MailboxUpdate::Exists {
                    uid,
                    message_id,
                    flags,
                    recent,
                } => exists_rows.push((uid, message_id, flags, recent)),
                MailboxUpdate::FlagsChanged { uid, flags } => {
                    flag_changes.push((uid, flags))
                },
                MailboxUpdate::UidValidityBumped(v) => {
                    validity_bump = Some(v)
                },
            }
        }

        queue.requeue_front(deferred);

        let mut lines = Vec::<Response>::new();
        {
            let selected = self
                .selected
                .as_mut()
                .expect("flush_updates with no selection");

            // Expunges first, descending. Each one the client processes
            // decrements its idea of the mailbox size.
            let mut client_view = selected.reported_exists;
            expunge_uids.sort_unstable_by(|a, b| b.cmp(a));
            for uid in expunge_uids {
                if let Some(seq) = selected.snapshot.expunge_uid(uid) {
                    lines.push(Response::Expunge(seq.get()));
                    client_view = client_view.saturating_sub(1);
                }
            }

            // New arrivals, ascending by UID.
            exists_rows.sort_unstable_by_key(|&(uid, ..)| uid);
            for (uid, message_id, mut flags, recent) in exists_rows {
                if recent {
                    flags.insert(Flag::Recent);
                }
                selected.snapshot.append(SnapMessage {
                    uid,
                    id: message_id,
                    flags,
                    recent,
                });
            }

            if selected.snapshot.len() != client_view {
                lines.push(Response::Exists(
                    selected.snapshot.len() as u32,
                ));
            }
            selected.reported_exists = selected.snapshot.len();
            let recent_now = selected.snapshot.recent_count();
            if recent_now != selected.reported_recent {
                selected.reported_recent = recent_now;
                lines.push(Response::Recent(recent_now as u32));
            }

            // Flag updates for messages still present.
            for (uid, mut flags) in flag_changes {
                let Some((_, row)) = selected.snapshot.get_by_uid(uid)
                else {
                    continue;
                };
                if row.recent {
                    flags.insert(Flag::Recent);
                }
                selected.snapshot.update_flags(uid, flags.clone());

                let seq = selected
                    .snapshot
                    .seq_of_uid(uid)
                    .expect("row vanished during flush");
                lines.push(Response::Fetch {
                    seq: seq.get(),
                    items: vec![
                        crate::response::FetchItem::Flags(flags),
                        crate::response::FetchItem::Uid(uid.get()),
                    ],
                });
            }

            if let Some(validity) = validity_bump {
                lines.push(Response::ok_code(
                    RespCode::UidValidity(validity.get()),
                    "UIDVALIDITY changed",
                ));
            }
        }

        for line in &lines {
            self.send_untagged(line).await;
        }

        if mailbox_deleted {
            self.selected = None;
            queue.select(None);
            self.bye_pending = true;
        }
    }

    /// Deselects without expunging (UNSELECT, failed SELECT, implicit
    /// deselect).
    pub fn deselect(&mut self) {
        self.selected = None;
        if let Some(ref queue) = self.queue {
            queue.select(None);
        }
    }
}

/// FETCH, STORE, and SEARCH (non-UID) forbid expunge responses because
/// they would invalidate the sequence numbers the client is using. UID
/// variants and everything else permit them.
fn expunge_permitted(body: &CommandBody) -> bool {
    !matches!(
        *body,
        CommandBody::Fetch(..)
            | CommandBody::Store(..)
            | CommandBody::Search(..),
    )
}
