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

//! An embeddable IMAP4rev1 server library.
//!
//! The host application supplies a [`Connector`] bridging to its own mail
//! backend and (optionally) a [`Store`] for message literals; berth
//! speaks IMAP to clients, maintains per-user metadata (mailboxes, UIDs,
//! flags) in SQLite, and keeps client-visible state coherent with
//! backend changes delivered asynchronously through the connector.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use berth::{DummyConnector, Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), berth::Error> {
//!     let server = Server::new(ServerConfig::new("data", "db"))?;
//!     server.add_user("user", "password", Arc::new(DummyConnector::new()))?;
//!
//!     let listener =
//!         tokio::net::TcpListener::bind("127.0.0.1:1143").await?;
//!     server.serve(listener).await
//! }
//! ```
//!
//! Supported extensions: IDLE, UIDPLUS, MOVE, UNSELECT, and STARTTLS.

pub mod command;
pub mod config;
pub mod connector;
pub mod db;
pub mod model;
pub mod parser;
pub mod response;
pub mod server;
mod session;
pub mod state;
pub mod store;
pub mod support;

pub use config::{
    ImapLimits, LogReporter, Reporter, ServerConfig, VersionInfo,
};
pub use connector::{
    Connector, DummyConnector, MailboxData, MessageData, Update,
};
pub use model::{
    Flag, FlagSet, RemoteMailboxId, RemoteMessageId, Uid, UidValidity,
};
pub use server::Server;
pub use store::{OnDiskStore, Semaphore, Store};
pub use support::error::Error;
