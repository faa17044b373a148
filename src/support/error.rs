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

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("No such mailbox")]
    NxMailbox,
    #[error("Mailbox already exists")]
    MailboxExists,
    #[error("Mailbox is read-only")]
    MailboxReadOnly,
    #[error("Mailbox is not selectable")]
    MailboxUnselectable,
    #[error("Operation not allowed for INBOX")]
    BadOperationOnInbox,
    #[error("Mailbox name too long")]
    MailboxNameTooLong,
    #[error("Too many subscriptions")]
    TooManySubscriptions,
    #[error("Non-existent message")]
    NxMessage,
    #[error("Message expunged")]
    ExpungedMessage,
    #[error("Message sequence number out of range")]
    UnaddressableMessage,
    #[error("Message exceeds size limit")]
    MessageTooLarge,
    #[error("Invalid credentials")]
    BadCredentials,
    #[error("Unknown or unsupported charset")]
    BadCharset,
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Mail store entry is corrupt")]
    CorruptBlob,
    #[error("Connector error: {0}")]
    Connector(String),
    #[error("Internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Ssl(#[from] openssl::error::ErrorStack),
    #[error(transparent)]
    Nix(#[from] nix::Error),
}

impl Error {
    /// Whether the session this error arose on is still usable.
    ///
    /// Unusable-connection errors result in an untagged `BYE` and teardown
    /// instead of a tagged `NO`.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Io(..) | Error::Ssl(..) | Error::Nix(..))
    }
}
