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

//! The parsed command model.
//!
//! Commands are a tagged variant carrying per-command payload structs;
//! dispatch in the session is a plain `match`.

pub mod fetch;
pub mod parser;
pub mod search;
pub mod sequence;

use chrono::{DateTime, FixedOffset};

use self::fetch::FetchCommand;
use self::search::SearchCommand;
use self::sequence::SeqSet;
use crate::model::FlagSet;

#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    /// `None` only for the tagless `DONE` keyword.
    pub tag: Option<String>,
    pub body: CommandBody,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CommandBody {
    Capability,
    Noop,
    Logout,
    StartTls,
    Check,
    Close,
    Expunge,
    Unselect,
    Idle,
    Done,
    Login {
        username: String,
        password: String,
    },
    Authenticate {
        mechanism: String,
        /// Raw base64, either from the SASL initial response or read by the
        /// session after the continuation prompt.
        initial: Option<Vec<u8>>,
    },
    Select {
        mailbox: String,
    },
    Examine {
        mailbox: String,
    },
    Create {
        mailbox: String,
    },
    Delete {
        mailbox: String,
    },
    Rename {
        from: String,
        to: String,
    },
    Subscribe {
        mailbox: String,
    },
    Unsubscribe {
        mailbox: String,
    },
    List {
        reference: String,
        pattern: String,
    },
    Lsub {
        reference: String,
        pattern: String,
    },
    Status {
        mailbox: String,
        items: Vec<StatusItem>,
    },
    Append {
        mailbox: String,
        flags: FlagSet,
        date: Option<DateTime<FixedOffset>>,
        literal: Vec<u8>,
    },
    Search(SearchCommand),
    Fetch(FetchCommand),
    Store(StoreCommand),
    Copy {
        set: SeqSet,
        mailbox: String,
    },
    Move {
        set: SeqSet,
        mailbox: String,
    },
    Uid(UidCommand),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusItem {
    Messages,
    Recent,
    UidNext,
    UidValidity,
    Unseen,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StoreCommand {
    pub set: SeqSet,
    pub action: StoreAction,
    pub silent: bool,
    pub flags: FlagSet,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreAction {
    Replace,
    Add,
    Remove,
}

/// The UID-prefixed command family, including the UID EXPUNGE extension.
#[derive(Clone, Debug, PartialEq)]
pub enum UidCommand {
    Copy { set: SeqSet, mailbox: String },
    Move { set: SeqSet, mailbox: String },
    Fetch(FetchCommand),
    Search(SearchCommand),
    Store(StoreCommand),
    Expunge(SeqSet),
}
