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

//! The per-user metadata database: mailboxes, messages, UID records,
//! flags, and the UID-validity singleton.
//!
//! Access is transactional through `read` and `write`; all entity
//! operations hang off the transaction wrapper so that multi-step
//! mutations (UID allocation and its `uid_next` bump, recent-clearing at
//! select time) are atomic by construction.
//!
//! `\Deleted` and `\Recent` are mailbox-scoped and live on the UID record;
//! every other flag is message-scoped and lives in `message_flag`.

use std::path::Path;
use std::str::FromStr as _;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension as _;

use crate::model::{
    Flag, FlagSet, MailboxId, MessageId, RemoteMailboxId, RemoteMessageId,
    Uid, UidValidity,
};
use crate::support::error::Error;

static SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS `uid_validity` (\
  `id` INTEGER NOT NULL PRIMARY KEY CHECK (`id` = 1), \
  `uid_validity` INTEGER NOT NULL\
) STRICT;\n\
CREATE TABLE IF NOT EXISTS `mailbox` (\
  `id` INTEGER NOT NULL PRIMARY KEY, \
  `remote_id` TEXT NOT NULL UNIQUE, \
  `name` TEXT NOT NULL UNIQUE, \
  `uid_next` INTEGER NOT NULL DEFAULT 1, \
  `uid_validity` INTEGER NOT NULL, \
  `subscribed` INTEGER NOT NULL DEFAULT 1, \
  `flags` TEXT NOT NULL DEFAULT '', \
  `perm_flags` TEXT NOT NULL DEFAULT '', \
  `attrs` TEXT NOT NULL DEFAULT ''\
) STRICT;\n\
CREATE TABLE IF NOT EXISTS `message` (\
  `id` TEXT NOT NULL PRIMARY KEY, \
  `remote_id` TEXT NOT NULL UNIQUE, \
  `size` INTEGER NOT NULL, \
  `internal_date` TEXT NOT NULL\
) STRICT;\n\
CREATE TABLE IF NOT EXISTS `uid` (\
  `mailbox_id` INTEGER NOT NULL \
    REFERENCES `mailbox` (`id`) ON DELETE CASCADE, \
  `message_id` TEXT NOT NULL \
    REFERENCES `message` (`id`) ON DELETE CASCADE, \
  `uid` INTEGER NOT NULL, \
  `recent` INTEGER NOT NULL DEFAULT 0, \
  `deleted` INTEGER NOT NULL DEFAULT 0, \
  PRIMARY KEY (`mailbox_id`, `message_id`), \
  UNIQUE (`mailbox_id`, `uid`)\
) STRICT;\n\
CREATE TABLE IF NOT EXISTS `message_flag` (\
  `message_id` TEXT NOT NULL \
    REFERENCES `message` (`id`) ON DELETE CASCADE, \
  `value` TEXT NOT NULL, \
  PRIMARY KEY (`message_id`, `value`)\
) STRICT;\n";

#[derive(Clone, Debug)]
pub struct MailboxEntry {
    pub id: MailboxId,
    pub remote_id: RemoteMailboxId,
    pub name: String,
    /// The next UID to assign, 1-based.
    pub uid_next: u32,
    pub uid_validity: UidValidity,
    pub flags: FlagSet,
    pub permanent_flags: FlagSet,
    pub attributes: FlagSet,
    pub subscribed: bool,
}

#[derive(Clone, Debug)]
pub struct MessageEntry {
    pub id: MessageId,
    pub remote_id: RemoteMessageId,
    pub size: u32,
    pub internal_date: DateTime<Utc>,
}

/// One row of a freshly-built snapshot, ordered by UID.
#[derive(Clone, Debug)]
pub struct SnapshotRow {
    pub uid: Uid,
    pub message_id: MessageId,
    pub flags: FlagSet,
    pub recent: bool,
    pub deleted: bool,
}

pub struct Db {
    cxn: rusqlite::Connection,
}

impl Db {
    pub fn open(path: &Path) -> Result<Self, Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(rusqlite::Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, Error> {
        Self::init(rusqlite::Connection::open_in_memory()?)
    }

    fn init(cxn: rusqlite::Connection) -> Result<Self, Error> {
        cxn.execute("PRAGMA foreign_keys = ON", ())?;
        cxn.busy_timeout(Duration::from_secs(10))?;
        cxn.execute_batch(SCHEMA)?;
        Ok(Db { cxn })
    }

    /// Runs `f` in a read transaction.
    pub fn read<T>(
        &mut self,
        f: impl FnOnce(&DbTx<'_>) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let tx = self.cxn.transaction()?;
        let result = f(&DbTx { tx: &tx });
        tx.commit()?;
        result
    }

    /// Runs `f` in a write transaction, committing on success and rolling
    /// back on error.
    pub fn write<T>(
        &mut self,
        f: impl FnOnce(&DbTx<'_>) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let tx = self.cxn.transaction_with_behavior(
            rusqlite::TransactionBehavior::Immediate,
        )?;

        match f(&DbTx { tx: &tx }) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            },
            Err(e) => {
                let _ = tx.rollback();
                Err(e)
            },
        }
    }
}

pub struct DbTx<'a> {
    tx: &'a rusqlite::Transaction<'a>,
}

impl DbTx<'_> {
    // ---- UID validity singleton ----

    /// Persists the initial UID-validity. Later calls only ever raise it.
    pub fn init_uid_validity(
        &self,
        seed: UidValidity,
    ) -> Result<UidValidity, Error> {
        let current = self
            .tx
            .query_row(
                "SELECT `uid_validity` FROM `uid_validity` WHERE `id` = 1",
                (),
                |row| row.get::<_, u32>(0),
            )
            .optional()?;

        match current {
            None => {
                self.tx.execute(
                    "INSERT INTO `uid_validity` (`id`, `uid_validity`) \
                     VALUES (1, ?)",
                    (seed.get(),),
                )?;
                Ok(seed)
            },
            Some(current) if seed.get() > current => {
                self.set_uid_validity(seed)?;
                Ok(seed)
            },
            Some(current) => Ok(UidValidity(current)),
        }
    }

    pub fn uid_validity(&self) -> Result<UidValidity, Error> {
        self.tx
            .query_row(
                "SELECT `uid_validity` FROM `uid_validity` WHERE `id` = 1",
                (),
                |row| row.get::<_, u32>(0),
            )
            .map(UidValidity)
            .map_err(Into::into)
    }

    fn set_uid_validity(&self, value: UidValidity) -> Result<(), Error> {
        self.tx.execute(
            "UPDATE `uid_validity` SET `uid_validity` = ? WHERE `id` = 1",
            (value.get(),),
        )?;
        Ok(())
    }

    /// Unconditionally advances the global epoch, returning the new value.
    pub fn bump_uid_validity(&self) -> Result<UidValidity, Error> {
        let new = self.uid_validity()?.next();
        self.set_uid_validity(new)?;
        Ok(new)
    }

    /// Stamps every mailbox with the given epoch (a connector-requested
    /// global bump).
    pub fn set_all_mailbox_uid_validity(
        &self,
        value: UidValidity,
    ) -> Result<(), Error> {
        self.tx.execute(
            "UPDATE `mailbox` SET `uid_validity` = ?",
            (value.get(),),
        )?;
        Ok(())
    }

    // ---- Mailboxes ----

    pub fn create_mailbox(
        &self,
        remote_id: &RemoteMailboxId,
        name: &str,
        flags: &FlagSet,
        permanent_flags: &FlagSet,
        attributes: &FlagSet,
    ) -> Result<MailboxEntry, Error> {
        if self.mailbox_by_name(name)?.is_some() {
            return Err(Error::MailboxExists);
        }

        let uid_validity = self.uid_validity()?;

        self.tx.execute(
            "INSERT INTO `mailbox` (`remote_id`, `name`, `uid_next`, \
             `uid_validity`, `flags`, `perm_flags`, `attrs`) \
             VALUES (?, ?, 1, ?, ?, ?, ?)",
            (
                &remote_id.0,
                name,
                uid_validity.get(),
                flagset_to_db(flags),
                flagset_to_db(permanent_flags),
                flagset_to_db(attributes),
            ),
        )?;

        let id = MailboxId(self.tx.last_insert_rowid());
        Ok(self
            .mailbox_by_id(id)?
            .expect("mailbox vanished within transaction"))
    }

    pub fn mailbox_by_name(
        &self,
        name: &str,
    ) -> Result<Option<MailboxEntry>, Error> {
        self.tx
            .query_row(
                "SELECT * FROM `mailbox` WHERE `name` = ?",
                (name,),
                mailbox_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn mailbox_by_id(
        &self,
        id: MailboxId,
    ) -> Result<Option<MailboxEntry>, Error> {
        self.tx
            .query_row(
                "SELECT * FROM `mailbox` WHERE `id` = ?",
                (id.0,),
                mailbox_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn mailbox_by_remote_id(
        &self,
        remote_id: &RemoteMailboxId,
    ) -> Result<Option<MailboxEntry>, Error> {
        self.tx
            .query_row(
                "SELECT * FROM `mailbox` WHERE `remote_id` = ?",
                (&remote_id.0,),
                mailbox_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn all_mailboxes(&self) -> Result<Vec<MailboxEntry>, Error> {
        self.tx
            .prepare("SELECT * FROM `mailbox` ORDER BY `name`")?
            .query_map((), mailbox_from_row)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn rename_mailbox(
        &self,
        id: MailboxId,
        new_name: &str,
    ) -> Result<(), Error> {
        let n = self.tx.execute(
            "UPDATE `mailbox` SET `name` = ? WHERE `id` = ?",
            (new_name, id.0),
        )?;
        if 0 == n {
            return Err(Error::NxMailbox);
        }
        Ok(())
    }

    /// Deletes the mailbox, bumping the global UID-validity when the
    /// deleted mailbox holds the current epoch. Returns the (possibly new)
    /// global value and whether it was bumped.
    pub fn delete_mailbox(
        &self,
        id: MailboxId,
    ) -> Result<(UidValidity, bool), Error> {
        let mailbox = self.mailbox_by_id(id)?.ok_or(Error::NxMailbox)?;
        let current = self.uid_validity()?;

        let bumped = mailbox.uid_validity == current;
        let new = if bumped {
            let new = current.next();
            self.set_uid_validity(new)?;
            new
        } else {
            current
        };

        self.tx
            .execute("DELETE FROM `mailbox` WHERE `id` = ?", (id.0,))?;

        Ok((new, bumped))
    }

    pub fn set_subscribed(
        &self,
        id: MailboxId,
        subscribed: bool,
    ) -> Result<(), Error> {
        let n = self.tx.execute(
            "UPDATE `mailbox` SET `subscribed` = ? WHERE `id` = ?",
            (subscribed as i64, id.0),
        )?;
        if 0 == n {
            return Err(Error::NxMailbox);
        }
        Ok(())
    }

    pub fn subscription_count(&self) -> Result<usize, Error> {
        self.tx
            .query_row(
                "SELECT COUNT(*) FROM `mailbox` WHERE `subscribed` != 0",
                (),
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as usize)
            .map_err(Into::into)
    }

    // ---- Messages ----

    pub fn insert_message(&self, entry: &MessageEntry) -> Result<(), Error> {
        self.tx.execute(
            "INSERT OR IGNORE INTO `message` \
             (`id`, `remote_id`, `size`, `internal_date`) \
             VALUES (?, ?, ?, ?)",
            (
                entry.id.to_string(),
                &entry.remote_id.0,
                entry.size,
                entry.internal_date,
            ),
        )?;
        Ok(())
    }

    pub fn message_by_id(
        &self,
        id: MessageId,
    ) -> Result<Option<MessageEntry>, Error> {
        self.tx
            .query_row(
                "SELECT * FROM `message` WHERE `id` = ?",
                (id.to_string(),),
                message_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn message_by_remote_id(
        &self,
        remote_id: &RemoteMessageId,
    ) -> Result<Option<MessageEntry>, Error> {
        self.tx
            .query_row(
                "SELECT * FROM `message` WHERE `remote_id` = ?",
                (&remote_id.0,),
                message_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Replaces the message-scoped flag set (`\Deleted`/`\Recent`
    /// excluded; those live on UID records).
    pub fn set_message_flags(
        &self,
        id: MessageId,
        flags: &FlagSet,
    ) -> Result<(), Error> {
        self.tx.execute(
            "DELETE FROM `message_flag` WHERE `message_id` = ?",
            (id.to_string(),),
        )?;

        for flag in flags {
            if matches!(*flag, Flag::Deleted | Flag::Recent) {
                continue;
            }
            self.tx.execute(
                "INSERT OR IGNORE INTO `message_flag` \
                 (`message_id`, `value`) VALUES (?, ?)",
                (id.to_string(), flag.to_string()),
            )?;
        }

        Ok(())
    }

    pub fn message_flags(&self, id: MessageId) -> Result<FlagSet, Error> {
        let mut stmt = self.tx.prepare(
            "SELECT `value` FROM `message_flag` WHERE `message_id` = ?",
        )?;
        let flags = stmt
            .query_map((id.to_string(),), |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(flags.iter().map(|f| Flag::from_wire(f)).collect())
    }

    pub fn delete_message(&self, id: MessageId) -> Result<(), Error> {
        self.tx.execute(
            "DELETE FROM `message` WHERE `id` = ?",
            (id.to_string(),),
        )?;
        Ok(())
    }

    /// Every mailbox placement of a message:
    /// `(mailbox, uid, recent, deleted)`.
    pub fn uids_for_message(
        &self,
        message_id: MessageId,
    ) -> Result<Vec<(MailboxId, Uid, bool, bool)>, Error> {
        let mut stmt = self.tx.prepare(
            "SELECT `mailbox_id`, `uid`, `recent`, `deleted` FROM `uid` \
             WHERE `message_id` = ?",
        )?;
        let rows = stmt
            .query_map((message_id.to_string(),), |row| {
                Ok((
                    MailboxId(row.get::<_, i64>(0)?),
                    row.get::<_, u32>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, bool>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|(m, u, r, d)| Uid::of(u).map(|u| (m, u, r, d)))
            .collect())
    }

    /// Deletes messages no longer referenced by any mailbox, returning
    /// their ids so the caller can drop the blobs.
    pub fn delete_orphan_messages(&self) -> Result<Vec<MessageId>, Error> {
        let mut stmt = self.tx.prepare(
            "SELECT `id` FROM `message` m WHERE NOT EXISTS \
             (SELECT 1 FROM `uid` u WHERE u.`message_id` = m.`id`)",
        )?;
        let ids = stmt
            .query_map((), |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter_map(|s| MessageId::from_str(&s).ok())
            .collect::<Vec<_>>();

        for id in &ids {
            self.tx.execute(
                "DELETE FROM `message` WHERE `id` = ?",
                (id.to_string(),),
            )?;
        }

        Ok(ids)
    }

    // ---- UID records ----

    /// Adds messages to a mailbox, assigning UIDs from `uid_next` and
    /// bumping it in the same transaction. Messages already present in the
    /// mailbox are skipped. Returns the `(message, uid)` pairs actually
    /// inserted, in assignment order.
    pub fn add_messages_to_mailbox(
        &self,
        mailbox_id: MailboxId,
        messages: &[(MessageId, bool)],
    ) -> Result<Vec<(MessageId, Uid)>, Error> {
        let mailbox =
            self.mailbox_by_id(mailbox_id)?.ok_or(Error::NxMailbox)?;
        let mut next = mailbox.uid_next;
        let mut assigned = Vec::new();

        for &(message_id, recent) in messages {
            let exists = self
                .tx
                .query_row(
                    "SELECT 1 FROM `uid` \
                     WHERE `mailbox_id` = ? AND `message_id` = ?",
                    (mailbox_id.0, message_id.to_string()),
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if exists {
                continue;
            }

            let uid = Uid::of(next).ok_or(Error::NxMessage)?;
            self.tx.execute(
                "INSERT INTO `uid` \
                 (`mailbox_id`, `message_id`, `uid`, `recent`, `deleted`) \
                 VALUES (?, ?, ?, ?, 0)",
                (
                    mailbox_id.0,
                    message_id.to_string(),
                    uid.get(),
                    recent as i64,
                ),
            )?;

            assigned.push((message_id, uid));
            next += 1;
        }

        if next != mailbox.uid_next {
            self.tx.execute(
                "UPDATE `mailbox` SET `uid_next` = ? WHERE `id` = ?",
                (next, mailbox_id.0),
            )?;
        }

        Ok(assigned)
    }

    pub fn remove_uids(
        &self,
        mailbox_id: MailboxId,
        uids: &[Uid],
    ) -> Result<(), Error> {
        for uid in uids {
            self.tx.execute(
                "DELETE FROM `uid` WHERE `mailbox_id` = ? AND `uid` = ?",
                (mailbox_id.0, uid.get()),
            )?;
        }
        Ok(())
    }

    pub fn remove_message_from_mailboxes(
        &self,
        message_id: MessageId,
    ) -> Result<Vec<(MailboxId, Uid)>, Error> {
        let mut stmt = self.tx.prepare(
            "SELECT `mailbox_id`, `uid` FROM `uid` WHERE `message_id` = ?",
        )?;
        let rows = stmt
            .query_map((message_id.to_string(),), |row| {
                Ok((
                    MailboxId(row.get::<_, i64>(0)?),
                    row.get::<_, u32>(1)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter_map(|(m, u)| Uid::of(u).map(|u| (m, u)))
            .collect::<Vec<_>>();

        self.tx.execute(
            "DELETE FROM `uid` WHERE `message_id` = ?",
            (message_id.to_string(),),
        )?;

        Ok(rows)
    }

    pub fn set_deleted(
        &self,
        mailbox_id: MailboxId,
        uids: &[Uid],
        deleted: bool,
    ) -> Result<(), Error> {
        for uid in uids {
            self.tx.execute(
                "UPDATE `uid` SET `deleted` = ? \
                 WHERE `mailbox_id` = ? AND `uid` = ?",
                (deleted as i64, mailbox_id.0, uid.get()),
            )?;
        }
        Ok(())
    }

    /// UIDs currently marked `\Deleted`, the set EXPUNGE consults.
    pub fn deleted_uids(
        &self,
        mailbox_id: MailboxId,
    ) -> Result<Vec<(Uid, MessageId)>, Error> {
        let mut stmt = self.tx.prepare(
            "SELECT `uid`, `message_id` FROM `uid` \
             WHERE `mailbox_id` = ? AND `deleted` != 0 ORDER BY `uid`",
        )?;
        let rows = stmt
            .query_map((mailbox_id.0,), |row| {
                Ok((
                    row.get::<_, u32>(0)?,
                    row.get::<_, String>(1)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|(uid, id)| {
                Some((Uid::of(uid)?, MessageId::from_str(&id).ok()?))
            })
            .collect())
    }

    pub fn message_for_uid(
        &self,
        mailbox_id: MailboxId,
        uid: Uid,
    ) -> Result<Option<MessageId>, Error> {
        let id = self
            .tx
            .query_row(
                "SELECT `message_id` FROM `uid` \
                 WHERE `mailbox_id` = ? AND `uid` = ?",
                (mailbox_id.0, uid.get()),
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        Ok(id.and_then(|id| MessageId::from_str(&id).ok()))
    }

    /// Clears `\Recent` on every message in the mailbox, as part of the
    /// read-write select transaction.
    pub fn clear_recent(&self, mailbox_id: MailboxId) -> Result<(), Error> {
        self.tx.execute(
            "UPDATE `uid` SET `recent` = 0 WHERE `mailbox_id` = ?",
            (mailbox_id.0,),
        )?;
        Ok(())
    }

    /// Rows for a fresh snapshot, ordered by UID.
    pub fn snapshot_rows(
        &self,
        mailbox_id: MailboxId,
    ) -> Result<Vec<SnapshotRow>, Error> {
        let mut stmt = self.tx.prepare(
            "SELECT u.`uid`, u.`message_id`, u.`recent`, u.`deleted`, \
             (SELECT GROUP_CONCAT(`value`, ',') FROM `message_flag` mf \
              WHERE mf.`message_id` = u.`message_id`) \
             FROM `uid` u WHERE u.`mailbox_id` = ? ORDER BY u.`uid`",
        )?;

        let rows = stmt
            .query_map((mailbox_id.0,), |row| {
                Ok((
                    row.get::<_, u32>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, bool>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|(uid, message_id, recent, deleted, flags)| {
                let mut flags = flags
                    .as_deref()
                    .map(flagset_from_db)
                    .unwrap_or_default();
                if deleted {
                    flags.insert(Flag::Deleted);
                }
                if recent {
                    flags.insert(Flag::Recent);
                }

                Some(SnapshotRow {
                    uid: Uid::of(uid)?,
                    message_id: MessageId::from_str(&message_id).ok()?,
                    flags,
                    recent,
                    deleted,
                })
            })
            .collect())
    }

    pub fn message_count(&self, mailbox_id: MailboxId) -> Result<u32, Error> {
        self.count(
            "SELECT COUNT(*) FROM `uid` WHERE `mailbox_id` = ?",
            mailbox_id,
        )
    }

    pub fn recent_count(&self, mailbox_id: MailboxId) -> Result<u32, Error> {
        self.count(
            "SELECT COUNT(*) FROM `uid` \
             WHERE `mailbox_id` = ? AND `recent` != 0",
            mailbox_id,
        )
    }

    pub fn unseen_count(&self, mailbox_id: MailboxId) -> Result<u32, Error> {
        self.count(
            "SELECT COUNT(*) FROM `uid` u \
             WHERE u.`mailbox_id` = ? AND NOT EXISTS \
             (SELECT 1 FROM `message_flag` mf \
              WHERE mf.`message_id` = u.`message_id` \
              AND lower(mf.`value`) = '\\seen')",
            mailbox_id,
        )
    }

    fn count(&self, sql: &str, mailbox_id: MailboxId) -> Result<u32, Error> {
        self.tx
            .query_row(sql, (mailbox_id.0,), |row| row.get::<_, i64>(0))
            .map(|n| n as u32)
            .map_err(Into::into)
    }
}

fn mailbox_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MailboxEntry> {
    Ok(MailboxEntry {
        id: MailboxId(row.get("id")?),
        remote_id: RemoteMailboxId(row.get("remote_id")?),
        name: row.get("name")?,
        uid_next: row.get("uid_next")?,
        uid_validity: UidValidity(row.get("uid_validity")?),
        flags: flagset_from_db(&row.get::<_, String>("flags")?),
        permanent_flags: flagset_from_db(&row.get::<_, String>("perm_flags")?),
        attributes: flagset_from_db(&row.get::<_, String>("attrs")?),
        subscribed: row.get("subscribed")?,
    })
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageEntry> {
    let id: String = row.get("id")?;
    Ok(MessageEntry {
        id: MessageId::from_str(&id).map_err(|_| {
            rusqlite::Error::InvalidColumnType(
                0,
                "id".to_owned(),
                rusqlite::types::Type::Text,
            )
        })?,
        remote_id: RemoteMessageId(row.get("remote_id")?),
        size: row.get("size")?,
        internal_date: row.get("internal_date")?,
    })
}

fn flagset_to_db(flags: &FlagSet) -> String {
    use itertools::Itertools as _;
    flags.iter().map(Flag::to_string).join(",")
}

fn flagset_from_db(raw: &str) -> FlagSet {
    raw.split(',')
        .filter(|s| !s.is_empty())
        .map(Flag::from_wire)
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn new_db() -> Db {
        Db::open_in_memory().unwrap()
    }

    fn make_mailbox(db: &mut Db, name: &str) -> MailboxEntry {
        db.write(|tx| {
            tx.create_mailbox(
                &RemoteMailboxId(format!("remote-{}", name)),
                name,
                &FlagSet::new(),
                &FlagSet::new(),
                &FlagSet::new(),
            )
        })
        .unwrap()
    }

    fn make_message(db: &mut Db, remote: &str) -> MessageId {
        let entry = MessageEntry {
            id: MessageId::new(),
            remote_id: RemoteMessageId(remote.to_owned()),
            size: 128,
            internal_date: Utc::now(),
        };
        db.write(|tx| tx.insert_message(&entry)).unwrap();
        entry.id
    }

    #[test]
    fn uid_validity_never_regresses() {
        let mut db = new_db();
        assert_eq!(
            UidValidity(100),
            db.write(|tx| tx.init_uid_validity(UidValidity(100)))
                .unwrap(),
        );
        assert_eq!(
            UidValidity(100),
            db.write(|tx| tx.init_uid_validity(UidValidity(50))).unwrap(),
        );
        assert_eq!(
            UidValidity(200),
            db.write(|tx| tx.init_uid_validity(UidValidity(200)))
                .unwrap(),
        );
    }

    #[test]
    fn uid_allocation_is_monotonic_and_bumps_uid_next() {
        let mut db = new_db();
        db.write(|tx| tx.init_uid_validity(UidValidity(1))).unwrap();
        let mailbox = make_mailbox(&mut db, "work");

        let m1 = make_message(&mut db, "r1");
        let m2 = make_message(&mut db, "r2");

        let assigned = db
            .write(|tx| {
                tx.add_messages_to_mailbox(
                    mailbox.id,
                    &[(m1, true), (m2, true)],
                )
            })
            .unwrap();
        assert_eq!(vec![(m1, Uid::u(1)), (m2, Uid::u(2))], assigned);

        // Re-adding an existing message assigns nothing.
        let assigned = db
            .write(|tx| {
                tx.add_messages_to_mailbox(mailbox.id, &[(m1, false)])
            })
            .unwrap();
        assert!(assigned.is_empty());

        let reloaded = db
            .read(|tx| tx.mailbox_by_id(mailbox.id))
            .unwrap()
            .unwrap();
        assert_eq!(3, reloaded.uid_next);
    }

    #[test]
    fn delete_mailbox_bumps_shared_epoch_only() {
        let mut db = new_db();
        db.write(|tx| tx.init_uid_validity(UidValidity(7))).unwrap();

        let a = make_mailbox(&mut db, "a");
        assert_eq!(UidValidity(7), a.uid_validity);

        let (new, bumped) =
            db.write(|tx| tx.delete_mailbox(a.id)).unwrap();
        assert!(bumped);
        assert_eq!(UidValidity(8), new);

        // A mailbox created on the old epoch does not bump on delete.
        let b = make_mailbox(&mut db, "b");
        assert_eq!(UidValidity(8), b.uid_validity);
        db.write(|tx| tx.set_uid_validity(UidValidity(9))).unwrap();
        let (new, bumped) =
            db.write(|tx| tx.delete_mailbox(b.id)).unwrap();
        assert!(!bumped);
        assert_eq!(UidValidity(9), new);
    }

    #[test]
    fn snapshot_rows_merge_flag_sources() {
        let mut db = new_db();
        db.write(|tx| tx.init_uid_validity(UidValidity(1))).unwrap();
        let mailbox = make_mailbox(&mut db, "x");
        let m1 = make_message(&mut db, "r1");

        db.write(|tx| {
            tx.add_messages_to_mailbox(mailbox.id, &[(m1, true)])?;
            tx.set_message_flags(
                m1,
                &[Flag::Seen, Flag::Keyword("blue".to_owned())]
                    .into_iter()
                    .collect(),
            )?;
            tx.set_deleted(mailbox.id, &[Uid::u(1)], true)
        })
        .unwrap();

        let rows = db.read(|tx| tx.snapshot_rows(mailbox.id)).unwrap();
        assert_eq!(1, rows.len());
        assert_eq!(Uid::u(1), rows[0].uid);
        assert!(rows[0].recent);
        assert!(rows[0].deleted);
        assert!(rows[0].flags.contains(&Flag::Seen));
        assert!(rows[0].flags.contains(&Flag::Deleted));
        assert!(rows[0].flags.contains(&Flag::Recent));
        assert!(rows[0]
            .flags
            .contains(&Flag::Keyword("BLUE".to_owned())));
    }

    #[test]
    fn expunge_flow_and_orphan_collection() {
        let mut db = new_db();
        db.write(|tx| tx.init_uid_validity(UidValidity(1))).unwrap();
        let mailbox = make_mailbox(&mut db, "x");
        let m1 = make_message(&mut db, "r1");
        let m2 = make_message(&mut db, "r2");

        db.write(|tx| {
            tx.add_messages_to_mailbox(
                mailbox.id,
                &[(m1, false), (m2, false)],
            )?;
            tx.set_deleted(mailbox.id, &[Uid::u(2)], true)
        })
        .unwrap();

        let deleted = db.read(|tx| tx.deleted_uids(mailbox.id)).unwrap();
        assert_eq!(vec![(Uid::u(2), m2)], deleted);

        let orphans = db
            .write(|tx| {
                tx.remove_uids(mailbox.id, &[Uid::u(2)])?;
                tx.delete_orphan_messages()
            })
            .unwrap();
        assert_eq!(vec![m2], orphans);

        assert_eq!(
            1,
            db.read(|tx| tx.message_count(mailbox.id)).unwrap(),
        );
    }

    #[test]
    fn counts() {
        let mut db = new_db();
        db.write(|tx| tx.init_uid_validity(UidValidity(1))).unwrap();
        let mailbox = make_mailbox(&mut db, "x");
        let m1 = make_message(&mut db, "r1");
        let m2 = make_message(&mut db, "r2");

        db.write(|tx| {
            tx.add_messages_to_mailbox(
                mailbox.id,
                &[(m1, true), (m2, false)],
            )?;
            tx.set_message_flags(
                m1,
                &[Flag::Seen].into_iter().collect(),
            )
        })
        .unwrap();

        assert_eq!(2, db.read(|tx| tx.message_count(mailbox.id)).unwrap());
        assert_eq!(1, db.read(|tx| tx.recent_count(mailbox.id)).unwrap());
        assert_eq!(1, db.read(|tx| tx.unseen_count(mailbox.id)).unwrap());

        db.write(|tx| tx.clear_recent(mailbox.id)).unwrap();
        assert_eq!(0, db.read(|tx| tx.recent_count(mailbox.id)).unwrap());
    }
}
