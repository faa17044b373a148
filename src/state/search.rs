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

//! The SEARCH engine.
//!
//! Search keys compile into a postfix program over a small op set, plus a
//! record of which per-message data the program needs (database row, raw
//! literal, parsed header). Execution walks the snapshot with one result
//! slot per row; workers fetch only the data the program declared, run the
//! stack machine, and write the UID (UID mode) or sequence number into
//! their slot. Zero slots are filtered out afterwards, preserving order.
//!
//! The degree of parallelism is `cpus / active-search-count`: concurrent
//! searches share the CPU budget through a process-wide counter, so one
//! busy mailbox cannot monopolise the machine.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{Datelike as _, NaiveDate};
use log::warn;
use rayon::prelude::*;

use super::snapshot::{SnapMessage, Snapshot};
use crate::command::search::SearchKey;
use crate::db::Db;
use crate::model::{Flag, Seqnum, Uid};
use crate::store::Store;
use crate::support::error::Error;
use crate::support::rfc5322::{self, Headers};

static ACTIVE_SEARCHES: AtomicUsize = AtomicUsize::new(0);

/// What per-message data a compiled program requires.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SearchNeeds {
    /// Message date and size from the metadata database.
    pub db_message: bool,
    /// The raw literal from the blob store.
    pub literal: bool,
    /// The parsed header (implies the literal).
    pub header: bool,
}

impl SearchNeeds {
    fn union(self, other: SearchNeeds) -> SearchNeeds {
        SearchNeeds {
            db_message: self.db_message || other.db_message,
            literal: self.literal || other.literal,
            header: self.header || other.header,
        }
    }
}

/// One postfix op. Text arguments are already charset-decoded and
/// lower-cased at compile time.
#[derive(Clone, Debug)]
enum Op {
    True,
    And,
    Or,
    Not,
    Flag(Flag),
    UidIn(Vec<Uid>),
    Larger(u32),
    Smaller(u32),
    Before(NaiveDate),
    On(NaiveDate),
    Since(NaiveDate),
    SentBefore(NaiveDate),
    SentOn(NaiveDate),
    SentSince(NaiveDate),
    Text(String),
    Body(String),
    Header(String, String),
}

pub struct Program {
    ops: Vec<Op>,
    needs: SearchNeeds,
}

impl Program {
    pub fn needs(&self) -> SearchNeeds {
        self.needs
    }
}

/// Compiles the key list (implicit AND) into a program.
///
/// `charset` is the name from the SEARCH command; text arguments are
/// decoded with it. Unknown charsets fail with `Error::BadCharset`.
pub fn compile(
    keys: &[SearchKey],
    charset: Option<&str>,
    snapshot: &Snapshot,
) -> Result<Program, Error> {
    let encoding = match charset {
        None => encoding_rs::UTF_8,
        Some(name) => encoding_rs::Encoding::for_label(name.as_bytes())
            .ok_or(Error::BadCharset)?,
    };

    let mut ops = Vec::new();
    compile_and(&mut ops, keys, encoding, snapshot)?;

    let needs = ops.iter().fold(SearchNeeds::default(), |needs, op| {
        needs.union(match *op {
            Op::Larger(..) | Op::Smaller(..) => SearchNeeds {
                db_message: true,
                ..SearchNeeds::default()
            },
            Op::Before(..) | Op::On(..) | Op::Since(..) => SearchNeeds {
                db_message: true,
                ..SearchNeeds::default()
            },
            Op::Text(..) | Op::Body(..) => SearchNeeds {
                literal: true,
                ..SearchNeeds::default()
            },
            Op::SentBefore(..)
            | Op::SentOn(..)
            | Op::SentSince(..)
            | Op::Header(..) => SearchNeeds {
                literal: true,
                header: true,
                ..SearchNeeds::default()
            },
            _ => SearchNeeds::default(),
        })
    });

    Ok(Program { ops, needs })
}

fn compile_and(
    dst: &mut Vec<Op>,
    keys: &[SearchKey],
    encoding: &'static encoding_rs::Encoding,
    snapshot: &Snapshot,
) -> Result<(), Error> {
    if keys.is_empty() {
        dst.push(Op::True);
        return Ok(());
    }

    let mut first = true;
    for key in keys {
        compile_one(dst, key, encoding, snapshot)?;
        if !first {
            dst.push(Op::And);
        }
        first = false;
    }

    Ok(())
}

fn compile_one(
    dst: &mut Vec<Op>,
    key: &SearchKey,
    encoding: &'static encoding_rs::Encoding,
    snapshot: &Snapshot,
) -> Result<(), Error> {
    let decode = |raw: &[u8]| -> String {
        let (text, _, _) = encoding.decode(raw);
        text.to_lowercase()
    };

    match *key {
        SearchKey::All => dst.push(Op::True),
        SearchKey::Answered => dst.push(Op::Flag(Flag::Answered)),
        SearchKey::Deleted => dst.push(Op::Flag(Flag::Deleted)),
        SearchKey::Draft => dst.push(Op::Flag(Flag::Draft)),
        SearchKey::Flagged => dst.push(Op::Flag(Flag::Flagged)),
        SearchKey::Recent => dst.push(Op::Flag(Flag::Recent)),
        SearchKey::Seen => dst.push(Op::Flag(Flag::Seen)),

        SearchKey::Unanswered => {
            dst.push(Op::Flag(Flag::Answered));
            dst.push(Op::Not);
        },
        SearchKey::Undeleted => {
            dst.push(Op::Flag(Flag::Deleted));
            dst.push(Op::Not);
        },
        SearchKey::Undraft => {
            dst.push(Op::Flag(Flag::Draft));
            dst.push(Op::Not);
        },
        SearchKey::Unflagged => {
            dst.push(Op::Flag(Flag::Flagged));
            dst.push(Op::Not);
        },
        SearchKey::Unseen => {
            dst.push(Op::Flag(Flag::Seen));
            dst.push(Op::Not);
        },

        SearchKey::Keyword(ref kw) => {
            dst.push(Op::Flag(Flag::from_wire(kw)))
        },
        SearchKey::Unkeyword(ref kw) => {
            dst.push(Op::Flag(Flag::from_wire(kw)));
            dst.push(Op::Not);
        },

        SearchKey::New => {
            dst.push(Op::Flag(Flag::Recent));
            dst.push(Op::Flag(Flag::Seen));
            dst.push(Op::Not);
            dst.push(Op::And);
        },
        SearchKey::Old => {
            dst.push(Op::Flag(Flag::Recent));
            dst.push(Op::Not);
        },

        SearchKey::Larger(n) => dst.push(Op::Larger(n)),
        SearchKey::Smaller(n) => dst.push(Op::Smaller(n)),

        SearchKey::Before(date) => dst.push(Op::Before(date)),
        SearchKey::On(date) => dst.push(Op::On(date)),
        SearchKey::Since(date) => dst.push(Op::Since(date)),
        SearchKey::SentBefore(date) => dst.push(Op::SentBefore(date)),
        SearchKey::SentOn(date) => dst.push(Op::SentOn(date)),
        SearchKey::SentSince(date) => dst.push(Op::SentSince(date)),

        SearchKey::Text(ref raw) => dst.push(Op::Text(decode(raw))),
        SearchKey::Body(ref raw) => dst.push(Op::Body(decode(raw))),
        SearchKey::Subject(ref raw) => {
            dst.push(Op::Header("subject".to_owned(), decode(raw)))
        },
        SearchKey::From(ref raw) => {
            dst.push(Op::Header("from".to_owned(), decode(raw)))
        },
        SearchKey::To(ref raw) => {
            dst.push(Op::Header("to".to_owned(), decode(raw)))
        },
        SearchKey::Cc(ref raw) => {
            dst.push(Op::Header("cc".to_owned(), decode(raw)))
        },
        SearchKey::Bcc(ref raw) => {
            dst.push(Op::Header("bcc".to_owned(), decode(raw)))
        },
        SearchKey::Header(ref name, ref raw) => dst.push(Op::Header(
            name.to_ascii_lowercase(),
            decode(raw),
        )),

        SearchKey::Uid(ref set) => {
            dst.push(Op::UidIn(snapshot.resolve_uid_set(set)))
        },
        SearchKey::SeqSet(ref set) => {
            // Sequence sets resolve to their UIDs now, against this
            // snapshot, so the predicate stays stable during the scan.
            let uids = snapshot
                .resolve_seq_set(set)?
                .into_iter()
                .filter_map(|seq| {
                    snapshot.get_by_seq(seq).map(|m| m.uid)
                })
                .collect();
            dst.push(Op::UidIn(uids));
        },

        SearchKey::Not(ref sub) => {
            compile_one(dst, sub, encoding, snapshot)?;
            dst.push(Op::Not);
        },
        SearchKey::Or(ref a, ref b) => {
            compile_one(dst, a, encoding, snapshot)?;
            compile_one(dst, b, encoding, snapshot)?;
            dst.push(Op::Or);
        },
        SearchKey::And(ref keys) => {
            compile_and(dst, keys, encoding, snapshot)?;
        },

        SearchKey::Charset => {
            return Err(Error::Internal(
                "CHARSET leaked into key tree".to_owned(),
            ))
        },
    }

    Ok(())
}

/// Per-message data, fetched lazily according to `SearchNeeds`.
struct SearchData<'a> {
    message: &'a SnapMessage,
    meta: Option<(chrono::DateTime<chrono::Utc>, u32)>,
    literal: Option<Vec<u8>>,
    header: Option<Headers>,
}

fn eval(ops: &[Op], data: &SearchData<'_>) -> bool {
    let mut stack = Vec::<bool>::with_capacity(8);

    for op in ops {
        match *op {
            Op::True => stack.push(true),
            Op::And => {
                let b = stack.pop().unwrap_or(false);
                let a = stack.pop().unwrap_or(false);
                stack.push(a && b);
            },
            Op::Or => {
                let b = stack.pop().unwrap_or(false);
                let a = stack.pop().unwrap_or(false);
                stack.push(a || b);
            },
            Op::Not => {
                let a = stack.pop().unwrap_or(false);
                stack.push(!a);
            },

            Op::Flag(ref flag) => {
                stack.push(data.message.flags.contains(flag))
            },

            Op::UidIn(ref uids) => {
                stack.push(uids.binary_search(&data.message.uid).is_ok())
            },

            Op::Larger(n) => stack.push(
                data.meta.map(|(_, size)| size > n).unwrap_or(false),
            ),
            Op::Smaller(n) => stack.push(
                data.meta.map(|(_, size)| size < n).unwrap_or(false),
            ),

            Op::Before(date) => stack.push(
                data.meta
                    .map(|(d, _)| d.date_naive() < date)
                    .unwrap_or(false),
            ),
            Op::On(date) => stack.push(
                data.meta
                    .map(|(d, _)| d.date_naive() == date)
                    .unwrap_or(false),
            ),
            Op::Since(date) => stack.push(
                data.meta
                    .map(|(d, _)| d.date_naive() >= date)
                    .unwrap_or(false),
            ),

            Op::SentBefore(date) => {
                stack.push(sent_date(data).is_some_and(|d| d < date))
            },
            Op::SentOn(date) => {
                stack.push(sent_date(data).is_some_and(|d| d == date))
            },
            Op::SentSince(date) => {
                stack.push(sent_date(data).is_some_and(|d| d >= date))
            },

            Op::Text(ref needle) => stack.push(
                data.literal
                    .as_deref()
                    .map(|l| contains_fold(l, needle))
                    .unwrap_or(false),
            ),
            Op::Body(ref needle) => stack.push(
                data.literal
                    .as_deref()
                    .map(|l| {
                        let (_, body) = rfc5322::split_message(l);
                        contains_fold(body, needle)
                    })
                    .unwrap_or(false),
            ),

            Op::Header(ref name, ref needle) => stack.push(
                data.header
                    .as_ref()
                    .and_then(|h| h.get(name))
                    .map(|value| {
                        needle.is_empty()
                            || value.to_lowercase().contains(needle)
                    })
                    .unwrap_or(false),
            ),
        }
    }

    stack.pop().unwrap_or(false)
}

fn sent_date(data: &SearchData<'_>) -> Option<NaiveDate> {
    let header = data.header.as_ref()?;
    let date = rfc5322::parse_date(header.get("date")?)?;
    // Truncate to date-only UTC before comparing.
    let utc = date.with_timezone(&chrono::Utc);
    NaiveDate::from_ymd_opt(utc.year(), utc.month(), utc.day())
}

/// Case-insensitive substring match over raw bytes.
///
/// The haystack is matched as-is, with ASCII-range folding and no UTF-8
/// validation: message bodies are arbitrary octets (Latin-1 mail is
/// still common) and must never be reinterpreted before comparison.
fn contains_fold(haystack: &[u8], needle: &str) -> bool {
    let needle = needle.as_bytes();
    if needle.is_empty() {
        return true;
    }
    if needle.len() > haystack.len() {
        return false;
    }

    haystack
        .windows(needle.len())
        .any(|window| window.eq_ignore_ascii_case(needle))
}

/// Executes the program over the snapshot.
///
/// Returns the matching UIDs (UID mode) or sequence numbers, in ascending
/// snapshot order. A set `cancel` flag aborts the workers; no partial
/// result escapes.
pub fn execute(
    program: &Program,
    snapshot: &Snapshot,
    db: &Mutex<Db>,
    store: &Arc<dyn Store>,
    uid_mode: bool,
    disable_parallelism: bool,
    cancel: &Arc<AtomicBool>,
) -> Result<Vec<u32>, Error> {
    let n = snapshot.len();
    let mut result = vec![0u32; n];

    ACTIVE_SEARCHES.fetch_add(1, Ordering::SeqCst);
    let _guard = ActiveSearchGuard;

    let active = ACTIVE_SEARCHES.load(Ordering::SeqCst).max(1);
    let cpus =
        std::thread::available_parallelism().map_or(1, |n| n.get());
    let parallelism = if disable_parallelism {
        1
    } else {
        (cpus / active).max(1)
    };

    let eval_slot = |ix: usize, slot: &mut u32| -> Result<(), Error> {
        if cancel.load(Ordering::Relaxed) {
            return Err(Error::Cancelled);
        }

        let seq = Seqnum::from_index(ix);
        let Some(message) = snapshot.get_by_seq(seq) else {
            return Ok(());
        };

        let matched = catch_unwind(AssertUnwindSafe(|| {
            eval_one(program, message, db, store)
        }))
        .map_err(|_| {
            Error::Internal("panic in search worker".to_owned())
        })?;

        if matched {
            *slot = if uid_mode {
                message.uid.get()
            } else {
                seq.get()
            };
        }

        Ok(())
    };

    if parallelism <= 1 || n <= 1 {
        for (ix, slot) in result.iter_mut().enumerate() {
            eval_slot(ix, slot)?;
        }
    } else {
        let chunk_size = n.div_ceil(parallelism);
        result
            .par_chunks_mut(chunk_size)
            .enumerate()
            .try_for_each(|(chunk_ix, chunk)| {
                for (offset, slot) in chunk.iter_mut().enumerate() {
                    eval_slot(chunk_ix * chunk_size + offset, slot)?;
                }
                Ok::<(), Error>(())
            })?;
    }

    Ok(result.into_iter().filter(|&v| v != 0).collect())
}

fn eval_one(
    program: &Program,
    message: &SnapMessage,
    db: &Mutex<Db>,
    store: &Arc<dyn Store>,
) -> bool {
    let needs = program.needs;

    let mut data = SearchData {
        message,
        meta: None,
        literal: None,
        header: None,
    };

    if needs.db_message {
        let meta = db
            .lock()
            .unwrap()
            .read(|tx| tx.message_by_id(message.id));
        match meta {
            Ok(Some(entry)) => {
                data.meta = Some((entry.internal_date, entry.size))
            },
            // Gone meanwhile; treat as no data.
            Ok(None) => (),
            Err(e) => {
                warn!(
                    "error loading metadata for uid {} during search: {}",
                    message.uid, e,
                );
                return false;
            },
        }
    }

    if needs.literal || needs.header {
        match store.get(message.id) {
            Ok(literal) => data.literal = Some(literal),
            Err(e) => {
                warn!(
                    "error loading literal for uid {} during search: {}",
                    message.uid, e,
                );
                return false;
            },
        }
    }

    if needs.header {
        let (header, _) = rfc5322::split_message(
            data.literal.as_deref().unwrap_or(&[]),
        );
        data.header = Some(Headers::parse(header));
    }

    eval(&program.ops, &data)
}

struct ActiveSearchGuard;

impl Drop for ActiveSearchGuard {
    fn drop(&mut self) {
        ACTIVE_SEARCHES.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::MessageEntry;
    use crate::model::{FlagSet, MessageId, RemoteMessageId};

    struct MapStore(Mutex<std::collections::HashMap<MessageId, Vec<u8>>>);

    impl Store for MapStore {
        fn set(
            &self,
            id: MessageId,
            data: &mut dyn std::io::Read,
        ) -> Result<(), Error> {
            let mut buf = Vec::new();
            data.read_to_end(&mut buf)?;
            self.0.lock().unwrap().insert(id, buf);
            Ok(())
        }

        fn get(&self, id: MessageId) -> Result<Vec<u8>, Error> {
            self.0
                .lock()
                .unwrap()
                .get(&id)
                .cloned()
                .ok_or(Error::NxMessage)
        }

        fn delete(&self, ids: &[MessageId]) -> Result<(), Error> {
            let mut map = self.0.lock().unwrap();
            for id in ids {
                map.remove(id);
            }
            Ok(())
        }

        fn list(&self) -> Result<Vec<MessageId>, Error> {
            Ok(self.0.lock().unwrap().keys().copied().collect())
        }
    }

    fn seq_set_of(
        intervals: &[(u32, u32)],
    ) -> crate::command::sequence::SeqSet {
        use crate::command::sequence::{SeqAtom, SeqInterval, SeqSet};
        use std::num::NonZeroU32;
        SeqSet(
            intervals
                .iter()
                .map(|&(lo, hi)| SeqInterval {
                    lo: SeqAtom::Num(NonZeroU32::new(lo).unwrap()),
                    hi: SeqAtom::Num(NonZeroU32::new(hi).unwrap()),
                })
                .collect(),
        )
    }

    fn fixture(
        count: usize,
    ) -> (Snapshot, Mutex<Db>, Arc<dyn Store>) {
        let mut db = Db::open_in_memory().unwrap();
        let store = MapStore(Mutex::new(Default::default()));
        let mut snapshot = Snapshot::default();

        for i in 0..count {
            let id = MessageId::new();
            let literal = format!(
                "From: sender-{i}@example.com\r\n\
                 Subject: note number {i}\r\n\
                 Date: Thu, 2 Jul 2020 10:00:00 +0000\r\n\
                 \r\n\
                 body payload {i}",
            )
            .into_bytes();

            db.write(|tx| {
                tx.insert_message(&MessageEntry {
                    id,
                    remote_id: RemoteMessageId(format!("r{i}")),
                    size: literal.len() as u32,
                    internal_date: chrono::Utc::now(),
                })
            })
            .unwrap();
            store.0.lock().unwrap().insert(id, literal);

            let mut flags = FlagSet::new();
            if i % 2 == 0 {
                flags.insert(Flag::Seen);
            }

            snapshot.append(SnapMessage {
                uid: Uid::u(i as u32 + 1),
                id,
                flags,
                recent: false,
            });
        }

        (snapshot, Mutex::new(db), Arc::new(store))
    }

    fn run(
        keys: &[SearchKey],
        snapshot: &Snapshot,
        db: &Mutex<Db>,
        store: &Arc<dyn Store>,
        uid_mode: bool,
        disable_parallelism: bool,
    ) -> Vec<u32> {
        let program = compile(keys, None, snapshot).unwrap();
        execute(
            &program,
            snapshot,
            db,
            store,
            uid_mode,
            disable_parallelism,
            &Arc::new(AtomicBool::new(false)),
        )
        .unwrap()
    }

    #[test]
    fn unseen_half_in_order_parallel_and_serial() {
        let (snapshot, db, store) = fixture(1000);

        let parallel = run(
            &[SearchKey::Unseen],
            &snapshot,
            &db,
            &store,
            false,
            false,
        );
        let serial = run(
            &[SearchKey::Unseen],
            &snapshot,
            &db,
            &store,
            false,
            true,
        );

        assert_eq!(parallel, serial);
        assert_eq!(500, parallel.len());
        // Ascending seqnums; exactly the odd (0-based) rows.
        let expected =
            (1..=1000u32).filter(|n| n % 2 == 0).collect::<Vec<_>>();
        assert_eq!(expected, parallel);
    }

    #[test]
    fn uid_mode_returns_uids() {
        let (snapshot, db, store) = fixture(4);
        let hits = run(
            &[SearchKey::Seen],
            &snapshot,
            &db,
            &store,
            true,
            true,
        );
        assert_eq!(vec![1, 3], hits);
    }

    #[test]
    fn header_and_body_predicates() {
        let (snapshot, db, store) = fixture(5);

        let hits = run(
            &[SearchKey::Subject(b"number 3".to_vec())],
            &snapshot,
            &db,
            &store,
            true,
            true,
        );
        assert_eq!(vec![4], hits);

        let hits = run(
            &[SearchKey::Body(b"PAYLOAD 2".to_vec())],
            &snapshot,
            &db,
            &store,
            true,
            true,
        );
        assert_eq!(vec![3], hits);

        // TEXT matches header bytes too.
        let hits = run(
            &[SearchKey::Text(b"sender-1@".to_vec())],
            &snapshot,
            &db,
            &store,
            true,
            true,
        );
        assert_eq!(vec![2], hits);
    }

    #[test]
    fn sent_date_truncates_to_utc_day() {
        let (snapshot, db, store) = fixture(2);
        let day = NaiveDate::from_ymd_opt(2020, 7, 2).unwrap();

        let hits = run(
            &[SearchKey::SentOn(day)],
            &snapshot,
            &db,
            &store,
            true,
            true,
        );
        assert_eq!(vec![1, 2], hits);

        let hits = run(
            &[SearchKey::SentBefore(day)],
            &snapshot,
            &db,
            &store,
            true,
            true,
        );
        assert!(hits.is_empty());
    }

    #[test]
    fn logical_operators() {
        let (snapshot, db, store) = fixture(6);

        // OR SEEN SUBJECT "number 1" — evens are seen (uids 1,3,5), plus 2.
        let hits = run(
            &[SearchKey::Or(
                Box::new(SearchKey::Seen),
                Box::new(SearchKey::Subject(b"number 1".to_vec())),
            )],
            &snapshot,
            &db,
            &store,
            true,
            true,
        );
        assert_eq!(vec![1, 2, 3, 5], hits);

        let hits = run(
            &[SearchKey::Not(Box::new(SearchKey::All))],
            &snapshot,
            &db,
            &store,
            true,
            true,
        );
        assert!(hits.is_empty());
    }

    #[test]
    fn uid_set_membership() {
        let (snapshot, db, store) = fixture(6);
        let set = seq_set_of(&[(2, 4)]);
        let hits = run(
            &[SearchKey::Uid(set)],
            &snapshot,
            &db,
            &store,
            true,
            true,
        );
        assert_eq!(vec![2, 3, 4], hits);
    }

    #[test]
    fn contains_fold_is_byte_wise() {
        assert!(contains_fold(b"CAF\xE9 NOIR", "caf"));
        assert!(contains_fold(b"pr\xE9fix suffix", "suffix"));
        assert!(contains_fold(b"abc", ""));
        assert!(!contains_fold(b"ab", "abc"));
        // An invalid UTF-8 byte must not alias to the replacement
        // character.
        assert!(!contains_fold(b"caf\xE9", "\u{fffd}"));
    }

    #[test]
    fn body_search_over_non_utf8_bytes() {
        // A Latin-1 body: raw octets, not valid UTF-8.
        let mut db = Db::open_in_memory().unwrap();
        let store = MapStore(Mutex::new(Default::default()));
        let mut snapshot = Snapshot::default();

        let id = MessageId::new();
        let literal = b"Subject: menu\r\n\r\ncaf\xE9 noir".to_vec();
        db.write(|tx| {
            tx.insert_message(&MessageEntry {
                id,
                remote_id: RemoteMessageId("latin1".to_owned()),
                size: literal.len() as u32,
                internal_date: chrono::Utc::now(),
            })
        })
        .unwrap();
        store.0.lock().unwrap().insert(id, literal);
        snapshot.append(SnapMessage {
            uid: Uid::u(1),
            id,
            flags: FlagSet::new(),
            recent: false,
        });

        let db = Mutex::new(db);
        let store: Arc<dyn Store> = Arc::new(store);

        // ASCII text right next to the raw high byte still matches.
        let hits = run(
            &[SearchKey::Body(b"CAF".to_vec())],
            &snapshot,
            &db,
            &store,
            true,
            true,
        );
        assert_eq!(vec![1], hits);

        let hits = run(
            &[SearchKey::Text(b"noir".to_vec())],
            &snapshot,
            &db,
            &store,
            true,
            true,
        );
        assert_eq!(vec![1], hits);

        let hits = run(
            &[SearchKey::Body("\u{fffd}".as_bytes().to_vec())],
            &snapshot,
            &db,
            &store,
            true,
            true,
        );
        assert!(hits.is_empty());
    }

    #[test]
    fn cancellation_aborts() {
        let (snapshot, db, store) = fixture(16);
        let program = compile(&[SearchKey::All], None, &snapshot).unwrap();
        let cancel = Arc::new(AtomicBool::new(true));

        assert!(matches!(
            execute(
                &program, &snapshot, &db, &store, false, true, &cancel,
            ),
            Err(Error::Cancelled),
        ));
    }

    #[test]
    fn bad_charset_rejected() {
        let snapshot = Snapshot::default();
        assert!(matches!(
            compile(&[SearchKey::All], Some("ebcdic-fantasy"), &snapshot),
            Err(Error::BadCharset),
        ));
    }

}
