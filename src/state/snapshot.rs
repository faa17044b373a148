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

//! The per-session view of a selected mailbox.
//!
//! A snapshot is an ordered vector of messages; the 1-based position of a
//! row is its sequence number, and rows are strictly ascending in UID.
//! Only the owning session mutates its snapshot: its own commands apply
//! immediately, changes from elsewhere arrive through the session's update
//! queue and are applied at flush points.

use std::collections::BTreeSet;

use crate::command::sequence::{SeqAtom, SeqSet};
use crate::db::SnapshotRow;
use crate::model::{FlagSet, MessageId, Seqnum, Uid};
use crate::support::error::Error;

#[derive(Clone, Debug)]
pub struct SnapMessage {
    pub uid: Uid,
    pub id: MessageId,
    pub flags: FlagSet,
    pub recent: bool,
}

#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    rows: Vec<SnapMessage>,
}

impl Snapshot {
    pub fn new(rows: Vec<SnapshotRow>) -> Self {
        Snapshot {
            rows: rows
                .into_iter()
                .map(|row| SnapMessage {
                    uid: row.uid,
                    id: row.message_id,
                    flags: row.flags,
                    recent: row.recent,
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn recent_count(&self) -> usize {
        self.rows.iter().filter(|r| r.recent).count()
    }

    pub fn max_uid(&self) -> Option<Uid> {
        self.rows.last().map(|r| r.uid)
    }

    pub fn get_by_seq(&self, seq: Seqnum) -> Option<&SnapMessage> {
        self.rows.get(seq.to_index())
    }

    pub fn get_by_uid(&self, uid: Uid) -> Option<(Seqnum, &SnapMessage)> {
        self.seq_of_uid(uid)
            .map(|seq| (seq, &self.rows[seq.to_index()]))
    }

    pub fn seq_of_uid(&self, uid: Uid) -> Option<Seqnum> {
        self.rows
            .binary_search_by_key(&uid, |r| r.uid)
            .ok()
            .map(Seqnum::from_index)
    }

    /// First message without `\Seen`, for the `[UNSEEN]` response code.
    pub fn first_unseen(&self) -> Option<Seqnum> {
        self.rows
            .iter()
            .position(|r| !r.flags.contains(&crate::model::Flag::Seen))
            .map(Seqnum::from_index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Seqnum, &SnapMessage)> {
        self.rows
            .iter()
            .enumerate()
            .map(|(ix, row)| (Seqnum::from_index(ix), row))
    }

    /// Appends a message. Rows arrive in UID order; a UID at or below the
    /// current maximum is a duplicate delivery and is dropped.
    pub fn append(&mut self, message: SnapMessage) {
        if self.max_uid().is_some_and(|max| message.uid <= max) {
            return;
        }
        self.rows.push(message);
    }

    /// Removes the row with the given UID, returning the sequence number
    /// it held. All later rows shift down by one.
    pub fn expunge_uid(&mut self, uid: Uid) -> Option<Seqnum> {
        let seq = self.seq_of_uid(uid)?;
        self.rows.remove(seq.to_index());
        Some(seq)
    }

    pub fn update_flags(&mut self, uid: Uid, flags: FlagSet) -> bool {
        match self.rows.binary_search_by_key(&uid, |r| r.uid) {
            Ok(ix) => {
                self.rows[ix].flags = flags;
                true
            },
            Err(_) => false,
        }
    }

    /// Resolves a sequence-number set against this snapshot.
    ///
    /// `*` expands to the highest sequence number; in an empty mailbox it
    /// resolves to nothing. A numeric bound beyond the end of the mailbox
    /// is a protocol error (the client is using stale arithmetic).
    pub fn resolve_seq_set(
        &self,
        set: &SeqSet,
    ) -> Result<Vec<Seqnum>, Error> {
        let len = self.rows.len() as u32;
        let mut out = BTreeSet::new();

        for interval in &set.0 {
            let lo = match interval.lo {
                SeqAtom::Num(n) => n.get(),
                SeqAtom::Star => len,
            };
            let hi = match interval.hi {
                SeqAtom::Num(n) => n.get(),
                SeqAtom::Star => len,
            };
            let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };

            // Entirely `*` in an empty mailbox: matches nothing.
            if 0 == hi {
                continue;
            }

            if lo > len {
                return Err(Error::UnaddressableMessage);
            }

            for seq in lo..=hi.min(len) {
                out.insert(seq);
            }
        }

        Ok(out.into_iter().filter_map(Seqnum::of).collect())
    }

    /// Resolves a UID set against this snapshot.
    ///
    /// `*` is the highest UID currently present. UIDs that do not exist
    /// are silently skipped; clients are explicitly allowed to name them.
    pub fn resolve_uid_set(&self, set: &SeqSet) -> Vec<Uid> {
        let Some(max_uid) = self.max_uid() else {
            return Vec::new();
        };

        let mut out = BTreeSet::new();

        for interval in &set.0 {
            let lo = match interval.lo {
                SeqAtom::Num(n) => n.get(),
                SeqAtom::Star => max_uid.get(),
            };
            let hi = match interval.hi {
                SeqAtom::Num(n) => n.get(),
                SeqAtom::Star => max_uid.get(),
            };
            let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };

            for row in &self.rows {
                let uid = row.uid.get();
                if uid >= lo && uid <= hi {
                    out.insert(row.uid);
                }
            }
        }

        out.into_iter().collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::command::sequence::SeqInterval;
    use crate::model::Flag;
    use std::num::NonZeroU32;

    fn message(uid: u32) -> SnapMessage {
        SnapMessage {
            uid: Uid::u(uid),
            id: MessageId::new(),
            flags: FlagSet::new(),
            recent: false,
        }
    }

    fn snapshot(uids: &[u32]) -> Snapshot {
        let mut snapshot = Snapshot::default();
        for &uid in uids {
            snapshot.append(message(uid));
        }
        snapshot
    }

    fn set(intervals: &[(u32, u32)]) -> SeqSet {
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

    fn star_set() -> SeqSet {
        SeqSet(vec![SeqInterval {
            lo: SeqAtom::Star,
            hi: SeqAtom::Star,
        }])
    }

    #[test]
    fn seq_uid_mapping() {
        let snap = snapshot(&[2, 5, 9]);
        assert_eq!(3, snap.len());
        assert_eq!(Uid::u(5), snap.get_by_seq(Seqnum::u(2)).unwrap().uid);
        assert_eq!(Some(Seqnum::u(3)), snap.seq_of_uid(Uid::u(9)));
        assert_eq!(None, snap.seq_of_uid(Uid::u(3)));
    }

    #[test]
    fn expunge_shifts_later_rows() {
        let mut snap = snapshot(&[1, 2, 3, 4]);
        assert_eq!(Some(Seqnum::u(2)), snap.expunge_uid(Uid::u(2)));
        assert_eq!(Some(Seqnum::u(2)), snap.seq_of_uid(Uid::u(3)));
        assert_eq!(Some(Seqnum::u(3)), snap.seq_of_uid(Uid::u(4)));
        assert_eq!(None, snap.expunge_uid(Uid::u(2)));
    }

    #[test]
    fn append_rejects_stale_uids() {
        let mut snap = snapshot(&[1, 5]);
        snap.append(message(3));
        assert_eq!(2, snap.len());
        snap.append(message(6));
        assert_eq!(3, snap.len());
    }

    #[test]
    fn seq_set_resolution() {
        let snap = snapshot(&[10, 20, 30, 40, 50]);

        assert_eq!(
            vec![Seqnum::u(2), Seqnum::u(3), Seqnum::u(4)],
            snap.resolve_seq_set(&set(&[(2, 4)])).unwrap(),
        );

        // Overlapping intervals deduplicate.
        assert_eq!(
            vec![Seqnum::u(1), Seqnum::u(2), Seqnum::u(3)],
            snap.resolve_seq_set(&set(&[(1, 2), (2, 3)])).unwrap(),
        );

        // A numeric bound past the end is a client error.
        assert!(matches!(
            snap.resolve_seq_set(&set(&[(6, 6)])),
            Err(Error::UnaddressableMessage),
        ));

        // Reversed bounds normalise.
        assert_eq!(
            vec![Seqnum::u(1), Seqnum::u(2)],
            snap.resolve_seq_set(&set(&[(2, 1)])).unwrap(),
        );
    }

    #[test]
    fn star_resolution() {
        let snap = snapshot(&[10, 20, 30]);
        assert_eq!(
            vec![Seqnum::u(3)],
            snap.resolve_seq_set(&star_set()).unwrap(),
        );
        assert_eq!(vec![Uid::u(30)], snap.resolve_uid_set(&star_set()));

        let empty = snapshot(&[]);
        assert!(empty.resolve_seq_set(&star_set()).unwrap().is_empty());
        assert!(empty.resolve_uid_set(&star_set()).is_empty());
    }

    #[test]
    fn uid_set_is_lenient() {
        let snap = snapshot(&[10, 20, 30]);
        // 25 and 99999 do not exist; no error, no match.
        assert_eq!(
            vec![Uid::u(20), Uid::u(30)],
            snap.resolve_uid_set(&set(&[(20, 25), (30, 99_999)])),
        );
    }

    #[test]
    fn flags_and_unseen() {
        let mut snap = snapshot(&[1, 2]);
        snap.update_flags(
            Uid::u(1),
            [Flag::Seen].into_iter().collect(),
        );
        assert_eq!(Some(Seqnum::u(2)), snap.first_unseen());
        snap.update_flags(
            Uid::u(2),
            [Flag::Seen].into_iter().collect(),
        );
        assert_eq!(None, snap.first_unseen());
    }
}
