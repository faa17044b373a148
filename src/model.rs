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

//! Identifier and flag types shared by every layer of the crate.

use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;

use uuid::Uuid;

/// Uniquely identifies a message within a single mailbox.
///
/// UIDs start at 1 and increase monotonically as messages are added to the
/// mailbox. Within one UID-validity epoch, UIDs are never reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uid(pub NonZeroU32);

impl Uid {
    pub const MIN: Self = match NonZeroU32::new(1) {
        Some(n) => Uid(n),
        None => unreachable!(),
    };
    pub const MAX: Self = match NonZeroU32::new(u32::MAX) {
        Some(n) => Uid(n),
        None => unreachable!(),
    };

    pub fn of(uid: u32) -> Option<Self> {
        NonZeroU32::new(uid).map(Uid)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }

    pub fn next(self) -> Option<Self> {
        self.0.get().checked_add(1).and_then(Uid::of)
    }

    #[cfg(test)]
    pub fn u(uid: u32) -> Self {
        Uid::of(uid).unwrap()
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Uid({})", self.0.get())
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.get())
    }
}

/// The 1-based position of a message in the currently selected mailbox view.
///
/// Unlike UIDs, sequence numbers shift whenever an earlier message is
/// expunged, so they are only meaningful relative to one session's snapshot.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Seqnum(pub NonZeroU32);

impl Seqnum {
    pub fn of(seqnum: u32) -> Option<Self> {
        NonZeroU32::new(seqnum).map(Seqnum)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }

    pub fn to_index(self) -> usize {
        self.0.get() as usize - 1
    }

    pub fn from_index(ix: usize) -> Self {
        Seqnum::of(u32::try_from(ix + 1).unwrap()).unwrap()
    }

    #[cfg(test)]
    pub fn u(seqnum: u32) -> Self {
        Seqnum::of(seqnum).unwrap()
    }
}

impl fmt::Debug for Seqnum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Seqnum({})", self.0.get())
    }
}

impl fmt::Display for Seqnum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.get())
    }
}

/// A per-mailbox UID-validity epoch.
///
/// The value is drawn from a per-user monotonic counter; when a mailbox is
/// destroyed while holding the current epoch, the counter is bumped so any
/// later mailbox with the same name reads as a fresh UID space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UidValidity(pub u32);

impl UidValidity {
    pub fn get(self) -> u32 {
        self.0
    }

    pub fn next(self) -> Self {
        UidValidity(self.0.saturating_add(1))
    }
}

impl fmt::Display for UidValidity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Internal mailbox identifier, dense within one user's metadata database.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MailboxId(pub i64);

/// Internal message identifier, unique within one user.
///
/// A message exists once per user and is referenced by zero or more
/// mailboxes through per-mailbox UID records.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        MessageId(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MessageId({})", self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(MessageId)
    }
}

/// Opaque mailbox identifier assigned by the host's backend.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RemoteMailboxId(pub String);

/// Opaque message identifier assigned by the host's backend.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RemoteMessageId(pub String);

/// A single message flag.
///
/// System flags are represented by dedicated variants; anything else is a
/// keyword. Flag comparison is case-insensitive per RFC 3501, which is
/// handled by normalising through `canonical_key`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Flag {
    Answered,
    Deleted,
    Draft,
    Flagged,
    Seen,
    Recent,
    Keyword(String),
}

impl Flag {
    /// Parses a flag from its wire form (`\Seen`, `\Answered`, `keyword`).
    pub fn from_wire(s: &str) -> Self {
        if let Some(name) = s.strip_prefix('\\') {
            match name.to_ascii_lowercase().as_str() {
                "answered" => return Flag::Answered,
                "deleted" => return Flag::Deleted,
                "draft" => return Flag::Draft,
                "flagged" => return Flag::Flagged,
                "seen" => return Flag::Seen,
                "recent" => return Flag::Recent,
                _ => (),
            }
        }

        Flag::Keyword(s.to_owned())
    }

    /// Lower-cased wire form used as the case-insensitive identity of the
    /// flag.
    pub fn canonical_key(&self) -> String {
        self.to_string().to_ascii_lowercase()
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Flag::Answered => write!(f, "\\Answered"),
            Flag::Deleted => write!(f, "\\Deleted"),
            Flag::Draft => write!(f, "\\Draft"),
            Flag::Flagged => write!(f, "\\Flagged"),
            Flag::Seen => write!(f, "\\Seen"),
            Flag::Recent => write!(f, "\\Recent"),
            Flag::Keyword(ref kw) => write!(f, "{}", kw),
        }
    }
}

/// A case-insensitive set of flags, preserving insertion order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlagSet {
    flags: Vec<Flag>,
}

impl FlagSet {
    pub fn new() -> Self {
        FlagSet::default()
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn contains(&self, flag: &Flag) -> bool {
        let key = flag.canonical_key();
        self.flags.iter().any(|f| f.canonical_key() == key)
    }

    /// Inserts `flag` unless an equivalent flag is already present. Returns
    /// whether the set changed.
    pub fn insert(&mut self, flag: Flag) -> bool {
        if self.contains(&flag) {
            false
        } else {
            self.flags.push(flag);
            true
        }
    }

    /// Removes any flag equivalent to `flag`. Returns whether the set
    /// changed.
    pub fn remove(&mut self, flag: &Flag) -> bool {
        let key = flag.canonical_key();
        let before = self.flags.len();
        self.flags.retain(|f| f.canonical_key() != key);
        before != self.flags.len()
    }

    pub fn union_with(&mut self, other: &FlagSet) {
        for flag in &other.flags {
            self.insert(flag.clone());
        }
    }

    pub fn difference_with(&mut self, other: &FlagSet) {
        for flag in &other.flags {
            self.remove(flag);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Flag> {
        self.flags.iter()
    }

    /// Renders the set in IMAP wire form, without the enclosing parentheses.
    pub fn to_wire(&self) -> String {
        use itertools::Itertools as _;
        self.flags.iter().map(Flag::to_string).join(" ")
    }
}

impl FromIterator<Flag> for FlagSet {
    fn from_iter<I: IntoIterator<Item = Flag>>(iter: I) -> Self {
        let mut set = FlagSet::new();
        for flag in iter {
            set.insert(flag);
        }
        set
    }
}

impl<'a> IntoIterator for &'a FlagSet {
    type Item = &'a Flag;
    type IntoIter = std::slice::Iter<'a, Flag>;

    fn into_iter(self) -> Self::IntoIter {
        self.flags.iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn flag_wire_round_trip() {
        assert_eq!(Flag::Seen, Flag::from_wire("\\seen"));
        assert_eq!(Flag::Seen, Flag::from_wire("\\SEEN"));
        assert_eq!(Flag::Deleted, Flag::from_wire("\\Deleted"));
        assert_eq!(
            Flag::Keyword("$Phishing".to_owned()),
            Flag::from_wire("$Phishing"),
        );
        assert_eq!("\\Seen", Flag::Seen.to_string());
    }

    #[test]
    fn flag_set_case_insensitive() {
        let mut set = FlagSet::new();
        assert!(set.insert(Flag::Keyword("Foo".to_owned())));
        assert!(!set.insert(Flag::Keyword("FOO".to_owned())));
        assert!(set.contains(&Flag::Keyword("foo".to_owned())));
        assert!(set.remove(&Flag::Keyword("fOo".to_owned())));
        assert!(set.is_empty());
    }

    #[test]
    fn flag_set_ops() {
        let mut a: FlagSet =
            [Flag::Seen, Flag::Flagged].into_iter().collect();
        let b: FlagSet =
            [Flag::Flagged, Flag::Deleted].into_iter().collect();

        a.union_with(&b);
        assert_eq!(3, a.len());

        a.difference_with(&b);
        assert_eq!(1, a.len());
        assert!(a.contains(&Flag::Seen));
    }

    #[test]
    fn uid_arithmetic() {
        assert_eq!(None, Uid::of(0));
        assert_eq!(Some(Uid::u(2)), Uid::u(1).next());
        assert_eq!(None, Uid::MAX.next());
        assert_eq!(0, Seqnum::u(1).to_index());
        assert_eq!(Seqnum::u(4), Seqnum::from_index(3));
    }
}
