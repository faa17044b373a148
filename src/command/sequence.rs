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

//! Sequence-set grammar.
//!
//! The parsed form keeps `*` unresolved; resolution against the live
//! snapshot happens at evaluation time, where `*` means the greatest
//! sequence number or UID then in the mailbox.

use std::num::NonZeroU32;

use tokio::io::AsyncRead;

use crate::parser::{ParseError, Parser, scanner::TokenType};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeqAtom {
    Num(NonZeroU32),
    Star,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SeqInterval {
    pub lo: SeqAtom,
    pub hi: SeqAtom,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeqSet(pub Vec<SeqInterval>);

/// sequence-set = (seq-number / seq-range) *("," (seq-number / seq-range))
pub async fn parse_seq_set<R: AsyncRead + Unpin>(
    p: &mut Parser<R>,
) -> Result<SeqSet, ParseError> {
    let mut intervals = Vec::new();

    loop {
        let lo = parse_seq_atom(p).await?;
        let hi = if p.matches_byte(b':').await? {
            parse_seq_atom(p).await?
        } else {
            lo
        };

        intervals.push(SeqInterval { lo, hi });

        if !p.matches_byte(b',').await? {
            break;
        }
    }

    Ok(SeqSet(intervals))
}

async fn parse_seq_atom<R: AsyncRead + Unpin>(
    p: &mut Parser<R>,
) -> Result<SeqAtom, ParseError> {
    if p.matches_byte(b'*').await? {
        return Ok(SeqAtom::Star);
    }

    if !p.check(TokenType::Digit) {
        return Err(p.make_error("expected sequence number or '*'"));
    }

    let number = p.parse_number().await?;
    NonZeroU32::new(number)
        .map(SeqAtom::Num)
        .ok_or_else(|| p.make_error("sequence numbers start at 1"))
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(input: &[u8]) -> Result<SeqSet, ParseError> {
        futures::executor::block_on(async {
            let mut p = Parser::new(input);
            p.advance().await?;
            parse_seq_set(&mut p).await
        })
    }

    fn num(n: u32) -> SeqAtom {
        SeqAtom::Num(NonZeroU32::new(n).unwrap())
    }

    #[test]
    fn single_values_and_ranges() {
        assert_eq!(
            SeqSet(vec![SeqInterval { lo: num(3), hi: num(3) }]),
            parse(b"3").unwrap(),
        );
        assert_eq!(
            SeqSet(vec![SeqInterval { lo: num(1), hi: num(5) }]),
            parse(b"1:5").unwrap(),
        );
        assert_eq!(
            SeqSet(vec![SeqInterval {
                lo: SeqAtom::Star,
                hi: SeqAtom::Star,
            }]),
            parse(b"*").unwrap(),
        );
    }

    #[test]
    fn comma_separated() {
        assert_eq!(
            SeqSet(vec![
                SeqInterval { lo: num(2), hi: num(2) },
                SeqInterval { lo: num(4), hi: SeqAtom::Star },
                SeqInterval { lo: num(7), hi: num(9) },
            ]),
            parse(b"2,4:*,7:9").unwrap(),
        );
    }

    #[test]
    fn zero_rejected() {
        assert!(parse(b"0").is_err());
        assert!(parse(b"1:0").is_err());
    }
}
