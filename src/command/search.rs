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

//! SEARCH key grammar.
//!
//! Text arguments are kept as raw bytes here; the search engine decodes them
//! with the charset named in the command (default US-ASCII/UTF-8) when it
//! compiles the key tree.

use std::future::Future;
use std::pin::Pin;

use chrono::NaiveDate;
use tokio::io::AsyncRead;

use super::sequence::{parse_seq_set, SeqSet};
use crate::parser::{
    is_astring_char, ParseError, Parser, scanner::TokenType,
};

#[derive(Clone, Debug, PartialEq)]
pub struct SearchCommand {
    pub charset: Option<String>,
    pub keys: Vec<SearchKey>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SearchKey {
    All,
    Answered,
    Bcc(Vec<u8>),
    Before(NaiveDate),
    Body(Vec<u8>),
    Cc(Vec<u8>),
    Deleted,
    Draft,
    Flagged,
    From(Vec<u8>),
    Header(String, Vec<u8>),
    Keyword(String),
    Larger(u32),
    New,
    Not(Box<SearchKey>),
    Old,
    On(NaiveDate),
    Or(Box<SearchKey>, Box<SearchKey>),
    Recent,
    Seen,
    SentBefore(NaiveDate),
    SentOn(NaiveDate),
    SentSince(NaiveDate),
    Since(NaiveDate),
    Smaller(u32),
    Subject(Vec<u8>),
    Text(Vec<u8>),
    To(Vec<u8>),
    Uid(SeqSet),
    Unanswered,
    Undeleted,
    Undraft,
    Unflagged,
    Unkeyword(String),
    Unseen,
    SeqSet(SeqSet),
    /// Parenthesised key list, an implicit AND.
    And(Vec<SearchKey>),
    /// The bare atom `CHARSET`; only valid as the first word of the
    /// command, where `parse_search` consumes it together with its
    /// argument.
    Charset,
}

/// search = ["CHARSET" SP astring SP] search-key *(SP search-key)
pub async fn parse_search<R: AsyncRead + Unpin + Send>(
    p: &mut Parser<R>,
) -> Result<SearchCommand, ParseError> {
    p.consume(TokenType::Sp, "expected space after command")
        .await?;

    let mut charset = None::<String>;
    let mut keys = Vec::new();

    loop {
        let key = parse_search_key(p).await?;

        if let SearchKey::Charset = key {
            if !keys.is_empty() || charset.is_some() {
                return Err(
                    p.make_error("CHARSET must be the first search item")
                );
            }

            p.consume(TokenType::Sp, "expected space after CHARSET")
                .await?;
            charset = Some(p.parse_astring().await?.into_utf8()?);
            p.consume(TokenType::Sp, "expected search key").await?;
            continue;
        }

        keys.push(key);

        if !p.matches(TokenType::Sp).await? {
            break;
        }
    }

    if keys.is_empty() {
        return Err(p.make_error("expected at least one search key"));
    }

    Ok(SearchCommand { charset, keys })
}

/// Boxing indirection for the recursive key grammar (NOT, OR, lists).
fn parse_search_key_boxed<'a, R: AsyncRead + Unpin + Send>(
    p: &'a mut Parser<R>,
) -> Pin<Box<dyn Future<Output = Result<SearchKey, ParseError>> + Send + 'a>>
{
    Box::pin(parse_search_key(p))
}

pub async fn parse_search_key<R: AsyncRead + Unpin + Send>(
    p: &mut Parser<R>,
) -> Result<SearchKey, ParseError> {
    // Parenthesised list.
    if p.matches(TokenType::LParen).await? {
        let mut keys = Vec::new();
        loop {
            keys.push(parse_search_key_boxed(p).await?);
            if !p.matches(TokenType::Sp).await? {
                break;
            }
        }
        p.consume(TokenType::RParen, "expected ')' after search keys")
            .await?;
        return Ok(SearchKey::And(keys));
    }

    // A bare sequence set.
    if p.check(TokenType::Digit) || p.current().value == b'*' {
        return Ok(SearchKey::SeqSet(parse_seq_set(p).await?));
    }

    let name = p.parse_atom().await?.to_ascii_uppercase();

    match name.as_str() {
        "ALL" => Ok(SearchKey::All),
        "ANSWERED" => Ok(SearchKey::Answered),
        "BCC" => Ok(SearchKey::Bcc(string_arg(p).await?)),
        "BEFORE" => Ok(SearchKey::Before(date_arg(p).await?)),
        "BODY" => Ok(SearchKey::Body(string_arg(p).await?)),
        "CC" => Ok(SearchKey::Cc(string_arg(p).await?)),
        "DELETED" => Ok(SearchKey::Deleted),
        "DRAFT" => Ok(SearchKey::Draft),
        "FLAGGED" => Ok(SearchKey::Flagged),
        "FROM" => Ok(SearchKey::From(string_arg(p).await?)),
        "HEADER" => {
            p.consume(TokenType::Sp, "expected space after HEADER")
                .await?;
            let field = p.parse_astring().await?.into_utf8()?;
            let value = string_arg(p).await?;
            Ok(SearchKey::Header(field, value))
        },
        "KEYWORD" => Ok(SearchKey::Keyword(atom_arg(p).await?)),
        "LARGER" => Ok(SearchKey::Larger(number_arg(p).await?)),
        "NEW" => Ok(SearchKey::New),
        "NOT" => {
            p.consume(TokenType::Sp, "expected space after NOT").await?;
            Ok(SearchKey::Not(Box::new(parse_search_key_boxed(p).await?)))
        },
        "OLD" => Ok(SearchKey::Old),
        "ON" => Ok(SearchKey::On(date_arg(p).await?)),
        "OR" => {
            p.consume(TokenType::Sp, "expected space after OR").await?;
            let a = parse_search_key_boxed(p).await?;
            p.consume(TokenType::Sp, "expected second OR operand")
                .await?;
            let b = parse_search_key_boxed(p).await?;
            Ok(SearchKey::Or(Box::new(a), Box::new(b)))
        },
        "RECENT" => Ok(SearchKey::Recent),
        "SEEN" => Ok(SearchKey::Seen),
        "SENTBEFORE" => Ok(SearchKey::SentBefore(date_arg(p).await?)),
        "SENTON" => Ok(SearchKey::SentOn(date_arg(p).await?)),
        "SENTSINCE" => Ok(SearchKey::SentSince(date_arg(p).await?)),
        "SINCE" => Ok(SearchKey::Since(date_arg(p).await?)),
        "SMALLER" => Ok(SearchKey::Smaller(number_arg(p).await?)),
        "SUBJECT" => Ok(SearchKey::Subject(string_arg(p).await?)),
        "TEXT" => Ok(SearchKey::Text(string_arg(p).await?)),
        "TO" => Ok(SearchKey::To(string_arg(p).await?)),
        "UID" => {
            p.consume(TokenType::Sp, "expected space after UID").await?;
            Ok(SearchKey::Uid(parse_seq_set(p).await?))
        },
        "UNANSWERED" => Ok(SearchKey::Unanswered),
        "UNDELETED" => Ok(SearchKey::Undeleted),
        "UNDRAFT" => Ok(SearchKey::Undraft),
        "UNFLAGGED" => Ok(SearchKey::Unflagged),
        "UNKEYWORD" => Ok(SearchKey::Unkeyword(atom_arg(p).await?)),
        "UNSEEN" => Ok(SearchKey::Unseen),
        "CHARSET" => Ok(SearchKey::Charset),
        _ => Err(p.make_error("unknown search key")),
    }
}

async fn string_arg<R: AsyncRead + Unpin>(
    p: &mut Parser<R>,
) -> Result<Vec<u8>, ParseError> {
    p.consume(TokenType::Sp, "expected search key argument")
        .await?;
    Ok(p.parse_astring().await?.value)
}

async fn atom_arg<R: AsyncRead + Unpin>(
    p: &mut Parser<R>,
) -> Result<String, ParseError> {
    p.consume(TokenType::Sp, "expected search key argument")
        .await?;
    p.collect_while(is_astring_char).await?.into_utf8()
}

async fn number_arg<R: AsyncRead + Unpin>(
    p: &mut Parser<R>,
) -> Result<u32, ParseError> {
    p.consume(TokenType::Sp, "expected search key argument")
        .await?;
    p.parse_number().await
}

async fn date_arg<R: AsyncRead + Unpin>(
    p: &mut Parser<R>,
) -> Result<NaiveDate, ParseError> {
    p.consume(TokenType::Sp, "expected search key argument")
        .await?;

    let raw = if p.check(TokenType::DQuote) {
        p.parse_quoted().await?
    } else {
        p.collect_while(|tt| {
            matches!(tt, TokenType::Digit | TokenType::Char)
        })
        .await?
    };

    let offset = raw.offset;
    let text = raw.into_utf8()?;
    NaiveDate::parse_from_str(&text, "%d-%b-%Y").map_err(|_| {
        ParseError::Syntax {
            offset,
            message: std::borrow::Cow::Borrowed("invalid date"),
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(input: &[u8]) -> Result<SearchCommand, ParseError> {
        futures::executor::block_on(async {
            let mut p = Parser::new(input);
            p.advance().await?;
            parse_search(&mut p).await
        })
    }

    #[test]
    fn simple_keys() {
        let cmd = parse(b" UNSEEN DELETED").unwrap();
        assert_eq!(None, cmd.charset);
        assert_eq!(
            vec![SearchKey::Unseen, SearchKey::Deleted],
            cmd.keys,
        );
    }

    #[test]
    fn charset_prefix() {
        let cmd = parse(b" CHARSET UTF-8 TEXT hello").unwrap();
        assert_eq!(Some("UTF-8".to_owned()), cmd.charset);
        assert_eq!(vec![SearchKey::Text(b"hello".to_vec())], cmd.keys);
    }

    #[test]
    fn recursion() {
        let cmd = parse(b" OR (SEEN FLAGGED) NOT DRAFT").unwrap();
        assert_eq!(
            vec![SearchKey::Or(
                Box::new(SearchKey::And(vec![
                    SearchKey::Seen,
                    SearchKey::Flagged,
                ])),
                Box::new(SearchKey::Not(Box::new(SearchKey::Draft))),
            )],
            cmd.keys,
        );
    }

    #[test]
    fn dates_and_sizes() {
        let cmd =
            parse(b" SENTBEFORE 1-Feb-1994 LARGER 1024 SINCE \"02-Feb-1994\"")
                .unwrap();
        assert_eq!(
            vec![
                SearchKey::SentBefore(
                    NaiveDate::from_ymd_opt(1994, 2, 1).unwrap(),
                ),
                SearchKey::Larger(1024),
                SearchKey::Since(
                    NaiveDate::from_ymd_opt(1994, 2, 2).unwrap(),
                ),
            ],
            cmd.keys,
        );
    }

    #[test]
    fn uid_and_seq_sets() {
        let cmd = parse(b" UID 1:4,9 2:*").unwrap();
        assert!(matches!(cmd.keys[0], SearchKey::Uid(..)));
        assert!(matches!(cmd.keys[1], SearchKey::SeqSet(..)));
    }

    #[test]
    fn literal_search_text() {
        let cmd = parse(b" SUBJECT {5}\r\nhello").unwrap();
        assert_eq!(
            vec![SearchKey::Subject(b"hello".to_vec())],
            cmd.keys,
        );
    }
}
