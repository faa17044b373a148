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

//! FETCH attribute grammar.

use tokio::io::AsyncRead;

use super::sequence::{parse_seq_set, SeqSet};
use crate::parser::{ParseError, Parser, scanner::TokenType};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchCommand {
    pub set: SeqSet,
    pub attrs: Vec<FetchAttr>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchAttr {
    Envelope,
    Flags,
    InternalDate,
    Rfc822,
    Rfc822Header,
    Rfc822Size,
    Rfc822Text,
    Uid,
    Body {
        section: Section,
        partial: Option<(u32, u32)>,
        peek: bool,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Section {
    /// `BODY[]` — the entire message.
    Full,
    Header,
    HeaderFields { fields: Vec<String>, not: bool },
    Text,
}

/// fetch = sequence-set SP ("ALL" / "FULL" / "FAST" / fetch-att /
///         "(" fetch-att *(SP fetch-att) ")")
pub async fn parse_fetch<R: AsyncRead + Unpin>(
    p: &mut Parser<R>,
) -> Result<FetchCommand, ParseError> {
    p.consume(TokenType::Sp, "expected space after command")
        .await?;

    let set = parse_seq_set(p).await?;

    p.consume(TokenType::Sp, "expected space after sequence set")
        .await?;

    let mut attrs = Vec::new();

    if p.matches(TokenType::LParen).await? {
        loop {
            attrs.push(parse_fetch_attr(p).await?);
            if !p.matches(TokenType::Sp).await? {
                break;
            }
        }
        p.consume(TokenType::RParen, "expected ')' after fetch attributes")
            .await?;
    } else {
        let name = p.parse_atom().await?.to_ascii_uppercase();
        match name.as_str() {
            // The macros may only appear alone.
            "ALL" => attrs.extend([
                FetchAttr::Flags,
                FetchAttr::InternalDate,
                FetchAttr::Rfc822Size,
                FetchAttr::Envelope,
            ]),
            "FAST" => attrs.extend([
                FetchAttr::Flags,
                FetchAttr::InternalDate,
                FetchAttr::Rfc822Size,
            ]),
            "FULL" => attrs.extend([
                FetchAttr::Flags,
                FetchAttr::InternalDate,
                FetchAttr::Rfc822Size,
                FetchAttr::Envelope,
            ]),
            _ => attrs.push(finish_fetch_attr(p, &name).await?),
        }
    }

    Ok(FetchCommand { set, attrs })
}

async fn parse_fetch_attr<R: AsyncRead + Unpin>(
    p: &mut Parser<R>,
) -> Result<FetchAttr, ParseError> {
    let name = p.parse_atom().await?.to_ascii_uppercase();
    finish_fetch_attr(p, &name).await
}

async fn finish_fetch_attr<R: AsyncRead + Unpin>(
    p: &mut Parser<R>,
    name: &str,
) -> Result<FetchAttr, ParseError> {
    match name {
        "ENVELOPE" => Ok(FetchAttr::Envelope),
        "FLAGS" => Ok(FetchAttr::Flags),
        "INTERNALDATE" => Ok(FetchAttr::InternalDate),
        "RFC822" => Ok(FetchAttr::Rfc822),
        "RFC822.HEADER" => Ok(FetchAttr::Rfc822Header),
        "RFC822.SIZE" => Ok(FetchAttr::Rfc822Size),
        "RFC822.TEXT" => Ok(FetchAttr::Rfc822Text),
        "UID" => Ok(FetchAttr::Uid),
        "BODY" | "BODY.PEEK" => {
            let peek = "BODY.PEEK" == name;
            if !p.check(TokenType::LBracket) {
                // Bare BODY asks for the non-extensible body structure,
                // which this server does not serve.
                return Err(
                    p.make_error("unsupported fetch attribute; use BODY[...]")
                );
            }

            let section = parse_section(p).await?;
            let partial = parse_partial(p).await?;

            Ok(FetchAttr::Body {
                section,
                partial,
                peek,
            })
        },
        _ => Err(p.make_error("unknown fetch attribute")),
    }
}

/// section = "[" ["HEADER" / "HEADER.FIELDS" [".NOT"] SP header-list /
///                "TEXT"] "]"
async fn parse_section<R: AsyncRead + Unpin>(
    p: &mut Parser<R>,
) -> Result<Section, ParseError> {
    p.consume(TokenType::LBracket, "expected '['").await?;

    if p.matches(TokenType::RBracket).await? {
        return Ok(Section::Full);
    }

    let name = p.parse_atom().await?.to_ascii_uppercase();
    let section = match name.as_str() {
        "HEADER" => Section::Header,
        "TEXT" => Section::Text,
        "HEADER.FIELDS" | "HEADER.FIELDS.NOT" => {
            let not = "HEADER.FIELDS.NOT" == name;
            p.consume(TokenType::Sp, "expected space before header list")
                .await?;
            p.consume(TokenType::LParen, "expected '(' for header list")
                .await?;

            let mut fields = Vec::new();
            loop {
                fields.push(p.parse_astring().await?.into_utf8()?);
                if !p.matches(TokenType::Sp).await? {
                    break;
                }
            }

            p.consume(TokenType::RParen, "expected ')' after header list")
                .await?;

            Section::HeaderFields { fields, not }
        },
        _ => return Err(p.make_error("unknown body section")),
    };

    p.consume(TokenType::RBracket, "expected ']' after section")
        .await?;

    Ok(section)
}

/// partial = "<" number "." nz-number ">"
async fn parse_partial<R: AsyncRead + Unpin>(
    p: &mut Parser<R>,
) -> Result<Option<(u32, u32)>, ParseError> {
    if !p.matches_byte(b'<').await? {
        return Ok(None);
    }

    let origin = p.parse_number().await?;
    p.consume_byte(b'.', "expected '.' in partial range").await?;
    let size = p.parse_number().await?;
    if 0 == size {
        return Err(p.make_error("partial size must not be zero"));
    }
    p.consume_byte(b'>', "expected '>' after partial range")
        .await?;

    Ok(Some((origin, size)))
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(input: &[u8]) -> Result<FetchCommand, ParseError> {
        futures::executor::block_on(async {
            let mut p = Parser::new(input);
            p.advance().await?;
            parse_fetch(&mut p).await
        })
    }

    #[test]
    fn single_attr() {
        let cmd = parse(b" 1:3 FLAGS").unwrap();
        assert_eq!(vec![FetchAttr::Flags], cmd.attrs);
    }

    #[test]
    fn macros_expand() {
        let cmd = parse(b" 1 FAST").unwrap();
        assert_eq!(
            vec![
                FetchAttr::Flags,
                FetchAttr::InternalDate,
                FetchAttr::Rfc822Size,
            ],
            cmd.attrs,
        );
    }

    #[test]
    fn parenthesised_list() {
        let cmd = parse(b" 1 (UID RFC822.SIZE BODY.PEEK[])").unwrap();
        assert_eq!(
            vec![
                FetchAttr::Uid,
                FetchAttr::Rfc822Size,
                FetchAttr::Body {
                    section: Section::Full,
                    partial: None,
                    peek: true,
                },
            ],
            cmd.attrs,
        );
    }

    #[test]
    fn sections_and_partials() {
        let cmd = parse(b" 1 BODY[HEADER.FIELDS (From Date)]<0.512>")
            .unwrap();
        assert_eq!(
            vec![FetchAttr::Body {
                section: Section::HeaderFields {
                    fields: vec!["From".to_owned(), "Date".to_owned()],
                    not: false,
                },
                partial: Some((0, 512)),
                peek: false,
            }],
            cmd.attrs,
        );

        let cmd = parse(b" 2 BODY[TEXT]").unwrap();
        assert_eq!(
            vec![FetchAttr::Body {
                section: Section::Text,
                partial: None,
                peek: false,
            }],
            cmd.attrs,
        );
    }

    #[test]
    fn bare_body_rejected() {
        assert!(parse(b" 1 BODY").is_err());
    }
}
