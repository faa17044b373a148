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

//! Token-level parsing primitives for RFC 3501 grammar.
//!
//! The parser keeps two tokens of lookahead (previous and current) over the
//! scanner. `advance` must run once before any check so that the current
//! token is populated; the command-level parser does this at the start of
//! every command.
//!
//! Literals are the one place where parsing suspends on the peer: when the
//! parser reaches the CR of a literal header and a continuation channel is
//! configured, it emits `+ Ready` and then pulls the announced number of raw
//! bytes straight from the scanner, bypassing tokenization.

pub mod scanner;

use std::borrow::Cow;
use std::fmt;
use std::io;

use tokio::sync::mpsc;

use self::scanner::{Scanner, Token, TokenType};
use crate::response::OutputEvent;

pub const DEFAULT_CONTINUATION_MESSAGE: &str = "Ready";

/// Hard ceiling on literal sizes, externalized through `ImapLimits`.
pub const DEFAULT_MAX_LITERAL_SIZE: u32 = 30 * 1024 * 1024;

#[derive(Debug)]
pub enum ParseError {
    /// The input violates the grammar. The session recovers by dropping the
    /// rest of the line and answering BAD.
    Syntax {
        offset: usize,
        message: Cow<'static, str>,
    },
    /// The input is syntactically valid but exceeds a protocol limit.
    Limit {
        offset: usize,
        message: Cow<'static, str>,
    },
    /// The underlying stream failed; the session is not recoverable.
    Io(io::Error),
}

impl ParseError {
    pub fn is_io(&self) -> bool {
        matches!(self, ParseError::Io(..))
    }

    /// Human-readable text safe to put in a BAD response (no leading
    /// bracket, which clients would read as a response code).
    pub fn wire_message(&self) -> String {
        match *self {
            ParseError::Syntax {
                offset,
                ref message,
            } => format!("Syntax error at offset {}: {}", offset, message),
            ParseError::Limit {
                offset,
                ref message,
            } => {
                format!("Protocol limit at offset {}: {}", offset, message)
            },
            ParseError::Io(ref e) => e.to_string(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ParseError::Syntax {
                offset,
                ref message,
            } => write!(f, "[offset={}] {}", offset, message),
            ParseError::Limit {
                offset,
                ref message,
            } => write!(f, "[offset={}] {}", offset, message),
            ParseError::Io(ref e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ParseError {}

impl From<io::Error> for ParseError {
    fn from(e: io::Error) -> Self {
        ParseError::Io(e)
    }
}

/// A run of collected bytes plus the offset of its first byte.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ByteString {
    pub value: Vec<u8>,
    pub offset: usize,
}

impl ByteString {
    pub fn into_utf8(self) -> Result<String, ParseError> {
        let offset = self.offset;
        String::from_utf8(self.value).map_err(|_| ParseError::Syntax {
            offset,
            message: Cow::Borrowed("invalid UTF-8 in string"),
        })
    }
}

pub struct Parser<R> {
    scanner: Scanner<R>,
    prev: Token,
    cur: Token,
    continuation: Option<mpsc::Sender<OutputEvent>>,
    max_literal: u32,
}

impl<R: tokio::io::AsyncRead + Unpin> Parser<R> {
    pub fn new(io: R) -> Self {
        Parser {
            scanner: Scanner::new(io),
            prev: Token::eof(0),
            cur: Token::eof(0),
            continuation: None,
            max_literal: DEFAULT_MAX_LITERAL_SIZE,
        }
    }

    /// Configures the capability used to prompt the client for the body of a
    /// synchronising literal.
    pub fn with_continuation(
        mut self,
        sender: mpsc::Sender<OutputEvent>,
    ) -> Self {
        self.continuation = Some(sender);
        self
    }

    pub fn with_max_literal(mut self, max_literal: u32) -> Self {
        self.max_literal = max_literal;
        self
    }

    pub fn previous(&self) -> Token {
        self.prev
    }

    pub fn current(&self) -> Token {
        self.cur
    }

    pub fn reset_offset(&mut self) {
        self.scanner.reset_offset();
    }

    pub fn raw_prefix(&self) -> [u8; 3] {
        self.scanner.raw_prefix()
    }

    pub fn make_error(&self, message: &'static str) -> ParseError {
        ParseError::Syntax {
            offset: self.prev.offset,
            message: Cow::Borrowed(message),
        }
    }

    /// Advances the scanner to the next token.
    pub async fn advance(&mut self) -> Result<(), ParseError> {
        self.prev = self.cur;
        self.cur = self.scanner.scan_token().await?;
        Ok(())
    }

    /// Whether the current token matches the given type.
    pub fn check(&self, tt: TokenType) -> bool {
        self.cur.ttype == tt
    }

    pub fn check_with(&self, f: impl Fn(TokenType) -> bool) -> bool {
        f(self.cur.ttype)
    }

    /// Advances past the current token if it has the given type; fails with
    /// `message` otherwise.
    pub async fn consume(
        &mut self,
        tt: TokenType,
        message: &'static str,
    ) -> Result<(), ParseError> {
        self.consume_with(|t| t == tt, message).await
    }

    pub async fn consume_with(
        &mut self,
        f: impl Fn(TokenType) -> bool,
        message: &'static str,
    ) -> Result<(), ParseError> {
        if f(self.cur.ttype) {
            self.advance().await
        } else {
            Err(ParseError::Syntax {
                offset: self.cur.offset,
                message: Cow::Borrowed(message),
            })
        }
    }

    /// Advances past the current token if its raw byte value is `byte`.
    pub async fn consume_byte(
        &mut self,
        byte: u8,
        message: &'static str,
    ) -> Result<(), ParseError> {
        if self.cur.ttype != TokenType::Eof && self.cur.value == byte {
            self.advance().await
        } else {
            Err(ParseError::Syntax {
                offset: self.cur.offset,
                message: Cow::Borrowed(message),
            })
        }
    }

    /// Advances and returns true if the current token has the given type.
    pub async fn matches(&mut self, tt: TokenType) -> Result<bool, ParseError> {
        self.matches_with(|t| t == tt).await
    }

    pub async fn matches_with(
        &mut self,
        f: impl Fn(TokenType) -> bool,
    ) -> Result<bool, ParseError> {
        if !f(self.cur.ttype) {
            return Ok(false);
        }

        self.advance().await?;
        Ok(true)
    }

    pub async fn matches_byte(&mut self, byte: u8) -> Result<bool, ParseError> {
        if self.cur.ttype == TokenType::Eof || self.cur.value != byte {
            return Ok(false);
        }

        self.advance().await?;
        Ok(true)
    }

    /// Collects bytes while tokens match the given condition, starting with
    /// the current token.
    pub async fn collect_while(
        &mut self,
        f: impl Fn(TokenType) -> bool,
    ) -> Result<ByteString, ParseError> {
        let offset = self.cur.offset;
        let mut value = Vec::new();

        while self.matches_with(&f).await? {
            value.push(self.prev.value);
        }

        Ok(ByteString { value, offset })
    }

    /// Like `collect_while`, but includes the previously consumed token at
    /// the front of the result.
    pub async fn collect_while_with_prev(
        &mut self,
        f: impl Fn(TokenType) -> bool,
    ) -> Result<ByteString, ParseError> {
        let offset = self.prev.offset;
        let mut value = vec![self.prev.value];

        while self.matches_with(&f).await? {
            value.push(self.prev.value);
        }

        Ok(ByteString { value, offset })
    }

    /// astring = 1*ASTRING-CHAR / string
    pub async fn parse_astring(&mut self) -> Result<ByteString, ParseError> {
        if self.check(TokenType::DQuote) || self.check(TokenType::LCurly) {
            return self.parse_string().await;
        }

        let astring = self.collect_while(is_astring_char).await?;
        if astring.value.is_empty() {
            return Err(self.make_error("expected astring"));
        }

        Ok(astring)
    }

    /// string = quoted / literal
    pub async fn parse_string(&mut self) -> Result<ByteString, ParseError> {
        if self.check(TokenType::DQuote) {
            self.parse_quoted().await
        } else if self.check(TokenType::LCurly) {
            let offset = self.cur.offset;
            let value = self.parse_literal().await?;
            Ok(ByteString { value, offset })
        } else {
            Err(ParseError::Syntax {
                offset: self.cur.offset,
                message: Cow::Borrowed(
                    "expected start of quoted string or literal",
                ),
            })
        }
    }

    /// quoted = DQUOTE *QUOTED-CHAR DQUOTE
    pub async fn parse_quoted(&mut self) -> Result<ByteString, ParseError> {
        self.consume(TokenType::DQuote, "expected '\"' for quoted start")
            .await?;

        let offset = self.cur.offset;
        let mut value = Vec::new();

        loop {
            if self.matches_with(is_quoted_char).await? {
                value.push(self.prev.value);
            } else if self.matches(TokenType::Backslash).await? {
                self.consume_with(
                    is_quoted_special,
                    "expected '\\' or '\"' after '\\' in quoted",
                )
                .await?;
                value.push(self.prev.value);
            } else {
                break;
            }
        }

        self.consume(TokenType::DQuote, "expected '\"' for quoted end")
            .await?;

        Ok(ByteString { value, offset })
    }

    /// literal = "{" number "}" CRLF *CHAR8
    ///
    /// The returned vector contains exactly the announced number of bytes,
    /// whatever they are.
    pub async fn parse_literal(&mut self) -> Result<Vec<u8>, ParseError> {
        let cap = self.max_literal;
        self.parse_literal_capped(cap).await
    }

    pub async fn parse_literal_capped(
        &mut self,
        cap: u32,
    ) -> Result<Vec<u8>, ParseError> {
        self.consume(TokenType::LCurly, "expected '{' for literal start")
            .await?;

        let size_offset = self.cur.offset;
        let size = self.parse_number().await?;

        if 0 == size {
            return Err(ParseError::Limit {
                offset: size_offset,
                message: Cow::Borrowed("literal size must not be zero"),
            });
        }

        if size > cap {
            return Err(ParseError::Limit {
                offset: size_offset,
                message: Cow::Borrowed("literal size exceeds maximum"),
            });
        }

        self.consume(TokenType::RCurly, "expected '}' for literal end")
            .await?;
        self.consume(TokenType::Cr, "expected CR").await?;

        // The continuation must go out before consuming the LF: the client
        // will not send another byte until it sees the prompt, and the
        // scanner would otherwise block forever waiting to tokenise one.
        if self.check(TokenType::Lf) {
            if let Some(ref sender) = self.continuation {
                if sender
                    .send(OutputEvent::Continuation {
                        prompt: DEFAULT_CONTINUATION_MESSAGE.to_owned(),
                    })
                    .await
                    .is_err()
                {
                    return Err(ParseError::Io(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "output channel closed during literal continuation",
                    )));
                }
            }
        }

        self.consume(TokenType::Lf, "expected LF after CR").await?;

        let mut literal = vec![0u8; size as usize];
        self.scanner.consume_raw(&mut literal).await?;

        // Reload the lookahead token now that the raw bytes are consumed.
        self.advance().await?;

        Ok(literal)
    }

    /// Parses an unsigned decimal number.
    pub async fn parse_number(&mut self) -> Result<u32, ParseError> {
        self.consume(TokenType::Digit, "expected digit").await?;

        let mut number = u32::from(self.prev.value - b'0');

        while self.matches(TokenType::Digit).await? {
            number = number
                .checked_mul(10)
                .and_then(|n| n.checked_add(u32::from(self.prev.value - b'0')))
                .ok_or_else(|| ParseError::Syntax {
                    offset: self.prev.offset,
                    message: Cow::Borrowed("number too large"),
                })?;
        }

        Ok(number)
    }

    /// Parses an atom into its (ASCII) string form.
    pub async fn parse_atom(&mut self) -> Result<String, ParseError> {
        self.consume_with(is_atom_char, "invalid character in atom")
            .await?;
        self.collect_while_with_prev(is_atom_char)
            .await?
            .into_utf8()
    }

    /// CRLF
    pub async fn consume_newline(&mut self) -> Result<(), ParseError> {
        self.consume(TokenType::Cr, "expected CR").await?;
        self.consume(TokenType::Lf, "expected LF after CR").await?;
        Ok(())
    }

    /// Discards input through the end of the current line so that parsing
    /// can resume at the next command after a syntax error.
    pub async fn consume_invalid_input(&mut self) -> Result<(), ParseError> {
        loop {
            if self.check(TokenType::Eof) {
                return Err(ParseError::Io(
                    io::ErrorKind::UnexpectedEof.into(),
                ));
            }

            let was_lf = self.check(TokenType::Lf);
            self.advance().await?;
            if was_lf {
                return Ok(());
            }
        }
    }
}

/// ASTRING-CHAR = ATOM-CHAR / resp-specials
pub fn is_astring_char(tt: TokenType) -> bool {
    is_atom_char(tt) || is_resp_special(tt)
}

/// ATOM-CHAR = any CHAR except atom-specials
pub fn is_atom_char(tt: TokenType) -> bool {
    !matches!(
        tt,
        TokenType::LParen
            | TokenType::RParen
            | TokenType::LBracket
            | TokenType::LCurly
            | TokenType::Sp
            | TokenType::Eof
    ) && !is_quoted_special(tt)
        && !is_resp_special(tt)
        && !is_ctl(tt)
}

pub fn is_quoted_special(tt: TokenType) -> bool {
    tt == TokenType::DQuote || tt == TokenType::Backslash
}

pub fn is_resp_special(tt: TokenType) -> bool {
    tt == TokenType::RBracket
}

pub fn is_quoted_char(tt: TokenType) -> bool {
    !is_quoted_special(tt) && !is_ctl(tt) && tt != TokenType::Eof
}

pub fn is_ctl(tt: TokenType) -> bool {
    matches!(
        tt,
        TokenType::Ctl | TokenType::Cr | TokenType::Lf | TokenType::Tab
    )
}

#[cfg(test)]
mod test {
    use super::*;

    fn parser(input: &[u8]) -> Parser<&[u8]> {
        Parser::new(input)
    }

    fn block_on<T>(f: impl std::future::Future<Output = T>) -> T {
        futures::executor::block_on(f)
    }

    #[test]
    fn astring_forms() {
        block_on(async {
            let mut p = parser(b"atom \"quo ted\" {5}\r\nhello ");
            p.advance().await.unwrap();

            assert_eq!(
                b"atom".to_vec(),
                p.parse_astring().await.unwrap().value,
            );
            p.consume(TokenType::Sp, "sp").await.unwrap();
            assert_eq!(
                b"quo ted".to_vec(),
                p.parse_astring().await.unwrap().value,
            );
            p.consume(TokenType::Sp, "sp").await.unwrap();
            assert_eq!(
                b"hello".to_vec(),
                p.parse_astring().await.unwrap().value,
            );
        });
    }

    #[test]
    fn quoted_escapes() {
        block_on(async {
            let mut p = parser(b"\"a\\\"b\\\\c\"");
            p.advance().await.unwrap();
            assert_eq!(
                b"a\"b\\c".to_vec(),
                p.parse_quoted().await.unwrap().value,
            );
        });
    }

    #[test]
    fn literal_exact_bytes_with_embedded_crlf() {
        block_on(async {
            let mut p = parser(b"{12}\r\nAB\r\nCD\r\nEFGH rest");
            p.advance().await.unwrap();
            let lit = p.parse_literal().await.unwrap();
            assert_eq!(b"AB\r\nCD\r\nEFGH".to_vec(), lit);
            // Parsing resumes correctly after the raw bytes.
            p.consume(TokenType::Sp, "sp").await.unwrap();
            assert_eq!("rest", p.parse_atom().await.unwrap());
        });
    }

    #[test]
    fn literal_size_limits() {
        block_on(async {
            let mut p = parser(b"{0}\r\n");
            p.advance().await.unwrap();
            assert!(matches!(
                p.parse_literal().await,
                Err(ParseError::Limit { .. }),
            ));

            let mut p = parser(b"{31457281}\r\n");
            p.advance().await.unwrap();
            assert!(matches!(
                p.parse_literal().await,
                Err(ParseError::Limit { .. }),
            ));
        });
    }

    #[test]
    fn literal_continuation_is_sent() {
        block_on(async {
            let (tx, mut rx) = mpsc::channel(4);
            let mut p =
                Parser::new(&b"{3}\r\nxyz"[..]).with_continuation(tx);
            p.advance().await.unwrap();
            assert_eq!(b"xyz".to_vec(), p.parse_literal().await.unwrap());

            match rx.try_recv().unwrap() {
                OutputEvent::Continuation { prompt } => {
                    assert_eq!(DEFAULT_CONTINUATION_MESSAGE, prompt)
                },
                _ => panic!("unexpected event"),
            }
        });
    }

    #[test]
    fn number_overflow() {
        block_on(async {
            let mut p = parser(b"99999999999999999999");
            p.advance().await.unwrap();
            assert!(matches!(
                p.parse_number().await,
                Err(ParseError::Syntax { .. }),
            ));
        });
    }

    #[test]
    fn invalid_input_recovery() {
        block_on(async {
            let mut p = parser(b"garbage )))\r\nnext");
            p.advance().await.unwrap();
            p.consume_invalid_input().await.unwrap();
            assert_eq!("next", p.parse_atom().await.unwrap());
        });
    }
}
