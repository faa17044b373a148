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

//! The command-level parser: `tag SP command CRLF`.

use std::io;

use chrono::{DateTime, FixedOffset};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

use super::fetch::parse_fetch;
use super::search::parse_search;
use super::sequence::parse_seq_set;
use super::{Command, CommandBody, StatusItem, StoreAction, StoreCommand, UidCommand};
use crate::model::{Flag, FlagSet};
use crate::parser::{
    is_astring_char, ParseError, Parser, scanner::TokenType,
};
use crate::response::OutputEvent;

pub struct CommandParser<R> {
    p: Parser<R>,
    last_tag: Option<String>,
    last_command: Option<String>,
}

impl<R: AsyncRead + Unpin + Send> CommandParser<R> {
    pub fn new(io: R) -> Self {
        CommandParser {
            p: Parser::new(io),
            last_tag: None,
            last_command: None,
        }
    }

    pub fn with_continuation(
        mut self,
        sender: mpsc::Sender<OutputEvent>,
    ) -> Self {
        self.p = self.p.with_continuation(sender);
        self
    }

    pub fn with_max_literal(mut self, max_literal: u32) -> Self {
        self.p = self.p.with_max_literal(max_literal);
        self
    }

    /// The tag of the most recently attempted command, if one was parsed
    /// before the failure.
    pub fn last_tag(&self) -> Option<&str> {
        self.last_tag.as_deref()
    }

    pub fn last_command(&self) -> Option<&str> {
        self.last_command.as_deref()
    }

    /// First raw bytes of the current command, for TLS ClientHello
    /// detection.
    pub fn raw_prefix(&self) -> [u8; 3] {
        self.p.raw_prefix()
    }

    pub async fn consume_invalid_input(&mut self) -> Result<(), ParseError> {
        self.p.consume_invalid_input().await
    }

    /// Reads one raw line, excluding CRLF. Used for the AUTHENTICATE
    /// continuation response.
    pub async fn read_line(&mut self) -> Result<Vec<u8>, ParseError> {
        let line = self
            .p
            .collect_while(|tt| {
                !matches!(tt, TokenType::Cr | TokenType::Lf | TokenType::Eof)
            })
            .await?;
        self.p.consume_newline().await?;
        Ok(line.value)
    }

    pub async fn parse(&mut self) -> Result<Command, ParseError> {
        self.last_tag = None;
        self.last_command = None;
        self.p.reset_offset();
        self.p.advance().await?;

        if self.p.check(TokenType::Eof) {
            return Err(ParseError::Io(io::ErrorKind::UnexpectedEof.into()));
        }

        let tag = self.parse_tag().await?;

        // DONE carries no tag.
        if tag.eq_ignore_ascii_case("done") {
            self.last_command = Some("done".to_owned());
            self.p.consume_newline().await?;
            return Ok(Command {
                tag: None,
                body: CommandBody::Done,
            });
        }

        self.last_tag = Some(tag.clone());

        self.p
            .consume(TokenType::Sp, "expected space after tag")
            .await?;

        let keyword = self
            .p
            .collect_while(|tt| tt == TokenType::Char)
            .await?
            .into_utf8()?
            .to_ascii_lowercase();
        self.last_command = Some(keyword.clone());

        let body = self.parse_body(&keyword).await?;

        self.p.consume_newline().await?;

        Ok(Command {
            tag: Some(tag),
            body,
        })
    }

    /// tag = 1*<any ASTRING-CHAR except "+">
    async fn parse_tag(&mut self) -> Result<String, ParseError> {
        let is_tag_char =
            |tt: TokenType| is_astring_char(tt) && tt != TokenType::Plus;

        self.p
            .consume_with(is_tag_char, "invalid tag character")
            .await?;
        self.p
            .collect_while_with_prev(is_tag_char)
            .await?
            .into_utf8()
    }

    async fn parse_body(
        &mut self,
        keyword: &str,
    ) -> Result<CommandBody, ParseError> {
        match keyword {
            "capability" => Ok(CommandBody::Capability),
            "noop" => Ok(CommandBody::Noop),
            "logout" => Ok(CommandBody::Logout),
            "starttls" => Ok(CommandBody::StartTls),
            "check" => Ok(CommandBody::Check),
            "close" => Ok(CommandBody::Close),
            "expunge" => Ok(CommandBody::Expunge),
            "unselect" => Ok(CommandBody::Unselect),
            "idle" => Ok(CommandBody::Idle),
            "login" => self.parse_login().await,
            "authenticate" => self.parse_authenticate().await,
            "select" => Ok(CommandBody::Select {
                mailbox: self.parse_mailbox_arg().await?,
            }),
            "examine" => Ok(CommandBody::Examine {
                mailbox: self.parse_mailbox_arg().await?,
            }),
            "create" => Ok(CommandBody::Create {
                mailbox: self.parse_mailbox_arg().await?,
            }),
            "delete" => Ok(CommandBody::Delete {
                mailbox: self.parse_mailbox_arg().await?,
            }),
            "subscribe" => Ok(CommandBody::Subscribe {
                mailbox: self.parse_mailbox_arg().await?,
            }),
            "unsubscribe" => Ok(CommandBody::Unsubscribe {
                mailbox: self.parse_mailbox_arg().await?,
            }),
            "rename" => {
                let from = self.parse_mailbox_arg().await?;
                let to = self.parse_mailbox_arg().await?;
                Ok(CommandBody::Rename { from, to })
            },
            "list" => {
                let reference = self.parse_mailbox_arg().await?;
                let pattern = self.parse_mailbox_arg().await?;
                Ok(CommandBody::List { reference, pattern })
            },
            "lsub" => {
                let reference = self.parse_mailbox_arg().await?;
                let pattern = self.parse_mailbox_arg().await?;
                Ok(CommandBody::Lsub { reference, pattern })
            },
            "status" => self.parse_status().await,
            "append" => self.parse_append().await,
            "search" => {
                Ok(CommandBody::Search(parse_search(&mut self.p).await?))
            },
            "fetch" => {
                Ok(CommandBody::Fetch(parse_fetch(&mut self.p).await?))
            },
            "store" => Ok(CommandBody::Store(self.parse_store().await?)),
            "copy" => {
                let (set, mailbox) = self.parse_set_and_mailbox().await?;
                Ok(CommandBody::Copy { set, mailbox })
            },
            "move" => {
                let (set, mailbox) = self.parse_set_and_mailbox().await?;
                Ok(CommandBody::Move { set, mailbox })
            },
            "uid" => self.parse_uid().await,
            _ => Err(self.p.make_error("unknown command")),
        }
    }

    /// uid = "UID" SP (copy / fetch / search / store / move / expunge)
    async fn parse_uid(&mut self) -> Result<CommandBody, ParseError> {
        self.p
            .consume(TokenType::Sp, "expected space after UID")
            .await?;

        let keyword = self
            .p
            .collect_while(|tt| tt == TokenType::Char)
            .await?
            .into_utf8()?
            .to_ascii_lowercase();
        self.last_command = Some(format!("uid {}", keyword));

        let sub = match keyword.as_str() {
            "copy" => {
                let (set, mailbox) = self.parse_set_and_mailbox().await?;
                UidCommand::Copy { set, mailbox }
            },
            "move" => {
                let (set, mailbox) = self.parse_set_and_mailbox().await?;
                UidCommand::Move { set, mailbox }
            },
            "fetch" => UidCommand::Fetch(parse_fetch(&mut self.p).await?),
            "search" => UidCommand::Search(parse_search(&mut self.p).await?),
            "store" => UidCommand::Store(self.parse_store().await?),
            "expunge" => {
                self.p
                    .consume(TokenType::Sp, "expected space after command")
                    .await?;
                UidCommand::Expunge(parse_seq_set(&mut self.p).await?)
            },
            _ => return Err(self.p.make_error("unknown UID command")),
        };

        Ok(CommandBody::Uid(sub))
    }

    async fn parse_login(&mut self) -> Result<CommandBody, ParseError> {
        self.p
            .consume(TokenType::Sp, "expected space after command")
            .await?;
        let username = self.p.parse_astring().await?.into_utf8()?;
        self.p
            .consume(TokenType::Sp, "expected space after username")
            .await?;
        let password = self.p.parse_astring().await?.into_utf8()?;

        Ok(CommandBody::Login { username, password })
    }

    async fn parse_authenticate(&mut self) -> Result<CommandBody, ParseError> {
        self.p
            .consume(TokenType::Sp, "expected space after command")
            .await?;
        let mechanism = self.p.parse_atom().await?;

        let initial = if self.p.matches(TokenType::Sp).await? {
            Some(
                self.p
                    .collect_while(|tt| {
                        !matches!(
                            tt,
                            TokenType::Cr | TokenType::Lf | TokenType::Eof,
                        )
                    })
                    .await?
                    .value,
            )
        } else {
            None
        };

        Ok(CommandBody::Authenticate { mechanism, initial })
    }

    async fn parse_status(&mut self) -> Result<CommandBody, ParseError> {
        let mailbox = self.parse_mailbox_arg().await?;

        self.p
            .consume(TokenType::Sp, "expected space after mailbox")
            .await?;
        self.p
            .consume(TokenType::LParen, "expected '(' for status items")
            .await?;

        let mut items = Vec::new();
        loop {
            let name = self.p.parse_atom().await?.to_ascii_uppercase();
            items.push(match name.as_str() {
                "MESSAGES" => StatusItem::Messages,
                "RECENT" => StatusItem::Recent,
                "UIDNEXT" => StatusItem::UidNext,
                "UIDVALIDITY" => StatusItem::UidValidity,
                "UNSEEN" => StatusItem::Unseen,
                _ => return Err(self.p.make_error("unknown status item")),
            });

            if !self.p.matches(TokenType::Sp).await? {
                break;
            }
        }

        self.p
            .consume(TokenType::RParen, "expected ')' after status items")
            .await?;

        Ok(CommandBody::Status { mailbox, items })
    }

    /// append = mailbox [SP flag-list] [SP date-time] SP literal
    async fn parse_append(&mut self) -> Result<CommandBody, ParseError> {
        let mailbox = self.parse_mailbox_arg().await?;
        self.p
            .consume(TokenType::Sp, "expected space after mailbox")
            .await?;

        let mut flags = FlagSet::new();
        if self.p.check(TokenType::LParen) {
            flags = self.parse_paren_flag_list().await?;
            self.p
                .consume(TokenType::Sp, "expected space after flag list")
                .await?;
        }

        let mut date = None;
        if self.p.check(TokenType::DQuote) {
            date = Some(self.parse_datetime().await?);
            self.p
                .consume(TokenType::Sp, "expected space after date")
                .await?;
        }

        let literal = self.p.parse_literal().await?;

        Ok(CommandBody::Append {
            mailbox,
            flags,
            date,
            literal,
        })
    }

    /// store = sequence-set SP ["+" / "-"] "FLAGS" [".SILENT"] SP
    ///         (flag-list / flag *(SP flag))
    async fn parse_store(&mut self) -> Result<StoreCommand, ParseError> {
        self.p
            .consume(TokenType::Sp, "expected space after command")
            .await?;
        let set = parse_seq_set(&mut self.p).await?;
        self.p
            .consume(TokenType::Sp, "expected space after sequence set")
            .await?;

        let action = if self.p.matches(TokenType::Plus).await? {
            StoreAction::Add
        } else if self.p.matches_byte(b'-').await? {
            StoreAction::Remove
        } else {
            StoreAction::Replace
        };

        let item = self.p.parse_atom().await?.to_ascii_uppercase();
        let silent = match item.as_str() {
            "FLAGS" => false,
            "FLAGS.SILENT" => true,
            _ => return Err(self.p.make_error("expected FLAGS data item")),
        };

        self.p
            .consume(TokenType::Sp, "expected space after data item")
            .await?;

        let flags = if self.p.check(TokenType::LParen) {
            self.parse_paren_flag_list().await?
        } else {
            let mut flags = FlagSet::new();
            loop {
                flags.insert(self.parse_flag().await?);
                if !self.p.matches(TokenType::Sp).await? {
                    break;
                }
            }
            flags
        };

        Ok(StoreCommand {
            set,
            action,
            silent,
            flags,
        })
    }

    async fn parse_set_and_mailbox(
        &mut self,
    ) -> Result<(super::sequence::SeqSet, String), ParseError> {
        self.p
            .consume(TokenType::Sp, "expected space after command")
            .await?;
        let set = parse_seq_set(&mut self.p).await?;
        let mailbox = self.parse_mailbox_arg().await?;
        Ok((set, mailbox))
    }

    /// SP mailbox
    async fn parse_mailbox_arg(&mut self) -> Result<String, ParseError> {
        self.p
            .consume(TokenType::Sp, "expected space before mailbox")
            .await?;
        self.p.parse_astring().await?.into_utf8()
    }

    /// flag-list = "(" [flag *(SP flag)] ")"
    async fn parse_paren_flag_list(&mut self) -> Result<FlagSet, ParseError> {
        self.p
            .consume(TokenType::LParen, "expected '(' for flag list")
            .await?;

        let mut flags = FlagSet::new();

        if self.p.matches(TokenType::RParen).await? {
            return Ok(flags);
        }

        loop {
            flags.insert(self.parse_flag().await?);
            if !self.p.matches(TokenType::Sp).await? {
                break;
            }
        }

        self.p
            .consume(TokenType::RParen, "expected ')' after flag list")
            .await?;

        Ok(flags)
    }

    /// flag = "\" atom / atom
    async fn parse_flag(&mut self) -> Result<Flag, ParseError> {
        if self.p.matches(TokenType::Backslash).await? {
            let name = self.p.parse_atom().await?;
            Ok(Flag::from_wire(&format!("\\{}", name)))
        } else {
            let name = self.p.parse_atom().await?;
            Ok(Flag::from_wire(&name))
        }
    }

    /// date-time = DQUOTE date-day-fixed "-" date-month "-" date-year SP
    ///             time SP zone DQUOTE
    async fn parse_datetime(
        &mut self,
    ) -> Result<DateTime<FixedOffset>, ParseError> {
        let raw = self.p.parse_quoted().await?;
        let offset = raw.offset;
        let text = raw.into_utf8()?;

        DateTime::parse_from_str(text.trim(), "%d-%b-%Y %H:%M:%S %z")
            .map_err(|_| ParseError::Syntax {
                offset,
                message: std::borrow::Cow::Borrowed("invalid date-time"),
            })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    fn parse_one(input: &[u8]) -> Result<Command, ParseError> {
        futures::executor::block_on(async {
            CommandParser::new(input).parse().await
        })
    }

    #[test]
    fn simple_commands() {
        let cmd = parse_one(b"a1 NOOP\r\n").unwrap();
        assert_eq!(Some("a1".to_owned()), cmd.tag);
        assert_eq!(CommandBody::Noop, cmd.body);

        let cmd = parse_one(b"a2 LOGOUT\r\n").unwrap();
        assert_eq!(CommandBody::Logout, cmd.body);

        // Command keywords are case-insensitive.
        let cmd = parse_one(b"a3 sTaRtTlS\r\n").unwrap();
        assert_eq!(CommandBody::StartTls, cmd.body);
    }

    #[test]
    fn done_has_no_tag() {
        let cmd = parse_one(b"DONE\r\n").unwrap();
        assert_eq!(None, cmd.tag);
        assert_eq!(CommandBody::Done, cmd.body);
    }

    #[test]
    fn login_forms() {
        let cmd = parse_one(b"x LOGIN azure \"hunter two\"\r\n").unwrap();
        assert_eq!(
            CommandBody::Login {
                username: "azure".to_owned(),
                password: "hunter two".to_owned(),
            },
            cmd.body,
        );

        let cmd = parse_one(b"x LOGIN azure {6}\r\nsecret\r\n").unwrap();
        assert_eq!(
            CommandBody::Login {
                username: "azure".to_owned(),
                password: "secret".to_owned(),
            },
            cmd.body,
        );
    }

    #[test]
    fn select_and_mailbox_commands() {
        let cmd = parse_one(b"t SELECT INBOX\r\n").unwrap();
        assert_eq!(
            CommandBody::Select {
                mailbox: "INBOX".to_owned(),
            },
            cmd.body,
        );

        let cmd = parse_one(b"t RENAME foo bar/baz\r\n").unwrap();
        assert_eq!(
            CommandBody::Rename {
                from: "foo".to_owned(),
                to: "bar/baz".to_owned(),
            },
            cmd.body,
        );

        let cmd = parse_one(b"t LIST \"\" *\r\n").unwrap();
        assert_eq!(
            CommandBody::List {
                reference: String::new(),
                pattern: "*".to_owned(),
            },
            cmd.body,
        );
    }

    #[test]
    fn status_items() {
        let cmd =
            parse_one(b"t STATUS INBOX (MESSAGES UIDNEXT unseen)\r\n")
                .unwrap();
        assert_eq!(
            CommandBody::Status {
                mailbox: "INBOX".to_owned(),
                items: vec![
                    StatusItem::Messages,
                    StatusItem::UidNext,
                    StatusItem::Unseen,
                ],
            },
            cmd.body,
        );
    }

    #[test]
    fn append_with_flags_and_date() {
        let cmd = parse_one(
            b"t APPEND saved (\\Seen) \" 4-Jul-2020 16:31:00 +0100\" \
              {5}\r\nhello\r\n",
        )
        .unwrap();

        let CommandBody::Append {
            mailbox,
            flags,
            date,
            literal,
        } = cmd.body
        else {
            panic!("not an append");
        };

        assert_eq!("saved", mailbox);
        assert!(flags.contains(&Flag::Seen));
        assert_eq!(
            chrono::FixedOffset::east_opt(3600)
                .unwrap()
                .with_ymd_and_hms(2020, 7, 4, 16, 31, 0)
                .unwrap(),
            date.unwrap(),
        );
        assert_eq!(b"hello".to_vec(), literal);
    }

    #[test]
    fn store_variants() {
        let cmd =
            parse_one(b"t STORE 2,4 +FLAGS.SILENT (\\Deleted)\r\n").unwrap();
        let CommandBody::Store(store) = cmd.body else {
            panic!("not a store");
        };
        assert_eq!(StoreAction::Add, store.action);
        assert!(store.silent);
        assert!(store.flags.contains(&Flag::Deleted));

        let cmd = parse_one(b"t STORE 1 FLAGS \\Seen custom\r\n").unwrap();
        let CommandBody::Store(store) = cmd.body else {
            panic!("not a store");
        };
        assert_eq!(StoreAction::Replace, store.action);
        assert!(!store.silent);
        assert_eq!(2, store.flags.len());
    }

    #[test]
    fn uid_dispatch() {
        let cmd = parse_one(b"t UID FETCH 1:* FLAGS\r\n").unwrap();
        assert!(matches!(
            cmd.body,
            CommandBody::Uid(UidCommand::Fetch(..)),
        ));

        let cmd = parse_one(b"t UID EXPUNGE 3:5\r\n").unwrap();
        assert!(matches!(
            cmd.body,
            CommandBody::Uid(UidCommand::Expunge(..)),
        ));

        let cmd = parse_one(b"t UID COPY 1 dst\r\n").unwrap();
        assert!(matches!(
            cmd.body,
            CommandBody::Uid(UidCommand::Copy { .. }),
        ));
    }

    #[test]
    fn unknown_command_keeps_tag() {
        futures::executor::block_on(async {
            let mut parser =
                CommandParser::new(&b"t7 FROBNICATE\r\nt8 NOOP\r\n"[..]);
            assert!(parser.parse().await.is_err());
            assert_eq!(Some("t7"), parser.last_tag());

            parser.consume_invalid_input().await.unwrap();
            let cmd = parser.parse().await.unwrap();
            assert_eq!(Some("t8".to_owned()), cmd.tag);
        });
    }

    #[test]
    fn authenticate_initial_response() {
        let cmd = parse_one(b"t AUTHENTICATE PLAIN AGF6dXJlAHB3\r\n").unwrap();
        assert_eq!(
            CommandBody::Authenticate {
                mechanism: "PLAIN".to_owned(),
                initial: Some(b"AGF6dXJlAHB3".to_vec()),
            },
            cmd.body,
        );
    }
}
