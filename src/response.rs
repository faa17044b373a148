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

//! Server responses: the data model, wire rendering, and the writer actor.
//!
//! Encoding decisions are conservative: a string goes out as an atom only if
//! every character is in a known-safe set, as a quoted string if it is short
//! and contains nothing that needs escaping beyond `\\` and `"`, and as a
//! literal otherwise.

use std::io;

use chrono::{DateTime, FixedOffset};
use itertools::Itertools as _;
use tokio::io::{AsyncWrite, AsyncWriteExt as _};
use tokio::sync::{mpsc, oneshot};

use crate::command::StatusItem;
use crate::model::{FlagSet, Uid};

/// An event for the writer actor.
pub enum OutputEvent {
    /// A full, rendered response line (without CRLF).
    Line { data: Vec<u8>, ctl: OutputControl },
    /// A continuation line, `+ <prompt>`; always flushed immediately.
    Continuation { prompt: String },
    /// Flush any buffered output.
    Flush,
    /// Flush, then signal the given channel. Used when the session must
    /// know the client has been answered before touching the stream (the
    /// STARTTLS handshake).
    Synced(oneshot::Sender<()>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputControl {
    /// Output may continue to be buffered.
    Buffer,
    /// Flush after writing this line.
    Flush,
    /// Flush and disconnect after writing this line.
    Disconnect,
}

const FLUSH_THRESH: usize = 4096;

/// Writer actor: single owner of the output stream.
///
/// Runs until the event channel closes, an `OutputControl::Disconnect` line
/// is processed, or an IO error occurs.
pub async fn write_responses<W: AsyncWrite + Unpin>(
    mut io: W,
    mut events: mpsc::Receiver<OutputEvent>,
) -> io::Result<()> {
    let mut buffer = Vec::<u8>::with_capacity(FLUSH_THRESH * 5 / 4);

    while let Some(event) = events.recv().await {
        match event {
            OutputEvent::Line { data, ctl } => {
                buffer.extend_from_slice(&data);
                buffer.extend_from_slice(b"\r\n");

                match ctl {
                    OutputControl::Buffer => {
                        if buffer.len() >= FLUSH_THRESH {
                            io.write_all(&buffer).await?;
                            io.flush().await?;
                            buffer.clear();
                        }
                    },
                    OutputControl::Flush => {
                        io.write_all(&buffer).await?;
                        io.flush().await?;
                        buffer.clear();
                    },
                    OutputControl::Disconnect => {
                        io.write_all(&buffer).await?;
                        io.flush().await?;
                        return Ok(());
                    },
                }
            },

            OutputEvent::Continuation { prompt } => {
                buffer.extend_from_slice(b"+ ");
                buffer.extend_from_slice(prompt.as_bytes());
                buffer.extend_from_slice(b"\r\n");
                io.write_all(&buffer).await?;
                io.flush().await?;
                buffer.clear();
            },

            OutputEvent::Flush => {
                if !buffer.is_empty() {
                    io.write_all(&buffer).await?;
                    io.flush().await?;
                    buffer.clear();
                }
            },

            OutputEvent::Synced(ack) => {
                if !buffer.is_empty() {
                    io.write_all(&buffer).await?;
                    io.flush().await?;
                    buffer.clear();
                }
                let _ = ack.send(());
            },
        }
    }

    if !buffer.is_empty() {
        io.write_all(&buffer).await?;
        io.flush().await?;
    }

    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cond {
    Ok,
    No,
    Bad,
    Bye,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RespCode {
    Capability(Vec<String>),
    BadCharset,
    PermanentFlags(FlagSet),
    ReadOnly,
    ReadWrite,
    TryCreate,
    UidNext(u32),
    UidValidity(u32),
    Unseen(u32),
    AppendUid { validity: u32, uid: u32 },
    CopyUid { validity: u32, src: String, dst: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct CondResponse {
    pub cond: Cond,
    pub code: Option<RespCode>,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    Cond(CondResponse),
    Capability(Vec<String>),
    List {
        attrs: Vec<String>,
        delimiter: u8,
        name: String,
    },
    Lsub {
        attrs: Vec<String>,
        delimiter: u8,
        name: String,
    },
    Status {
        mailbox: String,
        items: Vec<(StatusItem, u32)>,
    },
    Flags(FlagSet),
    Exists(u32),
    Recent(u32),
    Expunge(u32),
    Search(Vec<u32>),
    Fetch {
        seq: u32,
        items: Vec<FetchItem>,
    },
}

impl Response {
    pub fn ok(text: impl Into<String>) -> Self {
        Response::Cond(CondResponse {
            cond: Cond::Ok,
            code: None,
            text: text.into(),
        })
    }

    pub fn ok_code(code: RespCode, text: impl Into<String>) -> Self {
        Response::Cond(CondResponse {
            cond: Cond::Ok,
            code: Some(code),
            text: text.into(),
        })
    }

    pub fn no(text: impl Into<String>) -> Self {
        Response::Cond(CondResponse {
            cond: Cond::No,
            code: None,
            text: text.into(),
        })
    }

    pub fn no_code(code: RespCode, text: impl Into<String>) -> Self {
        Response::Cond(CondResponse {
            cond: Cond::No,
            code: Some(code),
            text: text.into(),
        })
    }

    pub fn bad(text: impl Into<String>) -> Self {
        Response::Cond(CondResponse {
            cond: Cond::Bad,
            code: None,
            text: text.into(),
        })
    }

    pub fn bye(text: impl Into<String>) -> Self {
        Response::Cond(CondResponse {
            cond: Cond::Bye,
            code: None,
            text: text.into(),
        })
    }

    pub fn is_bye(&self) -> bool {
        matches!(
            *self,
            Response::Cond(CondResponse {
                cond: Cond::Bye,
                ..
            }),
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum FetchItem {
    Flags(FlagSet),
    Uid(u32),
    InternalDate(DateTime<FixedOffset>),
    Rfc822Size(u32),
    Envelope(Envelope),
    Rfc822(Vec<u8>),
    Rfc822Header(Vec<u8>),
    Rfc822Text(Vec<u8>),
    Body {
        /// Rendered section text, e.g. `HEADER.FIELDS (FROM DATE)`.
        section: String,
        origin: Option<u32>,
        data: Vec<u8>,
    },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Envelope {
    pub date: Option<String>,
    pub subject: Option<String>,
    pub from: Vec<Address>,
    pub sender: Vec<Address>,
    pub reply_to: Vec<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub in_reply_to: Option<String>,
    pub message_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Address {
    pub name: Option<String>,
    pub mailbox: Option<String>,
    pub host: Option<String>,
}

/// Renders a full response line, without the trailing CRLF.
pub fn render_line(tag: Option<&str>, response: &Response) -> Vec<u8> {
    let mut out = Vec::new();

    match tag {
        Some(tag) => out.extend_from_slice(tag.as_bytes()),
        None => out.push(b'*'),
    }
    out.push(b' ');

    render_response(&mut out, response);
    out
}

fn render_response(out: &mut Vec<u8>, response: &Response) {
    match *response {
        Response::Cond(ref cond) => {
            out.extend_from_slice(match cond.cond {
                Cond::Ok => b"OK",
                Cond::No => b"NO",
                Cond::Bad => b"BAD",
                Cond::Bye => b"BYE",
            });

            if let Some(ref code) = cond.code {
                out.push(b' ');
                render_code(out, code);
            }

            if !cond.text.is_empty() {
                out.push(b' ');
                out.extend_from_slice(cond.text.as_bytes());
            }
        },

        Response::Capability(ref caps) => {
            out.extend_from_slice(b"CAPABILITY");
            for cap in caps {
                out.push(b' ');
                out.extend_from_slice(cap.as_bytes());
            }
        },

        Response::List {
            ref attrs,
            delimiter,
            ref name,
        }
        | Response::Lsub {
            ref attrs,
            delimiter,
            ref name,
        } => {
            out.extend_from_slice(
                if matches!(*response, Response::List { .. }) {
                    b"LIST ("
                } else {
                    b"LSUB ("
                },
            );
            out.extend_from_slice(attrs.iter().join(" ").as_bytes());
            out.extend_from_slice(b") \"");
            out.push(delimiter);
            out.extend_from_slice(b"\" ");
            write_astring(out, name.as_bytes());
        },

        Response::Status {
            ref mailbox,
            ref items,
        } => {
            out.extend_from_slice(b"STATUS ");
            write_astring(out, mailbox.as_bytes());
            out.extend_from_slice(b" (");
            let mut first = true;
            for &(item, value) in items {
                if !first {
                    out.push(b' ');
                }
                first = false;
                let name: &[u8] = match item {
                    StatusItem::Messages => b"MESSAGES",
                    StatusItem::Recent => b"RECENT",
                    StatusItem::UidNext => b"UIDNEXT",
                    StatusItem::UidValidity => b"UIDVALIDITY",
                    StatusItem::Unseen => b"UNSEEN",
                };
                out.extend_from_slice(name);
                out.extend_from_slice(format!(" {}", value).as_bytes());
            }
            out.push(b')');
        },

        Response::Flags(ref flags) => {
            out.extend_from_slice(b"FLAGS (");
            out.extend_from_slice(flags.to_wire().as_bytes());
            out.push(b')');
        },

        Response::Exists(n) => {
            out.extend_from_slice(format!("{} EXISTS", n).as_bytes())
        },
        Response::Recent(n) => {
            out.extend_from_slice(format!("{} RECENT", n).as_bytes())
        },
        Response::Expunge(n) => {
            out.extend_from_slice(format!("{} EXPUNGE", n).as_bytes())
        },

        Response::Search(ref hits) => {
            out.extend_from_slice(b"SEARCH");
            for hit in hits {
                out.extend_from_slice(format!(" {}", hit).as_bytes());
            }
        },

        Response::Fetch { seq, ref items } => {
            out.extend_from_slice(format!("{} FETCH (", seq).as_bytes());
            let mut first = true;
            for item in items {
                if !first {
                    out.push(b' ');
                }
                first = false;
                render_fetch_item(out, item);
            }
            out.push(b')');
        },
    }
}

fn render_code(out: &mut Vec<u8>, code: &RespCode) {
    out.push(b'[');
    match *code {
        RespCode::Capability(ref caps) => {
            out.extend_from_slice(b"CAPABILITY ");
            out.extend_from_slice(caps.iter().join(" ").as_bytes());
        },
        RespCode::BadCharset => out.extend_from_slice(b"BADCHARSET"),
        RespCode::PermanentFlags(ref flags) => {
            out.extend_from_slice(b"PERMANENTFLAGS (");
            out.extend_from_slice(flags.to_wire().as_bytes());
            out.push(b')');
        },
        RespCode::ReadOnly => out.extend_from_slice(b"READ-ONLY"),
        RespCode::ReadWrite => out.extend_from_slice(b"READ-WRITE"),
        RespCode::TryCreate => out.extend_from_slice(b"TRYCREATE"),
        RespCode::UidNext(n) => {
            out.extend_from_slice(format!("UIDNEXT {}", n).as_bytes())
        },
        RespCode::UidValidity(n) => {
            out.extend_from_slice(format!("UIDVALIDITY {}", n).as_bytes())
        },
        RespCode::Unseen(n) => {
            out.extend_from_slice(format!("UNSEEN {}", n).as_bytes())
        },
        RespCode::AppendUid { validity, uid } => out.extend_from_slice(
            format!("APPENDUID {} {}", validity, uid).as_bytes(),
        ),
        RespCode::CopyUid {
            validity,
            ref src,
            ref dst,
        } => out.extend_from_slice(
            format!("COPYUID {} {} {}", validity, src, dst).as_bytes(),
        ),
    }
    out.push(b']');
}

fn render_fetch_item(out: &mut Vec<u8>, item: &FetchItem) {
    match *item {
        FetchItem::Flags(ref flags) => {
            out.extend_from_slice(b"FLAGS (");
            out.extend_from_slice(flags.to_wire().as_bytes());
            out.push(b')');
        },
        FetchItem::Uid(uid) => {
            out.extend_from_slice(format!("UID {}", uid).as_bytes())
        },
        FetchItem::InternalDate(ref date) => {
            out.extend_from_slice(b"INTERNALDATE ");
            out.extend_from_slice(
                format!("\"{}\"", date.format("%_d-%b-%Y %H:%M:%S %z"))
                    .as_bytes(),
            );
        },
        FetchItem::Rfc822Size(size) => {
            out.extend_from_slice(format!("RFC822.SIZE {}", size).as_bytes())
        },
        FetchItem::Envelope(ref envelope) => {
            out.extend_from_slice(b"ENVELOPE ");
            render_envelope(out, envelope);
        },
        FetchItem::Rfc822(ref data) => {
            out.extend_from_slice(b"RFC822 ");
            write_literal(out, data);
        },
        FetchItem::Rfc822Header(ref data) => {
            out.extend_from_slice(b"RFC822.HEADER ");
            write_literal(out, data);
        },
        FetchItem::Rfc822Text(ref data) => {
            out.extend_from_slice(b"RFC822.TEXT ");
            write_literal(out, data);
        },
        FetchItem::Body {
            ref section,
            origin,
            ref data,
        } => {
            out.extend_from_slice(b"BODY[");
            out.extend_from_slice(section.as_bytes());
            out.push(b']');
            if let Some(origin) = origin {
                out.extend_from_slice(format!("<{}>", origin).as_bytes());
            }
            out.push(b' ');
            write_literal(out, data);
        },
    }
}

fn render_envelope(out: &mut Vec<u8>, envelope: &Envelope) {
    // RFC 3501: a missing sender/reply-to defaults to the from list.
    let sender = if envelope.sender.is_empty() {
        &envelope.from
    } else {
        &envelope.sender
    };
    let reply_to = if envelope.reply_to.is_empty() {
        &envelope.from
    } else {
        &envelope.reply_to
    };

    out.push(b'(');
    write_nstring(out, envelope.date.as_deref());
    out.push(b' ');
    write_nstring(out, envelope.subject.as_deref());
    for list in [
        &envelope.from,
        sender,
        reply_to,
        &envelope.to,
        &envelope.cc,
        &envelope.bcc,
    ] {
        out.push(b' ');
        render_address_list(out, list);
    }
    out.push(b' ');
    write_nstring(out, envelope.in_reply_to.as_deref());
    out.push(b' ');
    write_nstring(out, envelope.message_id.as_deref());
    out.push(b')');
}

fn render_address_list(out: &mut Vec<u8>, list: &[Address]) {
    if list.is_empty() {
        out.extend_from_slice(b"NIL");
        return;
    }

    out.push(b'(');
    for address in list {
        out.push(b'(');
        write_nstring(out, address.name.as_deref());
        out.extend_from_slice(b" NIL ");
        write_nstring(out, address.mailbox.as_deref());
        out.push(b' ');
        write_nstring(out, address.host.as_deref());
        out.push(b')');
    }
    out.push(b')');
}

/// Writes a string as an atom where safe, quoted where possible, and as a
/// literal otherwise.
pub fn write_astring(out: &mut Vec<u8>, s: &[u8]) {
    if is_conservative_atom(s) {
        out.extend_from_slice(s);
    } else {
        write_string(out, s);
    }
}

pub fn write_string(out: &mut Vec<u8>, s: &[u8]) {
    if is_quotable(s) {
        out.push(b'"');
        out.extend_from_slice(s);
        out.push(b'"');
    } else {
        write_literal(out, s);
    }
}

pub fn write_nstring(out: &mut Vec<u8>, s: Option<&str>) {
    match s {
        None => out.extend_from_slice(b"NIL"),
        Some(s) => write_string(out, s.as_bytes()),
    }
}

pub fn write_literal(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(format!("{{{}}}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
}

fn is_conservative_atom(s: &[u8]) -> bool {
    !s.is_empty()
        && !s.eq_ignore_ascii_case(b"nil")
        && s.iter().copied().all(|b| {
            matches!(
                b,
                b'a'..=b'z'
                | b'A'..=b'Z'
                | b'0'..=b'9'
                | b'='
                | b'?'
                | b'/'
                | b'+'
                | b'_'
                | b'.'
                | b'-',
            )
        })
}

fn is_quotable(s: &[u8]) -> bool {
    s.len() < 100
        && s.iter()
            .copied()
            .all(|b| !matches!(b, 0..=31 | 127 | b'\\' | b'"'))
}

/// Renders a set of UIDs (ascending) as a compressed IMAP uid-set, e.g.
/// `1:3,5`, for the UIDPLUS response codes.
pub fn compress_uid_set(uids: &[Uid]) -> String {
    let mut parts = Vec::<(u32, u32)>::new();

    for uid in uids {
        let v = uid.get();
        match parts.last_mut() {
            Some(&mut (_, ref mut end)) if *end + 1 == v => *end = v,
            _ => parts.push((v, v)),
        }
    }

    parts
        .into_iter()
        .map(|(start, end)| {
            if start == end {
                start.to_string()
            } else {
                format!("{}:{}", start, end)
            }
        })
        .join(",")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::Flag;

    fn render(tag: Option<&str>, response: &Response) -> String {
        String::from_utf8(render_line(tag, response)).unwrap()
    }

    #[test]
    fn cond_responses() {
        assert_eq!(
            "a1 OK done",
            render(Some("a1"), &Response::ok("done")),
        );
        assert_eq!(
            "* BYE shutting down",
            render(None, &Response::bye("shutting down")),
        );
        assert_eq!(
            "a2 OK [UIDNEXT 4] SELECT",
            render(
                Some("a2"),
                &Response::ok_code(RespCode::UidNext(4), "SELECT"),
            ),
        );
        assert_eq!(
            "a3 NO [TRYCREATE] no such mailbox",
            render(
                Some("a3"),
                &Response::no_code(RespCode::TryCreate, "no such mailbox"),
            ),
        );
    }

    #[test]
    fn untagged_mailbox_data() {
        assert_eq!("* 3 EXISTS", render(None, &Response::Exists(3)));
        assert_eq!("* 1 RECENT", render(None, &Response::Recent(1)));
        assert_eq!("* 4 EXPUNGE", render(None, &Response::Expunge(4)));
        assert_eq!(
            "* SEARCH 2 5 9",
            render(None, &Response::Search(vec![2, 5, 9])),
        );
    }

    #[test]
    fn list_quoting() {
        assert_eq!(
            "* LIST (\\Noselect) \"/\" Lost+Found",
            render(
                None,
                &Response::List {
                    attrs: vec!["\\Noselect".to_owned()],
                    delimiter: b'/',
                    name: "Lost+Found".to_owned(),
                },
            ),
        );
        assert_eq!(
            "* LIST () \"/\" \"Lost & Found\"",
            render(
                None,
                &Response::List {
                    attrs: vec![],
                    delimiter: b'/',
                    name: "Lost & Found".to_owned(),
                },
            ),
        );
    }

    #[test]
    fn fetch_with_literal() {
        let line = render(
            None,
            &Response::Fetch {
                seq: 2,
                items: vec![
                    FetchItem::Uid(7),
                    FetchItem::Flags(
                        [Flag::Seen].into_iter().collect(),
                    ),
                    FetchItem::Body {
                        section: String::new(),
                        origin: None,
                        data: b"AB\r\nCD".to_vec(),
                    },
                ],
            },
        );
        assert_eq!(
            "* 2 FETCH (UID 7 FLAGS (\\Seen) BODY[] {6}\r\nAB\r\nCD)",
            line,
        );
    }

    #[test]
    fn envelope_defaults() {
        let envelope = Envelope {
            date: Some("Thu, 2 Jul 2020 10:00:00 +0000".to_owned()),
            subject: Some("hi".to_owned()),
            from: vec![Address {
                name: None,
                mailbox: Some("azure".to_owned()),
                host: Some("example.com".to_owned()),
            }],
            ..Envelope::default()
        };

        let mut out = Vec::new();
        render_envelope(&mut out, &envelope);
        let rendered = String::from_utf8(out).unwrap();
        // sender and reply-to fall back to from
        assert_eq!(
            "(\"Thu, 2 Jul 2020 10:00:00 +0000\" \"hi\" \
             ((NIL NIL \"azure\" \"example.com\")) \
             ((NIL NIL \"azure\" \"example.com\")) \
             ((NIL NIL \"azure\" \"example.com\")) \
             NIL NIL NIL NIL NIL)",
            rendered,
        );
    }

    #[test]
    fn uid_set_compression() {
        let uids = [1, 2, 3, 5, 7, 8]
            .into_iter()
            .map(Uid::u)
            .collect::<Vec<_>>();
        assert_eq!("1:3,5,7:8", compress_uid_set(&uids));
        assert_eq!("", compress_uid_set(&[]));
    }

    #[test]
    fn writer_actor_flush_and_disconnect() {
        futures::executor::block_on(async {
            let (tx, rx) = mpsc::channel(8);
            let mut out = std::io::Cursor::new(Vec::<u8>::new());

            tx.send(OutputEvent::Line {
                data: b"* OK ready".to_vec(),
                ctl: OutputControl::Buffer,
            })
            .await
            .unwrap();
            tx.send(OutputEvent::Continuation {
                prompt: "Ready".to_owned(),
            })
            .await
            .unwrap();
            tx.send(OutputEvent::Line {
                data: b"a1 OK bye".to_vec(),
                ctl: OutputControl::Disconnect,
            })
            .await
            .unwrap();

            write_responses(&mut out, rx).await.unwrap();

            assert_eq!(
                b"* OK ready\r\n+ Ready\r\na1 OK bye\r\n".to_vec(),
                *out.get_ref(),
            );
        });
    }
}
