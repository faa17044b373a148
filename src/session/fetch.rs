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

//! FETCH and UID FETCH.
//!
//! A non-peek body fetch on a read-write mailbox implicitly stores
//! `\Seen`; the fetch then runs under the user's write lock. Pure reads
//! share the read guard so they can overlap with other readers.

use std::sync::Arc;

use super::{CmdResult, Session};
use crate::command::fetch::{FetchAttr, FetchCommand, Section};
use crate::command::StoreAction;
use crate::model::{Flag, MessageId, Uid};
use crate::response::{Envelope, FetchItem, Response};
use crate::state::User;
use crate::support::error::Error;
use crate::support::rfc5322::{self, Headers};

impl Session {
    pub(super) async fn cmd_fetch(
        &mut self,
        fetch: FetchCommand,
        uid_mode: bool,
    ) -> CmdResult {
        let user = Arc::clone(self.authenticated()?);
        let read_only =
            self.in_selected(|selected| Ok(selected.read_only))?;

        let targets = self.resolve_targets(&fetch.set, uid_mode)?;

        let mut attrs = fetch.attrs.clone();
        if uid_mode && !attrs.contains(&FetchAttr::Uid) {
            attrs.push(FetchAttr::Uid);
        }

        let sets_seen =
            !read_only && attrs.iter().any(attr_implies_seen);

        // Setting \Seen is a mutation; everything else can share the
        // read guard with other bulk readers.
        let responses = if sets_seen {
            let _guard = user.lock.write().await;
            self.fetch_messages(&user, &targets, &attrs, true)
        } else {
            let _guard = user.lock.read().await;
            self.fetch_messages(&user, &targets, &attrs, false)
        };

        let responses = responses.map_err(|e| self.map_error(e))?;
        for response in &responses {
            self.send_untagged(response).await;
        }

        Ok(Response::ok("FETCH"))
    }

    fn fetch_messages(
        &mut self,
        user: &Arc<User>,
        targets: &[(Uid, MessageId)],
        attrs: &[FetchAttr],
        may_set_seen: bool,
    ) -> Result<Vec<Response>, Error> {
        let needs_meta = attrs.iter().any(|a| {
            matches!(
                *a,
                FetchAttr::InternalDate | FetchAttr::Rfc822Size,
            )
        });
        let needs_literal = attrs.iter().any(|a| {
            matches!(
                *a,
                FetchAttr::Envelope
                    | FetchAttr::Rfc822
                    | FetchAttr::Rfc822Header
                    | FetchAttr::Rfc822Text
                    | FetchAttr::Body { .. },
            )
        });

        let mut responses = Vec::new();

        for &(uid, message_id) in targets {
            let meta = if needs_meta {
                match user.message_meta(message_id) {
                    Ok(meta) => Some(meta),
                    // Vanished under us; skip the row quietly.
                    Err(Error::ExpungedMessage) => continue,
                    Err(e) => return Err(e),
                }
            } else {
                None
            };

            let literal = if needs_literal {
                match user.message_literal(message_id) {
                    Ok(literal) => Some(literal),
                    Err(Error::Io(ref io))
                        if std::io::ErrorKind::NotFound == io.kind() =>
                    {
                        continue;
                    },
                    Err(e) => return Err(e),
                }
            } else {
                None
            };

            let flags_updated = if may_set_seen
                && attrs.iter().any(attr_implies_seen)
            {
                self.implicit_seen(user, uid, message_id)?
            } else {
                None
            };

            let mut items = Vec::new();
            for attr in attrs {
                match *attr {
                    FetchAttr::Flags => {
                        let flags = self
                            .selected
                            .as_ref()
                            .and_then(|s| {
                                s.snapshot
                                    .get_by_uid(uid)
                                    .map(|(_, row)| row.flags.clone())
                            })
                            .unwrap_or_default();
                        items.push(FetchItem::Flags(flags));
                    },
                    FetchAttr::Uid => {
                        items.push(FetchItem::Uid(uid.get()))
                    },
                    FetchAttr::InternalDate => {
                        let meta =
                            meta.as_ref().expect("meta fetched above");
                        items.push(FetchItem::InternalDate(
                            meta.internal_date.fixed_offset(),
                        ));
                    },
                    FetchAttr::Rfc822Size => {
                        let meta =
                            meta.as_ref().expect("meta fetched above");
                        items.push(FetchItem::Rfc822Size(meta.size));
                    },
                    FetchAttr::Envelope => {
                        let literal = literal
                            .as_deref()
                            .expect("literal fetched above");
                        let (header, _) =
                            rfc5322::split_message(literal);
                        items.push(FetchItem::Envelope(build_envelope(
                            &Headers::parse(header),
                        )));
                    },
                    FetchAttr::Rfc822 => {
                        let literal = literal
                            .as_deref()
                            .expect("literal fetched above");
                        items.push(FetchItem::Rfc822(literal.to_vec()));
                    },
                    FetchAttr::Rfc822Header => {
                        let literal = literal
                            .as_deref()
                            .expect("literal fetched above");
                        let (header, _) =
                            rfc5322::split_message(literal);
                        items.push(FetchItem::Rfc822Header(
                            header.to_vec(),
                        ));
                    },
                    FetchAttr::Rfc822Text => {
                        let literal = literal
                            .as_deref()
                            .expect("literal fetched above");
                        let (_, body) = rfc5322::split_message(literal);
                        items.push(FetchItem::Rfc822Text(body.to_vec()));
                    },
                    FetchAttr::Body {
                        ref section,
                        partial,
                        ..
                    } => {
                        let literal = literal
                            .as_deref()
                            .expect("literal fetched above");
                        let data = section_bytes(section, literal);
                        let data = apply_partial(data, partial);
                        items.push(FetchItem::Body {
                            section: render_section(section),
                            origin: partial.map(|(origin, _)| origin),
                            data,
                        });
                    },
                }
            }

            // The implicit \Seen store must be visible in the response
            // even when FLAGS was not requested.
            if let Some(flags) = flags_updated {
                if !attrs.contains(&FetchAttr::Flags) {
                    items.push(FetchItem::Flags(flags));
                }
            }

            let Some(seq) = self
                .selected
                .as_ref()
                .and_then(|s| s.snapshot.seq_of_uid(uid))
            else {
                continue;
            };

            responses.push(Response::Fetch {
                seq: seq.get(),
                items,
            });
        }

        Ok(responses)
    }

    /// Adds `\Seen` to one message if it is missing. Returns the new flag
    /// row when a change was made.
    fn implicit_seen(
        &mut self,
        user: &Arc<User>,
        uid: Uid,
        message_id: MessageId,
    ) -> Result<Option<crate::model::FlagSet>, Error> {
        let Some(selected) = self.selected.as_mut() else {
            return Ok(None);
        };

        let already_seen = selected
            .snapshot
            .get_by_uid(uid)
            .map(|(_, row)| row.flags.contains(&Flag::Seen))
            .unwrap_or(true);
        if already_seen {
            return Ok(None);
        }

        let seen: crate::model::FlagSet =
            [Flag::Seen].into_iter().collect();
        let results = user.store_flags(
            self.session_id,
            &selected.mailbox,
            &[(uid, message_id)],
            StoreAction::Add,
            &seen,
        )?;

        let Some((_, flags)) = results.into_iter().next() else {
            return Ok(None);
        };

        let recent = selected
            .snapshot
            .get_by_uid(uid)
            .map(|(_, row)| row.recent)
            .unwrap_or(false);
        let mut flags = flags;
        if recent {
            flags.insert(Flag::Recent);
        }
        selected.snapshot.update_flags(uid, flags.clone());

        Ok(Some(flags))
    }
}

/// RFC822, RFC822.TEXT, and non-peek BODY sections imply `\Seen`.
fn attr_implies_seen(attr: &FetchAttr) -> bool {
    matches!(
        *attr,
        FetchAttr::Rfc822
            | FetchAttr::Rfc822Text
            | FetchAttr::Body { peek: false, .. },
    )
}

fn section_bytes(section: &Section, literal: &[u8]) -> Vec<u8> {
    match *section {
        Section::Full => literal.to_vec(),
        Section::Header => {
            let (header, _) = rfc5322::split_message(literal);
            header.to_vec()
        },
        Section::Text => {
            let (_, body) = rfc5322::split_message(literal);
            body.to_vec()
        },
        Section::HeaderFields { ref fields, not } => {
            let (header, _) = rfc5322::split_message(literal);
            let headers = Headers::parse(header);

            let mut out = Vec::new();
            for (name, value) in headers.iter() {
                let listed = fields
                    .iter()
                    .any(|f| f.eq_ignore_ascii_case(name));
                if listed != not {
                    out.extend_from_slice(name.as_bytes());
                    out.extend_from_slice(b": ");
                    out.extend_from_slice(value.as_bytes());
                    out.extend_from_slice(b"\r\n");
                }
            }
            out.extend_from_slice(b"\r\n");
            out
        },
    }
}

fn apply_partial(data: Vec<u8>, partial: Option<(u32, u32)>) -> Vec<u8> {
    let Some((origin, size)) = partial else {
        return data;
    };

    let start = (origin as usize).min(data.len());
    let end = start.saturating_add(size as usize).min(data.len());
    data[start..end].to_vec()
}

fn render_section(section: &Section) -> String {
    use itertools::Itertools as _;

    match *section {
        Section::Full => String::new(),
        Section::Header => "HEADER".to_owned(),
        Section::Text => "TEXT".to_owned(),
        Section::HeaderFields { ref fields, not } => format!(
            "HEADER.FIELDS{} ({})",
            if not { ".NOT" } else { "" },
            fields
                .iter()
                .map(|f| f.to_ascii_uppercase())
                .join(" "),
        ),
    }
}

fn build_envelope(headers: &Headers) -> Envelope {
    let addresses = |name: &str| {
        headers
            .get(name)
            .map(rfc5322::parse_address_list)
            .unwrap_or_default()
    };

    Envelope {
        date: headers.get("date").map(str::to_owned),
        subject: headers.get("subject").map(str::to_owned),
        from: addresses("from"),
        sender: addresses("sender"),
        reply_to: addresses("reply-to"),
        to: addresses("to"),
        cc: addresses("cc"),
        bcc: addresses("bcc"),
        in_reply_to: headers.get("in-reply-to").map(str::to_owned),
        message_id: headers.get("message-id").map(str::to_owned),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn section_extraction() {
        let literal = b"From: a@b\r\nSubject: s\r\n\r\nthe body";
        assert_eq!(
            literal.to_vec(),
            section_bytes(&Section::Full, literal),
        );
        assert_eq!(
            b"From: a@b\r\nSubject: s\r\n\r\n".to_vec(),
            section_bytes(&Section::Header, literal),
        );
        assert_eq!(
            b"the body".to_vec(),
            section_bytes(&Section::Text, literal),
        );
        assert_eq!(
            b"Subject: s\r\n\r\n".to_vec(),
            section_bytes(
                &Section::HeaderFields {
                    fields: vec!["subject".to_owned()],
                    not: false,
                },
                literal,
            ),
        );
        assert_eq!(
            b"From: a@b\r\n\r\n".to_vec(),
            section_bytes(
                &Section::HeaderFields {
                    fields: vec!["subject".to_owned()],
                    not: true,
                },
                literal,
            ),
        );
    }

    #[test]
    fn partial_clamping() {
        let data = b"0123456789".to_vec();
        assert_eq!(
            b"234".to_vec(),
            apply_partial(data.clone(), Some((2, 3))),
        );
        assert_eq!(
            b"89".to_vec(),
            apply_partial(data.clone(), Some((8, 100))),
        );
        assert!(apply_partial(data.clone(), Some((50, 10))).is_empty());
        assert_eq!(data.clone(), apply_partial(data, None));
    }

    #[test]
    fn section_rendering() {
        assert_eq!("", render_section(&Section::Full));
        assert_eq!(
            "HEADER.FIELDS (FROM DATE)",
            render_section(&Section::HeaderFields {
                fields: vec!["From".to_owned(), "Date".to_owned()],
                not: false,
            }),
        );
    }
}
