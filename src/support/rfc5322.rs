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

//! A tolerant reader for the parts of RFC 5322 the server needs: splitting
//! header from body, unfolding header fields, the `Date:` field, and a
//! rough-and-ready address list parse for ENVELOPE.
//!
//! Real mail is full of almost-conformant data, so everything here degrades
//! to "treat it as opaque text" rather than failing.

use chrono::{DateTime, FixedOffset};

use crate::response::Address;

/// Splits a message into its header block (including the blank separator
/// line) and body.
pub fn split_message(raw: &[u8]) -> (&[u8], &[u8]) {
    let mut i = 0usize;
    while i + 3 < raw.len() {
        if &raw[i..i + 4] == b"\r\n\r\n" {
            return (&raw[..i + 4], &raw[i + 4..]);
        }
        i += 1;
    }

    // Accept bare-LF separators from non-conformant sources.
    let mut i = 0usize;
    while i + 1 < raw.len() {
        if &raw[i..i + 2] == b"\n\n" {
            return (&raw[..i + 2], &raw[i + 2..]);
        }
        i += 1;
    }

    (raw, &[])
}

/// Parsed, unfolded header fields in order of appearance.
#[derive(Clone, Debug, Default)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    pub fn parse(header: &[u8]) -> Self {
        let text = String::from_utf8_lossy(header);
        let mut fields = Vec::<(String, String)>::new();

        for line in text.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() {
                break;
            }

            if line.starts_with(' ') || line.starts_with('\t') {
                // Folded continuation of the previous field.
                if let Some(&mut (_, ref mut value)) = fields.last_mut() {
                    value.push(' ');
                    value.push_str(line.trim_start());
                }
                continue;
            }

            let Some(colon) = line.find(':') else {
                continue;
            };

            let name = line[..colon].trim().to_owned();
            let value = line[colon + 1..].trim().to_owned();
            fields.push((name, value));
        }

        Headers { fields }
    }

    /// First value of the named field, case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

/// Parses an RFC 5322 `Date:` value.
pub fn parse_date(value: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc2822(value.trim()).ok()
}

/// Parses an address list into ENVELOPE address structures.
///
/// This understands `Display Name <local@host>`, bare `local@host`, and
/// comma separation outside quotes and angle brackets. Anything stranger is
/// passed through as a nameless mailbox.
pub fn parse_address_list(value: &str) -> Vec<Address> {
    split_addresses(value)
        .into_iter()
        .filter_map(|part| parse_address(part.trim()))
        .collect()
}

fn split_addresses(value: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quoted = false;
    let mut start = 0usize;

    for (i, c) in value.char_indices() {
        match c {
            '"' => quoted = !quoted,
            '<' | '(' if !quoted => depth += 1,
            '>' | ')' if !quoted => depth -= 1,
            ',' if !quoted && depth <= 0 => {
                parts.push(&value[start..i]);
                start = i + 1;
            },
            _ => (),
        }
    }

    parts.push(&value[start..]);
    parts
}

fn parse_address(part: &str) -> Option<Address> {
    if part.is_empty() {
        return None;
    }

    let (name, addr) = match (part.find('<'), part.rfind('>')) {
        (Some(lt), Some(gt)) if lt < gt => {
            let name = part[..lt].trim().trim_matches('"').trim();
            let addr = part[lt + 1..gt].trim();
            (
                if name.is_empty() {
                    None
                } else {
                    Some(name.to_owned())
                },
                addr,
            )
        },
        _ => (None, part),
    };

    let (mailbox, host) = match addr.rfind('@') {
        Some(at) => (&addr[..at], Some(addr[at + 1..].to_owned())),
        None => (addr, None),
    };

    Some(Address {
        name,
        mailbox: if mailbox.is_empty() {
            None
        } else {
            Some(mailbox.to_owned())
        },
        host,
    })
}
