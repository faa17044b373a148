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

use std::fmt;
use std::sync::{Arc, Mutex};

/// Tracks text included at the start of every session-scoped log statement.
///
/// Clones of a `LogPrefix` share the same underlying data, so the reader,
/// handler, and writer tasks of one session all pick up the user name once
/// login binds it.
#[derive(Clone)]
pub struct LogPrefix {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    session_id: u64,
    peer: String,
    user: Option<String>,
}

impl LogPrefix {
    pub fn new(session_id: u64, peer: String) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                session_id,
                peer,
                user: None,
            })),
        }
    }

    pub fn set_user(&self, user: &str) {
        self.inner.lock().unwrap().user = Some(user.to_owned());
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        write!(f, "imap#{}[{}", inner.session_id, inner.peer)?;
        if let Some(ref user) = inner.user {
            write!(f, " {}", user)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn prefix_format() {
        let prefix = LogPrefix::new(42, "10.0.0.1:55555".to_owned());
        assert_eq!("imap#42[10.0.0.1:55555]", prefix.to_string());
        prefix.set_user("azure");
        assert_eq!("imap#42[10.0.0.1:55555 azure]", prefix.to_string());
    }
}
