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

//! CAPABILITY, LOGIN, AUTHENTICATE, LOGOUT.

use std::sync::atomic::Ordering;

use log::info;

use super::{CmdResult, Session};
use crate::response::{OutputControl, Response};

impl Session {
    pub(super) async fn cmd_capability(&mut self) -> CmdResult {
        let caps = self.capabilities();
        self.send_untagged(&Response::Capability(caps)).await;
        Ok(Response::ok("CAPABILITY"))
    }

    pub(super) async fn cmd_logout(&mut self) -> CmdResult {
        self.send_line(
            None,
            &Response::bye("Logging out"),
            OutputControl::Buffer,
        )
        .await;
        self.logged_out = true;
        self.deselect();
        Ok(Response::ok("LOGOUT"))
    }

    pub(super) async fn cmd_login(
        &mut self,
        username: &str,
        password: &str,
    ) -> CmdResult {
        if self.user.is_some() {
            return Err(Response::bad("Already authenticated"));
        }

        let user = self.server.find_user(username);
        let ok = user
            .as_ref()
            .map(|u| u.check_password(password))
            .unwrap_or(false);

        let Some(user) = user.filter(|_| ok) else {
            // Throttle brute force: the failure is not announced until
            // the jail time (plus a little jitter) has elapsed.
            let jitter = std::time::Duration::from_millis(
                rand::Rng::gen_range(&mut rand::thread_rng(), 0..50),
            );
            tokio::time::sleep(self.config.login_jail_time + jitter).await;
            return Err(Response::no("Invalid credentials"));
        };

        let queue = user.register_session(self.session_id);
        self.queue = Some(queue);
        self.log_prefix.set_user(&user.username);
        self.shared.authenticated.store(true, Ordering::SeqCst);
        info!("{} authenticated", self.log_prefix);
        self.user = Some(user);

        Ok(Response::ok("LOGIN"))
    }

    pub(super) async fn cmd_authenticate(
        &mut self,
        mechanism: &str,
        initial: Option<&[u8]>,
    ) -> CmdResult {
        if self.config.disable_imap_authenticate {
            return Err(Response::no("AUTHENTICATE is disabled"));
        }

        if self.user.is_some() {
            return Err(Response::bad("Already authenticated"));
        }

        if !mechanism.eq_ignore_ascii_case("plain") {
            return Err(Response::no(
                "Unsupported authentication mechanism",
            ));
        }

        let Some(initial) = initial else {
            return Err(Response::bad("Missing SASL response"));
        };

        if initial == b"*" {
            return Err(Response::bad("AUTHENTICATE cancelled"));
        }

        let Ok(decoded) = base64::decode(initial) else {
            return Err(Response::bad("Invalid base64"));
        };

        // PLAIN: authzid NUL authcid NUL password
        let mut parts = decoded.split(|&b| b == 0);
        let (_authzid, authcid, password) =
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(z), Some(c), Some(p), None) => (z, c, p),
                _ => {
                    return Err(Response::bad(
                        "Malformed PLAIN response",
                    ))
                },
            };

        let (Ok(username), Ok(password)) = (
            std::str::from_utf8(authcid).map(str::to_owned),
            std::str::from_utf8(password).map(str::to_owned),
        ) else {
            return Err(Response::bad("Malformed PLAIN response"));
        };

        self.cmd_login(&username, &password).await
    }
}
