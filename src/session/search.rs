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

//! SEARCH and UID SEARCH: compile the key tree, run it over the
//! snapshot under the read guard, answer with the matches.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use super::{CmdResult, Session};
use crate::command::search::SearchCommand;
use crate::response::Response;
use crate::state::search as engine;

impl Session {
    pub(super) async fn cmd_search(
        &mut self,
        search: SearchCommand,
        uid_mode: bool,
    ) -> CmdResult {
        let user = Arc::clone(self.authenticated()?);
        self.in_selected(|_| Ok(()))?;

        let hits = {
            let _guard = user.lock.read().await;
            let selected = self
                .selected
                .as_ref()
                .expect("selection checked above");

            let program = engine::compile(
                &search.keys,
                search.charset.as_deref(),
                &selected.snapshot,
            )
            .map_err(|e| self.map_error(e))?;

            engine::execute(
                &program,
                &selected.snapshot,
                &user.db,
                &user.store,
                uid_mode,
                self.config.disable_parallelism,
                &Arc::new(AtomicBool::new(false)),
            )
            .map_err(|e| self.map_error(e))?
        };

        self.send_untagged(&Response::Search(hits)).await;
        Ok(Response::ok("SEARCH"))
    }
}
