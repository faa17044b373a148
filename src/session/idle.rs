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

//! The IDLE loop: wait for DONE or a push from the hub, flushing queued
//! updates (expunges included) as they arrive.
//!
//! Pushed updates are coalesced for the configured idle-bulk window
//! before flushing, so a burst of backend changes becomes one batch of
//! untagged responses.

use tokio::sync::mpsc;

use super::{CmdResult, ReaderEvent, Session};
use crate::command::CommandBody;
use crate::response::{OutputControl, OutputEvent, Response};

impl Session {
    pub(super) async fn cmd_idle(
        &mut self,
        rx: &mut mpsc::Receiver<ReaderEvent>,
    ) -> CmdResult {
        let queue = match (&self.user, &self.queue) {
            (Some(_), Some(queue)) => queue.clone(),
            _ => return Err(Response::bad("Not authenticated")),
        };

        let _ = self
            .out
            .send(OutputEvent::Continuation {
                prompt: "idling".to_owned(),
            })
            .await;

        // Surface anything that queued up before the idle began.
        self.flush_updates(true).await;
        self.flush_output().await;

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    None => {
                        self.logged_out = true;
                        return Ok(Response::ok("IDLE terminated"));
                    },
                    Some(ReaderEvent::Command(command)) => {
                        if let CommandBody::Done = command.body {
                            return Ok(Response::ok("IDLE terminated"));
                        }
                        return Err(Response::bad(
                            "Expected DONE to end IDLE",
                        ));
                    },
                    Some(ReaderEvent::ParseFailed { .. }) => {
                        return Err(Response::bad(
                            "Expected DONE to end IDLE",
                        ));
                    },
                },

                _ = queue.notify.notified() => {
                    // Let a burst of updates accumulate, then flush the
                    // whole batch.
                    tokio::time::sleep(self.config.idle_bulk_time).await;
                    self.flush_updates(true).await;
                    self.flush_output().await;

                    if self.bye_pending {
                        self.logged_out = true;
                        self.send_line(
                            None,
                            &Response::bye(
                                "Selected mailbox no longer exists",
                            ),
                            OutputControl::Disconnect,
                        )
                        .await;
                        return Ok(Response::ok("IDLE terminated"));
                    }
                },
            }
        }
    }

    async fn flush_output(&self) {
        let _ = self.out.send(OutputEvent::Flush).await;
    }
}
