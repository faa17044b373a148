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

//! The embeddable server: user registry and TCP accept loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{error, info};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::config::ServerConfig;
use crate::connector::Connector;
use crate::response::write_responses;
use crate::session::{read_commands, Session, SessionShared};
use crate::state::User;
use crate::support::async_io::ServerIo;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;

pub struct Server {
    state: Arc<ServerState>,
}

pub(crate) struct ServerState {
    pub config: Arc<ServerConfig>,
    users: Mutex<HashMap<String, Arc<User>>>,
    session_counter: AtomicU64,
}

impl ServerState {
    pub(crate) fn find_user(&self, username: &str) -> Option<Arc<User>> {
        self.users.lock().unwrap().get(username).cloned()
    }
}

impl Server {
    pub fn new(config: ServerConfig) -> Result<Self, Error> {
        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(&config.database_dir)?;

        Ok(Server {
            state: Arc::new(ServerState {
                config: Arc::new(config),
                users: Mutex::new(HashMap::new()),
                session_counter: AtomicU64::new(0),
            }),
        })
    }

    /// Registers a user with their credentials and backend connector,
    /// returning the generated opaque user id.
    ///
    /// Must run inside a Tokio runtime: this attaches the connector's
    /// update worker and performs the initial sync.
    pub fn add_user(
        &self,
        username: &str,
        password: &str,
        connector: Arc<dyn Connector>,
    ) -> Result<String, Error> {
        let user_id = uuid::Uuid::new_v4().to_string();

        let user = User::new(
            user_id.clone(),
            username.to_owned(),
            password.to_owned(),
            Arc::clone(&self.state.config),
            connector,
        )?;
        user.start()?;

        self.state
            .users
            .lock()
            .unwrap()
            .insert(username.to_owned(), user);

        info!("added user {} ({})", username, user_id);
        Ok(user_id)
    }

    /// Accepts and serves IMAP connections until the listener fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Error> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let state = Arc::clone(&self.state);

            tokio::spawn(async move {
                let session_id =
                    state.session_counter.fetch_add(1, Ordering::SeqCst);
                let log_prefix =
                    LogPrefix::new(session_id, peer.to_string());
                info!("{} connected", log_prefix);

                if let Err(e) =
                    serve_connection(state, stream, session_id, &log_prefix)
                        .await
                {
                    error!("{} session failed: {}", log_prefix, e);
                }

                info!("{} disconnected", log_prefix);
            });
        }
    }
}

async fn serve_connection(
    state: Arc<ServerState>,
    stream: tokio::net::TcpStream,
    session_id: u64,
    log_prefix: &LogPrefix,
) -> Result<(), Error> {
    let io = ServerIo::new(stream.into_std()?)?;

    let (out_tx, out_rx) = mpsc::channel(64);
    let (cmd_tx, cmd_rx) = mpsc::channel(1);
    let shared = Arc::new(SessionShared {
        authenticated: false.into(),
        tls_active: false.into(),
    });

    let writer = tokio::spawn({
        let io = io.clone();
        async move { write_responses(io, out_rx).await }
    });

    let reader = tokio::spawn(read_commands(
        io,
        out_tx.clone(),
        cmd_tx,
        Arc::clone(&shared),
        Arc::clone(&state.config),
        log_prefix.clone(),
    ));

    let mut session = Session::new(
        state,
        session_id,
        log_prefix.clone(),
        shared,
        out_tx,
    );
    session.run(cmd_rx).await;
    drop(session);

    // The handler is done; tear the reader down (it may be blocked on
    // the socket) and let the writer drain.
    reader.abort();
    let _ = reader.await;
    match writer.await {
        Ok(result) => result?,
        Err(join) if join.is_cancelled() => (),
        Err(join) => {
            return Err(Error::Internal(format!(
                "writer task panicked: {}",
                join,
            )));
        },
    }

    Ok(())
}
