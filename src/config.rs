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

//! Server-wide configuration supplied by the embedding host.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::error;
use openssl::ssl::SslAcceptor;

use crate::model::UidValidity;
use crate::parser::DEFAULT_MAX_LITERAL_SIZE;
use crate::store::{OnDiskStore, Semaphore, Store};
use crate::support::error::Error;

/// Identity advertised in the server greeting.
#[derive(Clone, Debug)]
pub struct VersionInfo {
    pub name: String,
    pub vendor: String,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub support_url: String,
}

impl Default for VersionInfo {
    fn default() -> Self {
        VersionInfo {
            name: env!("CARGO_PKG_NAME").to_owned(),
            vendor: String::new(),
            major: env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
            minor: env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
            patch: env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0),
            support_url: String::new(),
        }
    }
}

/// Protocol limits, all externally tunable.
#[derive(Clone, Copy, Debug)]
pub struct ImapLimits {
    pub max_mailbox_name_len: usize,
    pub max_message_size: u32,
    pub max_literal_size: u32,
    pub max_subscriptions: usize,
}

impl Default for ImapLimits {
    fn default() -> Self {
        ImapLimits {
            max_mailbox_name_len: 255,
            max_message_size: DEFAULT_MAX_LITERAL_SIZE,
            max_literal_size: DEFAULT_MAX_LITERAL_SIZE,
            max_subscriptions: 5000,
        }
    }
}

/// Sink for failures that cannot be surfaced to any client, such as errors
/// applying backend updates during fan-out.
pub trait Reporter: Send + Sync + 'static {
    fn report_error(&self, context: &str, error: &Error);

    fn report_panic(&self, context: &str, message: &str) {
        error!("panic in {}: {}", context, message);
    }
}

/// Default reporter: forward to the `log` facade.
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report_error(&self, context: &str, error: &Error) {
        error!("{}: {}", context, error);
    }
}

pub type StoreBuilder =
    dyn Fn(&Path) -> Result<Arc<dyn Store>, Error> + Send + Sync;

pub type UidValidityGenerator = dyn Fn() -> UidValidity + Send + Sync;

pub struct ServerConfig {
    /// Root for per-user blob directories:
    /// `<data_dir>/<user_id>/blobs/<blob_id>`.
    pub data_dir: PathBuf,
    /// Root for per-user metadata databases: `<database_dir>/<user_id>.db`.
    pub database_dir: PathBuf,
    /// Mailbox hierarchy delimiter byte.
    pub delimiter: u8,
    /// TLS configuration; enables STARTTLS when present.
    pub tls: Option<SslAcceptor>,
    pub version: VersionInfo,
    /// Coalescing window for pushed updates while a session is idling.
    pub idle_bulk_time: Duration,
    /// Delay applied before answering a failed login attempt.
    pub login_jail_time: Duration,
    pub store_builder: Arc<StoreBuilder>,
    pub reporter: Arc<dyn Reporter>,
    pub limits: ImapLimits,
    /// Forces SEARCH to run single-threaded.
    pub disable_parallelism: bool,
    /// Withholds AUTH=PLAIN and rejects AUTHENTICATE.
    pub disable_imap_authenticate: bool,
    pub uid_validity_generator: Arc<UidValidityGenerator>,
}

impl ServerConfig {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        database_dir: impl Into<PathBuf>,
    ) -> Self {
        ServerConfig {
            data_dir: data_dir.into(),
            database_dir: database_dir.into(),
            delimiter: b'/',
            tls: None,
            version: VersionInfo::default(),
            idle_bulk_time: Duration::from_millis(500),
            login_jail_time: Duration::from_secs(1),
            store_builder: default_store_builder(),
            reporter: Arc::new(LogReporter),
            limits: ImapLimits::default(),
            disable_parallelism: false,
            disable_imap_authenticate: false,
            uid_validity_generator: default_uid_validity_generator(),
        }
    }
}

/// The default store builder encrypts blobs under a passphrase derived from
/// the directory path. Hosts wanting real at-rest protection supply their
/// own builder with a secret passphrase.
fn default_store_builder() -> Arc<StoreBuilder> {
    let semaphore = Arc::new(Semaphore::new(
        std::thread::available_parallelism().map_or(1, |n| n.get()),
    ));

    Arc::new(move |path: &Path| {
        let passphrase = path.as_os_str().to_string_lossy().into_owned();
        Ok(Arc::new(OnDiskStore::new(
            path,
            passphrase.as_bytes(),
            Arc::clone(&semaphore),
        )?) as Arc<dyn Store>)
    })
}

/// Epoch-seconds generator: recreated users naturally get a fresh
/// UID-validity base. Persisted once per user and never regressed.
fn default_uid_validity_generator() -> Arc<UidValidityGenerator> {
    Arc::new(|| {
        let now = chrono::Utc::now().timestamp();
        UidValidity(u32::try_from(now & 0x7fff_ffff).unwrap_or(1).max(1))
    })
}
