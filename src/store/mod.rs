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

//! Opaque blob storage for message literals.

mod on_disk;

pub use on_disk::OnDiskStore;

use std::io::Read;
use std::sync::{Condvar, Mutex};

use crate::model::MessageId;
use crate::support::error::Error;

/// Blob persistence: `id -> bytes`, opaque to the rest of the system.
///
/// Implementations must be individually thread-safe; callers invoke them
/// from parallel SEARCH workers and concurrent sessions.
pub trait Store: Send + Sync + 'static {
    fn set(&self, id: MessageId, data: &mut dyn Read) -> Result<(), Error>;
    fn get(&self, id: MessageId) -> Result<Vec<u8>, Error>;
    fn delete(&self, ids: &[MessageId]) -> Result<(), Error>;
    fn list(&self) -> Result<Vec<MessageId>, Error>;
}

/// A counting semaphore bounding parallel encrypt/decrypt work.
pub struct Semaphore {
    permits: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Semaphore {
            permits: Mutex::new(permits.max(1)),
            cond: Condvar::new(),
        }
    }

    pub fn acquire(&self) -> SemaphoreGuard<'_> {
        let mut permits = self.permits.lock().unwrap();
        while 0 == *permits {
            permits = self.cond.wait(permits).unwrap();
        }
        *permits -= 1;

        SemaphoreGuard { semaphore: self }
    }
}

pub struct SemaphoreGuard<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        let mut permits = self.semaphore.permits.lock().unwrap();
        *permits += 1;
        self.semaphore.cond.notify_one();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn semaphore_bounds_concurrency() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let semaphore = Arc::new(Semaphore::new(2));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let threads = (0..8)
            .map(|_| {
                let semaphore = Arc::clone(&semaphore);
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                std::thread::spawn(move || {
                    let _guard = semaphore.acquire();
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(
                        std::time::Duration::from_millis(10),
                    );
                    active.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect::<Vec<_>>();

        for thread in threads {
            thread.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
