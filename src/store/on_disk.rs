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

//! The reference `Store`: one file per blob, encrypted at rest.
//!
//! Each blob is AES-256-GCM under a key derived from the per-server
//! passphrase with PBKDF2-HMAC-SHA256 and a per-store random salt. File
//! layout: 12-byte IV, 16-byte tag, ciphertext. A salt file sits next to
//! the blobs; it is public data.
//!
//! Writes go to a temporary name in the same directory and are renamed into
//! place, so a crash never leaves a half-written blob under a real id.

use std::fs;
use std::io::{Read, Write as _};
use std::path::{Path, PathBuf};
use std::str::FromStr as _;
use std::sync::Arc;

use openssl::symm::Cipher;
use rand::{rngs::OsRng, RngCore as _};

use super::{Semaphore, Store};
use crate::model::MessageId;
use crate::support::error::Error;

const SALT_FILE: &str = "salt";
const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const PBKDF2_ROUNDS: usize = 100_000;

pub struct OnDiskStore {
    root: PathBuf,
    key: [u8; KEY_LEN],
    semaphore: Arc<Semaphore>,
}

impl OnDiskStore {
    /// Opens (creating if needed) the store rooted at `root`.
    pub fn new(
        root: &Path,
        passphrase: &[u8],
        semaphore: Arc<Semaphore>,
    ) -> Result<Self, Error> {
        fs::create_dir_all(root)?;

        let salt_path = root.join(SALT_FILE);
        let salt = match fs::read(&salt_path) {
            Ok(salt) if salt.len() == SALT_LEN => salt,
            _ => {
                let mut salt = vec![0u8; SALT_LEN];
                OsRng.fill_bytes(&mut salt);
                fs::write(&salt_path, &salt)?;
                salt
            },
        };

        let mut key = [0u8; KEY_LEN];
        openssl::pkcs5::pbkdf2_hmac(
            passphrase,
            &salt,
            PBKDF2_ROUNDS,
            openssl::hash::MessageDigest::sha256(),
            &mut key,
        )?;

        Ok(OnDiskStore {
            root: root.to_owned(),
            key,
            semaphore,
        })
    }

    fn blob_path(&self, id: MessageId) -> PathBuf {
        self.root.join(id.to_string())
    }
}

impl Store for OnDiskStore {
    fn set(&self, id: MessageId, data: &mut dyn Read) -> Result<(), Error> {
        let mut cleartext = Vec::new();
        data.read_to_end(&mut cleartext)?;

        let _permit = self.semaphore.acquire();

        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let mut tag = [0u8; TAG_LEN];
        let ciphertext = openssl::symm::encrypt_aead(
            Cipher::aes_256_gcm(),
            &self.key,
            Some(&iv),
            &[],
            &cleartext,
            &mut tag,
        )?;

        let path = self.blob_path(id);
        let tmp = self.root.join(format!("{}.tmp", id));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&iv)?;
            file.write_all(&tag)?;
            file.write_all(&ciphertext)?;
            file.sync_data()?;
        }
        fs::rename(&tmp, &path)?;

        Ok(())
    }

    fn get(&self, id: MessageId) -> Result<Vec<u8>, Error> {
        let raw = fs::read(self.blob_path(id))?;
        if raw.len() < IV_LEN + TAG_LEN {
            return Err(Error::CorruptBlob);
        }

        let _permit = self.semaphore.acquire();

        let (iv, rest) = raw.split_at(IV_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        openssl::symm::decrypt_aead(
            Cipher::aes_256_gcm(),
            &self.key,
            Some(iv),
            &[],
            ciphertext,
            tag,
        )
        .map_err(|_| Error::CorruptBlob)
    }

    fn delete(&self, ids: &[MessageId]) -> Result<(), Error> {
        for &id in ids {
            match fs::remove_file(self.blob_path(id)) {
                Ok(()) => (),
                Err(e) if std::io::ErrorKind::NotFound == e.kind() => (),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<MessageId>, Error> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Ok(id) = MessageId::from_str(name) {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn store(dir: &Path) -> OnDiskStore {
        OnDiskStore::new(dir, b"pass", Arc::new(Semaphore::new(4))).unwrap()
    }

    #[test]
    fn round_trip_large_random_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let mut data = vec![0u8; 1024 * 1204];
        OsRng.fill_bytes(&mut data);

        let id = MessageId::new();
        store.set(id, &mut &data[..]).unwrap();
        assert_eq!(data, store.get(id).unwrap());
        store.delete(&[id]).unwrap();
        assert!(store.get(id).is_err());
    }

    #[test]
    fn set_get_delete_several() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let id1 = MessageId::new();
        let id2 = MessageId::new();
        let id3 = MessageId::new();

        store.set(id1, &mut &b"literal1"[..]).unwrap();
        store.set(id2, &mut &b"literal2"[..]).unwrap();
        store.set(id3, &mut &b"literal3"[..]).unwrap();

        assert_eq!(b"literal1".to_vec(), store.get(id1).unwrap());
        assert_eq!(b"literal2".to_vec(), store.get(id2).unwrap());
        assert_eq!(b"literal3".to_vec(), store.get(id3).unwrap());

        store.delete(&[id1, id2, id3]).unwrap();
    }

    #[test]
    fn list_skips_salt_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let id1 = MessageId::new();
        let id2 = MessageId::new();
        store.set(id1, &mut &b"a"[..]).unwrap();
        store.set(id2, &mut &b"b"[..]).unwrap();

        let mut listed = store.list().unwrap();
        listed.sort_by_key(|id| id.to_string());
        let mut expected = vec![id1, id2];
        expected.sort_by_key(|id| id.to_string());
        assert_eq!(expected, listed);
    }

    #[test]
    fn reopening_with_same_passphrase_reads_old_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let id = MessageId::new();

        store(dir.path()).set(id, &mut &b"persist"[..]).unwrap();
        assert_eq!(
            b"persist".to_vec(),
            store(dir.path()).get(id).unwrap(),
        );
    }

    #[test]
    fn tampered_blob_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let id = MessageId::new();
        store.set(id, &mut &b"sensitive"[..]).unwrap();

        let path = dir.path().join(id.to_string());
        let mut raw = fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        fs::write(&path, &raw).unwrap();

        assert!(matches!(store.get(id), Err(Error::CorruptBlob)));
    }
}
