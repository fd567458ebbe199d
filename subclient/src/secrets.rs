//! Read side of the encrypted secrets store.
//!
//! The store is an AES-256-GCM encrypted JSON map of variable names to
//! values, used as one of the `${VAR}` interpolation sources. Management of
//! the store (init/set/rekey) happens out-of-band; this process only ever
//! decrypts.
//!
//! File layout:
//!
//! ```text
//! [ 8 bytes  magic "POLSECRT" ]
//! [ 1 byte   version = 0x01   ]
//! [16 bytes  salt (GCM AAD)   ]
//! [12 bytes  nonce            ]
//! [ N bytes  ciphertext + tag ]
//! ```
//!
//! The key file holds exactly 32 raw bytes.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use polaris_core::{Result, SubclientError};
use std::collections::HashMap;
use std::path::Path;

const MAGIC: &[u8; 8] = b"POLSECRT";
const VERSION: u8 = 0x01;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const HEADER_LEN: usize = MAGIC.len() + 1 + SALT_LEN + NONCE_LEN;

/// Decrypt the secrets store and return the name → value map.
pub fn load(secrets_file: &Path, key_file: &Path) -> Result<HashMap<String, String>> {
    let key = load_key(key_file)?;
    let data = std::fs::read(secrets_file).map_err(|e| {
        SubclientError::Secrets(format!("cannot read {}: {e}", secrets_file.display()))
    })?;

    if data.len() < HEADER_LEN {
        return Err(SubclientError::Secrets("secrets file truncated".into()));
    }
    if &data[..MAGIC.len()] != MAGIC {
        return Err(SubclientError::Secrets("invalid secrets file (bad magic)".into()));
    }
    let version = data[MAGIC.len()];
    if version != VERSION {
        return Err(SubclientError::Secrets(format!(
            "unsupported secrets file version: {version}"
        )));
    }

    let salt = &data[MAGIC.len() + 1..MAGIC.len() + 1 + SALT_LEN];
    let nonce = &data[MAGIC.len() + 1 + SALT_LEN..HEADER_LEN];
    let ciphertext = &data[HEADER_LEN..];

    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| SubclientError::Secrets(format!("bad key: {e}")))?;
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: salt,
            },
        )
        .map_err(|_| SubclientError::Secrets("decryption failed (wrong key or corrupt file)".into()))?;

    serde_json::from_slice(&plaintext)
        .map_err(|e| SubclientError::Secrets(format!("secrets payload is not a JSON map: {e}")))
}

fn load_key(key_file: &Path) -> Result<[u8; KEY_LEN]> {
    let bytes = std::fs::read(key_file).map_err(|e| {
        SubclientError::Secrets(format!("cannot read key file {}: {e}", key_file.display()))
    })?;
    <[u8; KEY_LEN]>::try_from(bytes.as_slice()).map_err(|_| {
        SubclientError::Secrets(format!(
            "key file must be exactly {KEY_LEN} bytes, got {}",
            bytes.len()
        ))
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write as _;

    /// Test-side writer matching the documented layout.
    fn write_store(path: &Path, key: &[u8; KEY_LEN], store: &HashMap<String, String>) {
        let salt = [7u8; SALT_LEN];
        let nonce = [9u8; NONCE_LEN];
        let plaintext = serde_json::to_vec(store).unwrap();

        let cipher = Aes256Gcm::new_from_slice(key).unwrap();
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &plaintext,
                    aad: &salt,
                },
            )
            .unwrap();

        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(MAGIC).unwrap();
        f.write_all(&[VERSION]).unwrap();
        f.write_all(&salt).unwrap();
        f.write_all(&nonce).unwrap();
        f.write_all(&ciphertext).unwrap();
    }

    fn key_file(dir: &Path, key: &[u8]) -> std::path::PathBuf {
        let p = dir.join("master.key");
        std::fs::write(&p, key).unwrap();
        p
    }

    #[test]
    fn round_trips_a_store() {
        let dir = tempfile::tempdir().unwrap();
        let key = [42u8; KEY_LEN];
        let kf = key_file(dir.path(), &key);
        let sf = dir.path().join(".secrets.enc");

        let mut store = HashMap::new();
        store.insert("POLARIS_API_KEY".to_string(), "super-secret".to_string());
        write_store(&sf, &key, &store);

        let loaded = load(&sf, &kf).unwrap();
        assert_eq!(loaded, store);
    }

    #[test]
    fn rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let key = [42u8; KEY_LEN];
        let kf = key_file(dir.path(), &key);
        let sf = dir.path().join(".secrets.enc");
        std::fs::write(&sf, b"NOTMAGIC\x01this is not a store at all....").unwrap();

        let err = load(&sf, &kf).unwrap_err();
        assert!(err.to_string().contains("bad magic"), "got: {err}");
    }

    #[test]
    fn rejects_wrong_key() {
        let dir = tempfile::tempdir().unwrap();
        let key = [42u8; KEY_LEN];
        let sf = dir.path().join(".secrets.enc");
        write_store(&sf, &key, &HashMap::new());

        let wrong = key_file(dir.path(), &[43u8; KEY_LEN]);
        let err = load(&sf, &wrong).unwrap_err();
        assert!(err.to_string().contains("decryption failed"), "got: {err}");
    }

    #[test]
    fn rejects_short_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let kf = key_file(dir.path(), &[1u8; 16]);
        let sf = dir.path().join(".secrets.enc");
        write_store(&sf, &[42u8; KEY_LEN], &HashMap::new());

        let err = load(&sf, &kf).unwrap_err();
        assert!(err.to_string().contains("exactly 32 bytes"), "got: {err}");
    }

    #[test]
    fn rejects_unsupported_version() {
        let dir = tempfile::tempdir().unwrap();
        let key = [42u8; KEY_LEN];
        let kf = key_file(dir.path(), &key);
        let sf = dir.path().join(".secrets.enc");

        let mut data = Vec::new();
        data.extend_from_slice(MAGIC);
        data.push(0x02);
        data.extend_from_slice(&[0u8; SALT_LEN + NONCE_LEN + 16]);
        std::fs::write(&sf, data).unwrap();

        let err = load(&sf, &kf).unwrap_err();
        assert!(err.to_string().contains("version"), "got: {err}");
    }
}
