use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;
use tracing::warn;

/// The persistent pairing secret. Either absent or complete: partial records
/// are never written (atomic replace) and a record without a bridge
/// credential does not count as paired.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredCredential {
    pub bridge_id: String,
    pub bridge_credential: String,
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paired_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_url: Option<String>,
}

impl StoredCredential {
    fn is_valid(&self) -> bool {
        !self.bridge_credential.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed credential file {path}: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Single-file credential persistence, shared by the pairing coordinator,
/// the cloud session, and the orchestrator. Writes are full-file replaces.
#[derive(Debug)]
pub struct CredentialStore {
    path: PathBuf,
    current: Mutex<Option<StoredCredential>>,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            current: Mutex::new(None),
        }
    }

    /// Read the credential file into memory. A missing or unreadable file is
    /// not an error: the bridge degrades to unpaired mode.
    pub fn load(&self) -> Option<StoredCredential> {
        let loaded = match self.read_file() {
            Ok(credential) => credential,
            Err(err) => {
                warn!(
                    target: "bridge::credentials",
                    error = %err,
                    "failed to load credential file; starting unpaired"
                );
                None
            }
        };
        let loaded = loaded.filter(StoredCredential::is_valid);
        *self.current.lock().unwrap() = loaded.clone();
        loaded
    }

    fn read_file(&self) -> Result<Option<StoredCredential>, CredentialError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CredentialError::Io {
                    path: self.path.display().to_string(),
                    source,
                })
            }
        };
        let credential =
            serde_json::from_str(&raw).map_err(|source| CredentialError::Malformed {
                path: self.path.display().to_string(),
                source,
            })?;
        Ok(Some(credential))
    }

    /// Persist a freshly redeemed credential. The record is written to a
    /// temporary file first and renamed over the target so a crash can never
    /// leave a partial file behind.
    pub fn save(&self, credential: StoredCredential) -> Result<(), CredentialError> {
        let io_err = |source| CredentialError::Io {
            path: self.path.display().to_string(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let serialized = serde_json::to_string_pretty(&credential).map_err(|source| {
            CredentialError::Malformed {
                path: self.path.display().to_string(),
                source,
            }
        })?;

        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, serialized.as_bytes()).map_err(io_err)?;
        fs::rename(&tmp_path, &self.path).map_err(io_err)?;

        *self.current.lock().unwrap() = Some(credential);
        Ok(())
    }

    /// Remove the credential file and the in-memory copy. Used on explicit
    /// user disconnect and on revoked/invalid authentication.
    pub fn clear(&self) -> Result<(), CredentialError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(CredentialError::Io {
                    path: self.path.display().to_string(),
                    source,
                })
            }
        }
        *self.current.lock().unwrap() = None;
        Ok(())
    }

    /// True iff a credential with a non-empty bridge credential is resident.
    pub fn is_paired(&self) -> bool {
        self.current
            .lock()
            .unwrap()
            .as_ref()
            .map(StoredCredential::is_valid)
            .unwrap_or(false)
    }

    pub fn current(&self) -> Option<StoredCredential> {
        self.current.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn credential() -> StoredCredential {
        StoredCredential {
            bridge_id: "helm-bridge-abcd1234".into(),
            bridge_credential: "bc_deadbeef".into(),
            tenant_id: "42".into(),
            paired_at: Some(Utc::now()),
            cloud_url: Some("https://helm.replit.app".into()),
        }
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("nested/credentials.json"));

        assert!(store.load().is_none());
        assert!(!store.is_paired());

        let saved = credential();
        store.save(saved.clone()).unwrap();
        assert!(store.is_paired());

        let reloaded = CredentialStore::new(dir.path().join("nested/credentials.json"));
        assert_eq!(reloaded.load(), Some(saved));
        assert!(reloaded.is_paired());
    }

    #[test]
    fn clear_makes_unpaired_until_next_save() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("credentials.json"));

        store.save(credential()).unwrap();
        assert!(store.is_paired());

        store.clear().unwrap();
        assert!(!store.is_paired());
        assert!(store.load().is_none());
        assert!(!dir.path().join("credentials.json").exists());

        store.save(credential()).unwrap();
        assert!(store.is_paired());
    }

    #[test]
    fn malformed_file_degrades_to_unpaired() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        fs::write(&path, "{ not json").unwrap();

        let store = CredentialStore::new(&path);
        assert!(store.load().is_none());
        assert!(!store.is_paired());
    }

    #[test]
    fn empty_bridge_credential_is_not_paired() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        fs::write(
            &path,
            r#"{"bridgeId": "helm-bridge-abcd1234", "bridgeCredential": "", "tenantId": "42"}"#,
        )
        .unwrap();

        let store = CredentialStore::new(&path);
        assert!(store.load().is_none());
        assert!(!store.is_paired());
    }

    #[test]
    fn clearing_a_missing_file_is_fine() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("credentials.json"));
        store.clear().unwrap();
        assert!(!store.is_paired());
    }
}
