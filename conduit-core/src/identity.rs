//! Persistent per-instance identity key.

use std::fmt;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::InstanceError;

const IDENTITY_FILE: &str = "identity.key";
const KEY_LEN: usize = 32;

/// Key material that identifies one instance across restarts.
#[derive(Clone, PartialEq, Eq)]
pub struct InstanceIdentity {
    key: [u8; KEY_LEN],
}

impl InstanceIdentity {
    /// Loads the identity stored in `data_dir`, creating it on first run.
    ///
    /// # Errors
    ///
    /// - `InstanceError::Identity` - If the key file is unreadable, malformed
    ///   or cannot be written
    pub async fn load_or_create(data_dir: &Path) -> Result<Self, InstanceError> {
        let path = identity_path(data_dir);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Self::parse(&text).map_err(|reason| InstanceError::Identity {
                reason: format!("{}: {reason}", path.display()),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let identity = Self {
                    key: rand::random(),
                };
                identity.persist(&path).await?;
                tracing::info!("Generated new identity {}", identity.fingerprint());
                Ok(identity)
            }
            Err(e) => Err(InstanceError::Identity {
                reason: format!("failed to read {}: {e}", path.display()),
            }),
        }
    }

    /// Short printable identifier derived from the key.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.key[..8])
    }

    fn parse(text: &str) -> Result<Self, String> {
        let bytes = hex::decode(text.trim()).map_err(|e| format!("invalid key encoding: {e}"))?;
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|bytes: Vec<u8>| format!("expected {KEY_LEN} key bytes, found {}", bytes.len()))?;
        Ok(Self { key })
    }

    async fn persist(&self, path: &Path) -> Result<(), InstanceError> {
        let write_error = |e: std::io::Error| InstanceError::Identity {
            reason: format!("failed to write {}: {e}", path.display()),
        };

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(path).await.map_err(write_error)?;
        file.write_all(hex::encode(self.key).as_bytes())
            .await
            .map_err(write_error)?;
        file.sync_all().await.map_err(write_error)
    }
}

impl fmt::Debug for InstanceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceIdentity")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

fn identity_path(data_dir: &Path) -> PathBuf {
    data_dir.join(IDENTITY_FILE)
}
