//! Stable per-installation device identity for the backend side.
//!
//! The token lives in `<data_dir>/device_id` and is created once. It is what the
//! gateway's registry keys on, so it must survive restarts and reconnects.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;
use tracing::info;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed to access device identity at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("device identity file {0} is empty or corrupt")]
    Corrupt(PathBuf),
}

/// File name of the identity token inside the data directory.
pub const IDENTITY_FILE: &str = "device_id";

/// An opaque, stable device token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
}

impl DeviceIdentity {
    /// Read the identity at `path`, creating it when the file does not exist.
    ///
    /// An existing file that does not contain a usable token is an error.
    /// Regenerating would silently change the backend's public id.
    pub async fn load_or_create(path: &Path) -> Result<Self, IdentityError> {
        match fs::read_to_string(path).await {
            Ok(content) => {
                let device_id = content.trim();
                if !is_valid_token(device_id) {
                    return Err(IdentityError::Corrupt(path.to_path_buf()));
                }
                Ok(Self {
                    device_id: device_id.to_string(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let device_id = uuid::Uuid::new_v4().to_string();
                crate::util::write_atomic(path, device_id.as_bytes())
                    .await
                    .map_err(|source| IdentityError::Io {
                        path: path.to_path_buf(),
                        source,
                    })?;
                info!(path = %path.display(), "Created new device identity");
                Ok(Self { device_id })
            }
            Err(source) => Err(IdentityError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Resolve the identity inside `data_dir`.
    pub async fn in_dir(data_dir: &Path) -> Result<Self, IdentityError> {
        Self::load_or_create(&data_dir.join(IDENTITY_FILE)).await
    }
}

fn is_valid_token(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 128
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn identity_is_stable_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let first = DeviceIdentity::in_dir(dir.path()).await.unwrap();
        let second = DeviceIdentity::in_dir(dir.path()).await.unwrap();
        assert_eq!(first, second);
        assert!(!first.device_id.is_empty());
    }

    #[tokio::test]
    async fn corrupt_identity_is_not_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(IDENTITY_FILE);
        std::fs::write(&path, "  \n").unwrap();
        let err = DeviceIdentity::load_or_create(&path).await.unwrap_err();
        assert!(matches!(err, IdentityError::Corrupt(_)));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "  \n");
    }

    #[tokio::test]
    async fn existing_token_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(IDENTITY_FILE);
        std::fs::write(&path, "device-42\n").unwrap();
        let id = DeviceIdentity::load_or_create(&path).await.unwrap();
        assert_eq!(id.device_id, "device-42");
    }
}
