//! Persistent device identity → public backend id mapping.
//!
//! One record per device. The first registration mints a short random
//! `backend_id`; every later registration with the same device id gets the
//! same id back and can only change the display name. The whole table is a
//! single JSON document rewritten atomically on each change.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// File name of the registry inside the data directory.
pub const REGISTRY_FILE: &str = "registry.json";

/// Length of generated backend ids.
const BACKEND_ID_LEN: usize = 12;

/// Longest accepted device id.
const MAX_DEVICE_ID_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("registry JSON error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid device id")]
    InvalidDeviceId,
}

/// A persisted registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendRegistration {
    pub device_id: String,
    pub backend_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Default, Serialize, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    backends: Vec<BackendRegistration>,
}

/// The registry. Owned by the gateway reactor; not shared.
pub struct Registry {
    path: Option<PathBuf>,
    by_device: HashMap<String, BackendRegistration>,
}

impl Registry {
    /// Load the registry at `path`; a missing file is an empty registry.
    pub async fn open(path: &Path) -> Result<Self, RegistryError> {
        let by_device = match tokio::fs::read(path).await {
            Ok(bytes) => {
                let doc: RegistryDocument =
                    serde_json::from_slice(&bytes).map_err(|source| RegistryError::Json {
                        path: path.to_path_buf(),
                        source,
                    })?;
                doc.backends
                    .into_iter()
                    .map(|r| (r.device_id.clone(), r))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(source) => {
                return Err(RegistryError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        info!(path = %path.display(), backends = by_device.len(), "Loaded backend registry");
        Ok(Self {
            path: Some(path.to_path_buf()),
            by_device,
        })
    }

    /// A registry that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            by_device: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.by_device.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_device.is_empty()
    }

    pub fn get(&self, device_id: &str) -> Option<&BackendRegistration> {
        self.by_device.get(device_id)
    }

    /// Return the backend id for `device_id`, minting and persisting one on
    /// first sight. A changed display name is persisted; the id never is.
    pub async fn get_or_create_backend_id(
        &mut self,
        device_id: &str,
        display_name: Option<&str>,
    ) -> Result<String, RegistryError> {
        if device_id.is_empty() || device_id.len() > MAX_DEVICE_ID_LEN {
            return Err(RegistryError::InvalidDeviceId);
        }
        let now = crate::util::now_ms();

        if let Some(existing) = self.by_device.get_mut(device_id) {
            let backend_id = existing.backend_id.clone();
            if let Some(name) = display_name {
                if existing.display_name.as_deref() != Some(name) {
                    let previous = existing.clone();
                    existing.display_name = Some(name.to_string());
                    existing.updated_at = now;
                    if let Err(e) = self.persist().await {
                        self.by_device.insert(device_id.to_string(), previous);
                        return Err(e);
                    }
                    debug!(backend_id = %backend_id, "Updated backend display name");
                }
            }
            return Ok(backend_id);
        }

        let backend_id = self.fresh_backend_id();
        self.by_device.insert(
            device_id.to_string(),
            BackendRegistration {
                device_id: device_id.to_string(),
                backend_id: backend_id.clone(),
                display_name: display_name.map(ToString::to_string),
                created_at: now,
                updated_at: now,
            },
        );
        if let Err(e) = self.persist().await {
            self.by_device.remove(device_id);
            return Err(e);
        }
        info!(backend_id = %backend_id, "Registered new backend");
        Ok(backend_id)
    }

    fn fresh_backend_id(&self) -> String {
        loop {
            let candidate = generate_backend_id();
            if !self.by_device.values().any(|r| r.backend_id == candidate) {
                return candidate;
            }
        }
    }

    async fn persist(&self) -> Result<(), RegistryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut backends: Vec<BackendRegistration> = self.by_device.values().cloned().collect();
        backends.sort_by_key(|r| r.created_at);
        let doc = RegistryDocument { backends };
        let bytes = serde_json::to_vec_pretty(&doc).map_err(|source| RegistryError::Json {
            path: path.clone(),
            source,
        })?;
        crate::util::write_atomic(path, &bytes)
            .await
            .map_err(|source| RegistryError::Io {
                path: path.clone(),
                source,
            })
    }
}

/// Short URL-safe id drawn from UUID v4 randomness (lowercase hex).
fn generate_backend_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(BACKEND_ID_LEN);
    id
}
