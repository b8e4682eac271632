//! Long-lived signing identity used to authenticate to the local ADB daemon.

mod certificate;
mod storage;

use std::{error::Error, sync::Arc};

use anyhow::{Context, Result};
use base64::{Engine, engine::general_purpose::STANDARD};
pub use certificate::{Identity, KEY_BITS, VALIDITY};
use derive_more::Debug;
pub use storage::{JsonFileStore, KeyValueStore, MemoryStore};
use tokio::sync::OnceCell;
use tracing::{info, instrument, warn};

/// Namespace holding the persisted identity
pub const KEYS_NAMESPACE: &str = "adb_keys";
pub const PRIVATE_KEY_SLOT: &str = "private_key";
pub const CERTIFICATE_SLOT: &str = "certificate";

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Failed to generate ADB keys: {0:#}")]
    Generation(anyhow::Error),
    #[error("Failed to save ADB keys: {0:#}")]
    Persist(anyhow::Error),
    #[error("Identity task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Owns the process' signing identity.
///
/// The identity is loaded (or generated and persisted) on first use, exactly
/// once, even when several callers race for it.
#[derive(Debug)]
pub struct IdentityStore {
    #[debug(skip)]
    storage: Arc<dyn KeyValueStore>,
    label: String,
    identity: OnceCell<Arc<Identity>>,
}

impl IdentityStore {
    pub fn new(storage: Arc<dyn KeyValueStore>, label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self { storage, label: label.into(), identity: OnceCell::new() })
    }

    /// Returns the identity, loading or generating it on first call
    pub async fn identity(&self) -> Result<Arc<Identity>, IdentityError> {
        self.identity
            .get_or_try_init(|| {
                let storage = self.storage.clone();
                let label = self.label.clone();
                async move {
                    // RSA generation and file I/O, keep them off the async workers
                    tokio::task::spawn_blocking(move || load_or_generate(storage.as_ref(), &label))
                        .await?
                        .map(Arc::new)
                }
            })
            .await
            .cloned()
    }
}

#[instrument(level = "debug", skip(storage))]
fn load_or_generate(storage: &dyn KeyValueStore, label: &str) -> Result<Identity, IdentityError> {
    match load(storage) {
        Ok(Some(identity)) => {
            info!("Loaded existing ADB identity");
            return Ok(identity);
        }
        Ok(None) => info!("No stored ADB identity, generating a new one"),
        Err(e) => {
            warn!(
                error = e.as_ref() as &dyn Error,
                "Stored ADB identity is unusable, generating a new one"
            );
        }
    }

    let identity = Identity::generate(label).map_err(IdentityError::Generation)?;
    save(storage, &identity).map_err(IdentityError::Persist)?;
    info!(ski = ?identity.subject_key_identifier(), "Generated and saved new ADB identity");
    Ok(identity)
}

/// Reads the identity from `storage`; `Ok(None)` when either slot is empty
fn load(storage: &dyn KeyValueStore) -> Result<Option<Identity>> {
    let key = storage.get(PRIVATE_KEY_SLOT).context("Failed to read private key slot")?;
    let cert = storage.get(CERTIFICATE_SLOT).context("Failed to read certificate slot")?;
    let (Some(key), Some(cert)) = (key, cert) else {
        return Ok(None);
    };
    if key.trim().is_empty() || cert.trim().is_empty() {
        return Ok(None);
    }

    let key = decode_base64(&key).context("Failed to decode private key")?;
    let cert = decode_base64(&cert).context("Failed to decode certificate")?;
    Identity::from_der(&key, &cert).map(Some)
}

fn save(storage: &dyn KeyValueStore, identity: &Identity) -> Result<()> {
    storage.put_all(&[
        (PRIVATE_KEY_SLOT, STANDARD.encode(identity.private_key_der())),
        (CERTIFICATE_SLOT, STANDARD.encode(identity.certificate_der())),
    ])
}

/// Decodes base64 that may be wrapped into MIME-style lines
fn decode_base64(encoded: &str) -> Result<Vec<u8>> {
    let compact: String = encoded.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    Ok(STANDARD.decode(compact)?)
}

/// One identity shared by every test in the process, RSA generation is slow
#[cfg(test)]
pub(crate) fn test_identity() -> Arc<Identity> {
    use std::sync::OnceLock;

    static IDENTITY: OnceLock<Arc<Identity>> = OnceLock::new();
    IDENTITY
        .get_or_init(|| Arc::new(Identity::generate("selfinstall").expect("generate identity")))
        .clone()
}

/// Memory storage pre-seeded with [`test_identity`]
#[cfg(test)]
pub(crate) fn seeded_storage() -> Arc<MemoryStore> {
    let storage = Arc::new(MemoryStore::new());
    let identity = test_identity();
    storage.set(PRIVATE_KEY_SLOT, STANDARD.encode(identity.private_key_der()));
    storage.set(CERTIFICATE_SLOT, STANDARD.encode(identity.certificate_der()));
    storage
}
