//! Identity and credential store.
//!
//! One JSON record per identity lives in `<state_dir>/<identity>.conf`:
//!
//! ```json
//! {"client":{"user":"...","password":"<hash>","permissions":{"subscribe":[],"publish":[]}},
//!  "key":{"private":"..."},
//!  "vbus":{"url":"...","hostname":"..."}}
//! ```
//!
//! The record is created on first run with a random password whose Argon2
//! hash is the public credential handed to the authorization service. Every
//! mutation happens under the store's lock and is persisted before the lock
//! is released.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use bytes::Bytes;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};
use vbus_types::{Permissions, VbusError, VbusResult};
use vbus_wire::Credentials;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Length of generated passwords.
pub const PASSWORD_LENGTH: usize = 22;

const PASSWORD_CHARSET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789!@$#%^&*()";

/// Public half of the record, sent to the authorization service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSection {
    pub user: String,
    /// PHC-formatted password hash.
    pub password: String,
    #[serde(default)]
    pub permissions: Permissions,
}

/// Private password.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeySection {
    pub private: String,
}

impl std::fmt::Debug for KeySection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySection")
            .field("private", &"<redacted>")
            .finish()
    }
}

/// Last known broker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

/// Persisted identity record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub client: ClientSection,
    pub key: KeySection,
    #[serde(default)]
    pub vbus: BrokerSection,
}

impl IdentityRecord {
    /// A fresh record for `identity` with default grants on `service_id`.
    pub fn generate(service_id: &str, identity: &str) -> VbusResult<Self> {
        let password = generate_password();
        let hash = hash_password(&password)?;
        Ok(Self {
            client: ClientSection {
                user: identity.to_string(),
                password: hash,
                permissions: Permissions::for_service(service_id),
            },
            key: KeySection {
                private: password.to_string(),
            },
            vbus: BrokerSection::default(),
        })
    }
}

/// Random password over letters, digits and `!@$#%^&*()`.
pub fn generate_password() -> Zeroizing<String> {
    let mut rng = OsRng;
    let password: String = (0..PASSWORD_LENGTH)
        .map(|_| PASSWORD_CHARSET[rng.gen_range(0..PASSWORD_CHARSET.len())] as char)
        .collect();
    Zeroizing::new(password)
}

/// Argon2id hash in PHC string format.
pub fn hash_password(password: &str) -> VbusResult<String> {
    let mut salt_bytes = [0u8; 16];
    OsRng.fill_bytes(&mut salt_bytes);
    let salt =
        SaltString::encode_b64(&salt_bytes).map_err(|e| VbusError::Internal(e.to_string()))?;
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| VbusError::Internal(format!("password hashing failed: {e}")))?;
    Ok(hash.to_string())
}

/// Check `password` against a PHC hash.
pub fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Process-wide owner of the identity record.
pub struct IdentityStore {
    path: PathBuf,
    record: Mutex<IdentityRecord>,
}

impl IdentityStore {
    /// Record file for `identity` inside `state_dir`.
    pub fn record_path(state_dir: &Path, identity: &str) -> PathBuf {
        state_dir.join(format!("{identity}.conf"))
    }

    /// Load the record for `identity`, creating and persisting it on first
    /// run. The flag is true when the record was created.
    pub fn open(state_dir: &Path, service_id: &str, identity: &str) -> VbusResult<(Self, bool)> {
        std::fs::create_dir_all(state_dir)?;
        let path = Self::record_path(state_dir, identity);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            let record: IdentityRecord = serde_json::from_str(&contents).map_err(|e| {
                VbusError::Config(format!("invalid identity record {}: {e}", path.display()))
            })?;
            info!(identity, path = %path.display(), "Loaded identity record");
            return Ok((
                Self {
                    path,
                    record: Mutex::new(record),
                },
                false,
            ));
        }

        let record = IdentityRecord::generate(service_id, identity)?;
        let store = Self {
            path,
            record: Mutex::new(record),
        };
        store.persist()?;
        info!(identity, path = %store.path.display(), "Created identity record");
        Ok((store, true))
    }

    fn lock(&self) -> MutexGuard<'_, IdentityRecord> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self) -> IdentityRecord {
        self.lock().clone()
    }

    pub fn identity(&self) -> String {
        self.lock().client.user.clone()
    }

    /// Credentials for connecting as this identity.
    pub fn credentials(&self) -> Credentials {
        let record = self.lock();
        Credentials::new(record.client.user.clone(), record.key.private.clone())
    }

    pub fn permissions(&self) -> Permissions {
        self.lock().client.permissions.clone()
    }

    pub fn broker_url(&self) -> Option<String> {
        self.lock().vbus.url.clone()
    }

    pub fn hostname(&self) -> Option<String> {
        self.lock().vbus.hostname.clone()
    }

    /// Record the resolved broker and persist.
    pub fn set_broker(&self, url: &str, hostname: &str) -> VbusResult<()> {
        let mut record = self.lock();
        record.vbus.url = Some(url.to_string());
        record.vbus.hostname = Some(hostname.to_string());
        write_record(&self.path, &record)
    }

    /// The `client` section as sent on `system.authorization.<host>.add`.
    pub fn registration_payload(&self) -> VbusResult<Bytes> {
        let record = self.lock();
        Ok(Bytes::from(serde_json::to_vec(&record.client)?))
    }

    /// Add a confirmed grant and persist. Returns false if it was there.
    pub fn grant_permission(&self, permission: &str) -> VbusResult<bool> {
        let mut record = self.lock();
        if !record.client.permissions.grant(permission) {
            return Ok(false);
        }
        write_record(&self.path, &record)?;
        Ok(true)
    }

    /// Write the record to disk.
    pub fn persist(&self) -> VbusResult<()> {
        let record = self.lock();
        write_record(&self.path, &record)
    }
}

impl std::fmt::Debug for IdentityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityStore")
            .field("path", &self.path)
            .finish()
    }
}

/// Write through a temporary file so a crash never leaves half a record.
fn write_record(path: &Path, record: &IdentityRecord) -> VbusResult<()> {
    let json = Zeroizing::new(serde_json::to_string_pretty(record)?);
    let tmp = path.with_extension("conf.tmp");
    std::fs::write(&tmp, json.as_bytes())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
    }
    std::fs::rename(&tmp, path)?;
    debug!(path = %path.display(), "Identity record persisted");
    Ok(())
}
