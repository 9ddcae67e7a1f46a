//! Credential storage: the durable record produced by pair-setup and
//! consumed by pair-verify on every subsequent connection.

use crate::protocol::crypto::Ed25519KeyPair;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

mod hex32 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        hex::encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(&text).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes of hex"))
    }
}

/// One long-term key-exchange identity: either the primary (AirPlay)
/// credential or the bundled Companion-variant one, which has the
/// identical shape (§3 "Credential record").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialHalf {
    #[serde(rename = "clientId")]
    pub client_identifier: String,
    #[serde(rename = "clientLTSK", with = "hex32")]
    pub client_long_term_private: [u8; 32],
    #[serde(rename = "clientLTPK", with = "hex32")]
    pub client_long_term_public: [u8; 32],
    #[serde(rename = "serverLTPK", with = "hex32")]
    pub server_long_term_public: [u8; 32],
    #[serde(rename = "serverId")]
    pub server_identifier: String,
}

impl CredentialHalf {
    /// Check that the stored public key actually matches the stored seed,
    /// per the record's self-consistency invariant.
    #[must_use]
    pub fn is_self_consistent(&self) -> bool {
        match Ed25519KeyPair::from_bytes(&self.client_long_term_private) {
            Ok(keypair) => keypair.public_key().as_bytes() == &self.client_long_term_public,
            Err(_) => false,
        }
    }
}

/// Durable result of pair-setup: the primary credential plus an optional
/// bundled Companion-variant credential of identical shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    #[serde(flatten)]
    pub primary: CredentialHalf,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub companion: Option<CredentialHalf>,
}

/// Abstract storage interface for device credentials. The serializer
/// never persists session material, only the long-term identity.
pub trait CredentialStorage: Send + Sync {
    /// Load the credential for a device.
    fn load(&self, device_id: &str) -> Option<Credential>;

    /// Save the credential for a device.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    fn save(&mut self, device_id: &str, credential: &Credential) -> Result<(), StorageError>;

    /// Remove the credential for a device.
    ///
    /// # Errors
    ///
    /// Returns an error if removal fails.
    fn remove(&mut self, device_id: &str) -> Result<(), StorageError>;

    /// List all device IDs with stored credentials.
    fn list_devices(&self) -> Vec<String>;
}

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage not available")]
    NotAvailable,
}

/// In-memory credential storage (non-persistent)
#[derive(Debug, Default)]
pub struct MemoryStorage {
    credentials: HashMap<String, Credential>,
}

impl MemoryStorage {
    /// Create a new in-memory storage
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStorage for MemoryStorage {
    fn load(&self, device_id: &str) -> Option<Credential> {
        self.credentials.get(device_id).cloned()
    }

    fn save(&mut self, device_id: &str, credential: &Credential) -> Result<(), StorageError> {
        self.credentials.insert(device_id.to_string(), credential.clone());
        Ok(())
    }

    fn remove(&mut self, device_id: &str) -> Result<(), StorageError> {
        self.credentials.remove(device_id);
        Ok(())
    }

    fn list_devices(&self) -> Vec<String> {
        self.credentials.keys().cloned().collect()
    }
}

/// File-based credential storage, one JSON object per device keyed by
/// device ID in a single file.
pub struct FileStorage {
    path: std::path::PathBuf,
    cache: HashMap<String, Credential>,
}

impl FileStorage {
    /// Create file storage at the given path
    ///
    /// # Errors
    ///
    /// Returns error if the parent directory cannot be created or the
    /// existing file cannot be parsed.
    pub fn new(path: impl AsRef<std::path::Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let cache = Self::load_all(&path)?;

        Ok(Self { path, cache })
    }

    fn load_all(path: &std::path::Path) -> Result<HashMap<String, Credential>, StorageError> {
        if !path.exists() {
            return Ok(HashMap::new());
        }

        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let cache = serde_json::from_reader(reader)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        Ok(cache)
    }

    fn save_all(&self) -> Result<(), StorageError> {
        let file = std::fs::File::create(&self.path)?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(writer, &self.cache)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        Ok(())
    }
}

impl CredentialStorage for FileStorage {
    fn load(&self, device_id: &str) -> Option<Credential> {
        self.cache.get(device_id).cloned()
    }

    fn save(&mut self, device_id: &str, credential: &Credential) -> Result<(), StorageError> {
        self.cache.insert(device_id.to_string(), credential.clone());
        self.save_all()
    }

    fn remove(&mut self, device_id: &str) -> Result<(), StorageError> {
        self.cache.remove(device_id);
        self.save_all()
    }

    fn list_devices(&self) -> Vec<String> {
        self.cache.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_half() -> CredentialHalf {
        CredentialHalf {
            client_identifier: "11111111-1111-1111-1111-111111111111".to_string(),
            client_long_term_private: [0x11; 32],
            client_long_term_public: [0x22; 32],
            server_long_term_public: [0x33; 32],
            server_identifier: "device-1".to_string(),
        }
    }

    #[test]
    fn serializes_to_the_documented_json_shape() {
        let credential = Credential {
            primary: sample_half(),
            companion: None,
        };
        let json = serde_json::to_value(&credential).unwrap();
        assert_eq!(json["clientId"], "11111111-1111-1111-1111-111111111111");
        assert_eq!(json["clientLTSK"], "11".repeat(32));
        assert_eq!(json["clientLTPK"], "22".repeat(32));
        assert_eq!(json["serverLTPK"], "33".repeat(32));
        assert_eq!(json["serverId"], "device-1");
        assert!(json.get("companion").is_none());
    }

    #[test]
    fn round_trips_with_a_nested_companion_credential() {
        let mut companion_half = sample_half();
        companion_half.server_identifier = "device-1-companion".to_string();

        let credential = Credential {
            primary: sample_half(),
            companion: Some(companion_half),
        };

        let json = serde_json::to_string(&credential).unwrap();
        let decoded: Credential = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.companion.unwrap().server_identifier, "device-1-companion");
    }

    #[test]
    fn memory_storage_round_trips() {
        let mut storage = MemoryStorage::new();
        let credential = Credential {
            primary: sample_half(),
            companion: None,
        };
        storage.save("dev-1", &credential).unwrap();
        assert_eq!(
            storage.load("dev-1").unwrap().primary.server_identifier,
            "device-1"
        );
        storage.remove("dev-1").unwrap();
        assert!(storage.load("dev-1").is_none());
    }
}
