//! Local persistence for the session.
//!
//! The client only needs an opaque string key-value store. `SledStore` is the
//! on-disk implementation; `MemoryStore` backs tests and throwaway sessions.
//! `SessionVault` knows which keys the session lives under.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::warn;

use crate::error::StorageError;
use crate::models::{AuthTokens, User};

pub const ACCESS_TOKEN_KEY: &str = "access_token";
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";
pub const CURRENT_USER_KEY: &str = "current_user";

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Entries live in the `session` tree. The tree keeps its database open.
#[derive(Clone)]
pub struct SledStore {
    tree: sled::Tree,
}

impl SledStore {
    /// Open or create the sled database at `path`, using the `session` tree.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// A database that is deleted when dropped.
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StorageError> {
        let tree = db.open_tree("session")?;
        Ok(Self { tree })
    }
}

impl KeyValueStore for SledStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match self.tree.get(key.as_bytes())? {
            Some(bytes) => String::from_utf8(bytes.to_vec())
                .map(Some)
                .map_err(|_| StorageError::NotUtf8(key.to_string())),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.tree.insert(key.as_bytes(), value.as_bytes())?;
        self.tree.flush()?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.tree.remove(key.as_bytes())?;
        self.tree.flush()?;
        Ok(())
    }
}

/// Shared in-memory map. Clones see the same entries, which is how tests
/// simulate a process restart over the same device storage.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.lock().remove(key);
        Ok(())
    }
}

/// What was found in the store at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredSession {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub user: Option<User>,
}

#[derive(Clone)]
pub struct SessionVault {
    store: Arc<dyn KeyValueStore>,
}

impl SessionVault {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn save(&self, tokens: &AuthTokens, user: &User) -> Result<(), StorageError> {
        let user_json = serde_json::to_string(user)?;
        self.store.set(ACCESS_TOKEN_KEY, &tokens.access)?;
        self.store.set(REFRESH_TOKEN_KEY, &tokens.refresh)?;
        self.store.set(CURRENT_USER_KEY, &user_json)?;
        Ok(())
    }

    /// A stored user that no longer decodes is treated as absent.
    pub fn load(&self) -> Result<StoredSession, StorageError> {
        let access_token = self.store.get(ACCESS_TOKEN_KEY)?;
        let refresh_token = self.store.get(REFRESH_TOKEN_KEY)?;
        let user = match self.store.get(CURRENT_USER_KEY)? {
            Some(raw) => match serde_json::from_str::<User>(&raw) {
                Ok(user) => Some(user),
                Err(e) => {
                    warn!("Discarding unreadable stored user: {e}");
                    None
                }
            },
            None => None,
        };

        Ok(StoredSession {
            access_token,
            refresh_token,
            user,
        })
    }

    /// Removes all three keys; every removal is attempted even if one fails.
    pub fn clear(&self) -> Result<(), StorageError> {
        let results = [
            self.store.remove(ACCESS_TOKEN_KEY),
            self.store.remove(REFRESH_TOKEN_KEY),
            self.store.remove(CURRENT_USER_KEY),
        ];
        results.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_user() -> User {
        User {
            id: 7,
            username: "ana".to_string(),
            email: "ana@example.com".to_string(),
            date_joined: "2025-09-13T10:00:00Z".to_string(),
        }
    }

    fn sample_tokens() -> AuthTokens {
        AuthTokens {
            access: "access-1".to_string(),
            refresh: "refresh-1".to_string(),
        }
    }

    #[test]
    fn test_vault_round_trip_in_memory() {
        let store = MemoryStore::new();
        let vault = SessionVault::new(Arc::new(store.clone()));
        vault.save(&sample_tokens(), &sample_user()).unwrap();
        assert_eq!(store.len(), 3);

        let restored = SessionVault::new(Arc::new(store.clone())).load().unwrap();
        assert_eq!(restored.access_token.as_deref(), Some("access-1"));
        assert_eq!(restored.refresh_token.as_deref(), Some("refresh-1"));
        assert_eq!(restored.user, Some(sample_user()));

        vault.clear().unwrap();
        assert!(store.is_empty());
        assert_eq!(vault.load().unwrap(), StoredSession::default());
    }

    #[test]
    fn test_corrupt_user_is_dropped() {
        let store = MemoryStore::new();
        store.set(ACCESS_TOKEN_KEY, "a").unwrap();
        store.set(CURRENT_USER_KEY, "{not json").unwrap();

        let restored = SessionVault::new(Arc::new(store)).load().unwrap();
        assert_eq!(restored.access_token.as_deref(), Some("a"));
        assert!(restored.user.is_none());
    }

    #[test]
    fn test_temporary_sled_store() {
        let store = SledStore::temporary().unwrap();
        let vault = SessionVault::new(Arc::new(store.clone()));
        vault.save(&sample_tokens(), &sample_user()).unwrap();
        assert_eq!(store.get(REFRESH_TOKEN_KEY).unwrap().as_deref(), Some("refresh-1"));

        vault.clear().unwrap();
        assert_eq!(vault.load().unwrap(), StoredSession::default());
    }

    #[test]
    fn test_sled_store_persists_across_reopen() {
        // Use temp dir for isolated test DB
        let temp_dir = std::env::temp_dir().join(format!("featurevote_test_{}", uuid::Uuid::new_v4()));

        {
            let store = SledStore::open(&temp_dir).expect("Failed to open store");
            SessionVault::new(Arc::new(store))
                .save(&sample_tokens(), &sample_user())
                .expect("Save failed");
        }

        let store = SledStore::open(&temp_dir).expect("Failed to reopen store");
        let restored = SessionVault::new(Arc::new(store.clone())).load().unwrap();
        assert_eq!(restored.user.map(|u| u.id), Some(7));
        assert_eq!(store.get(ACCESS_TOKEN_KEY).unwrap().as_deref(), Some("access-1"));

        store.remove(ACCESS_TOKEN_KEY).unwrap();
        assert_eq!(store.get(ACCESS_TOKEN_KEY).unwrap(), None);

        drop(store);
        let _ = std::fs::remove_dir_all(temp_dir);
    }
}
