use crate::error::ClubhouseError;
use crate::types::UserId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Full registry snapshot: user → absolute expiry instant.
pub type EntitlementSnapshot = BTreeMap<UserId, DateTime<Utc>>;

/// Durable home of the entitlement registry.
///
/// The registry is small, so it is always loaded and saved wholesale.
#[async_trait]
pub trait EntitlementRepository: Send + Sync {
    fn label(&self) -> &'static str;

    async fn load(&self) -> Result<EntitlementSnapshot, ClubhouseError>;

    /// Replace the stored snapshot. Must be durable when it returns `Ok`.
    async fn save(&self, snapshot: &EntitlementSnapshot) -> Result<(), ClubhouseError>;
}

/// Accepts both RFC 3339 instants and the legacy epoch-seconds format.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoredExpiry {
    Instant(DateTime<Utc>),
    EpochSeconds(f64),
}

impl StoredExpiry {
    fn into_instant(self, user: UserId) -> Result<DateTime<Utc>, ClubhouseError> {
        match self {
            Self::Instant(instant) => Ok(instant),
            Self::EpochSeconds(secs) => DateTime::<Utc>::from_timestamp_millis(
                (secs * 1000.0).round() as i64,
            )
            .ok_or_else(|| {
                ClubhouseError::Persistence(format!(
                    "expiry {secs} for user {user} is out of range"
                ))
            }),
        }
    }
}

/// Flat JSON file, rewritten through a temp file and rename on every save.
#[derive(Debug, Clone)]
pub struct JsonFileRepository {
    path: PathBuf,
}

impl JsonFileRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EntitlementRepository for JsonFileRepository {
    fn label(&self) -> &'static str {
        "json-file"
    }

    async fn load(&self) -> Result<EntitlementSnapshot, ClubhouseError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(EntitlementSnapshot::new())
            }
            Err(err) => return Err(ClubhouseError::persistence("entitlement file read failed", err)),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(EntitlementSnapshot::new());
        }

        let stored: BTreeMap<UserId, StoredExpiry> = serde_json::from_slice(&bytes)
            .map_err(|e| ClubhouseError::persistence("entitlement file decode failed", e))?;

        stored
            .into_iter()
            .map(|(user, expiry)| expiry.into_instant(user).map(|instant| (user, instant)))
            .collect()
    }

    async fn save(&self, snapshot: &EntitlementSnapshot) -> Result<(), ClubhouseError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ClubhouseError::persistence("entitlement dir create failed", e))?;
            }
        }

        let bytes = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| ClubhouseError::persistence("entitlement encode failed", e))?;
        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, bytes)
            .await
            .map_err(|e| ClubhouseError::persistence("entitlement temp write failed", e))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| ClubhouseError::persistence("entitlement rename failed", e))?;
        Ok(())
    }
}

/// In-process repository for tests; can be switched into a failing mode.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    snapshot: Mutex<EntitlementSnapshot>,
    fail_saves: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: EntitlementSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
            ..Self::default()
        }
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn stored(&self) -> EntitlementSnapshot {
        self.snapshot
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EntitlementRepository for MemoryRepository {
    fn label(&self) -> &'static str {
        "memory"
    }

    async fn load(&self) -> Result<EntitlementSnapshot, ClubhouseError> {
        self.snapshot
            .lock()
            .map(|guard| guard.clone())
            .map_err(|_| ClubhouseError::Persistence("snapshot lock poisoned".to_string()))
    }

    async fn save(&self, snapshot: &EntitlementSnapshot) -> Result<(), ClubhouseError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(ClubhouseError::Persistence(
                "memory repository configured to fail".to_string(),
            ));
        }
        let mut guard = self
            .snapshot
            .lock()
            .map_err(|_| ClubhouseError::Persistence("snapshot lock poisoned".to_string()))?;
        *guard = snapshot.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
