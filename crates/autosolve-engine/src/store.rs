use std::path::{Path, PathBuf};

use async_trait::async_trait;
use autosolve_core::{AttemptUpdate, AutoSolveError, SolveAttempt};
use dashmap::DashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Attempt not found: {0}")]
    NotFound(String),
    #[error("Invalid attempt id: {0}")]
    InvalidId(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for AutoSolveError {
    fn from(e: StoreError) -> Self {
        AutoSolveError::Store(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Persistence for attempt records, keyed by attempt id.
#[async_trait]
pub trait AttemptStore: Send + Sync {
    async fn insert(&self, attempt: &SolveAttempt) -> Result<()>;

    /// Merge `update` into the stored record and return the result.
    async fn update(&self, id: &str, update: &AttemptUpdate) -> Result<SolveAttempt>;

    async fn get(&self, id: &str) -> Result<Option<SolveAttempt>>;

    /// Attempts for one challenge, newest first.
    async fn list_by_challenge(&self, challenge_id: &str) -> Result<Vec<SolveAttempt>>;
}

fn newest_first(attempts: &mut [SolveAttempt]) {
    attempts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Debug, Default)]
pub struct MemoryAttemptStore {
    attempts: DashMap<String, SolveAttempt>,
}

impl MemoryAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}

#[async_trait]
impl AttemptStore for MemoryAttemptStore {
    async fn insert(&self, attempt: &SolveAttempt) -> Result<()> {
        self.attempts.insert(attempt.id.clone(), attempt.clone());
        Ok(())
    }

    async fn update(&self, id: &str, update: &AttemptUpdate) -> Result<SolveAttempt> {
        let mut entry = self
            .attempts
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        update.apply(&mut entry);
        Ok(entry.clone())
    }

    async fn get(&self, id: &str) -> Result<Option<SolveAttempt>> {
        Ok(self.attempts.get(id).map(|a| a.clone()))
    }

    async fn list_by_challenge(&self, challenge_id: &str) -> Result<Vec<SolveAttempt>> {
        let mut found: Vec<SolveAttempt> = self
            .attempts
            .iter()
            .filter(|a| a.challenge_id.as_deref() == Some(challenge_id))
            .map(|a| a.clone())
            .collect();
        newest_first(&mut found);
        Ok(found)
    }
}

// =============================================================================
// JSON files
// =============================================================================

/// One `<id>.json` file per attempt.
#[derive(Debug, Clone)]
pub struct JsonAttemptStore {
    dir: PathBuf,
}

impl JsonAttemptStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        tracing::info!("Attempt records stored in {:?}", dir);
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> Result<PathBuf> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        match valid {
            true => Ok(self.dir.join(format!("{id}.json"))),
            false => Err(StoreError::InvalidId(id.to_string())),
        }
    }

    async fn write(&self, attempt: &SolveAttempt) -> Result<()> {
        let path = self.record_path(&attempt.id)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(attempt)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn read(&self, path: &Path) -> Result<Option<SolveAttempt>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl AttemptStore for JsonAttemptStore {
    async fn insert(&self, attempt: &SolveAttempt) -> Result<()> {
        self.write(attempt).await
    }

    async fn update(&self, id: &str, update: &AttemptUpdate) -> Result<SolveAttempt> {
        let path = self.record_path(id)?;
        let mut attempt = self
            .read(&path)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        update.apply(&mut attempt);
        self.write(&attempt).await?;
        Ok(attempt)
    }

    async fn get(&self, id: &str) -> Result<Option<SolveAttempt>> {
        let path = self.record_path(id)?;
        self.read(&path).await
    }

    async fn list_by_challenge(&self, challenge_id: &str) -> Result<Vec<SolveAttempt>> {
        let mut found = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            // Skip records that no longer parse rather than failing the listing.
            let Ok(Some(attempt)) = self.read(&path).await else {
                tracing::warn!("Skipping unreadable attempt record {:?}", path);
                continue;
            };
            if attempt.challenge_id.as_deref() == Some(challenge_id) {
                found.push(attempt);
            }
        }
        newest_first(&mut found);
        Ok(found)
    }
}
