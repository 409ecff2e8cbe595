//! Run / match / opportunity record sets and optimistic-concurrency stores for Edgebook.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use edgebook_core::{Match, Opportunity, Run};
use fs4::fs_std::FileExt;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "edgebook-storage";

pub const RUNS_FILE: &str = "runs.json";
pub const MATCHES_FILE: &str = "matches.json";
pub const OPPORTUNITIES_FILE: &str = "opportunities.json";
pub const LOCK_FILE: &str = ".edgebook.lock";

/// Consistent snapshot of the three related record sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Dataset {
    #[serde(default)]
    pub runs: Vec<Run>,
    #[serde(default)]
    pub matches: Vec<Match>,
    #[serde(default)]
    pub opportunities: Vec<Opportunity>,
}

impl Dataset {
    pub fn run(&self, run_id: Uuid) -> Option<&Run> {
        self.runs.iter().find(|r| r.id == run_id)
    }

    pub fn opportunity(&self, id: Uuid) -> Option<&Opportunity> {
        self.opportunities.iter().find(|o| o.id == id)
    }

    /// Matches are looked up by domain id across all runs; the most recent write wins.
    pub fn find_match(&self, match_id: i64) -> Option<&Match> {
        self.matches.iter().rev().find(|m| m.match_id == match_id)
    }

    pub fn run_index(&self) -> HashMap<Uuid, &Run> {
        self.runs.iter().map(|r| (r.id, r)).collect()
    }

    pub fn match_ids(&self) -> HashSet<i64> {
        self.matches.iter().map(|m| m.match_id).collect()
    }

    /// Deletes a run together with the matches and opportunities it owns.
    pub fn remove_run(&mut self, run_id: Uuid) -> bool {
        let before = self.runs.len();
        self.runs.retain(|r| r.id != run_id);
        if self.runs.len() == before {
            return false;
        }
        self.matches.retain(|m| m.run_id != run_id);
        self.opportunities.retain(|o| o.run_id != run_id);
        true
    }

    /// Runs other than `keep` that no longer own any opportunity.
    pub fn orphan_runs(&self, keep: Uuid) -> Vec<Uuid> {
        let owners: HashSet<Uuid> = self.opportunities.iter().map(|o| o.run_id).collect();
        self.runs
            .iter()
            .filter(|r| r.id != keep && !owners.contains(&r.id))
            .map(|r| r.id)
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("write conflict on opportunity {id}: expected version {expected}, found {actual}")]
    Conflict { id: Uuid, expected: u64, actual: u64 },
    #[error("opportunity {id} not found")]
    NotFound { id: Uuid },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid json at {path}: {source}")]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("record {id} changed since the dataset was loaded")]
    StaleSnapshot { id: Uuid },
}

/// Read/write access to the persisted record sets.
///
/// Single-record updates go through [`OpportunityStore::compare_and_swap`], which
/// only succeeds when the caller saw the latest version of the record.
#[async_trait]
pub trait OpportunityStore: Send + Sync {
    async fn load(&self) -> Result<Dataset, StoreError>;

    /// Replaces all three record sets with `next`. Used by batch intake.
    ///
    /// `base` is the snapshot `next` was derived from. The write is refused with
    /// [`StoreError::StaleSnapshot`] when any run or opportunity was added,
    /// removed or re-versioned since `base` was loaded.
    async fn save(&self, base: &Dataset, next: &Dataset) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Opportunity, StoreError>;

    /// Writes `updated` if the stored version still equals `expected_version`.
    /// Returns the stored record with its bumped version.
    async fn compare_and_swap(
        &self,
        expected_version: u64,
        updated: Opportunity,
    ) -> Result<Opportunity, StoreError>;
}

fn ensure_unchanged(stored: &Dataset, base: &Dataset) -> Result<(), StoreError> {
    let seen: HashMap<Uuid, u64> = base.opportunities.iter().map(|o| (o.id, o.version)).collect();
    if let Some(changed) = stored
        .opportunities
        .iter()
        .find(|o| seen.get(&o.id) != Some(&o.version))
    {
        return Err(StoreError::StaleSnapshot { id: changed.id });
    }
    let present: HashSet<Uuid> = stored.opportunities.iter().map(|o| o.id).collect();
    if let Some(removed) = base.opportunities.iter().find(|o| !present.contains(&o.id)) {
        return Err(StoreError::StaleSnapshot { id: removed.id });
    }

    let base_runs: HashSet<Uuid> = base.runs.iter().map(|r| r.id).collect();
    let stored_runs: HashSet<Uuid> = stored.runs.iter().map(|r| r.id).collect();
    if let Some(run_id) = stored_runs.symmetric_difference(&base_runs).next() {
        return Err(StoreError::StaleSnapshot { id: *run_id });
    }
    Ok(())
}

fn swap_in(
    opportunities: &mut [Opportunity],
    expected_version: u64,
    mut updated: Opportunity,
) -> Result<Opportunity, StoreError> {
    let slot = opportunities
        .iter_mut()
        .find(|o| o.id == updated.id)
        .ok_or(StoreError::NotFound { id: updated.id })?;
    if slot.version != expected_version {
        return Err(StoreError::Conflict {
            id: updated.id,
            expected: expected_version,
            actual: slot.version,
        });
    }
    updated.version = expected_version + 1;
    *slot = updated.clone();
    Ok(updated)
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<Dataset>,
}

impl MemoryStore {
    pub fn new(dataset: Dataset) -> Self {
        Self {
            state: Mutex::new(dataset),
        }
    }
}

#[async_trait]
impl OpportunityStore for MemoryStore {
    async fn load(&self) -> Result<Dataset, StoreError> {
        Ok(self.state.lock().await.clone())
    }

    async fn save(&self, base: &Dataset, next: &Dataset) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        ensure_unchanged(&state, base)?;
        *state = next.clone();
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Opportunity, StoreError> {
        self.state
            .lock()
            .await
            .opportunity(id)
            .cloned()
            .ok_or(StoreError::NotFound { id })
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        updated: Opportunity,
    ) -> Result<Opportunity, StoreError> {
        let mut state = self.state.lock().await;
        swap_in(&mut state.opportunities, expected_version, updated)
    }
}

/// Held while a process reads or rewrites the record-set files. Dropping it
/// closes the lock file, which releases the advisory lock.
#[derive(Debug)]
struct StoreLock {
    _file: std::fs::File,
}

/// Directory of JSON record-set files written with atomic temp-file renames.
///
/// Every multi-file read and every write holds an exclusive advisory lock on
/// [`LOCK_FILE`], so separate processes sharing the directory never interleave.
#[derive(Debug)]
pub struct JsonFileStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn read_set<T: DeserializeOwned>(&self, name: &str) -> Result<Vec<T>, StoreError> {
        let path = self.root.join(name);
        match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StoreError::Serde { path, source }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "record set missing, treating as empty");
                Ok(Vec::new())
            }
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    async fn write_set<T: Serialize>(&self, name: &str, rows: &[T]) -> Result<(), StoreError> {
        let path = self.root.join(name);
        let bytes = serde_json::to_vec_pretty(rows).map_err(|source| StoreError::Serde {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, &bytes).await
    }

    async fn lock_files(&self) -> Result<StoreLock, StoreError> {
        fs::create_dir_all(&self.root).await.map_err(io_err(&self.root))?;
        let path = self.root.join(LOCK_FILE);
        let lock_path = path.clone();
        let file = tokio::task::spawn_blocking(move || -> std::io::Result<std::fs::File> {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&lock_path)?;
            FileExt::lock_exclusive(&file)?;
            Ok(file)
        })
        .await
        .map_err(|err| StoreError::Io {
            path: path.clone(),
            source: std::io::Error::other(err),
        })?
        .map_err(io_err(&path))?;
        Ok(StoreLock { _file: file })
    }

    async fn load_unlocked(&self) -> Result<Dataset, StoreError> {
        Ok(Dataset {
            runs: self.read_set(RUNS_FILE).await?,
            matches: self.read_set(MATCHES_FILE).await?,
            opportunities: self.read_set(OPPORTUNITIES_FILE).await?,
        })
    }
}

#[async_trait]
impl OpportunityStore for JsonFileStore {
    async fn load(&self) -> Result<Dataset, StoreError> {
        if !fs::try_exists(&self.root).await.map_err(io_err(&self.root))? {
            debug!(root = %self.root.display(), "data directory missing, treating as empty");
            return Ok(Dataset::default());
        }
        let _guard = self.write_lock.lock().await;
        let _files = self.lock_files().await?;
        self.load_unlocked().await
    }

    async fn save(&self, base: &Dataset, next: &Dataset) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let _files = self.lock_files().await?;
        let stored = self.load_unlocked().await?;
        ensure_unchanged(&stored, base)?;
        debug!(
            root = %self.root.display(),
            runs = next.runs.len(),
            matches = next.matches.len(),
            opportunities = next.opportunities.len(),
            "saving dataset"
        );
        self.write_set(RUNS_FILE, &next.runs).await?;
        self.write_set(MATCHES_FILE, &next.matches).await?;
        self.write_set(OPPORTUNITIES_FILE, &next.opportunities).await
    }

    async fn get(&self, id: Uuid) -> Result<Opportunity, StoreError> {
        let opportunities: Vec<Opportunity> = self.read_set(OPPORTUNITIES_FILE).await?;
        opportunities
            .into_iter()
            .find(|o| o.id == id)
            .ok_or(StoreError::NotFound { id })
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        updated: Opportunity,
    ) -> Result<Opportunity, StoreError> {
        let _guard = self.write_lock.lock().await;
        let _files = self.lock_files().await?;
        let mut opportunities: Vec<Opportunity> = self.read_set(OPPORTUNITIES_FILE).await?;
        let stored = swap_in(&mut opportunities, expected_version, updated)?;
        self.write_set(OPPORTUNITIES_FILE, &opportunities).await?;
        Ok(stored)
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError {
    let path = path.to_path_buf();
    move |source| StoreError::Io { path, source }
}

/// Write bytes through a sibling temp file and rename it into place.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await.map_err(io_err(parent))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(io_err(&temp_path))?;
    file.write_all(bytes).await.map_err(io_err(&temp_path))?;
    file.flush().await.map_err(io_err(&temp_path))?;
    drop(file);

    if let Err(source) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Written { record: Opportunity, attempts: u8 },
    /// The precondition no longer holds; nothing to write.
    Unchanged,
    /// Lost the race twice; the record is left for the next batch.
    Conflicted,
}

/// Read-modify-write with one retry on a version conflict.
///
/// `mutate` is re-evaluated against a fresh read before the retry, so it must
/// re-check its own precondition and return `None` when there is nothing to do.
pub async fn update_with_retry<S, F>(store: &S, id: Uuid, mut mutate: F) -> Result<UpdateOutcome, StoreError>
where
    S: OpportunityStore + ?Sized,
    F: FnMut(&Opportunity) -> Option<Opportunity> + Send,
{
    for attempt in 1..=2u8 {
        let current = store.get(id).await?;
        let Some(updated) = mutate(&current) else {
            return Ok(UpdateOutcome::Unchanged);
        };
        match store.compare_and_swap(current.version, updated).await {
            Ok(record) => return Ok(UpdateOutcome::Written { record, attempts: attempt }),
            Err(StoreError::Conflict { expected, actual, .. }) => {
                warn!(%id, expected, actual, attempt, "opportunity write conflict");
            }
            Err(err) => return Err(err),
        }
    }
    Ok(UpdateOutcome::Conflicted)
}
