use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use wheel_core::{PrizeEntry, PrizeId, SpinRecord, UserAccount};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn list_prizes(&self) -> Result<Vec<PrizeEntry>, StorageError>;
    async fn get_prize(&self, id: PrizeId) -> Result<Option<PrizeEntry>, StorageError>;
    async fn put_prize(&self, prize: PrizeEntry) -> Result<(), StorageError>;
    /// Returns whether the prize existed.
    async fn delete_prize(&self, id: PrizeId) -> Result<bool, StorageError>;
    async fn next_prize_id(&self) -> Result<PrizeId, StorageError>;

    async fn list_accounts(&self) -> Result<Vec<UserAccount>, StorageError>;
    async fn get_account(&self, user_id: &str) -> Result<Option<UserAccount>, StorageError>;
    async fn put_account(&self, account: UserAccount) -> Result<(), StorageError>;
    async fn delete_account(&self, user_id: &str) -> Result<bool, StorageError>;

    async fn list_spins(&self) -> Result<Vec<SpinRecord>, StorageError>;
    async fn get_spin(&self, id: u64) -> Result<Option<SpinRecord>, StorageError>;
    /// Appends a record, assigning its id. Returns the stored record.
    async fn append_spin(&self, record: SpinRecord) -> Result<SpinRecord, StorageError>;
    async fn put_spin(&self, record: SpinRecord) -> Result<(), StorageError>;

    async fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    prizes: BTreeMap<PrizeId, PrizeEntry>,
    accounts: HashMap<String, UserAccount>,
    next_prize_id: PrizeId,
}

// Records ordered by id. On disk every append or replacement is one JSON
// line; the last line for an id wins.
#[derive(Debug, Default)]
struct SpinLog {
    records: Vec<SpinRecord>,
    next_id: u64,
}

impl SpinLog {
    fn upsert(&mut self, record: SpinRecord) {
        self.next_id = self.next_id.max(record.id);
        match self.records.binary_search_by_key(&record.id, |r| r.id) {
            Ok(at) => self.records[at] = record,
            Err(at) => self.records.insert(at, record),
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryStorage {
    state: Arc<RwLock<Snapshot>>,
    spins: Arc<RwLock<SpinLog>>,
    persist_path: Option<PathBuf>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_persistence(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let snapshot = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Snapshot>(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(err) => return Err(err.into()),
        };
        let spins = load_spin_log(&spin_log_path(&path)).await?;
        tracing::info!(
            path = %path.display(),
            prizes = snapshot.prizes.len(),
            accounts = snapshot.accounts.len(),
            spins = spins.records.len(),
            "loaded persisted state"
        );
        Ok(Self {
            state: Arc::new(RwLock::new(snapshot)),
            spins: Arc::new(RwLock::new(spins)),
            persist_path: Some(path),
        })
    }

    // A failed write leaves memory unchanged.
    async fn write<T>(&self, op: impl FnOnce(&mut Snapshot) -> T) -> Result<T, StorageError> {
        let mut state = self.state.write().await;
        match &self.persist_path {
            None => Ok(op(&mut state)),
            Some(path) => {
                let mut next = state.clone();
                let out = op(&mut next);
                write_snapshot(path, &next).await?;
                *state = next;
                Ok(out)
            }
        }
    }

    async fn log_spin(&self, log: &mut SpinLog, record: SpinRecord) -> Result<(), StorageError> {
        if let Some(path) = &self.persist_path {
            append_line(&spin_log_path(path), &record).await?;
        }
        log.upsert(record);
        Ok(())
    }
}

fn spin_log_path(path: &Path) -> PathBuf {
    path.with_extension("spins.jsonl")
}

async fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<(), StorageError> {
    let json = serde_json::to_vec_pretty(snapshot)?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn append_line(path: &Path, record: &SpinRecord) -> Result<(), StorageError> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&line).await?;
    file.flush().await?;
    Ok(())
}

async fn load_spin_log(path: &Path) -> Result<SpinLog, StorageError> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(SpinLog::default()),
        Err(err) => return Err(err.into()),
    };
    let mut log = SpinLog::default();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        log.upsert(serde_json::from_str(line)?);
    }
    Ok(log)
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn list_prizes(&self) -> Result<Vec<PrizeEntry>, StorageError> {
        Ok(self.state.read().await.prizes.values().cloned().collect())
    }

    async fn get_prize(&self, id: PrizeId) -> Result<Option<PrizeEntry>, StorageError> {
        Ok(self.state.read().await.prizes.get(&id).cloned())
    }

    async fn put_prize(&self, prize: PrizeEntry) -> Result<(), StorageError> {
        self.write(|s| {
            s.next_prize_id = s.next_prize_id.max(prize.id);
            s.prizes.insert(prize.id, prize);
        })
        .await
    }

    async fn delete_prize(&self, id: PrizeId) -> Result<bool, StorageError> {
        self.write(|s| s.prizes.remove(&id).is_some()).await
    }

    async fn next_prize_id(&self) -> Result<PrizeId, StorageError> {
        self.write(|s| {
            s.next_prize_id += 1;
            s.next_prize_id
        })
        .await
    }

    async fn list_accounts(&self) -> Result<Vec<UserAccount>, StorageError> {
        Ok(self.state.read().await.accounts.values().cloned().collect())
    }

    async fn get_account(&self, user_id: &str) -> Result<Option<UserAccount>, StorageError> {
        Ok(self.state.read().await.accounts.get(user_id).cloned())
    }

    async fn put_account(&self, account: UserAccount) -> Result<(), StorageError> {
        self.write(|s| {
            s.accounts.insert(account.user_id.clone(), account);
        })
        .await
    }

    async fn delete_account(&self, user_id: &str) -> Result<bool, StorageError> {
        self.write(|s| s.accounts.remove(user_id).is_some()).await
    }

    async fn list_spins(&self) -> Result<Vec<SpinRecord>, StorageError> {
        Ok(self.spins.read().await.records.clone())
    }

    async fn get_spin(&self, id: u64) -> Result<Option<SpinRecord>, StorageError> {
        let log = self.spins.read().await;
        Ok(log
            .records
            .binary_search_by_key(&id, |r| r.id)
            .ok()
            .map(|at| log.records[at].clone()))
    }

    async fn append_spin(&self, mut record: SpinRecord) -> Result<SpinRecord, StorageError> {
        let mut log = self.spins.write().await;
        record.id = log.next_id + 1;
        self.log_spin(&mut log, record.clone()).await?;
        Ok(record)
    }

    async fn put_spin(&self, record: SpinRecord) -> Result<(), StorageError> {
        let mut log = self.spins.write().await;
        self.log_spin(&mut log, record).await
    }

    async fn flush(&self) -> Result<(), StorageError> {
        if let Some(path) = &self.persist_path {
            let snapshot = self.state.read().await.clone();
            write_snapshot(path, &snapshot).await?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(25),
        }
    }
}

pub async fn retry_read<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.attempts => {
                let delay = policy.base_delay * 2u32.saturating_pow(attempt);
                attempt += 1;
                tracing::warn!(error = %err, attempt, ?delay, "transient storage read failure, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
