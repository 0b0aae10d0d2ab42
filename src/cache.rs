//! Stage result cache: fingerprints, stores and the single-flight gate.
//!
//! Two backends share the [`StageCache`] trait: an in-memory TTL+LRU map and a
//! SQLite file. Concurrent computes of the same fingerprint are serialized by
//! [`SingleFlight`], so identical concurrent requests pay for providers once.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use fs2::FileExt;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;

use crate::patterns::StageKind;
use crate::pipeline::StageResult;

const FINGERPRINT_VERSION: &str = "v1";

// =============================================================================
// Fingerprint
// =============================================================================

/// blake3 hex digest identifying one cacheable stage computation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn builder<'a>(
        prompt: &'a str,
        pattern_key: &'a str,
        stage: StageKind,
    ) -> FingerprintBuilder<'a> {
        FingerprintBuilder {
            prompt,
            pattern_key,
            pattern_digest: "",
            stage,
            selected: Vec::new(),
            temperature: 0.0,
            max_tokens: None,
            participants: Vec::new(),
            upstream: String::new(),
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct FingerprintBuilder<'a> {
    prompt: &'a str,
    pattern_key: &'a str,
    pattern_digest: &'a str,
    stage: StageKind,
    selected: Vec<&'a str>,
    temperature: f32,
    max_tokens: Option<u32>,
    participants: Vec<&'a str>,
    upstream: String,
}

impl<'a> FingerprintBuilder<'a> {
    /// Digest of the pattern's templates, so edited wording misses.
    pub fn pattern_digest(mut self, digest: &'a str) -> Self {
        self.pattern_digest = digest;
        self
    }

    pub fn selected<I: IntoIterator<Item = &'a str>>(mut self, ids: I) -> Self {
        self.selected = ids.into_iter().collect();
        self
    }

    pub fn options(mut self, temperature: f32, max_tokens: Option<u32>) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    /// Models called in this stage, in call order.
    pub fn participants<I: IntoIterator<Item = &'a str>>(mut self, ids: I) -> Self {
        self.participants = ids.into_iter().collect();
        self
    }

    /// Results this stage consumed; empty for the first stage.
    pub fn upstream<'s, I>(mut self, stages: I) -> Self
    where
        I: IntoIterator<Item = &'s StageResult>,
    {
        self.upstream = upstream_digest(stages);
        self
    }

    pub fn build(self) -> Fingerprint {
        let prompt = normalize_prompt(self.prompt);
        let mut selected = self.selected;
        selected.sort_unstable();
        selected.dedup();
        let selected = selected.join(",");
        let participants = self.participants.join(",");
        let temperature = format!("{:.3}", self.temperature);
        let max_tokens = self
            .max_tokens
            .map(|t| t.to_string())
            .unwrap_or_else(|| "none".to_string());

        Fingerprint(hash_fields(&[
            FINGERPRINT_VERSION,
            &prompt,
            self.pattern_key,
            self.pattern_digest,
            self.stage.as_str(),
            &selected,
            &temperature,
            &max_tokens,
            &participants,
            &self.upstream,
        ]))
    }
}

/// Trim and collapse internal whitespace runs to single spaces.
pub fn normalize_prompt(prompt: &str) -> String {
    prompt.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn upstream_digest<'s>(stages: impl IntoIterator<Item = &'s StageResult>) -> String {
    let mut hasher = blake3::Hasher::new();
    let mut any = false;
    for stage in stages {
        // Plain data; serialization cannot fail.
        let encoded = serde_json::to_vec(stage).unwrap_or_default();
        hasher.update(&encoded);
        hasher.update(b"|");
        any = true;
    }
    if any {
        hasher.finalize().to_hex().to_string()
    } else {
        String::new()
    }
}

fn hash_fields(fields: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            hasher.update(b"|");
        }
        hasher.update(field.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

// =============================================================================
// Store trait
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
    #[error("serialization error: {0}")]
    Serde(String),
}

/// Keyed store of stage results. Reads may run concurrently; a write to one key
/// replaces the whole entry atomically.
#[async_trait]
pub trait StageCache: Send + Sync {
    /// `Ok(None)` on miss or expiry.
    async fn get(&self, key: &Fingerprint) -> Result<Option<StageResult>, CacheError>;
    async fn put(&self, key: &Fingerprint, value: &StageResult, ttl: Duration)
        -> Result<(), CacheError>;
}

fn default_ttl_secs() -> u64 {
    24 * 3_600
}
fn default_max_entries() -> usize {
    1_024
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Capacity of the in-memory store.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Use the SQLite store at this path instead of the in-memory one.
    #[serde(default)]
    pub sqlite_path: Option<PathBuf>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            max_entries: default_max_entries(),
            sqlite_path: None,
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

// =============================================================================
// In-memory store
// =============================================================================

/// Stand-in lifetime for TTLs too large to add to an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 86_400);

fn expiry(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

#[derive(Debug)]
struct MemoryEntry {
    payload: StageResult,
    expires_at: Instant,
    last_access: AtomicU64,
}

/// TTL + LRU map. Reads share the lock; recency is bumped atomically per entry.
#[derive(Debug)]
pub struct MemoryStageCache {
    entries: RwLock<HashMap<Fingerprint, MemoryEntry>>,
    max_entries: usize,
    clock: AtomicU64,
}

impl MemoryStageCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries: max_entries.max(1),
            clock: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Default for MemoryStageCache {
    fn default() -> Self {
        Self::new(default_max_entries())
    }
}

#[async_trait]
impl StageCache for MemoryStageCache {
    async fn get(&self, key: &Fingerprint) -> Result<Option<StageResult>, CacheError> {
        let now = Instant::now();
        {
            let entries = self.entries.read().map_err(|_| CacheError::Poisoned)?;
            match entries.get(key) {
                None => return Ok(None),
                Some(entry) if entry.expires_at > now => {
                    entry.last_access.store(self.tick(), Ordering::Relaxed);
                    return Ok(Some(entry.payload.clone()));
                }
                Some(_) => {}
            }
        }
        // Expired: drop it unless a writer refreshed it meanwhile.
        let mut entries = self.entries.write().map_err(|_| CacheError::Poisoned)?;
        if entries.get(key).is_some_and(|e| e.expires_at <= now) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn put(
        &self,
        key: &Fingerprint,
        value: &StageResult,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.write().map_err(|_| CacheError::Poisoned)?;
        entries.retain(|_, e| e.expires_at > now);

        if !entries.contains_key(key) && entries.len() >= self.max_entries {
            let lru = entries
                .iter()
                .min_by_key(|(_, e)| e.last_access.load(Ordering::Relaxed))
                .map(|(k, _)| k.clone());
            if let Some(lru) = lru {
                entries.remove(&lru);
            }
        }

        entries.insert(
            key.clone(),
            MemoryEntry {
                payload: value.clone(),
                expires_at: expiry(now, ttl),
                last_access: AtomicU64::new(self.tick()),
            },
        );
        Ok(())
    }
}

// =============================================================================
// SQLite store
// =============================================================================

#[derive(Clone)]
pub struct SqliteStageCache {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStageCache {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             CREATE TABLE IF NOT EXISTS stage_cache (\
               fingerprint TEXT PRIMARY KEY,\
               stage TEXT NOT NULL,\
               payload TEXT NOT NULL,\
               created_at INTEGER NOT NULL,\
               expires_at INTEGER NOT NULL,\
               updated_at INTEGER NOT NULL,\
               hit_count INTEGER NOT NULL DEFAULT 0\
             );",
        )?;

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("ENSEMBLE_CACHE_PATH") {
            return PathBuf::from(path);
        }
        PathBuf::from(".ensemble_stage_cache.sqlite")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_exclusive(&self) -> Result<CacheLock, CacheError> {
        CacheLock::new(&self.path)
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, CacheError>
    where
        F: FnOnce(&Connection) -> Result<R, CacheError>,
    {
        let guard = self.conn.lock().map_err(|_| CacheError::Poisoned)?;
        f(&guard)
    }

    async fn blocking<F, R>(&self, f: F) -> Result<R, CacheError>
    where
        F: FnOnce(&Connection) -> Result<R, CacheError> + Send + 'static,
        R: Send + 'static,
    {
        let cache = self.clone();
        tokio::task::spawn_blocking(move || cache.with_conn(f))
            .await
            .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

#[async_trait]
impl StageCache for SqliteStageCache {
    async fn get(&self, key: &Fingerprint) -> Result<Option<StageResult>, CacheError> {
        let key = key.as_str().to_string();
        self.blocking(move |conn| {
            let now = now_epoch();
            let row: Option<(String, i64)> = conn
                .query_row(
                    "SELECT payload, expires_at FROM stage_cache WHERE fingerprint = ?1",
                    params![key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((payload, expires_at)) = row else {
                return Ok(None);
            };
            if expires_at <= now {
                conn.execute("DELETE FROM stage_cache WHERE fingerprint = ?1", params![key])?;
                return Ok(None);
            }
            let result: StageResult =
                serde_json::from_str(&payload).map_err(|e| CacheError::Serde(e.to_string()))?;
            conn.execute(
                "UPDATE stage_cache \
                 SET hit_count = hit_count + 1, updated_at = ?1 \
                 WHERE fingerprint = ?2",
                params![now, key],
            )?;
            Ok(Some(result))
        })
        .await
    }

    async fn put(
        &self,
        key: &Fingerprint,
        value: &StageResult,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let key = key.as_str().to_string();
        let stage = value.stage.as_str();
        let payload = serde_json::to_string(value).map_err(|e| CacheError::Serde(e.to_string()))?;
        let ttl_secs = i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX);
        self.blocking(move |conn| {
            let now = now_epoch();
            conn.execute(
                "INSERT INTO stage_cache (\
                    fingerprint, stage, payload, created_at, expires_at, updated_at\
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(fingerprint) DO UPDATE SET \
                    stage = excluded.stage, \
                    payload = excluded.payload,\
                    created_at = excluded.created_at,\
                    expires_at = excluded.expires_at,\
                    updated_at = excluded.updated_at",
                params![key, stage, payload, now, now.saturating_add(ttl_secs), now],
            )?;
            Ok(())
        })
        .await
    }
}

#[derive(Debug)]
pub struct CacheLock {
    _file: std::fs::File,
}

impl CacheLock {
    fn new(db_path: &Path) -> Result<Self, CacheError> {
        let mut lock_path = db_path.to_path_buf();
        lock_path.set_extension("lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }
}

#[derive(Debug, Serialize)]
pub struct CacheExportRow {
    pub fingerprint: String,
    pub stage: String,
    pub payload: serde_json::Value,
    pub created_at: i64,
    pub expires_at: i64,
    pub updated_at: i64,
    pub hit_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CachePruneStats {
    pub deleted: usize,
    pub remaining: usize,
}

impl SqliteStageCache {
    pub async fn export_jsonl(&self, path: impl AsRef<Path>) -> Result<usize, CacheError> {
        let path = path.as_ref().to_path_buf();
        self.blocking(move |conn| {
            use std::io::Write;

            let mut stmt = conn.prepare(
                "SELECT fingerprint, stage, payload, created_at, expires_at, updated_at, hit_count \
                 FROM stage_cache ORDER BY updated_at DESC, fingerprint",
            )?;
            let mut rows = stmt.query([])?;
            let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
            let mut written = 0;
            while let Some(row) = rows.next()? {
                let payload: String = row.get(2)?;
                let record = CacheExportRow {
                    fingerprint: row.get(0)?,
                    stage: row.get(1)?,
                    payload: serde_json::from_str(&payload)
                        .map_err(|e| CacheError::Serde(e.to_string()))?,
                    created_at: row.get(3)?,
                    expires_at: row.get(4)?,
                    updated_at: row.get(5)?,
                    hit_count: row.get(6)?,
                };
                let line =
                    serde_json::to_string(&record).map_err(|e| CacheError::Serde(e.to_string()))?;
                writeln!(file, "{line}")?;
                written += 1;
            }
            file.flush()?;
            Ok(written)
        })
        .await
    }

    /// Drop expired rows, rows untouched for `max_age_days`, then the least
    /// recently used rows beyond `max_rows`.
    pub async fn prune(
        &self,
        max_age_days: Option<u64>,
        max_rows: Option<usize>,
    ) -> Result<CachePruneStats, CacheError> {
        self.blocking(move |conn| {
            let now = now_epoch();
            let mut deleted =
                conn.execute("DELETE FROM stage_cache WHERE expires_at <= ?1", params![now])?;

            if let Some(days) = max_age_days {
                let cutoff = now.saturating_sub((days as i64).saturating_mul(86_400));
                let removed = conn.execute(
                    "DELETE FROM stage_cache WHERE updated_at < ?1",
                    params![cutoff],
                )?;
                deleted = deleted.saturating_add(removed);
            }

            if let Some(max_rows) = max_rows {
                let removed = conn.execute(
                    "DELETE FROM stage_cache WHERE fingerprint IN (\
                        SELECT fingerprint FROM stage_cache \
                        ORDER BY updated_at DESC, fingerprint LIMIT -1 OFFSET ?1\
                     )",
                    params![max_rows as i64],
                )?;
                deleted = deleted.saturating_add(removed);
            }

            let remaining: i64 =
                conn.query_row("SELECT COUNT(*) FROM stage_cache", [], |row| row.get(0))?;
            Ok(CachePruneStats {
                deleted,
                remaining: remaining.max(0) as usize,
            })
        })
        .await
    }
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

// =============================================================================
// Single-flight gate
// =============================================================================

/// Per-fingerprint async mutexes. Holding a [`FlightGuard`] means no other task is
/// computing the same fingerprint.
#[derive(Debug, Default)]
pub struct SingleFlight {
    inflight: Mutex<HashMap<Fingerprint, Arc<tokio::sync::Mutex<()>>>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &Fingerprint) -> FlightGuard<'_> {
        let gate = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            inflight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let guard = gate.lock_owned().await;
        FlightGuard {
            owner: self,
            key: key.clone(),
            guard: Some(guard),
        }
    }

    /// Fingerprints with a holder or waiter.
    pub fn in_flight(&self) -> usize {
        self.inflight.lock().map(|m| m.len()).unwrap_or(0)
    }
}

pub struct FlightGuard<'a> {
    owner: &'a SingleFlight,
    key: Fingerprint,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut inflight = self.owner.inflight.lock().unwrap_or_else(|e| e.into_inner());
        let idle = inflight
            .get(&self.key)
            .is_some_and(|gate| Arc::strong_count(gate) == 1);
        if idle {
            inflight.remove(&self.key);
        }
    }
}
