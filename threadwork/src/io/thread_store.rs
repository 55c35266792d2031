//! Durable thread records (`<data_dir>/threads/<id>.json`).
//!
//! Each open thread lives in memory behind an async `RwLock` so readers
//! (stream consumers, the CLI) can look at it while the loop appends. Every
//! mutation goes through [`ThreadStore::update`], which validates the status
//! transition and persists the new record before it becomes visible.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use crate::core::transitions::validate_transition;
use crate::core::types::{Thread, ThreadId};
use crate::error::EngineError;
use crate::io::config::write_atomic;

pub type SharedThread = Arc<RwLock<Thread>>;

#[derive(Debug)]
pub struct ThreadStore {
    dir: PathBuf,
    threads: Mutex<HashMap<ThreadId, SharedThread>>,
}

impl ThreadStore {
    /// Open the store rooted at `dir`, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create thread dir {}", dir.display()))?;
        Ok(Self {
            dir,
            threads: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &ThreadId) -> PathBuf {
        self.dir.join(format!("{}.json", id.as_str()))
    }

    /// Persist a new record and register it.
    #[instrument(skip_all, fields(thread = %thread.id))]
    pub async fn create(&self, thread: Thread) -> Result<SharedThread> {
        let path = self.path_for(&thread.id);
        if path.exists() {
            return Err(anyhow!("thread {} already exists", thread.id));
        }
        persist(path, &thread).await?;
        let id = thread.id.clone();
        let shared = Arc::new(RwLock::new(thread));
        self.cache()?.insert(id, shared.clone());
        debug!("thread created");
        Ok(shared)
    }

    /// In-memory record, loading it from disk on first access.
    pub async fn get(&self, id: &ThreadId) -> Result<SharedThread> {
        if let Some(shared) = self.cache()?.get(id) {
            return Ok(shared.clone());
        }
        let thread = self.load(id).await?;
        let mut cache = self.cache()?;
        // A concurrent loader may have won; keep its copy.
        let shared = cache
            .entry(id.clone())
            .or_insert_with(|| Arc::new(RwLock::new(thread)))
            .clone();
        Ok(shared)
    }

    /// Clone of the current record.
    pub async fn snapshot(&self, id: &ThreadId) -> Result<Thread> {
        let shared = self.get(id).await?;
        let guard = shared.read().await;
        Ok(guard.clone())
    }

    /// Apply `f` to the record, validate the status change and persist.
    ///
    /// The in-memory record is replaced only after the write succeeded.
    pub async fn update<F, R>(&self, id: &ThreadId, f: F) -> Result<R>
    where
        F: FnOnce(&mut Thread) -> R,
    {
        let shared = self.get(id).await?;
        let mut guard = shared.write().await;
        let mut next = guard.clone();
        let out = f(&mut next);
        if let Err(msg) = validate_transition(guard.status, next.status) {
            warn!(thread = %id, from = %guard.status, to = %next.status, "rejected status change");
            return Err(anyhow!("thread {id}: {msg}"));
        }
        next.touch();
        persist(self.path_for(id), &next).await?;
        if guard.status != next.status {
            debug!(thread = %id, from = %guard.status, to = %next.status, "status changed");
        }
        *guard = next;
        Ok(out)
    }

    /// All persisted threads, newest first.
    pub async fn list(&self) -> Result<Vec<Thread>> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("read thread dir {}", self.dir.display()))?;
        while let Some(entry) = entries.next_entry().await.context("read thread dir entry")? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(ThreadId::new(stem));
            }
        }
        let mut threads = Vec::with_capacity(ids.len());
        for id in ids {
            threads.push(self.snapshot(&id).await?);
        }
        threads.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(threads)
    }

    /// Drop a record from memory; the file stays on disk.
    pub fn evict(&self, id: &ThreadId) -> Result<()> {
        self.cache()?.remove(id);
        Ok(())
    }

    async fn load(&self, id: &ThreadId) -> Result<Thread> {
        let path = self.path_for(id);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::ThreadNotFound(id.clone()).into());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("read thread {}", path.display()));
            }
        };
        let thread: Thread = serde_json::from_str(&contents)
            .with_context(|| format!("parse thread {}", path.display()))?;
        debug!(thread = %id, status = %thread.status, "thread loaded");
        Ok(thread)
    }

    #[cfg(test)]
    pub(crate) fn is_cached(&self, id: &ThreadId) -> bool {
        self.cache().is_ok_and(|cache| cache.contains_key(id))
    }

    fn cache(&self) -> Result<std::sync::MutexGuard<'_, HashMap<ThreadId, SharedThread>>> {
        self.threads
            .lock()
            .map_err(|_| anyhow!("thread cache lock poisoned"))
    }
}

async fn persist(path: PathBuf, thread: &Thread) -> Result<()> {
    let mut buf = serde_json::to_vec_pretty(thread).context("serialize thread")?;
    buf.push(b'\n');
    tokio::task::spawn_blocking(move || write_atomic(&path, &buf))
        .await
        .context("join thread writer")?
}
