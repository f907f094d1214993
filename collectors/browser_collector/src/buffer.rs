//! Durable per-domain accumulation of seconds that have not been synced yet.

use anyhow::Context;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use tracing::warn;

/// Key-value store that survives process restarts.
pub trait DurableStore: Send + 'static {
    fn get(&self, key: &str) -> anyhow::Result<Option<u64>>;
    fn set(&mut self, key: &str, value: u64) -> anyhow::Result<()>;
    fn remove(&mut self, key: &str) -> anyhow::Result<()>;
    fn entries(&self) -> anyhow::Result<BTreeMap<String, u64>>;
    fn clear(&mut self) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct MemoryStore {
    entries: BTreeMap<String, u64>,
}

impl DurableStore for MemoryStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<u64>> {
        Ok(self.entries.get(key).copied())
    }

    fn set(&mut self, key: &str, value: u64) -> anyhow::Result<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&mut self, key: &str) -> anyhow::Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn entries(&self) -> anyhow::Result<BTreeMap<String, u64>> {
        Ok(self.entries.clone())
    }

    fn clear(&mut self) -> anyhow::Result<()> {
        self.entries.clear();
        Ok(())
    }
}

/// A JSON object on disk, rewritten in full on every change. Writes go to a
/// sibling temp file first and are renamed into place, so a crash leaves
/// either the old or the new contents.
pub struct JsonFileStore {
    path: PathBuf,
    entries: BTreeMap<String, u64>,
}

impl JsonFileStore {
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create buffer dir {}", parent.display()))?;
            }
        }

        let entries = match fs::read(&path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => BTreeMap::new(),
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(entries) => entries,
                Err(err) => {
                    let aside = path.with_extension("json.corrupt");
                    warn!(
                        path = %path.display(),
                        aside = %aside.display(),
                        error = %err,
                        "buffer file is corrupt; moving it aside and starting empty"
                    );
                    fs::rename(&path, &aside)
                        .with_context(|| format!("move corrupt buffer to {}", aside.display()))?;
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("read buffer {}", path.display()))
            }
        };

        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, u64>) -> anyhow::Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(entries)?;
        fs::write(&tmp, bytes).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("replace buffer {}", self.path.display()))?;
        Ok(())
    }

    fn update(&mut self, f: impl FnOnce(&mut BTreeMap<String, u64>)) -> anyhow::Result<()> {
        let mut next = self.entries.clone();
        f(&mut next);
        self.persist(&next)?;
        self.entries = next;
        Ok(())
    }
}

impl DurableStore for JsonFileStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<u64>> {
        Ok(self.entries.get(key).copied())
    }

    fn set(&mut self, key: &str, value: u64) -> anyhow::Result<()> {
        self.update(|m| {
            m.insert(key.to_string(), value);
        })
    }

    fn remove(&mut self, key: &str) -> anyhow::Result<()> {
        if !self.entries.contains_key(key) {
            return Ok(());
        }
        self.update(|m| {
            m.remove(key);
        })
    }

    fn entries(&self) -> anyhow::Result<BTreeMap<String, u64>> {
        Ok(self.entries.clone())
    }

    fn clear(&mut self) -> anyhow::Result<()> {
        self.update(BTreeMap::clear)
    }
}

/// Domain -> seconds accrued locally and not yet confirmed by the server.
/// Only ever grows through [`LocalBuffer::add`]; shrinks only through
/// [`LocalBuffer::settle`] or [`LocalBuffer::clear`].
pub struct LocalBuffer<S> {
    store: S,
}

impl<S: DurableStore> LocalBuffer<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn add(&mut self, domain: &str, seconds: u64) -> anyhow::Result<()> {
        if seconds == 0 {
            return Ok(());
        }
        let current = self.store.get(domain)?.unwrap_or(0);
        self.store.set(domain, current.saturating_add(seconds))
    }

    pub fn snapshot(&self) -> anyhow::Result<BTreeMap<String, u64>> {
        let mut entries = self.store.entries()?;
        entries.retain(|_, seconds| *seconds > 0);
        Ok(entries)
    }

    pub fn is_empty(&self) -> anyhow::Result<bool> {
        Ok(self.snapshot()?.is_empty())
    }

    /// Removes exactly the amounts the server confirmed. Time added after the
    /// snapshot was taken stays in the buffer for the next sync.
    pub fn settle(&mut self, sent: &BTreeMap<String, u64>) -> anyhow::Result<()> {
        for (domain, seconds) in sent {
            let current = self.store.get(domain)?.unwrap_or(0);
            let remaining = current.saturating_sub(*seconds);
            if remaining == 0 {
                self.store.remove(domain)?;
            } else {
                self.store.set(domain, remaining)?;
            }
        }
        Ok(())
    }

    pub fn clear(&mut self) -> anyhow::Result<()> {
        self.store.clear()
    }
}
