//! Core StateStore implementation

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{Result, StateError};
use crate::lock::{LockMode, StateLock};

/// The whole persisted state: string keys to arbitrary JSON values
pub type Document = Map<String, Value>;

/// Default bound on waiting for the state lock
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Readers only need the lock where replacing an open file is not atomic for them
const READERS_LOCK: bool = cfg!(windows);

/// Atomic, lock-protected JSON key-value file
///
/// Every call goes back to disk; nothing is cached between calls. Mutations
/// run as one cycle under an exclusive lock on `<file>.lock`:
///
/// 1. load the current document (missing file is an empty document)
/// 2. apply the mutation in memory
/// 3. write the document to a temp file in the same directory and fsync it
/// 4. rename the temp file over the state file and fsync the directory
///
/// A failure at any step leaves the previous file in place.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

impl StateStore {
    /// Open a store backed by the file at `path`, creating its directory
    ///
    /// The state file itself is only created by the first mutation.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let lock_path = lock_path_for(&path);
        let store = Self {
            path,
            lock_path,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        };

        let dir = store.dir();
        fs::create_dir_all(dir).map_err(|e| StateError::io(dir, e))?;
        debug!(path = %store.path.display(), "Opened state store");
        Ok(store)
    }

    /// Bound how long mutations wait for the lock
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Path of the state file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the sidecar lock file
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Read the full document; empty if nothing has been written yet
    pub fn read_all(&self) -> Result<Document> {
        let _guard = self.read_lock()?;
        self.load()
    }

    /// Read one key, failing with `KeyNotFound` if absent
    ///
    /// A key explicitly set to `null` is present and reads back as `Value::Null`.
    pub fn read(&self, key: &str) -> Result<Value> {
        self.get(key)?.ok_or_else(|| StateError::KeyNotFound { key: key.to_string() })
    }

    /// Read one key, `None` if absent
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.read_all()?.remove(key))
    }

    /// Read one key and deserialize it into `T`
    ///
    /// A value that does not fit `T` is reported as corruption, not as absence.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| StateError::corruption(&self.path, format!("key '{}': {}", key, e))),
            None => Ok(None),
        }
    }

    /// Set `key` to `value`
    pub fn write(&self, key: &str, value: Value) -> Result<()> {
        self.transact(|doc| {
            doc.insert(key.to_string(), value);
            ((), true)
        })?;
        debug!(key, "Wrote state key");
        Ok(())
    }

    /// Set several keys in one locked cycle
    pub fn write_many(&self, updates: Document) -> Result<()> {
        let count = updates.len();
        self.transact(|doc| {
            doc.extend(updates);
            ((), true)
        })?;
        debug!(count, "Wrote state keys");
        Ok(())
    }

    /// Remove `key`; returns whether it was present
    ///
    /// The file is left untouched when the key is absent.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let existed = self.transact(|doc| {
            let existed = doc.remove(key).is_some();
            (existed, existed)
        })?;
        debug!(key, existed, "Deleted state key");
        Ok(existed)
    }

    /// Run `f` over the document under the lock and persist the result
    ///
    /// This is the primitive for nested read-modify-write, e.g. appending to a
    /// list stored under one key, so concurrent callers cannot lose updates.
    /// Nothing is written if `f` leaves the document as it found it.
    pub fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Document) -> T,
    {
        self.transact(|doc| {
            let before = doc.clone();
            let out = f(doc);
            let dirty = *doc != before;
            (out, dirty)
        })
    }

    /// Like [`update`](Self::update), for mutations that can fail
    ///
    /// When `f` returns `Err`, whatever it changed is discarded and the file is
    /// left as it was. Store failures convert into the caller's error type.
    pub fn try_update<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Document) -> std::result::Result<T, E>,
        E: From<StateError>,
    {
        self.transact(|doc| {
            let before = doc.clone();
            match f(doc) {
                Ok(out) => {
                    let dirty = *doc != before;
                    (Ok(out), dirty)
                }
                Err(e) => {
                    debug!("try_update: mutation failed, discarding changes");
                    (Err(e), false)
                }
            }
        })?
    }

    fn transact<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Document) -> (T, bool),
    {
        let _guard = StateLock::acquire(&self.lock_path, LockMode::Exclusive, self.lock_timeout)?;

        let mut doc = self.load()?;
        let (out, dirty) = f(&mut doc);
        if dirty {
            debug!(path = %self.path.display(), keys = doc.len(), "transact: document changed, committing");
            let staged = self.stage(&doc)?;
            self.commit(staged)?;
        } else {
            debug!(path = %self.path.display(), "transact: document unchanged, skipping write");
        }

        Ok(out)
    }

    fn read_lock(&self) -> Result<Option<StateLock>> {
        if !READERS_LOCK || !self.dir().exists() {
            debug!("read_lock: readers do not lock here");
            return Ok(None);
        }
        debug!(lock = %self.lock_path.display(), "read_lock: taking shared lock");
        StateLock::acquire(&self.lock_path, LockMode::Shared, self.lock_timeout).map(Some)
    }

    fn load(&self) -> Result<Document> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No state file yet, starting empty");
                return Ok(Document::new());
            }
            Err(e) => return Err(StateError::io(&self.path, e)),
        };

        match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(doc)) => {
                debug!(path = %self.path.display(), keys = doc.len(), "load: parsed document");
                Ok(doc)
            }
            Ok(other) => Err(StateError::corruption(
                &self.path,
                format!("expected a JSON object, found {}", json_kind(&other)),
            )),
            Err(e) => Err(StateError::corruption(&self.path, e)),
        }
    }

    /// Write `doc` to a synced temp file next to the state file
    fn stage(&self, doc: &Document) -> Result<NamedTempFile> {
        let dir = self.dir();
        let prefix = format!(".{}.", self.file_name());
        let mut staged = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(|e| StateError::io(dir, e))?;
        let staged_path = staged.path().to_path_buf();

        {
            let mut writer = BufWriter::new(staged.as_file_mut());
            serde_json::to_writer_pretty(&mut writer, doc).map_err(|e| StateError::io(&staged_path, e.into()))?;
            writer
                .write_all(b"\n")
                .and_then(|_| writer.flush())
                .map_err(|e| StateError::io(&staged_path, e))?;
        }

        staged
            .as_file()
            .sync_all()
            .map_err(|e| StateError::io(&staged_path, e))?;

        Ok(staged)
    }

    /// Rename a staged file over the state file
    fn commit(&self, staged: NamedTempFile) -> Result<()> {
        debug!(from = %staged.path().display(), to = %self.path.display(), "commit: renaming staged file");
        staged
            .persist(&self.path)
            .map_err(|e| StateError::io(&self.path, e.error))?;
        sync_dir(self.dir())
    }

    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state".to_string())
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    fs::File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| StateError::io(dir, e))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
