//! StateStore - atomic, lock-protected JSON key-value state
//!
//! A single JSON object on disk, read and rewritten as a whole. Writers are
//! serialized across threads and processes by an advisory lock on a sidecar
//! file, and every write lands through a synced temp file and a rename, so the
//! file on disk is always either the old document or the new one.
//!
//! # Layout
//!
//! ```text
//! logs/
//! ├── state.json        # the document
//! └── state.json.lock   # lock file, never holds data
//! ```
//!
//! # Example
//!
//! ```ignore
//! use serde_json::json;
//! use statestore::StateStore;
//!
//! let store = StateStore::open("logs/state.json")?;
//! store.write("demo", json!("ok"))?;
//! assert_eq!(store.read("demo")?, json!("ok"));
//! ```

mod error;
mod lock;
mod store;

pub use error::{Result, StateError};
pub use lock::{LockMode, StateLock};
pub use store::{DEFAULT_LOCK_TIMEOUT, Document, StateStore};
