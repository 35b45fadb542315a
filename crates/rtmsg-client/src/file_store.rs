//! Directory-backed [`SharedStore`] for contexts living in separate processes.
//!
//! Each key is one file. A file starts with a header line `origin seq`
//! followed by the value:
//!
//! ```text
//! 5b0c…e1 17
//! {"ownerId":"…","acquiredAtMillis":1700000000000}
//! ```
//!
//! The header lets a watcher drop its own writes (the writer never observes
//! its own change) and collapse the several file-system events a single write
//! produces. Writes go to a temp file that is renamed into place, so readers
//! never see a partial value.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use rtmsg_core::prelude::*;

use crate::store::{ChangeReceiver, SharedStore, StoreChange};

const TEMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    origin: String,
    seq: u64,
    value: String,
}

impl Entry {
    fn parse(content: &str) -> Option<Self> {
        let (header, value) = content.split_once('\n')?;
        let (origin, seq) = header.split_once(' ')?;
        Some(Self {
            origin: origin.to_string(),
            seq: seq.parse().ok()?,
            value: value.to_string(),
        })
    }

    fn render(&self) -> String {
        format!("{} {}\n{}", self.origin, self.seq, self.value)
    }
}

/// Watcher-side state: last known entry per key and live subscribers.
struct WatchState {
    dir: PathBuf,
    origin: String,
    known: HashMap<String, Entry>,
    subscribers: Vec<mpsc::UnboundedSender<StoreChange>>,
}

impl WatchState {
    /// Re-read the file behind `path` and emit a change if another context
    /// produced a new entry.
    fn on_path_changed(&mut self, path: &Path) {
        if path.parent() != Some(self.dir.as_path()) {
            return;
        }
        let Some(key) = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(file_name_to_key)
        else {
            return;
        };

        let change = match read_entry(path) {
            Some(entry) => {
                let previous = self.known.get(&key);
                if previous.map(|p| (&p.origin, p.seq)) == Some((&entry.origin, entry.seq)) {
                    return;
                }
                let old_value = previous.map(|p| p.value.clone());
                let own = entry.origin == self.origin;
                let new_value = entry.value.clone();
                self.known.insert(key.clone(), entry);
                if own {
                    return;
                }
                StoreChange {
                    key,
                    old_value,
                    new_value: Some(new_value),
                }
            }
            None => match self.known.remove(&key) {
                Some(previous) => StoreChange {
                    key,
                    old_value: Some(previous.value),
                    new_value: None,
                },
                None => return,
            },
        };

        trace!("File store change on '{}'", change.key);
        self.subscribers.retain(|tx| tx.send(change.clone()).is_ok());
    }
}

/// Shared store kept in a directory watched with `notify`.
pub struct FileStore {
    dir: PathBuf,
    origin: String,
    seq: AtomicU64,
    state: Arc<Mutex<WatchState>>,
    _watcher: RecommendedWatcher,
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("dir", &self.dir)
            .field("origin", &self.origin)
            .finish()
    }
}

impl FileStore {
    /// Open (creating if needed) the store directory and start watching it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] if the directory cannot be created or watched.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::store(format!("create {}: {e}", dir.display())))?;
        let dir = dir
            .canonicalize()
            .map_err(|e| Error::store(format!("resolve {}: {e}", dir.display())))?;

        let origin = uuid::Uuid::new_v4().simple().to_string();
        let known = scan_entries(&dir)?;

        let state = Arc::new(Mutex::new(WatchState {
            dir: dir.clone(),
            origin: origin.clone(),
            known,
            subscribers: Vec::new(),
        }));

        let watch_state = Arc::clone(&state);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    let mut state = watch_state.lock().unwrap_or_else(|e| e.into_inner());
                    for path in &event.paths {
                        state.on_path_changed(path);
                    }
                }
                Err(e) => warn!("File store watcher error: {}", e),
            }
        })
        .map_err(|e| Error::store(format!("create watcher: {e}")))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::store(format!("watch {}: {e}", dir.display())))?;

        debug!("File store opened at {} as {}", dir.display(), origin);

        Ok(Self {
            dir,
            origin,
            seq: AtomicU64::new(1),
            state,
            _watcher: watcher,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(key_to_file_name(key))
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, WatchState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Process a path as if the watcher had reported it.
    #[cfg(test)]
    fn process_path(&self, path: &Path) {
        self.lock_state().on_path_changed(path);
    }
}

impl SharedStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        read_entry(&self.path_for(key)).map(|entry| entry.value)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key);
        if read_entry(&path).is_some_and(|current| current.value == value) {
            return Ok(());
        }

        let entry = Entry {
            origin: self.origin.clone(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            value: value.to_string(),
        };
        let temp = self.dir.join(format!(
            ".{}.{}{}",
            key_to_file_name(key),
            self.origin,
            TEMP_SUFFIX
        ));
        std::fs::write(&temp, entry.render())
            .map_err(|e| Error::store(format!("write {}: {e}", temp.display())))?;
        std::fs::rename(&temp, &path)
            .map_err(|e| Error::store(format!("rename into {}: {e}", path.display())))?;

        self.lock_state().known.insert(key.to_string(), entry);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(Error::store(format!("remove {}: {e}", path.display()))),
        }
        self.lock_state().known.remove(key);
        Ok(())
    }

    fn subscribe(&self) -> ChangeReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock_state().subscribers.push(tx);
        rx
    }

    fn is_shared(&self) -> bool {
        true
    }
}

fn read_entry(path: &Path) -> Option<Entry> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let entry = Entry::parse(&content);
            if entry.is_none() {
                debug!("Ignoring malformed store file {}", path.display());
            }
            entry
        }
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => {
            warn!("Failed to read store file {}: {}", path.display(), e);
            None
        }
    }
}

fn scan_entries(dir: &Path) -> Result<HashMap<String, Entry>> {
    let mut known = HashMap::new();
    let listing =
        std::fs::read_dir(dir).map_err(|e| Error::store(format!("list {}: {e}", dir.display())))?;
    for item in listing.flatten() {
        let name = item.file_name();
        let Some(key) = name.to_str().and_then(file_name_to_key) else {
            continue;
        };
        if let Some(entry) = read_entry(&item.path()) {
            known.insert(key, entry);
        }
    }
    Ok(known)
}

/// Encode a key as a file name: `[A-Za-z0-9._-]` pass through, everything
/// else becomes `%XX`. A leading dot is escaped so temp files never collide.
fn key_to_file_name(key: &str) -> String {
    let mut name = String::with_capacity(key.len());
    for (i, byte) in key.bytes().enumerate() {
        let plain = byte.is_ascii_alphanumeric()
            || byte == b'-'
            || byte == b'_'
            || (byte == b'.' && i > 0);
        if plain {
            name.push(char::from(byte));
        } else {
            name.push_str(&format!("%{byte:02X}"));
        }
    }
    name
}

fn file_name_to_key(name: &str) -> Option<String> {
    if name.starts_with('.') || name.ends_with(TEMP_SUFFIX) {
        return None;
    }
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
