//! Multi-shard CDB64 reader over a directory or an explicit file list
//! (spec §4.C). Shards are probed in lexicographic order; the first match
//! wins. Initialization is lazy: nothing is opened until the first `get`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cdb64::Reader;
use common::error::AppError;
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, RecommendedCache};
use parking_lot::RwLock;
use tracing::{debug, warn};

const DEBOUNCE_WINDOW: Duration = Duration::from_secs(1);

/// Where a `ShardedIndex` should look for shard files.
#[derive(Debug, Clone)]
pub enum ShardSource {
    /// A single `.cdb` file; never watched even if `watch: true`.
    File(PathBuf),
    /// An explicit, static list of shard files.
    Paths(Vec<PathBuf>),
    /// A directory scanned for `*.cdb` files; eligible for hot reload.
    Dir(PathBuf),
}

struct ShardEntry {
    path: PathBuf,
    reader: Reader,
}

struct State {
    initialized: bool,
    shards: Vec<ShardEntry>,
    _watcher: Option<Debouncer<notify::RecommendedWatcher, RecommendedCache>>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            initialized: false,
            shards: Vec::new(),
            _watcher: None,
        }
    }
}

struct Inner {
    source: ShardSource,
    watch: bool,
    state: RwLock<State>,
}

/// A reader over an ordered set of CDB64 shards.
pub struct ShardedIndex {
    inner: Arc<Inner>,
}

impl ShardedIndex {
    pub fn new(source: ShardSource, watch: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                watch,
                state: RwLock::new(State::default()),
            }),
        }
    }

    /// First-match-wins lookup across shards in lexicographic order.
    /// Triggers the lazy directory scan / shard open on first call.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, AppError> {
        self.ensure_initialized();
        let state = self.inner.state.read();
        for entry in &state.shards {
            match entry.reader.get(key) {
                Ok(Some(value)) => return Ok(Some(value)),
                Ok(None) => continue,
                Err(e) => {
                    warn!(shard = %entry.path.display(), error = %e, "shard read error, skipping");
                    continue;
                }
            }
        }
        Ok(None)
    }

    /// Shard count and whether a hot-reload watcher is active. Ambient
    /// operational visibility, not a new feature.
    pub fn stats(&self) -> ShardStats {
        let state = self.inner.state.read();
        ShardStats {
            shard_count: state.shards.len(),
            watching: state._watcher.is_some(),
            initialized: state.initialized,
        }
    }

    /// Tears down the watcher and every open shard reader.
    pub fn close(self) {
        let mut state = self.inner.state.write();
        state._watcher = None;
        state.shards.clear();
    }

    fn ensure_initialized(&self) {
        {
            let state = self.inner.state.read();
            if state.initialized {
                return;
            }
        }

        let mut state = self.inner.state.write();
        if state.initialized {
            return;
        }

        let paths = discover_paths(&self.inner.source);
        for path in &paths {
            open_and_insert(&mut state.shards, path);
        }

        if self.inner.watch {
            if let ShardSource::Dir(dir) = &self.inner.source {
                match start_watcher(Arc::clone(&self.inner), dir.clone()) {
                    Ok(debouncer) => state._watcher = Some(debouncer),
                    Err(e) => warn!(dir = %dir.display(), error = %e, "failed to start shard directory watcher"),
                }
            }
        }

        state.initialized = true;
    }
}

/// Operational snapshot of a `ShardedIndex` (ambient, not part of the read path).
#[derive(Debug, Clone, Copy)]
pub struct ShardStats {
    pub shard_count: usize,
    pub watching: bool,
    pub initialized: bool,
}

fn discover_paths(source: &ShardSource) -> Vec<PathBuf> {
    match source {
        ShardSource::File(path) => {
            if path.exists() {
                vec![path.clone()]
            } else {
                debug!(path = %path.display(), "shard file does not exist, treating as empty index");
                Vec::new()
            }
        }
        ShardSource::Paths(paths) => paths.clone(),
        ShardSource::Dir(dir) => scan_dir(dir),
    }
}

fn scan_dir(dir: &Path) -> Vec<PathBuf> {
    let Ok(read_dir) = std::fs::read_dir(dir) else {
        debug!(dir = %dir.display(), "shard directory does not exist, treating as empty index");
        return Vec::new();
    };

    let mut paths: Vec<PathBuf> = read_dir
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "cdb"))
        .collect();
    paths.sort();
    paths
}

fn open_and_insert(shards: &mut Vec<ShardEntry>, path: &Path) {
    match Reader::open(path) {
        Ok(reader) => shards.push(ShardEntry {
            path: path.to_path_buf(),
            reader,
        }),
        Err(e) => warn!(shard = %path.display(), error = %e, "failed to open shard, skipping"),
    }
}

fn start_watcher(
    inner: Arc<Inner>,
    dir: PathBuf,
) -> notify::Result<Debouncer<notify::RecommendedWatcher, RecommendedCache>> {
    use notify::Watcher;

    let handler_inner = Arc::clone(&inner);
    let mut debouncer = new_debouncer(
        DEBOUNCE_WINDOW,
        None,
        move |result: DebounceEventResult| match result {
            Ok(events) => handle_events(&handler_inner, &events),
            Err(errors) => {
                for error in errors {
                    warn!(error = %error, "shard directory watcher error");
                }
            }
        },
    )?;
    debouncer.watcher().watch(&dir, notify::RecursiveMode::NonRecursive)?;
    Ok(debouncer)
}

fn handle_events(inner: &Arc<Inner>, events: &[notify_debouncer_full::DebouncedEvent]) {
    let mut state = inner.state.write();
    for event in events {
        for path in &event.paths {
            if !path.extension().is_some_and(|ext| ext == "cdb") {
                continue;
            }
            match event.kind {
                notify::EventKind::Remove(_) => {
                    if let Some(pos) = state.shards.iter().position(|s| &s.path == path) {
                        debug!(shard = %path.display(), "shard removed");
                        state.shards.remove(pos);
                    }
                }
                notify::EventKind::Create(_) | notify::EventKind::Modify(_) => {
                    state.shards.retain(|s| &s.path != path);
                    if path.exists() {
                        open_and_insert(&mut state.shards, path);
                        state.shards.sort_by(|a, b| a.path.cmp(&b.path));
                        debug!(shard = %path.display(), "shard added or refreshed");
                    }
                }
                _ => {}
            }
        }
    }
}
