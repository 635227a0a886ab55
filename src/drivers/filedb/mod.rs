//! Read-only driver over JSON files.
//!
//! Files are loaded at start and re-read whenever the filesystem reports a
//! change. When several files define the same key, the file listed first
//! wins; events describe how that merged view changed, so a shadowed entry
//! never produces one.

mod loader;

pub(crate) use loader::*;


use std::collections::BTreeMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notify::Event;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use parking_lot::Mutex;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::kv::unsupported;
use crate::utils::async_task::with_timeout;
use crate::utils::validate_key;
use crate::Capabilities;
use crate::DeleteOptions;
use crate::Error;
use crate::FileDbConfig;
use crate::KeyIterator;
use crate::KeyVal;
use crate::KvDriver;
use crate::KvIterator;
use crate::KvPair;
use crate::PutOptions;
use crate::Result;
use crate::TxnOp;
use crate::Versioned;
use crate::WatchConfig;
use crate::WatchHub;
use crate::WatchRequest;

const NAME: &str = "filedb";

/// Loaded files and the merged view readers and watchers see
#[derive(Debug, Default)]
struct Catalog {
    /// Load order of the files; earlier files shadow later ones
    order: Vec<PathBuf>,
    files: BTreeMap<PathBuf, BTreeMap<String, Vec<u8>>>,
    view: RevisionedView,
}

#[derive(Debug)]
struct FileState {
    catalog: RwLock<Catalog>,
    /// Configured files and directories
    roots: Vec<PathBuf>,
    hub: Arc<WatchHub>,
}

impl FileState {
    fn lookup(
        &self,
        key: &str,
    ) -> Option<FileValue> {
        self.catalog.read().view.get(key).cloned()
    }

    /// Merged view under `prefix`, sorted by key
    fn scan(
        &self,
        prefix: &str,
    ) -> Vec<(String, FileValue)> {
        self.catalog
            .read()
            .view
            .scan(prefix)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Whether a change at `path` concerns a loaded or loadable file
    fn is_relevant(
        &self,
        path: &Path,
    ) -> bool {
        if is_ignored(path) {
            return false;
        }
        self.roots.iter().any(|root| {
            root == path || (root.is_dir() && path.parent() == Some(root.as_path()))
        })
    }

    /// Re-reads `path` and publishes how the merged view changed.
    fn reload(
        &self,
        path: &Path,
    ) {
        let exists = path.is_file();
        let fresh = if exists {
            match load_file(path) {
                Ok(values) => Some(values),
                Err(e) => {
                    warn!("[{}] keeping previous content of {}: {}", NAME, path.display(), e);
                    return;
                }
            }
        } else {
            None
        };

        let events = {
            let mut catalog = self.catalog.write();
            let listed = catalog.order.iter().any(|p| p == path);
            match fresh {
                Some(values) => {
                    catalog.files.insert(path.to_path_buf(), values);
                    if !listed {
                        catalog.order.push(path.to_path_buf());
                    }
                }
                None => {
                    catalog.files.remove(path);
                    catalog.order.retain(|p| p != path);
                }
            }
            let merged = merge_files(&catalog.order, &catalog.files);
            catalog.view.apply(merged)
        };

        debug!("[{}] {} reloaded, {} changes", NAME, path.display(), events.len());
        for event in events {
            self.hub.publish(event);
        }
    }
}

/// Driver over JSON files and directories of JSON files
pub struct FileDbDriver {
    state: Arc<FileState>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    closed: AtomicBool,
    op_timeout: Duration,
}

impl std::fmt::Debug for FileDbDriver {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("FileDbDriver")
            .field("roots", &self.state.roots)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl FileDbDriver {
    /// Loads every configured file and starts watching for changes.
    pub async fn open(
        config: &FileDbConfig,
        watch: &WatchConfig,
    ) -> Result<Self> {
        let order = expand_paths(&config.paths)?;
        let mut files = BTreeMap::new();
        for path in &order {
            files.insert(path.clone(), load_file(path)?);
        }
        let view = RevisionedView::initial(merge_files(&order, &files));
        info!("[{}] loaded {} files, {} keys", NAME, files.len(), view.len());

        let op_timeout = Duration::from_millis(config.op_timeout);
        let delivery_timeout = watch.delivery_timeout.map(Duration::from_millis).unwrap_or(op_timeout);
        let hub = WatchHub::new(NAME, delivery_timeout, watch.filter_dup_notifs);
        let state = Arc::new(FileState {
            catalog: RwLock::new(Catalog { order, files, view }),
            roots: config.paths.iter().map(PathBuf::from).collect(),
            hub: hub.clone(),
        });

        let (tx, rx) = mpsc::unbounded_channel::<PathBuf>();
        let watcher = start_watcher(&state.roots, tx)?;
        let consumer = state.clone();
        hub.spawn("filedb-reloader", reload_loop(consumer, rx));

        Ok(Self {
            state,
            watcher: Mutex::new(Some(watcher)),
            closed: AtomicBool::new(false),
            op_timeout,
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed("filedb driver"));
        }
        Ok(())
    }
}

/// Watches directories rather than files so replace-by-rename saves are seen.
fn start_watcher(
    roots: &[PathBuf],
    tx: mpsc::UnboundedSender<PathBuf>,
) -> Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for path in event.paths {
                // the receiver is gone once the driver closed
                let _ = tx.send(path);
            }
        }
        Err(e) => warn!("[{}] filesystem watch error: {}", NAME, e),
    })?;

    let mut watched = HashSet::new();
    for root in roots {
        let dir = if root.is_dir() {
            root.clone()
        } else {
            match root.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => PathBuf::from("."),
            }
        };
        if watched.insert(dir.clone()) {
            watcher.watch(&dir, RecursiveMode::NonRecursive)?;
            debug!("[{}] watching {}", NAME, dir.display());
        }
    }
    Ok(watcher)
}

async fn reload_loop(
    state: Arc<FileState>,
    mut rx: mpsc::UnboundedReceiver<PathBuf>,
) -> Result<()> {
    let shutdown = state.hub.shutdown_token().clone();
    loop {
        let first = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            path = rx.recv() => match path {
                Some(path) => path,
                None => return Ok(()),
            },
        };
        // one save usually fires several notifications
        let mut pending = vec![first];
        while let Ok(path) = rx.try_recv() {
            if !pending.contains(&path) {
                pending.push(path);
            }
        }
        for path in pending {
            let path = normalize(&state.roots, path);
            if state.is_relevant(&path) {
                state.reload(&path);
            }
        }
    }
}

/// Maps an absolute notification path back onto the configured spelling.
fn normalize(
    roots: &[PathBuf],
    path: PathBuf,
) -> PathBuf {
    for root in roots {
        let Ok(canonical_root) = root.canonicalize() else {
            continue;
        };
        if path == canonical_root {
            return root.clone();
        }
        if let Ok(rest) = path.strip_prefix(&canonical_root) {
            if root.is_dir() {
                return root.join(rest);
            }
        }
        if let (Some(parent), Some(name)) = (root.parent(), root.file_name()) {
            let canonical_parent = if parent.as_os_str().is_empty() {
                Path::new(".").canonicalize()
            } else {
                parent.canonicalize()
            };
            if let Ok(canonical_parent) = canonical_parent {
                if path == canonical_parent.join(name) {
                    return root.clone();
                }
            }
        }
    }
    path
}

#[async_trait]
impl KvDriver for FileDbDriver {
    fn name(&self) -> &'static str {
        NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            txn: false,
            ttl: false,
            revisions: true,
            writable: false,
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn put(
        &self,
        _key: &str,
        _value: &[u8],
        _opts: PutOptions,
    ) -> Result<()> {
        self.ensure_open()?;
        Err(unsupported(NAME, "put"))
    }

    #[instrument(skip(self))]
    async fn get(
        &self,
        key: &str,
    ) -> Result<Option<Versioned>> {
        self.ensure_open()?;
        validate_key(key)?;
        with_timeout(NAME, "get", self.op_timeout, async {
            Ok(self.state.lookup(key).map(|v| Versioned {
                value: v.value,
                revision: v.revision,
            }))
        })
        .await
    }

    async fn delete(
        &self,
        _key: &str,
        _opts: DeleteOptions,
    ) -> Result<bool> {
        self.ensure_open()?;
        Err(unsupported(NAME, "delete"))
    }

    async fn list_keys(
        &self,
        prefix: &str,
    ) -> Result<KeyIterator> {
        self.ensure_open()?;
        let items = self
            .state
            .scan(prefix)
            .into_iter()
            .map(|(key, v)| KeyVal {
                key,
                revision: v.revision,
            })
            .collect();
        Ok(KeyIterator::from_vec(items))
    }

    async fn list_values(
        &self,
        prefix: &str,
    ) -> Result<KvIterator> {
        self.ensure_open()?;
        let items = self
            .state
            .scan(prefix)
            .into_iter()
            .map(|(key, v)| KvPair {
                key,
                value: v.value,
                revision: v.revision,
            })
            .collect();
        Ok(KvIterator::from_vec(items))
    }

    async fn commit(
        &self,
        _ops: Vec<TxnOp>,
    ) -> Result<()> {
        self.ensure_open()?;
        Err(unsupported(NAME, "txn"))
    }

    async fn watch(
        &self,
        request: WatchRequest,
    ) -> Result<()> {
        self.ensure_open()?;
        self.state.hub.subscribe(request)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // dropping the watcher closes the notification channel
        self.watcher.lock().take();
        self.state.hub.close().await;
        info!("[{}] driver closed", NAME);
        Ok(())
    }
}
