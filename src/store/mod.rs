//! Namespaced durable state with atomic writes and rotating backups.
//!
//! A single [`StateStore`] owns the consolidated [`StateDocument`]. Every
//! mutation runs under the document mutex and marks the document dirty.
//! When legacy sync is enabled, the touched namespace is serialized under
//! the lock and written through a [`StateExporter`] after the lock is
//! released. Saves are serialized by a separate FIFO write lock so at most
//! one writer touches the state file at a time.

pub mod autosave;
pub mod document;
pub mod export;
pub mod namespace;
pub mod writer;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

pub use document::{Section, StateDocument, UiState};
pub use export::{LegacyFileExporter, StateExporter};
pub use namespace::Namespace;

use crate::config::GlobalConfig;
use crate::{AppError, Result};

/// Construction parameters for a [`StateStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Directory holding the state file, backups, and legacy files.
    pub data_dir: PathBuf,
    /// Consolidated state file name inside `data_dir`.
    pub state_file: String,
    /// Number of `.backup.N` generations to keep.
    pub max_backups: u32,
    /// Delay used by [`StateStore::schedule_save`] to coalesce bursts.
    pub save_debounce: Duration,
    /// Mirror every namespace into its legacy file.
    pub legacy_sync: bool,
}

impl StoreOptions {
    /// Derive store options from the global configuration.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            state_file: config.store.state_file.clone(),
            max_backups: config.store.max_backups,
            save_debounce: Duration::from_millis(config.store.save_debounce_ms),
            legacy_sync: config.store.enable_legacy_sync,
        }
    }

    /// Full path of the consolidated state file.
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join(&self.state_file)
    }
}

/// Where the in-memory document came from during [`StateStore::initialize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    /// The consolidated state file.
    Consolidated,
    /// Numbered backup generation after the main file failed to parse.
    Backup(u32),
    /// Legacy per-namespace files and default skeletons.
    Legacy,
}

/// Durable owner of the state document.
pub struct StateStore {
    options: StoreOptions,
    state_path: PathBuf,
    doc: Mutex<StateDocument>,
    dirty: AtomicBool,
    write_lock: Mutex<()>,
    save_pending: AtomicBool,
    exporter: Option<Arc<dyn StateExporter>>,
    export_seq: AtomicU64,
    exported: Mutex<BTreeMap<Namespace, u64>>,
    cancel: CancellationToken,
    auto_save: Mutex<Option<JoinHandle<()>>>,
}

impl StateStore {
    /// Construct a store. The legacy exporter is attached when enabled.
    ///
    /// Nothing is read from disk until [`Self::initialize`] runs.
    #[must_use]
    pub fn new(options: StoreOptions) -> Self {
        let exporter: Option<Arc<dyn StateExporter>> = if options.legacy_sync {
            Some(Arc::new(LegacyFileExporter::new(options.data_dir.clone())))
        } else {
            None
        };
        Self::with_exporter(options, exporter)
    }

    /// Construct a store with an explicit exporter (or none).
    #[must_use]
    pub fn with_exporter(options: StoreOptions, exporter: Option<Arc<dyn StateExporter>>) -> Self {
        let state_path = options.state_path();
        Self {
            options,
            state_path,
            doc: Mutex::new(StateDocument::new()),
            dirty: AtomicBool::new(false),
            write_lock: Mutex::new(()),
            save_pending: AtomicBool::new(false),
            exporter,
            export_seq: AtomicU64::new(0),
            exported: Mutex::new(BTreeMap::new()),
            cancel: CancellationToken::new(),
            auto_save: Mutex::new(None),
        }
    }

    /// Path of the consolidated state file.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Directory holding all store files.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.options.data_dir
    }

    /// Whether in-memory changes are waiting to be saved.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Create directories and load the document.
    ///
    /// Load order: consolidated file, then `.backup.1..N` if the main file
    /// is corrupt, then each namespace's legacy file or default skeleton.
    /// A document recovered from anything but the main file is marked dirty
    /// so the next save rewrites it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Persistence` if the data directory cannot be created.
    pub async fn initialize(&self) -> Result<LoadSource> {
        let span = info_span!("store_initialize", path = %self.state_path.display());
        async {
            tokio::fs::create_dir_all(&self.options.data_dir)
                .await
                .map_err(|e| {
                    AppError::Persistence(format!(
                        "failed to create data directory {}: {e}",
                        self.options.data_dir.display()
                    ))
                })?;

            let discarded = writer::discard_stale_tmp(&self.options.data_dir).await?;
            if discarded > 0 {
                warn!(discarded, "discarded temp files left by an interrupted save");
            }

            let (document, source) = self.load_document().await;
            let mut doc = self.doc.lock().await;
            *doc = document;
            if source != LoadSource::Consolidated {
                self.dirty.store(true, Ordering::SeqCst);
            }
            drop(doc);

            info!(?source, "state document loaded");
            Ok(source)
        }
        .instrument(span)
        .await
    }

    async fn load_document(&self) -> (StateDocument, LoadSource) {
        match writer::read_json::<StateDocument>(&self.state_path).await {
            Ok(Some(doc)) => return (doc, LoadSource::Consolidated),
            Ok(None) => debug!("no consolidated state file"),
            Err(err) => {
                warn!(%err, "consolidated state file unreadable, trying backups");
                for n in 1..=self.options.max_backups {
                    let path = writer::backup_path(&self.state_path, n);
                    match writer::read_json::<StateDocument>(&path).await {
                        Ok(Some(doc)) => {
                            warn!(generation = n, "recovered state from backup");
                            return (doc, LoadSource::Backup(n));
                        }
                        Ok(None) => {}
                        Err(err) => warn!(generation = n, %err, "backup unreadable"),
                    }
                }
            }
        }

        let mut doc = StateDocument::new();
        for namespace in Namespace::ALL {
            let path = export::legacy_path(&self.options.data_dir, namespace);
            match writer::read_json::<serde_json::Value>(&path).await {
                Ok(Some(value)) => {
                    if let Err(err) = doc.replace_section(namespace, value) {
                        warn!(%namespace, %err, "legacy file has wrong shape, using defaults");
                        doc.reset_section(namespace);
                    }
                }
                Ok(None) => debug!(%namespace, "no legacy file, using defaults"),
                Err(err) => warn!(%namespace, %err, "legacy file unreadable, using defaults"),
            }
        }
        (doc, LoadSource::Legacy)
    }

    /// Run `f` against the document without changing it.
    pub async fn read<R>(&self, f: impl FnOnce(&StateDocument) -> R) -> R {
        let doc = self.doc.lock().await;
        f(&doc)
    }

    /// Mutate the document under the single-writer lock.
    ///
    /// On `Ok`, the document is marked dirty and `namespace` is exported.
    /// `f` must not leave partial changes behind when it returns `Err`.
    ///
    /// # Errors
    ///
    /// Propagates the error returned by `f`.
    pub async fn mutate<R>(
        &self,
        namespace: Namespace,
        f: impl FnOnce(&mut StateDocument) -> Result<R>,
    ) -> Result<R> {
        let (out, pending) = {
            let mut doc = self.doc.lock().await;
            let out = f(&mut doc)?;
            self.dirty.store(true, Ordering::SeqCst);
            (out, self.collect_exports(&doc, &[namespace]))
        };
        self.flush_exports(pending).await;
        Ok(out)
    }

    /// Serialize `namespaces` for export. Must run under the document lock
    /// so sequence numbers follow mutation order.
    fn collect_exports(
        &self,
        doc: &StateDocument,
        namespaces: &[Namespace],
    ) -> Vec<(Namespace, u64, serde_json::Value)> {
        if self.exporter.is_none() {
            return Vec::new();
        }
        let seq = self.export_seq.fetch_add(1, Ordering::SeqCst) + 1;
        namespaces
            .iter()
            .filter_map(|&namespace| match doc.section_value(namespace) {
                Ok(value) => Some((namespace, seq, value)),
                Err(err) => {
                    warn!(%namespace, %err, "legacy sync skipped");
                    None
                }
            })
            .collect()
    }

    /// Write collected exports on the blocking pool, skipping any namespace
    /// already exported at a newer sequence number.
    async fn flush_exports(&self, pending: Vec<(Namespace, u64, serde_json::Value)>) {
        let Some(exporter) = &self.exporter else {
            return;
        };
        if pending.is_empty() {
            return;
        }

        let mut exported = self.exported.lock().await;
        for (namespace, seq, value) in pending {
            if exported.get(&namespace).is_some_and(|&done| done >= seq) {
                continue;
            }
            let exporter = Arc::clone(exporter);
            let result = match tokio::task::spawn_blocking(move || exporter.export(namespace, &value)).await {
                Ok(result) => result,
                Err(err) => Err(AppError::Io(format!("export task failed: {err}"))),
            };
            match result {
                Ok(()) => {
                    exported.insert(namespace, seq);
                }
                Err(err) => warn!(%namespace, %err, "legacy sync failed"),
            }
        }
    }

    /// Clone a typed section.
    pub async fn get<S: Section>(&self) -> S {
        self.read(|doc| S::section(doc).clone()).await
    }

    /// Replace a typed section.
    pub async fn set<S: Section>(&self, value: S) {
        self.update::<S, ()>(|section| *section = value).await;
    }

    /// Apply an infallible change to a typed section.
    pub async fn update<S: Section, R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let (out, pending) = {
            let mut doc = self.doc.lock().await;
            let out = f(S::section_mut(&mut doc));
            self.dirty.store(true, Ordering::SeqCst);
            (out, self.collect_exports(&doc, &[S::NAMESPACE]))
        };
        self.flush_exports(pending).await;
        out
    }

    /// Apply a fallible change to a typed section.
    ///
    /// # Errors
    ///
    /// Propagates the error returned by `f`; the document is not marked dirty.
    pub async fn try_update<S: Section, R>(&self, f: impl FnOnce(&mut S) -> Result<R>) -> Result<R> {
        self.mutate(S::NAMESPACE, |doc| f(S::section_mut(doc))).await
    }

    /// Read a namespace, or a dotted path inside it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Serialization` if the namespace cannot be encoded.
    pub async fn get_path(
        &self,
        namespace: Namespace,
        path: Option<&str>,
    ) -> Result<Option<serde_json::Value>> {
        let value = self.read(|doc| doc.section_value(namespace)).await?;
        Ok(match path {
            None => Some(value),
            Some(path) => document::lookup_path(&value, path).cloned(),
        })
    }

    /// Write a namespace, or a dotted path inside it.
    ///
    /// The result must still decode as the namespace's typed section.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Serialization` on a shape mismatch; the document
    /// is left unchanged.
    pub async fn set_path(
        &self,
        namespace: Namespace,
        path: Option<&str>,
        value: serde_json::Value,
    ) -> Result<()> {
        self.mutate(namespace, |doc| {
            let mut section = doc.section_value(namespace)?;
            document::assign_path(&mut section, path.unwrap_or_default(), value)?;
            doc.replace_section(namespace, section)
        })
        .await
    }

    /// Clone the whole document.
    pub async fn snapshot(&self) -> StateDocument {
        self.read(Clone::clone).await
    }

    /// Replace the whole document and export every namespace.
    pub async fn replace_document(&self, document: StateDocument) {
        let pending = {
            let mut doc = self.doc.lock().await;
            *doc = document;
            self.dirty.store(true, Ordering::SeqCst);
            self.collect_exports(&doc, &Namespace::ALL)
        };
        self.flush_exports(pending).await;
    }

    /// Flush the document to disk if it is dirty.
    ///
    /// Concurrent callers queue on the write lock in arrival order; each
    /// resolves once the write that covers its changes has finished.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Persistence` if the write fails. The in-memory
    /// document is kept and stays dirty so a later save retries.
    pub async fn save(&self) -> Result<()> {
        let _write = self.write_lock.lock().await;

        let bytes = {
            let mut doc = self.doc.lock().await;
            if !self.dirty.swap(false, Ordering::SeqCst) {
                return Ok(());
            }
            doc.saved_at = Some(Utc::now());
            match serde_json::to_vec_pretty(&*doc) {
                Ok(bytes) => bytes,
                Err(err) => {
                    self.dirty.store(true, Ordering::SeqCst);
                    return Err(err.into());
                }
            }
        };

        let result = async {
            writer::rotate_backups(&self.state_path, self.options.max_backups).await?;
            writer::write_atomic(&self.state_path, &bytes).await
        }
        .await;

        if let Err(err) = result {
            self.dirty.store(true, Ordering::SeqCst);
            warn!(%err, "state save failed");
            return Err(err);
        }
        debug!(bytes = bytes.len(), "state saved");
        Ok(())
    }

    /// Request a save after the debounce delay.
    ///
    /// Bursts of calls inside the delay collapse into one write.
    pub fn schedule_save(self: &Arc<Self>) {
        if self.save_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let store = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(store.options.save_debounce).await;
            store.save_pending.store(false, Ordering::SeqCst);
            if let Err(err) = store.save().await {
                warn!(%err, "debounced save failed");
            }
        });
    }

    /// Start the periodic auto-save task. Replaces a previous one.
    pub async fn spawn_auto_save(self: &Arc<Self>, interval: Duration) {
        let handle = autosave::spawn_auto_save_task(Arc::clone(self), interval, self.cancel.child_token());
        if let Some(previous) = self.auto_save.lock().await.replace(handle) {
            previous.abort();
        }
    }

    /// Existing backup generations, newest first.
    pub async fn list_backups(&self) -> Vec<u32> {
        let mut found = Vec::new();
        for n in 1..=self.options.max_backups {
            if tokio::fs::try_exists(writer::backup_path(&self.state_path, n))
                .await
                .unwrap_or(false)
            {
                found.push(n);
            }
        }
        found
    }

    /// Replace the document with backup generation `n` and persist it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the backup does not exist,
    /// `AppError::Serialization` if it is corrupt, or a persistence error
    /// from the save.
    pub async fn restore_from_backup(&self, n: u32) -> Result<()> {
        let path = writer::backup_path(&self.state_path, n);
        let document = writer::read_json::<StateDocument>(&path)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("backup {n} does not exist")))?;
        self.replace_document(document).await;
        info!(generation = n, "state restored from backup");
        self.save().await
    }

    /// Stop background saving and flush pending changes.
    ///
    /// # Errors
    ///
    /// Returns the error of the final save.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        if let Some(handle) = self.auto_save.lock().await.take() {
            let _ = handle.await;
        }
        self.save().await?;
        info!("state store shut down");
        Ok(())
    }
}
