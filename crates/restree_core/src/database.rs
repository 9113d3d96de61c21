//! Database facade and lifecycle.

use crate::change_feed::{ChangeFeed, ListenerError, ListenerId, ResourceEvent, ResourceListener};
use crate::config::Config;
#[cfg(feature = "std")]
use crate::dir::DatabaseDir;
use crate::error::{CoreError, CoreResult};
use crate::overlay::VirtualResourceDb;
use crate::persistence::{
    recover, FlushOutcome, GenerationInfo, LogStore, Prefixes, RecoveryReport, TimedPersistence,
};
use crate::resource::Session;
use crate::schema::SchemaRegistry;
use crate::stats::DatabaseStats;
use crate::types::Generation;
use parking_lot::{Mutex, RwLock};
use restree_storage::{MemoryDirectory, StorageDirectory};
use serde::Serialize;
#[cfg(feature = "std")]
use std::path::Path;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Weak};

/// State shared by the database handle, its sessions and the flush thread.
pub(crate) struct DbInner {
    pub(crate) tree: VirtualResourceDb,
    pub(crate) schema: Arc<SchemaRegistry>,
    pub(crate) stats: Arc<DatabaseStats>,
    store: LogStore,
    feed: ChangeFeed,
    config: Config,
    report: RecoveryReport,
    is_open: RwLock<bool>,
    #[cfg(feature = "std")]
    _dir: Option<DatabaseDir>,
}

impl DbInner {
    pub(crate) fn ensure_open(&self) -> CoreResult<()> {
        if *self.is_open.read() {
            Ok(())
        } else {
            Err(CoreError::DatabaseClosed)
        }
    }

    /// Hands events to the feed, or holds them while the calling thread has
    /// a transaction open.
    pub(crate) fn publish(&self, events: Vec<ResourceEvent>) {
        if events.is_empty() {
            return;
        }
        if self.tree.lock().is_write_held() {
            self.feed.hold(events);
            return;
        }
        let dispatched = self.feed.emit_batch(events);
        self.record_dispatch(dispatched.events, dispatched.failures);
    }

    fn record_dispatch(&self, events: u64, failures: u64) {
        self.stats.record_events(events);
        for _ in 0..failures {
            self.stats.record_listener_failure();
        }
    }

    pub(crate) fn start_transaction(&self) -> CoreResult<usize> {
        self.tree.start_transaction()
    }

    pub(crate) fn finish_transaction(&self) -> CoreResult<usize> {
        let remaining = self.tree.finish_transaction()?;
        if remaining == 0 {
            let dispatched = self.feed.release();
            self.record_dispatch(dispatched.events, dispatched.failures);
        }
        Ok(remaining)
    }

    fn flush(&self) -> CoreResult<FlushOutcome> {
        self.ensure_open()?;
        if self.tree.lock().is_write_held() {
            return Err(CoreError::illegal_state(
                "cannot flush while holding the exclusive lock",
            ));
        }
        self.store.flush(&self.tree)
    }
}

/// One node of a [`ResourceDb::dump`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeInfo {
    /// Storage path.
    pub path: String,
    /// Resource id.
    pub id: u32,
    /// Schema type.
    pub type_name: String,
    /// Active flag.
    pub active: bool,
    /// Decorator flag.
    pub decorator: bool,
    /// Target path, for references.
    pub reference: Option<String>,
    /// Owning application, for toplevel resources.
    pub owner: Option<String>,
    /// Rendered value, for value resources.
    pub value: Option<String>,
    /// Last write time.
    pub last_modified: i64,
}

/// The main database handle.
///
/// `ResourceDb` owns the recovered tree, the generation files and the
/// background flush thread. Applications work through [`Session`]s.
///
/// ```rust,ignore
/// use restree_core::{Config, ResourceDb, SchemaRegistry};
/// use std::path::Path;
///
/// let db = ResourceDb::open(Path::new("store"), Config::default(), SchemaRegistry::new())?;
/// let app = db.session("heating");
/// let meter = app.add_resource("meter", "FloatResource")?;
/// meter.set_float(10.0)?;
/// db.close()?;
/// ```
///
/// Dropping the handle closes the database, which stops the flush thread and
/// performs a final flush unless [`Config::flush_on_close`] is off.
pub struct ResourceDb {
    inner: Arc<DbInner>,
    timed: Mutex<Option<TimedPersistence>>,
}

impl ResourceDb {
    /// Opens or creates a store in a directory and takes its lock.
    ///
    /// # Errors
    ///
    /// - `DatabaseLocked` if another process has the store open
    /// - `InvalidPath` if the directory is missing and
    ///   [`Config::create_if_missing`] is off
    /// - `Recovery` if generation files exist but none is usable
    #[cfg(feature = "std")]
    pub fn open(path: &Path, config: Config, schema: SchemaRegistry) -> CoreResult<Self> {
        let dir = DatabaseDir::open(path, config.create_if_missing)?;
        let files = dir.files();
        tracing::info!(path = %path.display(), "opening resource database");
        Self::build(files, config, schema, Some(dir))
    }

    /// Opens a store living in any [`StorageDirectory`].
    ///
    /// # Errors
    ///
    /// `Recovery` if generation files exist but none is usable, I/O errors.
    pub fn open_with_directory(
        dir: Arc<dyn StorageDirectory>,
        config: Config,
        schema: SchemaRegistry,
    ) -> CoreResult<Self> {
        #[cfg(feature = "std")]
        return Self::build(dir, config, schema, None);
        #[cfg(not(feature = "std"))]
        return Self::build(dir, config, schema);
    }

    /// Opens a fresh store in memory, without a background flush.
    ///
    /// # Errors
    ///
    /// Fails only if the initial generations cannot be written.
    pub fn open_in_memory(schema: SchemaRegistry) -> CoreResult<Self> {
        Self::open_with_directory(
            Arc::new(MemoryDirectory::new()),
            Config::default().background_flush(false),
            schema,
        )
    }

    fn build(
        files: Arc<dyn StorageDirectory>,
        config: Config,
        schema: SchemaRegistry,
        #[cfg(feature = "std")] dir: Option<DatabaseDir>,
    ) -> CoreResult<Self> {
        let schema = Arc::new(schema);
        let prefixes = Prefixes {
            structure: config.structure_prefix.clone(),
            values: config.value_prefix.clone(),
        };
        let recovered = recover(files.as_ref(), &prefixes, Arc::clone(&schema))?;
        let report = recovered.report.clone();
        let (index, generations) = recovered.split();

        let stats = Arc::new(DatabaseStats::new());
        if !report.new_store {
            stats.record_recovery();
        }
        tracing::info!(
            resources = index.len(),
            structure = ?report.structure_current,
            values = report.value_current,
            rebuilt = report.rebuilt,
            new_store = report.new_store,
            "resource database ready"
        );

        let store = LogStore::new(
            files,
            prefixes,
            config.compaction_start_size,
            Arc::clone(&stats),
            generations,
        );
        let inner = Arc::new(DbInner {
            tree: VirtualResourceDb::new(index, config.node_cache_capacity),
            schema,
            stats,
            store,
            feed: ChangeFeed::new(),
            config,
            report,
            is_open: RwLock::new(true),
            #[cfg(feature = "std")]
            _dir: dir,
        });

        let timed = if inner.config.background_flush {
            let weak: Weak<DbInner> = Arc::downgrade(&inner);
            Some(TimedPersistence::start(inner.config.store_period, move || {
                match weak.upgrade() {
                    Some(inner) if *inner.is_open.read() => inner.flush().map(|_| ()),
                    _ => Ok(()),
                }
            })?)
        } else {
            None
        };

        Ok(Self {
            inner,
            timed: Mutex::new(timed),
        })
    }

    /// A session acting for application `app_id`.
    #[must_use]
    pub fn session(&self, app_id: &str) -> Session {
        Session::new(Arc::clone(&self.inner), app_id)
    }

    /// The schema the store was opened with.
    #[must_use]
    pub fn schema(&self) -> &SchemaRegistry {
        &self.inner.schema
    }

    /// The configuration the store was opened with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Current generation files.
    #[must_use]
    pub fn generations(&self) -> GenerationInfo {
        self.inner.store.generations()
    }

    /// What recovery found when the store was opened.
    #[must_use]
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.inner.report
    }

    /// Persistence and dispatch counters.
    #[must_use]
    pub fn stats(&self) -> &DatabaseStats {
        &self.inner.stats
    }

    /// Number of real resources.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.inner.tree.index().len()
    }

    /// Writes all pending changes now.
    ///
    /// # Errors
    ///
    /// `IllegalState` if the calling thread has a transaction open,
    /// `DatabaseClosed`, I/O errors.
    pub fn flush(&self) -> CoreResult<FlushOutcome> {
        self.inner.flush()
    }

    /// Rewrites the value generation without superseded records.
    ///
    /// # Errors
    ///
    /// As [`Self::flush`].
    pub fn compact(&self) -> CoreResult<Generation> {
        self.inner.ensure_open()?;
        if self.inner.tree.lock().is_write_held() {
            return Err(CoreError::illegal_state(
                "cannot compact while holding the exclusive lock",
            ));
        }
        self.inner.store.compact(&self.inner.tree)
    }

    /// Subscribes to every future event.
    #[must_use]
    pub fn subscribe(&self) -> Receiver<ResourceEvent> {
        self.inner.feed.subscribe()
    }

    /// Registers a callback for events at or below `prefix`; every event
    /// for `None`.
    pub fn add_listener<F>(&self, prefix: Option<&str>, listener: F) -> ListenerId
    where
        F: Fn(&ResourceEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.inner.feed.add_listener(prefix, Arc::new(listener))
    }

    /// Registers a shared listener.
    pub fn add_listener_arc(
        &self,
        prefix: Option<&str>,
        listener: Arc<dyn ResourceListener>,
    ) -> ListenerId {
        self.inner.feed.add_listener(prefix, listener)
    }

    /// Removes a listener. Returns `false` if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.feed.remove_listener(id)
    }

    /// Lists every real node, parents first.
    #[must_use]
    pub fn dump(&self) -> Vec<NodeInfo> {
        let _shared = self.inner.tree.lock().read();
        let index = self.inner.tree.index();
        index
            .walk()
            .into_iter()
            .map(|el| NodeInfo {
                path: index.path_of(el.id()).unwrap_or_default(),
                id: el.id().as_u32(),
                type_name: el.type_name().to_string(),
                active: el.is_active(),
                decorator: el.is_decorator(),
                reference: el.reference_target().and_then(|t| index.path_of(t)),
                owner: el.app_id().map(str::to_string),
                value: el
                    .value()
                    .filter(|_| el.type_key().has_value())
                    .map(ToString::to_string),
                last_modified: el.last_modified(),
            })
            .collect()
    }

    /// Closes the database: stops the flush thread, writes pending changes
    /// if configured, and rejects further operations. Closing twice is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns the error of the final flush; the database is closed anyway.
    pub fn close(&self) -> CoreResult<()> {
        if !*self.inner.is_open.read() {
            return Ok(());
        }
        if let Some(mut timed) = self.timed.lock().take() {
            timed.stop();
        }
        let flushed = if self.inner.config.flush_on_close {
            self.inner.flush().map(|_| ())
        } else {
            Ok(())
        };
        *self.inner.is_open.write() = false;
        tracing::info!("resource database closed");
        flushed
    }

    /// Checks if the database is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        !*self.inner.is_open.read()
    }
}

impl std::fmt::Debug for ResourceDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceDb")
            .field("resources", &self.resource_count())
            .field("generations", &self.generations())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Drop for ResourceDb {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "final flush failed");
        }
    }
}
