//! Database facade, recovery, compaction, and the background worker.

use crate::config::{Config, SyncPolicy};
use crate::error::{Error, Result};
use crate::index::ordering::{self, LessFn};
use crate::index::{Index, IndexOptions};
use crate::item::Item;
use crate::log::{write_set, Command, CommandReader};
use crate::rect::RectFn;
use crate::tx::{managed, Tx};
use parking_lot::{Condvar, Mutex, RwLock};
use reefdb_storage::{FileBackend, LogBackend, LogRewrite};
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Items copied per critical section during online compaction.
const SHRINK_CHUNK: usize = 100;

/// Expires-tree key: orders items by expiration instant, then key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct ExpiresKey {
    pub at: SystemTime,
    pub key: Vec<u8>,
}

/// Everything the database lock protects.
pub(crate) struct Core {
    /// Primary tree: all items ordered by key.
    pub keys: BTreeMap<Vec<u8>, Arc<Item>>,
    /// Items with a TTL, ordered by (expiration, key).
    pub expires: BTreeMap<ExpiresKey, Arc<Item>>,
    /// Secondary index registry, ordered by name.
    pub indexes: BTreeMap<String, Index>,
    /// The command log; `None` for an in-memory database.
    pub log: Option<Box<dyn LogBackend>>,
    /// Scratch buffer reused across commit serializations.
    pub buf: Vec<u8>,
    pub config: Config,
    pub closed: bool,
    /// Set while a compaction is running.
    pub shrinking: bool,
    /// Commit appends since open; the worker's fsync pacing watches it.
    pub flushes: u64,
    /// Log size right after open or the last compaction.
    pub last_shrink_size: u64,
}

impl Core {
    fn new(log: Option<Box<dyn LogBackend>>) -> Self {
        Self {
            keys: BTreeMap::new(),
            expires: BTreeMap::new(),
            indexes: BTreeMap::new(),
            log,
            buf: Vec::new(),
            config: Config::default(),
            closed: false,
            shrinking: false,
            flushes: 0,
            last_shrink_size: 0,
        }
    }

    /// Inserts an item, removing any prior item with the same key from
    /// every tree first. Returns the prior item.
    pub(crate) fn insert_item(&mut self, item: Arc<Item>) -> Option<Arc<Item>> {
        let prev = self.keys.insert(item.key.clone(), Arc::clone(&item));
        if let Some(prev) = &prev {
            if let Some(at) = prev.expires_at {
                self.expires.remove(&ExpiresKey {
                    at,
                    key: prev.key.clone(),
                });
            }
            for index in self.indexes.values_mut() {
                index.remove(prev);
            }
        }
        if let Some(at) = item.expires_at {
            self.expires.insert(
                ExpiresKey {
                    at,
                    key: item.key.clone(),
                },
                Arc::clone(&item),
            );
        }
        for index in self.indexes.values_mut() {
            if index.matches(&item.key) {
                index.insert(&item);
            }
        }
        prev
    }

    /// Removes an item from every tree. Returns it, or `None` when the
    /// key does not exist.
    pub(crate) fn delete_item(&mut self, key: &[u8]) -> Option<Arc<Item>> {
        let item = self.keys.remove(key)?;
        if let Some(at) = item.expires_at {
            self.expires.remove(&ExpiresKey {
                at,
                key: item.key.clone(),
            });
        }
        for index in self.indexes.values_mut() {
            index.remove(&item);
        }
        Some(item)
    }

    /// Restores the pre-images recorded by a write transaction.
    pub(crate) fn apply_undo(&mut self, undo: HashMap<Vec<u8>, Option<Arc<Item>>>) {
        for (key, original) in undo {
            self.delete_item(&key);
            if let Some(item) = original {
                self.insert_item(item);
            }
        }
    }

    /// Empties every tree but keeps index definitions.
    fn clear_items(&mut self) {
        self.keys.clear();
        self.expires.clear();
        for index in self.indexes.values_mut() {
            if let Some(tree) = &mut index.tree {
                tree.clear();
            }
            if let Some(spatial) = &mut index.spatial {
                spatial.clear();
            }
        }
    }
}

/// State shared between database handles, transactions, and the
/// background worker.
pub(crate) struct Shared {
    /// The single reader/writer lock over all engine state.
    pub core: RwLock<Core>,
    /// Background worker shutdown flag, paired with `tick`.
    shutdown: Mutex<bool>,
    tick: Condvar,
}

/// An embeddable key/value store with secondary indexes, TTL eviction,
/// and an append-only command log.
///
/// All data access goes through transactions: [`Database::view`] for
/// reads, [`Database::update`] for writes, or [`Database::begin`] for
/// manual control. A single writer is serialized against any number of
/// readers.
///
/// # Example
///
/// ```rust,ignore
/// let db = Database::open("data.db")?;
/// db.update(|tx| {
///     tx.set(b"hello", b"world", None)?;
///     Ok(())
/// })?;
/// db.view(|tx| {
///     assert_eq!(tx.get(b"hello")?, b"world");
///     Ok(())
/// })?;
/// db.close()?;
/// ```
pub struct Database {
    shared: Arc<Shared>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Database {
    /// Opens a database at the given path, creating the file when
    /// missing and replaying the command log when present.
    ///
    /// The path `":memory:"` opens a non-persistent database.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidDatabase`] when the file exists but
    /// is not a valid command log, and with an I/O error when the path
    /// cannot be opened (a directory, for example).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.as_os_str() == ":memory:" {
            return Self::with_log(None);
        }
        let backend = FileBackend::open(path)?;
        Self::with_log(Some(Box::new(backend)))
    }

    /// Opens a database over a pre-built log backend.
    ///
    /// This is a lower-level constructor, mostly useful for tests that
    /// want persistence semantics without a real file.
    pub fn open_with_backend(backend: Box<dyn LogBackend>) -> Result<Self> {
        Self::with_log(Some(backend))
    }

    fn with_log(log: Option<Box<dyn LogBackend>>) -> Result<Self> {
        let mut core = Core::new(log);
        if core.log.is_some() {
            replay_log(&mut core)?;
            info!(
                items = core.keys.len(),
                size = core.last_shrink_size,
                "database loaded"
            );
        }
        let shared = Arc::new(Shared {
            core: RwLock::new(core),
            shutdown: Mutex::new(false),
            tick: Condvar::new(),
        });
        let worker = spawn_manager(Arc::clone(&shared));
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Closes the database: syncs the log, releases the file, stops the
    /// background worker. Closing twice is an error.
    pub fn close(&self) -> Result<()> {
        {
            let mut core = self.shared.core.write();
            if core.closed {
                return Err(Error::DatabaseClosed);
            }
            core.closed = true;
            if let Some(log) = core.log.as_mut() {
                let _ = log.sync();
            }
            core.log = None;
            core.keys.clear();
            core.expires.clear();
            core.indexes.clear();
        }
        *self.shared.shutdown.lock() = true;
        self.shared.tick.notify_all();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Runs `f` in a managed read-only transaction. Any error rolls the
    /// transaction back and propagates.
    ///
    /// Calling `commit` or `rollback` on the transaction inside `f`
    /// panics.
    pub fn view<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Tx<'_>) -> Result<T>,
    {
        managed(&self.shared, false, f)
    }

    /// Runs `f` in a managed write transaction: commits on `Ok`, rolls
    /// back on `Err`.
    ///
    /// Calling `commit` or `rollback` on the transaction inside `f`
    /// panics.
    pub fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Tx<'_>) -> Result<T>,
    {
        managed(&self.shared, true, f)
    }

    /// Begins a manual transaction. The caller must finish it with
    /// `commit` or `rollback`; dropping an unfinished write transaction
    /// rolls back.
    pub fn begin(&self, writable: bool) -> Result<Tx<'_>> {
        Tx::begin(&self.shared, writable)
    }

    // ------------------------------------------------------------------
    // Index management
    // ------------------------------------------------------------------

    /// Creates a B-tree index named `name` over keys matching `pattern`,
    /// ordered by the given comparators combined lexicographically.
    /// Zero comparators yields an index ordered by key alone.
    ///
    /// The index back-fills from the live items and starts serving
    /// immediately. A duplicate or empty name fails with
    /// [`Error::IndexExists`].
    pub fn create_index(&self, name: &str, pattern: &[u8], lessers: &[LessFn]) -> Result<()> {
        self.create_index_with_options(name, pattern, IndexOptions::default(), lessers)
    }

    /// [`Database::create_index`] with per-index options.
    pub fn create_index_with_options(
        &self,
        name: &str,
        pattern: &[u8],
        options: IndexOptions,
        lessers: &[LessFn],
    ) -> Result<()> {
        let less = ordering::composite(lessers);
        self.install_index(name, Index::btree(name, pattern, options, less))
    }

    /// Creates an R-tree index named `name` over keys matching
    /// `pattern`. `rect_of` extracts each item's rectangle; items whose
    /// values it rejects are left out of the index.
    pub fn create_spatial_index(&self, name: &str, pattern: &[u8], rect_of: RectFn) -> Result<()> {
        self.create_spatial_index_with_options(name, pattern, IndexOptions::default(), rect_of)
    }

    /// [`Database::create_spatial_index`] with per-index options.
    pub fn create_spatial_index_with_options(
        &self,
        name: &str,
        pattern: &[u8],
        options: IndexOptions,
        rect_of: RectFn,
    ) -> Result<()> {
        self.install_index(name, Index::spatial(name, pattern, options, rect_of))
    }

    fn install_index(&self, name: &str, mut index: Index) -> Result<()> {
        let mut core = self.shared.core.write();
        if core.closed {
            return Err(Error::DatabaseClosed);
        }
        if name.is_empty() || core.indexes.contains_key(name) {
            return Err(Error::IndexExists);
        }
        for (key, item) in &core.keys {
            if !item.expired() && index.matches(key) {
                index.insert(item);
            }
        }
        core.indexes.insert(name.to_owned(), index);
        Ok(())
    }

    /// Removes an index. The items it contained are untouched.
    pub fn drop_index(&self, name: &str) -> Result<()> {
        let mut core = self.shared.core.write();
        if core.closed {
            return Err(Error::DatabaseClosed);
        }
        if name.is_empty() {
            return Err(Error::InvalidOperation);
        }
        core.indexes
            .remove(name)
            .map(|_| ())
            .ok_or(Error::NotFound)
    }

    /// Returns the index names, lexicographically sorted.
    pub fn indexes(&self) -> Result<Vec<String>> {
        let core = self.shared.core.read();
        if core.closed {
            return Err(Error::DatabaseClosed);
        }
        Ok(core.indexes.keys().cloned().collect())
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Returns a copy of the current configuration.
    pub fn read_config(&self) -> Result<Config> {
        let core = self.shared.core.read();
        if core.closed {
            return Err(Error::DatabaseClosed);
        }
        Ok(core.config.clone())
    }

    /// Replaces the configuration.
    pub fn set_config(&self, config: Config) -> Result<()> {
        let mut core = self.shared.core.write();
        if core.closed {
            return Err(Error::DatabaseClosed);
        }
        core.config = config;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Rewrites the command log down to one `set` per live item.
    ///
    /// Runs online: items are copied in small chunks under short read
    /// locks, writers proceed in between, and their appends are carried
    /// over before the rewritten log atomically replaces the original.
    /// A no-op for in-memory databases; a second concurrent call fails
    /// with [`Error::ShrinkInProcess`].
    pub fn shrink(&self) -> Result<()> {
        shrink_impl(&self.shared)
    }

    /// Writes the whole database to `writer` as a RESP command stream,
    /// one `set` per live item in key order.
    pub fn save(&self, writer: &mut dyn Write) -> Result<()> {
        let core = self.shared.core.read();
        if core.closed {
            return Err(Error::DatabaseClosed);
        }
        let mut buf = Vec::with_capacity(16 * 1024);
        for (key, item) in &core.keys {
            if item.expired() {
                continue;
            }
            write_set(&mut buf, key, &item.value, item.expires_at);
            if buf.len() >= 16 * 1024 {
                writer.write_all(&buf)?;
                buf.clear();
            }
        }
        writer.write_all(&buf)?;
        Ok(())
    }

    /// Replaces the database contents from a RESP command stream.
    ///
    /// Only valid on an in-memory database: on a persistent one the
    /// log on disk would silently diverge from memory, so this fails
    /// with [`Error::InvalidOperation`].
    pub fn load(&self, reader: &mut dyn Read) -> Result<()> {
        let mut core = self.shared.core.write();
        if core.closed {
            return Err(Error::DatabaseClosed);
        }
        if core.log.is_some() {
            return Err(Error::InvalidOperation);
        }
        core.clear_items();
        let now = SystemTime::now();
        let mut commands = CommandReader::new(reader);
        while let Some(command) = commands.next_command()? {
            apply_command(&mut core, command, now, Duration::ZERO);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.shared.core.read();
        f.debug_struct("Database")
            .field("items", &core.keys.len())
            .field("indexes", &core.indexes.len())
            .field("persistent", &core.log.is_some())
            .field("closed", &core.closed)
            .finish()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Replays the command log into a fresh core.
///
/// TTLs are persisted as seconds-remaining, so each one is re-anchored
/// against the file's modification time: a record written with `ex 10`
/// in a file last touched 4 seconds ago has 6 seconds left.
fn replay_log(core: &mut Core) -> Result<()> {
    let log = core.log.as_ref().expect("replay requires a log");
    let modified = log.modified()?;
    let reader = log.reader()?;

    let now = SystemTime::now();
    let elapsed = now.duration_since(modified).unwrap_or(Duration::ZERO);
    let mut commands = CommandReader::new(reader);
    while let Some(command) = commands.next_command()? {
        apply_command(core, command, now, elapsed);
    }
    core.last_shrink_size = core.log.as_ref().expect("still present").size()?;
    Ok(())
}

fn apply_command(core: &mut Core, command: Command, now: SystemTime, elapsed: Duration) {
    match command {
        Command::Set {
            key,
            value,
            ttl_secs: None,
        } => {
            core.insert_item(Item::new(key, value, None));
        }
        Command::Set {
            key,
            value,
            ttl_secs: Some(secs),
        } => {
            let ttl = Duration::from_secs(secs);
            // Anything at or past its deadline stays dead.
            if ttl > elapsed {
                core.insert_item(Item::new(key, value, Some(now + (ttl - elapsed))));
            }
        }
        Command::Del { key } => {
            core.delete_item(&key);
        }
    }
}

/// Online log compaction. See `Database::shrink` for the contract.
fn shrink_impl(shared: &Shared) -> Result<()> {
    let (rewriter, endpos) = {
        let mut core = shared.core.write();
        if core.closed {
            return Err(Error::DatabaseClosed);
        }
        if core.log.is_none() {
            // In-memory only; there is no log to rewrite.
            return Ok(());
        }
        if core.shrinking {
            return Err(Error::ShrinkInProcess);
        }
        let log = core.log.as_mut().expect("checked above");
        let endpos = log.size()?;
        let rewriter = log.begin_rewrite()?;
        core.shrinking = true;
        (rewriter, endpos)
    };

    debug!(endpos, "shrink started");
    let result = shrink_copy(shared, rewriter, endpos);
    shared.core.write().shrinking = false;
    if let Ok(size) = &result {
        info!(before = endpos, after = *size, "shrink finished");
    }
    result.map(|_| ())
}

/// Copies live items to the rewriter in bounded chunks, then swaps the
/// rewritten log in under the write lock. Returns the new log size.
fn shrink_copy(
    shared: &Shared,
    mut rewriter: Box<dyn LogRewrite>,
    endpos: u64,
) -> Result<u64> {
    let mut pivot: Option<Vec<u8>> = None;
    loop {
        let mut buf = Vec::new();
        let done = {
            let core = shared.core.read();
            if core.closed {
                return Err(Error::DatabaseClosed);
            }
            let range = match &pivot {
                None => core.keys.range::<Vec<u8>, _>(..),
                Some(last) => core
                    .keys
                    .range((Bound::Excluded(last.clone()), Bound::Unbounded)),
            };
            let mut copied = 0;
            let mut done = true;
            for (key, item) in range {
                if copied >= SHRINK_CHUNK {
                    done = false;
                    break;
                }
                if !item.expired() {
                    write_set(&mut buf, key, &item.value, item.expires_at);
                }
                pivot = Some(key.clone());
                copied += 1;
            }
            done
        };
        // Write outside the lock so readers and writers keep moving.
        rewriter.write(&buf)?;
        if done {
            break;
        }
    }

    let mut core = shared.core.write();
    if core.closed {
        return Err(Error::DatabaseClosed);
    }
    rewriter.commit(endpos)?;
    let log = core.log.as_mut().ok_or(Error::DatabaseClosed)?;
    log.reopen()?;
    let size = log.size()?;
    core.last_shrink_size = size;
    Ok(size)
}

fn spawn_manager(shared: Arc<Shared>) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("reefdb-manager".into())
        .spawn(move || manager_loop(&shared))
        .expect("failed to spawn background manager")
}

/// The background worker: roughly once per second it sweeps expired
/// items, paces the every-second fsync, and schedules auto-compaction.
fn manager_loop(shared: &Shared) {
    let mut synced_flushes = 0u64;
    loop {
        {
            let mut stop = shared.shutdown.lock();
            if !*stop {
                shared.tick.wait_for(&mut stop, Duration::from_secs(1));
            }
            if *stop {
                return;
            }
        }
        if tick(shared, &mut synced_flushes).is_err() {
            return;
        }
    }
}

/// One worker pass. `Err(())` means the database has closed.
fn tick(shared: &Shared, synced_flushes: &mut u64) -> std::result::Result<(), ()> {
    let mut want_shrink = false;
    let mut notify: Vec<Arc<Item>> = Vec::new();
    let mut async_hook = None;

    let result = managed(shared, true, |tx| {
        let now = SystemTime::now();
        let (expired, sync_hook) = {
            let core = tx.core()?;
            if core.log.is_some() && !core.config.auto_shrink_disabled {
                let size = core.log.as_ref().expect("checked").size()?;
                let last = core.last_shrink_size;
                let threshold =
                    last + last.saturating_mul(core.config.auto_shrink_percentage) / 100;
                want_shrink = size > core.config.auto_shrink_min_size && size > threshold;
            }
            let expired: Vec<Arc<Item>> = core
                .expires
                .iter()
                .take_while(|(entry, _)| entry.at <= now)
                .map(|(_, item)| Arc::clone(item))
                .collect();
            async_hook = core.config.on_expired.clone();
            (expired, core.config.on_expired_sync.clone())
        };

        if let Some(hook) = &sync_hook {
            // The hook owns each expiring item's fate.
            for item in &expired {
                match hook(&item.key, &item.value, tx) {
                    Ok(()) | Err(Error::NotFound) => {}
                    Err(e) => return Err(e),
                }
            }
        } else if async_hook.is_some() {
            notify = expired;
        } else {
            for item in &expired {
                match tx.delete(&item.key) {
                    Ok(_) | Err(Error::NotFound) => {}
                    Err(e) => return Err(e),
                }
            }
            if !expired.is_empty() {
                debug!(count = expired.len(), "swept expired items");
            }
        }

        let needs_sync = {
            let core = tx.core()?;
            core.log.is_some()
                && core.config.sync_policy == SyncPolicy::EverySecond
                && *synced_flushes != core.flushes
        };
        if needs_sync {
            let core = tx.core_mut()?;
            let flushes = core.flushes;
            core.log.as_mut().expect("checked").sync()?;
            *synced_flushes = flushes;
        }
        Ok(())
    });

    match result {
        Ok(()) => {}
        Err(Error::DatabaseClosed) => return Err(()),
        Err(e) => warn!(error = %e, "background pass failed"),
    }

    if let Some(hook) = &async_hook {
        for item in &notify {
            hook(&item.key, &item.value);
        }
    }

    if want_shrink {
        match shrink_impl(shared) {
            Ok(()) | Err(Error::ShrinkInProcess) => {}
            Err(Error::DatabaseClosed) => return Err(()),
            Err(e) => warn!(error = %e, "auto shrink failed"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::SetOptions;
    use crate::Rect;

    fn db() -> Database {
        Database::open(":memory:").unwrap()
    }

    fn set_plain(db: &Database, key: &[u8], value: &[u8]) {
        db.update(|tx| tx.set(key, value, None).map(|_| ())).unwrap();
    }

    #[test]
    fn set_get_delete() {
        let db = db();
        set_plain(&db, b"hello", b"world");

        assert_eq!(db.view(|tx| tx.get(b"hello")).unwrap(), b"world");
        assert_eq!(db.update(|tx| tx.delete(b"hello")).unwrap(), b"world");
        assert!(matches!(
            db.view(|tx| tx.get(b"hello")),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn set_reports_replacement() {
        let db = db();
        db.update(|tx| {
            assert_eq!(tx.set(b"k", b"one", None)?, None);
            assert_eq!(tx.set(b"k", b"two", None)?, Some(b"one".to_vec()));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn replacing_expired_item_reports_no_replacement() {
        let db = db();
        db.update(|tx| {
            tx.set(
                b"k",
                b"stale",
                Some(SetOptions {
                    ttl: Some(Duration::ZERO),
                }),
            )?;
            Ok(())
        })
        .unwrap();
        db.update(|tx| {
            assert_eq!(tx.set(b"k", b"fresh", None)?, None);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn rollback_restores_prior_value() {
        let db = db();
        set_plain(&db, b"hello", b"planet");

        let err = db
            .update(|tx| {
                tx.set(b"hello", b"world", None)?;
                Err::<(), _>(Error::InvalidOperation)
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation));

        assert_eq!(db.view(|tx| tx.get(b"hello")).unwrap(), b"planet");
    }

    #[test]
    fn rollback_restores_deletes_and_inserts() {
        let db = db();
        set_plain(&db, b"keep", b"original");

        db.update(|tx| {
            tx.delete(b"keep")?;
            tx.set(b"new", b"x", None)?;
            tx.set(b"keep", b"changed", None)?;
            Err::<(), _>(Error::InvalidOperation)
        })
        .ok();

        db.view(|tx| {
            assert_eq!(tx.get(b"keep")?, b"original");
            assert!(matches!(tx.get(b"new"), Err(Error::NotFound)));
            assert_eq!(tx.len()?, 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn manual_transaction_lifecycle() {
        let db = db();
        let mut tx = db.begin(true).unwrap();
        tx.set(b"a", b"1", None).unwrap();
        tx.commit().unwrap();

        assert!(matches!(tx.get(b"a"), Err(Error::TxClosed)));
        assert!(matches!(tx.commit(), Err(Error::TxClosed)));

        assert_eq!(db.view(|tx| tx.get(b"a")).unwrap(), b"1");
    }

    #[test]
    fn manual_rollback_discards() {
        let db = db();
        let mut tx = db.begin(true).unwrap();
        tx.set(b"a", b"1", None).unwrap();
        tx.rollback().unwrap();

        assert!(matches!(db.view(|tx| tx.get(b"a")), Err(Error::NotFound)));
    }

    #[test]
    fn dropped_write_tx_rolls_back() {
        let db = db();
        {
            let mut tx = db.begin(true).unwrap();
            tx.set(b"a", b"1", None).unwrap();
            // Dropped without commit.
        }
        assert!(matches!(db.view(|tx| tx.get(b"a")), Err(Error::NotFound)));
    }

    #[test]
    fn read_only_transactions_cannot_write() {
        let db = db();
        let err = db.view(|tx| tx.set(b"a", b"1", None)).unwrap_err();
        assert!(matches!(err, Error::TxNotWritable));

        let mut tx = db.begin(false).unwrap();
        assert!(matches!(tx.delete(b"a"), Err(Error::TxNotWritable)));
        assert!(matches!(tx.commit(), Err(Error::TxNotWritable)));
        tx.rollback().unwrap();
    }

    #[test]
    #[should_panic(expected = "managed tx commit not allowed")]
    fn manual_commit_inside_update_panics() {
        let db = db();
        let _ = db.update(|tx| tx.commit());
    }

    #[test]
    #[should_panic(expected = "managed tx rollback not allowed")]
    fn manual_rollback_inside_view_panics() {
        let db = db();
        let _ = db.view(|tx| tx.rollback());
    }

    #[test]
    fn zero_ttl_is_born_expired() {
        let db = db();
        db.update(|tx| {
            tx.set(
                b"gone",
                b"x",
                Some(SetOptions {
                    ttl: Some(Duration::ZERO),
                }),
            )?;
            Ok(())
        })
        .unwrap();

        db.view(|tx| {
            assert!(matches!(tx.get(b"gone"), Err(Error::NotFound)));
            assert!(matches!(tx.ttl(b"gone"), Err(Error::NotFound)));
            // Physically present until swept.
            assert_eq!(tx.len()?, 1);
            Ok(())
        })
        .unwrap();

        // Delete still removes it but reports not found.
        let err = db.update(|tx| tx.delete(b"gone")).unwrap_err();
        assert!(matches!(err, Error::NotFound));
        assert_eq!(db.view(|tx| tx.len()).unwrap(), 0);
    }

    #[test]
    fn ttl_reporting() {
        let db = db();
        db.update(|tx| {
            tx.set(b"forever", b"x", None)?;
            tx.set(
                b"brief",
                b"y",
                Some(SetOptions {
                    ttl: Some(Duration::from_secs(60)),
                }),
            )?;
            Ok(())
        })
        .unwrap();

        db.view(|tx| {
            assert_eq!(tx.ttl(b"forever")?, None);
            let remaining = tx.ttl(b"brief")?.unwrap();
            assert!(remaining <= Duration::from_secs(60));
            assert!(remaining > Duration::from_secs(58));
            assert!(matches!(tx.ttl(b"missing"), Err(Error::NotFound)));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn get_ignore_expired_sees_stale_value() {
        let db = db();
        db.update(|tx| {
            tx.set(
                b"stale",
                b"value",
                Some(SetOptions {
                    ttl: Some(Duration::ZERO),
                }),
            )?;
            Ok(())
        })
        .unwrap();

        db.view(|tx| {
            assert!(matches!(tx.get(b"stale"), Err(Error::NotFound)));
            assert_eq!(tx.get_ignore_expired(b"stale")?, b"value");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn index_lifecycle() {
        let db = db();
        db.create_index("b-names", b"*", &[ordering::string()]).unwrap();
        db.create_index("a-ages", b"*", &[ordering::int()]).unwrap();

        assert!(matches!(
            db.create_index("a-ages", b"*", &[]),
            Err(Error::IndexExists)
        ));
        assert!(matches!(
            db.create_index("", b"*", &[]),
            Err(Error::IndexExists)
        ));

        assert_eq!(db.indexes().unwrap(), ["a-ages", "b-names"]);

        db.drop_index("a-ages").unwrap();
        assert!(matches!(db.drop_index("a-ages"), Err(Error::NotFound)));
        assert!(matches!(db.drop_index(""), Err(Error::InvalidOperation)));
        assert_eq!(db.indexes().unwrap(), ["b-names"]);

        db.view(|tx| {
            let err = tx.ascend("a-ages", |_, _, _| Ok(true)).unwrap_err();
            assert!(matches!(err, Error::NotFound));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn index_backfills_existing_items() {
        let db = db();
        for (k, v) in [("1", "30"), ("2", "10"), ("3", "20")] {
            set_plain(&db, k.as_bytes(), v.as_bytes());
        }
        db.create_index("ages", b"*", &[ordering::int()]).unwrap();

        db.view(|tx| {
            let mut order = Vec::new();
            tx.ascend("ages", |_, k, _| {
                order.push(k.to_vec());
                Ok(true)
            })?;
            assert_eq!(order, [b"2".to_vec(), b"3".to_vec(), b"1".to_vec()]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn index_tracks_replacements_and_pattern_exits() {
        let db = db();
        db.create_index("nums", b"num:*", &[ordering::int()]).unwrap();

        set_plain(&db, b"num:1", b"5");
        set_plain(&db, b"other:1", b"ignored");

        let count = |db: &Database| {
            db.view(|tx| {
                let mut n = 0;
                tx.ascend("nums", |_, _, _| {
                    n += 1;
                    Ok(true)
                })?;
                Ok(n)
            })
            .unwrap()
        };
        assert_eq!(count(&db), 1);

        // Replacement stays indexed exactly once.
        set_plain(&db, b"num:1", b"7");
        assert_eq!(count(&db), 1);

        db.update(|tx| tx.delete(b"num:1")).unwrap();
        assert_eq!(count(&db), 0);
    }

    #[test]
    fn composite_index_with_descending_secondary() {
        let db = db();
        db.create_index(
            "last_name_age",
            b"*",
            &[
                ordering::json("name.last"),
                ordering::desc(ordering::json("age")),
            ],
        )
        .unwrap();

        let records = [
            ("1", r#"{"name":{"first":"Tom","last":"Johnson"},"age":38}"#),
            ("2", r#"{"name":{"first":"Janet","last":"Prichard"},"age":47}"#),
            ("3", r#"{"name":{"first":"Carol","last":"Anderson"},"age":52}"#),
            ("4", r#"{"name":{"first":"Alan","last":"Cooper"},"age":28}"#),
            ("5", r#"{"name":{"first":"Sam","last":"Anderson"},"age":51}"#),
            ("6", r#"{"name":{"first":"Melinda","last":"Prichard"},"age":44}"#),
        ];
        db.update(|tx| {
            for (k, v) in records {
                tx.set(k.as_bytes(), v.as_bytes(), None)?;
            }
            Ok(())
        })
        .unwrap();

        db.view(|tx| {
            let mut order = Vec::new();
            tx.ascend("last_name_age", |_, k, _| {
                order.push(String::from_utf8(k.to_vec()).unwrap());
                Ok(true)
            })?;
            // Anderson 52, Anderson 51, Cooper 28, Johnson 38,
            // Prichard 47, Prichard 44.
            assert_eq!(order, ["3", "5", "4", "1", "2", "6"]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn spatial_index_intersection() {
        let db = db();
        db.create_spatial_index("fleet", b"fleet:*:pos", Rect::parser())
            .unwrap();

        db.update(|tx| {
            tx.set(b"fleet:0:pos", b"[-115.567 33.532]", None)?;
            tx.set(b"fleet:1:pos", b"[-116.671 35.735]", None)?;
            tx.set(b"fleet:2:pos", b"[-113.902 31.234]", None)?;
            Ok(())
        })
        .unwrap();

        db.update(|tx| {
            let mut found = Vec::new();
            tx.intersects("fleet", b"[-117 30],[-112 36]", |_, k, _| {
                found.push(String::from_utf8(k.to_vec()).unwrap());
                Ok(true)
            })?;
            found.sort();
            assert_eq!(found, ["fleet:0:pos", "fleet:1:pos", "fleet:2:pos"]);

            // Narrower query.
            let mut found = Vec::new();
            tx.intersects("fleet", b"[-117 33],[-115 36]", |_, k, _| {
                found.push(String::from_utf8(k.to_vec()).unwrap());
                Ok(true)
            })?;
            found.sort();
            assert_eq!(found, ["fleet:0:pos", "fleet:1:pos"]);

            // Empty index name is a no-op; missing index errors.
            tx.intersects("", b"[0 0]", |_, _, _| Ok(true))?;
            assert!(matches!(
                tx.intersects("nope", b"[0 0]", |_, _, _| Ok(true)),
                Err(Error::NotFound)
            ));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn spatial_index_drops_removed_items() {
        let db = db();
        db.create_spatial_index("pts", b"*", Rect::parser()).unwrap();
        set_plain(&db, b"p1", b"[1 1]");
        db.update(|tx| tx.delete(b"p1")).unwrap();

        db.update(|tx| {
            let mut n = 0;
            tx.intersects("pts", b"[0 0],[5 5]", |_, _, _| {
                n += 1;
                Ok(true)
            })?;
            assert_eq!(n, 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn case_insensitive_index_matching() {
        let db = db();
        db.create_index_with_options(
            "users",
            b"User:*",
            IndexOptions {
                case_insensitive_key_matching: true,
            },
            &[ordering::string()],
        )
        .unwrap();

        set_plain(&db, b"user:1", b"a");
        set_plain(&db, b"USER:2", b"b");
        set_plain(&db, b"other", b"c");

        db.view(|tx| {
            let mut n = 0;
            tx.ascend("users", |_, _, _| {
                n += 1;
                Ok(true)
            })?;
            assert_eq!(n, 2);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn scan_on_spatial_index_is_a_no_op() {
        let db = db();
        db.create_spatial_index("pts", b"*", Rect::parser()).unwrap();
        set_plain(&db, b"p1", b"[1 1]");

        db.view(|tx| {
            let mut n = 0;
            tx.ascend("pts", |_, _, _| {
                n += 1;
                Ok(true)
            })?;
            assert_eq!(n, 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn close_is_terminal() {
        let db = db();
        db.close().unwrap();
        assert!(matches!(db.close(), Err(Error::DatabaseClosed)));
        assert!(matches!(
            db.view(|tx| tx.len()),
            Err(Error::DatabaseClosed)
        ));
        assert!(matches!(
            db.update(|tx| tx.set(b"a", b"1", None)),
            Err(Error::DatabaseClosed)
        ));
        assert!(matches!(db.indexes(), Err(Error::DatabaseClosed)));
        assert!(matches!(db.shrink(), Err(Error::DatabaseClosed)));
        assert!(matches!(
            db.create_index("x", b"*", &[]),
            Err(Error::DatabaseClosed)
        ));
    }

    #[test]
    fn config_round_trip() {
        let db = db();
        let config = db.read_config().unwrap().sync_policy(SyncPolicy::Always);
        db.set_config(config).unwrap();
        assert_eq!(db.read_config().unwrap().sync_policy, SyncPolicy::Always);
    }

    #[test]
    fn save_and_load_round_trip() {
        let source = db();
        set_plain(&source, b"a", b"1");
        set_plain(&source, b"b", b"2");
        db_set_ttl(&source, b"t", b"3", Duration::from_secs(300));

        let mut dump = Vec::new();
        source.save(&mut dump).unwrap();

        let target = db();
        set_plain(&target, b"old", b"gone");
        target.load(&mut dump.as_slice()).unwrap();

        target
            .view(|tx| {
                assert_eq!(tx.get(b"a")?, b"1");
                assert_eq!(tx.get(b"b")?, b"2");
                assert_eq!(tx.get(b"t")?, b"3");
                let remaining = tx.ttl(b"t")?.unwrap();
                assert!(remaining > Duration::from_secs(298));
                assert!(matches!(tx.get(b"old"), Err(Error::NotFound)));
                Ok(())
            })
            .unwrap();
    }

    fn db_set_ttl(db: &Database, key: &[u8], value: &[u8], ttl: Duration) {
        db.update(|tx| {
            tx.set(key, value, Some(SetOptions { ttl: Some(ttl) }))?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn shrink_in_memory_is_a_no_op() {
        let db = db();
        set_plain(&db, b"a", b"1");
        db.shrink().unwrap();
        assert_eq!(db.view(|tx| tx.len()).unwrap(), 1);
    }

    #[test]
    fn update_propagates_user_error_and_rolls_back() {
        let db = db();
        set_plain(&db, b"k", b"v");
        let err = db
            .update(|tx| {
                tx.delete(b"k")?;
                tx.get(b"missing").map(|_| ())
            })
            .unwrap_err();
        assert!(matches!(err, Error::NotFound));
        assert_eq!(db.view(|tx| tx.get(b"k")).unwrap(), b"v");
    }

    #[test]
    fn writes_visible_inside_own_transaction() {
        let db = db();
        db.update(|tx| {
            tx.set(b"a", b"1", None)?;
            assert_eq!(tx.get(b"a")?, b"1");
            tx.delete(b"a")?;
            assert!(matches!(tx.get(b"a"), Err(Error::NotFound)));
            tx.set(b"a", b"2", None)?;
            assert_eq!(tx.get(b"a")?, b"2");
            Ok(())
        })
        .unwrap();
        assert_eq!(db.view(|tx| tx.get(b"a")).unwrap(), b"2");
    }
}
