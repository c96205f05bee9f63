//! Transactions: the only way in or out of the database.
//!
//! A read-only transaction holds the database's read lock for its whole
//! lifetime; a write transaction holds the write lock. Mutations are
//! applied to the trees immediately and recorded in an undo map so
//! rollback can restore the exact prior state; commit serializes the
//! redo map into the command log.

use crate::database::{Core, Shared};
use crate::error::{Error, Result};
use crate::item::Item;
use crate::log::{write_del, write_set};
use crate::pattern;
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::ops::Bound;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::warn;

/// Options for `Tx::set`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    /// Evict the item this long after the write. A zero duration is
    /// admissible and produces an item that is born expired.
    pub ttl: Option<Duration>,
}

/// The lock held for the transaction's lifetime.
enum TxGuard<'db> {
    Read(RwLockReadGuard<'db, Core>),
    Write(RwLockWriteGuard<'db, Core>),
}

impl TxGuard<'_> {
    fn core(&self) -> &Core {
        match self {
            TxGuard::Read(guard) => guard,
            TxGuard::Write(guard) => guard,
        }
    }
}

/// A transaction on the database, either read-only or read/write.
///
/// Transactions obtained from `Database::begin` must be finished with
/// [`Tx::commit`] or [`Tx::rollback`]. Dropping an unfinished write
/// transaction rolls it back, which is also what makes a panic inside
/// a managed closure safe.
pub struct Tx<'db> {
    guard: Option<TxGuard<'db>>,
    writable: bool,
    /// Set while the runtime manages this transaction's lifecycle;
    /// manual commit/rollback is then a programming error.
    pub(crate) managed: bool,
    /// Number of in-flight scans; mutations are refused while nonzero.
    iter_depth: u32,
    /// Undo map: first observed pre-image per key. `None` means the key
    /// did not exist before this transaction.
    rollbacks: HashMap<Vec<u8>, Option<Arc<Item>>>,
    /// Redo map: final state per key. `None` means deleted.
    pending: HashMap<Vec<u8>, Option<Arc<Item>>>,
}

/// A scan bound, carried both raw (for the keys tree) and as a keyless
/// pivot item (for value-ordered index trees).
struct ScanBound {
    raw: Vec<u8>,
    pivot: Arc<Item>,
}

impl ScanBound {
    fn new(bytes: &[u8]) -> Self {
        Self {
            raw: bytes.to_vec(),
            pivot: Item::pivot(bytes.to_vec()),
        }
    }
}

impl<'db> Tx<'db> {
    pub(crate) fn begin(shared: &'db Shared, writable: bool) -> Result<Self> {
        let guard = if writable {
            TxGuard::Write(shared.core.write())
        } else {
            TxGuard::Read(shared.core.read())
        };
        if guard.core().closed {
            return Err(Error::DatabaseClosed);
        }
        Ok(Self {
            guard: Some(guard),
            writable,
            managed: false,
            iter_depth: 0,
            rollbacks: HashMap::new(),
            pending: HashMap::new(),
        })
    }

    pub(crate) fn core(&self) -> Result<&Core> {
        self.guard.as_ref().map(TxGuard::core).ok_or(Error::TxClosed)
    }

    pub(crate) fn core_mut(&mut self) -> Result<&mut Core> {
        match self.guard.as_mut() {
            None => Err(Error::TxClosed),
            Some(TxGuard::Read(_)) => Err(Error::TxNotWritable),
            Some(TxGuard::Write(guard)) => Ok(&mut *guard),
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.guard.is_none() {
            return Err(Error::TxClosed);
        }
        if !self.writable {
            return Err(Error::TxNotWritable);
        }
        if self.iter_depth > 0 {
            return Err(Error::TxIterating);
        }
        Ok(())
    }

    fn release(&mut self) {
        self.guard = None;
        self.rollbacks.clear();
        self.pending.clear();
    }

    // ------------------------------------------------------------------
    // Item operations
    // ------------------------------------------------------------------

    /// Inserts or replaces an item.
    ///
    /// Returns the previous value when a live item was replaced. A prior
    /// item that had already expired reports as no replacement.
    pub fn set(
        &mut self,
        key: &[u8],
        value: &[u8],
        options: Option<SetOptions>,
    ) -> Result<Option<Vec<u8>>> {
        self.check_writable()?;
        let expires_at = options
            .and_then(|o| o.ttl)
            .map(|ttl| SystemTime::now() + ttl);
        let item = Item::new(key.to_vec(), value.to_vec(), expires_at);

        let prev = self.core_mut()?.insert_item(Arc::clone(&item));
        let mut replaced = None;
        match &prev {
            None => {
                self.rollbacks.entry(key.to_vec()).or_insert(None);
            }
            Some(prior) => {
                self.rollbacks
                    .entry(key.to_vec())
                    .or_insert_with(|| Some(Arc::clone(prior)));
                if !prior.expired() {
                    replaced = Some(prior.value.clone());
                }
            }
        }
        self.pending.insert(key.to_vec(), Some(item));
        Ok(replaced)
    }

    /// Returns the value for a key. Expired items report as not found.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.get_inner(key, false)
    }

    /// Like [`Tx::get`], but returns the value of an item that has
    /// expired and not yet been swept.
    pub fn get_ignore_expired(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.get_inner(key, true)
    }

    fn get_inner(&self, key: &[u8], ignore_expired: bool) -> Result<Vec<u8>> {
        let core = self.core()?;
        let item = core.keys.get(key).ok_or(Error::NotFound)?;
        if item.expired() && !ignore_expired {
            return Err(Error::NotFound);
        }
        Ok(item.value.clone())
    }

    /// Removes an item, returning its value.
    ///
    /// An expired item is still physically removed but reports not
    /// found, the same as a missing key.
    pub fn delete(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        self.check_writable()?;
        let item = self.core_mut()?.delete_item(key).ok_or(Error::NotFound)?;
        self.rollbacks
            .entry(key.to_vec())
            .or_insert_with(|| Some(Arc::clone(&item)));
        self.pending.insert(key.to_vec(), None);
        if item.expired() {
            return Err(Error::NotFound);
        }
        Ok(item.value.clone())
    }

    /// Returns the remaining time-to-live for an item, or `None` for an
    /// item with no expiration. An expired item reports not found.
    pub fn ttl(&self, key: &[u8]) -> Result<Option<Duration>> {
        let core = self.core()?;
        let item = core.keys.get(key).ok_or(Error::NotFound)?;
        match item.expires_at {
            None => Ok(None),
            Some(at) => match at.duration_since(SystemTime::now()) {
                Ok(remaining) => Ok(Some(remaining)),
                Err(_) => Err(Error::NotFound),
            },
        }
    }

    /// Returns the number of items in the database.
    ///
    /// Expired items still count until the background sweep removes
    /// them.
    pub fn len(&self) -> Result<usize> {
        Ok(self.core()?.keys.len())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Commits the transaction, appending its redo records to the log.
    ///
    /// A log write failure rolls the in-memory state back and surfaces
    /// the error; the torn tail it may leave behind is tolerated on the
    /// next open.
    ///
    /// # Panics
    ///
    /// Panics when called inside a managed `view`/`update` closure.
    pub fn commit(&mut self) -> Result<()> {
        if self.managed {
            panic!("managed tx commit not allowed");
        }
        if self.guard.is_none() {
            return Err(Error::TxClosed);
        }
        if !self.writable {
            return Err(Error::TxNotWritable);
        }

        let mut result = Ok(());
        let Some(TxGuard::Write(guard)) = self.guard.as_mut() else {
            unreachable!("writable tx holds the write guard");
        };
        let core: &mut Core = guard;
        if core.log.is_some() && !self.pending.is_empty() {
            let mut buf = std::mem::take(&mut core.buf);
            buf.clear();
            let mut entries: Vec<_> = self.pending.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            for (key, entry) in entries {
                match entry {
                    Some(item) => write_set(&mut buf, &item.key, &item.value, item.expires_at),
                    None => write_del(&mut buf, key),
                }
            }
            let log = core.log.as_mut().expect("checked above");
            match log.append(&buf) {
                Ok(()) => {
                    if core.config.sync_policy == crate::SyncPolicy::Always {
                        let _ = log.sync();
                    }
                    core.flushes += 1;
                }
                Err(e) => {
                    warn!(error = %e, "commit append failed, rolling back");
                    let undo = std::mem::take(&mut self.rollbacks);
                    core.apply_undo(undo);
                    result = Err(e.into());
                }
            }
            core.buf = buf;
        }
        self.release();
        result
    }

    /// Rolls back the transaction, restoring the pre-transaction state
    /// of every mutated key.
    ///
    /// # Panics
    ///
    /// Panics when called inside a managed `view`/`update` closure.
    pub fn rollback(&mut self) -> Result<()> {
        if self.managed {
            panic!("managed tx rollback not allowed");
        }
        if self.guard.is_none() {
            return Err(Error::TxClosed);
        }
        if self.writable {
            self.rollback_inner();
        }
        self.release();
        Ok(())
    }

    fn rollback_inner(&mut self) {
        let undo = std::mem::take(&mut self.rollbacks);
        if let Some(TxGuard::Write(guard)) = self.guard.as_mut() {
            guard.apply_undo(undo);
        }
        self.pending.clear();
    }

    // ------------------------------------------------------------------
    // Range iteration
    // ------------------------------------------------------------------

    /// Calls `f` for every item, ascending. An empty index name scans
    /// the keys tree in key order; otherwise the named index's tree in
    /// value order. `f` returns `Ok(false)` to stop cleanly.
    pub fn ascend<F>(&mut self, index: &str, f: F) -> Result<()>
    where
        F: FnMut(&mut Tx<'db>, &[u8], &[u8]) -> Result<bool>,
    {
        self.scan(false, None, None, index, f)
    }

    /// Ascending over items at or after `pivot`.
    pub fn ascend_greater_or_equal<F>(&mut self, index: &str, pivot: &[u8], f: F) -> Result<()>
    where
        F: FnMut(&mut Tx<'db>, &[u8], &[u8]) -> Result<bool>,
    {
        self.scan(false, Some(pivot), None, index, f)
    }

    /// Ascending over items strictly before `pivot`.
    pub fn ascend_less_than<F>(&mut self, index: &str, pivot: &[u8], f: F) -> Result<()>
    where
        F: FnMut(&mut Tx<'db>, &[u8], &[u8]) -> Result<bool>,
    {
        self.scan(false, None, Some(pivot), index, f)
    }

    /// Ascending over `[greater_or_equal, less_than)`.
    pub fn ascend_range<F>(
        &mut self,
        index: &str,
        greater_or_equal: &[u8],
        less_than: &[u8],
        f: F,
    ) -> Result<()>
    where
        F: FnMut(&mut Tx<'db>, &[u8], &[u8]) -> Result<bool>,
    {
        self.scan(false, Some(greater_or_equal), Some(less_than), index, f)
    }

    /// Calls `f` for every item, descending.
    pub fn descend<F>(&mut self, index: &str, f: F) -> Result<()>
    where
        F: FnMut(&mut Tx<'db>, &[u8], &[u8]) -> Result<bool>,
    {
        self.scan(true, None, None, index, f)
    }

    /// Descending over items strictly after `pivot`.
    pub fn descend_greater_than<F>(&mut self, index: &str, pivot: &[u8], f: F) -> Result<()>
    where
        F: FnMut(&mut Tx<'db>, &[u8], &[u8]) -> Result<bool>,
    {
        self.scan(true, None, Some(pivot), index, f)
    }

    /// Descending over items at or before `pivot`.
    pub fn descend_less_or_equal<F>(&mut self, index: &str, pivot: &[u8], f: F) -> Result<()>
    where
        F: FnMut(&mut Tx<'db>, &[u8], &[u8]) -> Result<bool>,
    {
        self.scan(true, Some(pivot), None, index, f)
    }

    /// Descending over `[less_or_equal, greater_than)` - high end first.
    pub fn descend_range<F>(
        &mut self,
        index: &str,
        less_or_equal: &[u8],
        greater_than: &[u8],
        f: F,
    ) -> Result<()>
    where
        F: FnMut(&mut Tx<'db>, &[u8], &[u8]) -> Result<bool>,
    {
        self.scan(true, Some(less_or_equal), Some(greater_than), index, f)
    }

    /// Ascending over keys matching a wildcard pattern. `f` receives
    /// only matching items, in key order.
    pub fn ascend_keys<F>(&mut self, pat: &[u8], mut f: F) -> Result<()>
    where
        F: FnMut(&mut Tx<'db>, &[u8], &[u8]) -> Result<bool>,
    {
        if pat == b"*" {
            return self.ascend("", f);
        }
        let prefix = pattern::literal_prefix(pat).to_vec();
        if prefix.is_empty() {
            self.scan(false, None, None, "", |tx, k, v| {
                if pattern::matches(k, pat) {
                    f(tx, k, v)
                } else {
                    Ok(true)
                }
            })
        } else {
            self.scan(false, Some(&prefix), None, "", |tx, k, v| {
                if !k.starts_with(&prefix) {
                    return Ok(false);
                }
                if pattern::matches(k, pat) {
                    f(tx, k, v)
                } else {
                    Ok(true)
                }
            })
        }
    }

    /// Descending counterpart of [`Tx::ascend_keys`].
    pub fn descend_keys<F>(&mut self, pat: &[u8], mut f: F) -> Result<()>
    where
        F: FnMut(&mut Tx<'db>, &[u8], &[u8]) -> Result<bool>,
    {
        if pat == b"*" {
            return self.descend("", f);
        }
        let prefix = pattern::literal_prefix(pat).to_vec();
        if prefix.is_empty() {
            return self.scan(true, None, None, "", |tx, k, v| {
                if pattern::matches(k, pat) {
                    f(tx, k, v)
                } else {
                    Ok(true)
                }
            });
        }
        // Keys with this prefix form one contiguous block; begin at the
        // block's upper fence and stop at the first key below it. The
        // fence key itself may exist and is skipped, not a stop.
        let visit = |f: &mut F, prefix: &[u8], tx: &mut Tx<'db>, k: &[u8], v: &[u8]| {
            if !k.starts_with(prefix) {
                return if k < prefix { Ok(false) } else { Ok(true) };
            }
            if pattern::matches(k, pat) {
                f(tx, k, v)
            } else {
                Ok(true)
            }
        };
        match prefix_successor(&prefix) {
            Some(begin) => self.scan(true, Some(&begin), None, "", |tx, k, v| {
                visit(&mut f, &prefix, tx, k, v)
            }),
            None => self.scan(true, None, None, "", |tx, k, v| {
                visit(&mut f, &prefix, tx, k, v)
            }),
        }
    }

    /// Calls `f` for every item in a spatial index whose rectangle
    /// intersects `bounds`. The bounds string is parsed by the index's
    /// own rectangle extractor. An empty index name is a no-op; a
    /// non-spatial index is a no-op.
    pub fn intersects<F>(&mut self, index: &str, bounds: &[u8], mut f: F) -> Result<()>
    where
        F: FnMut(&mut Tx<'db>, &[u8], &[u8]) -> Result<bool>,
    {
        if self.guard.is_none() {
            return Err(Error::TxClosed);
        }
        if index.is_empty() {
            return Ok(());
        }
        let found = {
            let core = self.core()?;
            let idx = core.indexes.get(index).ok_or(Error::NotFound)?;
            let (Some(spatial), Some(rect_of)) = (&idx.spatial, &idx.rect_of) else {
                return Ok(());
            };
            let Some(query) = rect_of(bounds) else {
                return Ok(());
            };
            let mut found = Vec::new();
            spatial.search(&query, &mut found);
            found
        };

        self.iter_depth += 1;
        let mut result = Ok(());
        for item in found {
            if item.expired() {
                continue;
            }
            match f(self, &item.key, &item.value) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        self.iter_depth -= 1;
        result
    }

    /// The unified scan primitive.
    ///
    /// Ascending: begin at the first item (or first >= `begin`), run
    /// while the item is strictly before `until`. Descending: begin at
    /// the last item (or last <= `begin`), run while the item is
    /// strictly after `until`.
    fn scan<F>(
        &mut self,
        desc: bool,
        begin: Option<&[u8]>,
        until: Option<&[u8]>,
        index: &str,
        mut f: F,
    ) -> Result<()>
    where
        F: FnMut(&mut Tx<'db>, &[u8], &[u8]) -> Result<bool>,
    {
        if self.guard.is_none() {
            return Err(Error::TxClosed);
        }
        if !index.is_empty() {
            let core = self.core()?;
            let idx = core.indexes.get(index).ok_or(Error::NotFound)?;
            if idx.tree.is_none() {
                // Spatial-only index: nothing to scan by value.
                return Ok(());
            }
        }
        let begin = begin.map(ScanBound::new);
        let until = until.map(ScanBound::new);

        self.iter_depth += 1;
        let result = self.scan_loop(desc, begin.as_ref(), until.as_ref(), index, &mut f);
        self.iter_depth -= 1;
        result
    }

    fn scan_loop<F>(
        &mut self,
        desc: bool,
        begin: Option<&ScanBound>,
        until: Option<&ScanBound>,
        index: &str,
        f: &mut F,
    ) -> Result<()>
    where
        F: FnMut(&mut Tx<'db>, &[u8], &[u8]) -> Result<bool>,
    {
        let mut cursor: Option<Arc<Item>> = None;
        loop {
            let next = step(self.core()?, index, desc, cursor.as_ref(), begin);
            let Some(item) = next else {
                return Ok(());
            };
            if let Some(until) = until {
                let ord = compare_to_bound(self.core()?, index, &item, until);
                let within = if desc {
                    ord == Ordering::Greater
                } else {
                    ord == Ordering::Less
                };
                if !within {
                    return Ok(());
                }
            }
            cursor = Some(Arc::clone(&item));
            if item.expired() {
                continue;
            }
            if !f(self, &item.key, &item.value)? {
                return Ok(());
            }
        }
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if self.guard.is_some() {
            if self.writable {
                self.rollback_inner();
            }
            self.guard = None;
        }
    }
}

impl std::fmt::Debug for Tx<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tx")
            .field("writable", &self.writable)
            .field("open", &self.guard.is_some())
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Runs `f` inside a transaction whose lifecycle the runtime manages:
/// commit on `Ok` (writes), rollback on `Err` or read-only completion.
pub(crate) fn managed<T, F>(shared: &Shared, writable: bool, f: F) -> Result<T>
where
    F: FnOnce(&mut Tx<'_>) -> Result<T>,
{
    let mut tx = Tx::begin(shared, writable)?;
    tx.managed = true;
    let result = f(&mut tx);
    tx.managed = false;
    match result {
        Ok(value) => {
            if writable {
                tx.commit()?;
            } else {
                tx.rollback()?;
            }
            Ok(value)
        }
        Err(e) => {
            let _ = tx.rollback();
            Err(e)
        }
    }
}

/// One cursor advance over the keys tree or an index tree.
fn step(
    core: &Core,
    index: &str,
    desc: bool,
    cursor: Option<&Arc<Item>>,
    begin: Option<&ScanBound>,
) -> Option<Arc<Item>> {
    if index.is_empty() {
        let keys = &core.keys;
        return match (cursor, desc) {
            (Some(last), false) => keys
                .range::<[u8], _>((Bound::Excluded(&last.key[..]), Bound::Unbounded))
                .next()
                .map(|(_, v)| Arc::clone(v)),
            (Some(last), true) => keys
                .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(&last.key[..])))
                .next_back()
                .map(|(_, v)| Arc::clone(v)),
            (None, false) => match begin {
                Some(b) => keys
                    .range::<[u8], _>((Bound::Included(&b.raw[..]), Bound::Unbounded))
                    .next()
                    .map(|(_, v)| Arc::clone(v)),
                None => keys.values().next().map(Arc::clone),
            },
            (None, true) => match begin {
                Some(b) => keys
                    .range::<[u8], _>((Bound::Unbounded, Bound::Included(&b.raw[..])))
                    .next_back()
                    .map(|(_, v)| Arc::clone(v)),
                None => keys.values().next_back().map(Arc::clone),
            },
        };
    }

    let tree = core.indexes.get(index)?.tree.as_ref()?;
    match (cursor, desc) {
        (Some(last), false) => tree.next_after(last),
        (Some(last), true) => tree.prev_before(last),
        (None, false) => match begin {
            Some(b) => tree.seek_ge(&b.pivot),
            None => tree.first(),
        },
        (None, true) => match begin {
            Some(b) => tree.seek_le(&b.pivot),
            None => tree.last(),
        },
    }
}

fn compare_to_bound(core: &Core, index: &str, item: &Arc<Item>, bound: &ScanBound) -> Ordering {
    if index.is_empty() {
        return item.key[..].cmp(&bound.raw);
    }
    match core.indexes.get(index).and_then(|i| i.tree.as_ref()) {
        Some(tree) => tree.compare(item, &bound.pivot),
        None => Ordering::Equal,
    }
}

/// Smallest byte string greater than every string with this prefix, or
/// `None` when the prefix is all 0xFF.
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut succ = prefix.to_vec();
    while let Some(&last) = succ.last() {
        if last < 0xff {
            *succ.last_mut().expect("nonempty") += 1;
            return Some(succ);
        }
        succ.pop();
    }
    None
}
