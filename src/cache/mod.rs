//! The client-side row cache (§4.D): a per-table `PrimaryKey -> Row` mirror
//! of subscribed rows, fed by [`crate::protocol::DatabaseUpdate`]s and
//! dispatching insert/delete/update events to registered observers.
//!
//! Grounded in `crates/client-sdk/src/client_cache.rs`'s `TableCache`, but
//! generalized from a typed, codegen-backed `T: TableType` to raw row bytes,
//! since this crate has no generated schema to hang a primary key on.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub type Row = Bytes;
pub type PrimaryKey = Box<[u8]>;

/// A pure function from a row's bytes to its primary key.
///
/// When no extractor is registered for a table, [`PrimaryKeyExtractor::Identity`]
/// is used: the whole row is its own key, which is correct for distinguishing
/// rows in an initial snapshot but prevents update detection once a row's
/// non-key bytes change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PrimaryKeyExtractor {
    Identity,
    /// The first `n` bytes of the row. Rows shorter than `n` degrade to the
    /// whole row rather than panicking.
    FixedPrefix(usize),
    /// Bytes `[offset, offset + len)` of the row. Degrades to the whole row
    /// if the row is too short to contain the range.
    FixedRange(usize, usize),
}

impl PrimaryKeyExtractor {
    pub fn prefix4() -> Self {
        PrimaryKeyExtractor::FixedPrefix(4)
    }
    pub fn prefix8() -> Self {
        PrimaryKeyExtractor::FixedPrefix(8)
    }
    pub fn prefix16() -> Self {
        PrimaryKeyExtractor::FixedPrefix(16)
    }
    pub fn prefix32() -> Self {
        PrimaryKeyExtractor::FixedPrefix(32)
    }

    pub fn extract(&self, row: &Row) -> PrimaryKey {
        match self {
            PrimaryKeyExtractor::Identity => row.to_vec().into_boxed_slice(),
            PrimaryKeyExtractor::FixedPrefix(n) => {
                let n = (*n).min(row.len());
                row[..n].to_vec().into_boxed_slice()
            }
            PrimaryKeyExtractor::FixedRange(offset, len) => {
                if offset.saturating_add(*len) > row.len() {
                    row.to_vec().into_boxed_slice()
                } else {
                    row[*offset..*offset + *len].to_vec().into_boxed_slice()
                }
            }
        }
    }
}

/// The kind of a row-level event dispatched to observers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Insert,
    Delete,
    Update,
}

/// A single row-level event, delivered synchronously to matching observers.
#[derive(Clone, Debug)]
pub enum RowEvent {
    Insert { table: String, row: Row },
    Delete { table: String, row: Row },
    Update { table: String, old: Row, new: Row },
}

impl RowEvent {
    pub fn table(&self) -> &str {
        match self {
            RowEvent::Insert { table, .. } | RowEvent::Delete { table, .. } | RowEvent::Update { table, .. } => table,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            RowEvent::Insert { .. } => EventKind::Insert,
            RowEvent::Delete { .. } => EventKind::Delete,
            RowEvent::Update { .. } => EventKind::Update,
        }
    }
}

/// The registration scope of an observer: a specific table and event kind, a
/// specific table and any kind, or every table and any kind (§4.D).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum ObserverScope {
    Table(String, EventKind),
    TableAnyKind(String),
    Any,
}

type Observer = Box<dyn Fn(&RowEvent) + Send + Sync>;

/// An opaque handle returned at observer registration; deregister with
/// [`ClientCache::unobserve`]. Idempotent and safe under concurrent dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverHandle(u64);

struct Registration {
    handle: ObserverHandle,
    scope: ObserverScope,
    observer: Observer,
}

#[derive(Default)]
struct TableCache {
    rows: HashMap<PrimaryKey, Row>,
    extractor: PrimaryKeyExtractor,
}

impl Default for PrimaryKeyExtractor {
    fn default() -> Self {
        PrimaryKeyExtractor::Identity
    }
}

/// Running totals incremented in lockstep with event emission (§4.D).
#[derive(Debug, Default)]
pub struct CacheStats {
    pub total_inserts: AtomicU64,
    pub total_deletes: AtomicU64,
    pub total_updates: AtomicU64,
}

impl CacheStats {
    fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            total_inserts: self.total_inserts.load(Ordering::Relaxed),
            total_deletes: self.total_deletes.load(Ordering::Relaxed),
            total_updates: self.total_updates.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStatsSnapshot {
    pub total_inserts: u64,
    pub total_deletes: u64,
    pub total_updates: u64,
}

struct Inner {
    tables: HashMap<String, TableCache>,
    observers: Vec<Registration>,
    next_handle: u64,
    stats: CacheStats,
    legacy_update_events: bool,
}

/// The coherent, synchronously-updated mirror of every subscribed row
/// across every table (§4.D).
#[derive(Clone)]
pub struct ClientCache {
    inner: Arc<Mutex<Inner>>,
}

impl Default for ClientCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientCache {
    pub fn new() -> Self {
        ClientCache {
            inner: Arc::new(Mutex::new(Inner {
                tables: HashMap::new(),
                observers: Vec::new(),
                next_handle: 0,
                stats: CacheStats::default(),
                legacy_update_events: false,
            })),
        }
    }

    /// Opt into synthesized `Insert`/`Delete` notifications for `Insert`-only
    /// and `Delete`-only observers when an `Update` fires. Off by default
    /// (§9's Open Question resolution): by default those observers only see
    /// genuine, unpaired inserts and deletes.
    pub fn enable_legacy_update_events(&self) {
        self.inner.lock().unwrap().legacy_update_events = true;
    }

    /// Register a primary-key extractor for `table`. Generated code calls
    /// this once per table when it knows the schema; unregistered tables use
    /// [`PrimaryKeyExtractor::Identity`].
    pub fn set_extractor(&self, table: &str, extractor: PrimaryKeyExtractor) {
        let mut inner = self.inner.lock().unwrap();
        inner.tables.entry(table.to_string()).or_default().extractor = extractor;
    }

    /// Register an observer for a specific `(table, kind)`.
    pub fn observe_table_kind(&self, table: &str, kind: EventKind, f: impl Fn(&RowEvent) + Send + Sync + 'static) -> ObserverHandle {
        self.register(ObserverScope::Table(table.to_string(), kind), Box::new(f))
    }

    /// Register an observer for any event kind on a specific table.
    pub fn observe_table(&self, table: &str, f: impl Fn(&RowEvent) + Send + Sync + 'static) -> ObserverHandle {
        self.register(ObserverScope::TableAnyKind(table.to_string()), Box::new(f))
    }

    /// Register an observer for every table and every event kind.
    pub fn observe_any(&self, f: impl Fn(&RowEvent) + Send + Sync + 'static) -> ObserverHandle {
        self.register(ObserverScope::Any, Box::new(f))
    }

    fn register(&self, scope: ObserverScope, observer: Observer) -> ObserverHandle {
        let mut inner = self.inner.lock().unwrap();
        let handle = ObserverHandle(inner.next_handle);
        inner.next_handle += 1;
        inner.observers.push(Registration { handle, scope, observer });
        handle
    }

    /// Deregister an observer. Safe to call more than once with the same
    /// handle, or concurrently with dispatch.
    pub fn unobserve(&self, handle: ObserverHandle) {
        let mut inner = self.inner.lock().unwrap();
        inner.observers.retain(|r| r.handle != handle);
    }

    pub fn table_row_count(&self, table: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.tables.get(table).map(|t| t.rows.len()).unwrap_or(0)
    }

    pub fn iter_rows(&self, table: &str) -> Vec<Row> {
        let inner = self.inner.lock().unwrap();
        inner.tables.get(table).map(|t| t.rows.values().cloned().collect()).unwrap_or_default()
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.inner.lock().unwrap().stats.snapshot()
    }

    /// Remove all rows of all tables, keeping table structures and
    /// registered extractors. Does not fire events.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        for table in inner.tables.values_mut() {
            table.rows.clear();
        }
    }

    /// Remove all tables and reset statistics. Does not fire events.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.tables.clear();
        inner.stats = CacheStats::default();
    }

    /// Apply one table's `(deletes, inserts)` row delta, updating the cache
    /// and dispatching events (§4.D's update-detection algorithm).
    ///
    /// A delete and an insert sharing a primary key within this delta are
    /// collapsed into a single `Update` event rather than a `Delete` followed
    /// by an `Insert`: the PK sets of `deletes` and `inserts` are computed
    /// up front, and rows whose PK appears in both are paired before either
    /// set is applied to the table.
    pub fn apply_delta(&self, table: &str, deletes: &[Row], inserts: &[Row]) {
        let mut inner = self.inner.lock().unwrap();
        let extractor = inner.tables.entry(table.to_string()).or_default().extractor.clone();

        let delete_keyed: Vec<(PrimaryKey, &Row)> = deletes.iter().map(|r| (extractor.extract(r), r)).collect();
        let insert_keyed: Vec<(PrimaryKey, &Row)> = inserts.iter().map(|r| (extractor.extract(r), r)).collect();

        let insert_pks: std::collections::HashSet<&PrimaryKey> = insert_keyed.iter().map(|(pk, _)| pk).collect();
        let delete_pks: std::collections::HashSet<&PrimaryKey> = delete_keyed.iter().map(|(pk, _)| pk).collect();

        let mut events = Vec::new();

        // Paired delete+insert under the same PK: a single Update.
        for (pk, new_row) in &insert_keyed {
            if delete_pks.contains(pk) {
                let old = inner
                    .tables
                    .get_mut(table)
                    .unwrap()
                    .rows
                    .remove(pk)
                    .or_else(|| delete_keyed.iter().find(|(dpk, _)| dpk == pk).map(|(_, r)| (*r).clone()));
                inner.tables.get_mut(table).unwrap().rows.insert(pk.clone(), (*new_row).clone());
                if let Some(old) = old {
                    inner.stats.total_updates.fetch_add(1, Ordering::Relaxed);
                    events.push(RowEvent::Update {
                        table: table.to_string(),
                        old,
                        new: (*new_row).clone(),
                    });
                }
            }
        }

        // Unpaired deletes: physically remove, emit Delete if present.
        for (pk, row) in &delete_keyed {
            if insert_pks.contains(pk) {
                continue;
            }
            let removed = inner.tables.get_mut(table).unwrap().rows.remove(pk);
            if let Some(removed) = removed {
                inner.stats.total_deletes.fetch_add(1, Ordering::Relaxed);
                events.push(RowEvent::Delete { table: table.to_string(), row: removed });
            } else {
                log::warn!("delete for row not present in cache for table {table:?}: {row:?}");
            }
        }

        // Unpaired inserts: insert, Update if this PK already existed before
        // this delta, else Insert.
        for (pk, row) in &insert_keyed {
            if delete_pks.contains(pk) {
                continue;
            }
            let prior = inner.tables.get_mut(table).unwrap().rows.insert(pk.clone(), (*row).clone());
            match prior {
                Some(old) => {
                    inner.stats.total_updates.fetch_add(1, Ordering::Relaxed);
                    events.push(RowEvent::Update {
                        table: table.to_string(),
                        old,
                        new: (*row).clone(),
                    });
                }
                None => {
                    inner.stats.total_inserts.fetch_add(1, Ordering::Relaxed);
                    events.push(RowEvent::Insert { table: table.to_string(), row: (*row).clone() });
                }
            }
        }

        for event in &events {
            match event {
                RowEvent::Insert { .. } => crate::metrics::CACHE_ROW_INSERTS_TOTAL.inc(),
                RowEvent::Delete { .. } => crate::metrics::CACHE_ROW_DELETES_TOTAL.inc(),
                RowEvent::Update { .. } => crate::metrics::CACHE_ROW_UPDATES_TOTAL.inc(),
            }
        }

        let legacy_update_events = inner.legacy_update_events;
        dispatch(&inner.observers, &events, legacy_update_events);
    }
}

/// Dispatch each event to every observer whose scope matches. When
/// `legacy_update_events` is enabled, an `Update` also notifies observers
/// registered for `Insert`-only and `Delete`-only on that table with
/// `(old, new)` respectively, for backward compatibility with code written
/// before `change`/`Update` observers existed. Off by default.
fn dispatch(observers: &[Registration], events: &[RowEvent], legacy_update_events: bool) {
    for event in events {
        for reg in observers {
            let matches = match &reg.scope {
                ObserverScope::Table(t, k) => t == event.table() && *k == event.kind(),
                ObserverScope::TableAnyKind(t) => t == event.table(),
                ObserverScope::Any => true,
            };
            if matches {
                (reg.observer)(event);
            }
        }
        if !legacy_update_events {
            continue;
        }
        if let RowEvent::Update { table, old, new } = event {
            let synth_delete = RowEvent::Delete { table: table.clone(), row: old.clone() };
            let synth_insert = RowEvent::Insert { table: table.clone(), row: new.clone() };
            for reg in observers {
                if let ObserverScope::Table(t, EventKind::Delete) = &reg.scope {
                    if t == table {
                        (reg.observer)(&synth_delete);
                    }
                }
                if let ObserverScope::Table(t, EventKind::Insert) = &reg.scope {
                    if t == table {
                        (reg.observer)(&synth_insert);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn row(bytes: &[u8]) -> Row {
        Bytes::copy_from_slice(bytes)
    }

    #[test]
    fn identity_extractor_uses_whole_row() {
        let ex = PrimaryKeyExtractor::Identity;
        assert_eq!(ex.extract(&row(b"abc")), Box::from(b"abc".as_slice()));
    }

    #[test]
    fn fixed_prefix_degrades_for_short_rows() {
        let ex = PrimaryKeyExtractor::FixedPrefix(8);
        assert_eq!(ex.extract(&row(b"ab")), Box::from(b"ab".as_slice()));
        assert_eq!(ex.extract(&row(b"abcdefghij")), Box::from(b"abcdefgh".as_slice()));
    }

    #[test]
    fn fixed_range_degrades_when_out_of_bounds() {
        let ex = PrimaryKeyExtractor::FixedRange(4, 4);
        assert_eq!(ex.extract(&row(b"ab")), Box::from(b"ab".as_slice()));
        assert_eq!(ex.extract(&row(b"0123456789")), Box::from(b"4567".as_slice()));
    }

    #[test]
    fn plain_insert_and_delete() {
        let cache = ClientCache::new();
        cache.set_extractor("t", PrimaryKeyExtractor::FixedPrefix(1));
        let events = Arc::new(Mutex::new(Vec::new()));
        let events2 = events.clone();
        cache.observe_table("t", move |e| events2.lock().unwrap().push(e.clone()));

        cache.apply_delta("t", &[], &[row(b"1x")]);
        cache.apply_delta("t", &[row(b"1x")], &[]);

        let evs = events.lock().unwrap();
        assert!(matches!(evs[0], RowEvent::Insert { .. }));
        assert!(matches!(evs[1], RowEvent::Delete { .. }));
        assert_eq!(cache.stats().total_inserts, 1);
        assert_eq!(cache.stats().total_deletes, 1);
    }

    #[test]
    fn delete_insert_same_pk_collapses_to_single_update() {
        let cache = ClientCache::new();
        cache.set_extractor("t", PrimaryKeyExtractor::FixedPrefix(1));
        cache.apply_delta("t", &[], &[row(b"1old")]);

        let events = Arc::new(Mutex::new(Vec::new()));
        let events2 = events.clone();
        cache.observe_table("t", move |e| events2.lock().unwrap().push(e.clone()));

        cache.apply_delta("t", &[row(b"1old")], &[row(b"1new")]);

        let evs = events.lock().unwrap();
        assert_eq!(evs.len(), 1);
        match &evs[0] {
            RowEvent::Update { old, new, .. } => {
                assert_eq!(old.as_ref(), b"1old");
                assert_eq!(new.as_ref(), b"1new");
            }
            other => panic!("expected Update, got {other:?}"),
        }
        assert_eq!(cache.stats().total_updates, 1);
        assert_eq!(cache.stats().total_inserts, 0);
        assert_eq!(cache.stats().total_deletes, 0);
    }

    #[test]
    fn insert_over_existing_row_without_matching_delete_is_update() {
        let cache = ClientCache::new();
        cache.set_extractor("t", PrimaryKeyExtractor::FixedPrefix(1));
        cache.apply_delta("t", &[], &[row(b"1old")]);
        cache.apply_delta("t", &[], &[row(b"1new")]);
        assert_eq!(cache.stats().total_updates, 1);
        assert_eq!(cache.table_row_count("t"), 1);
        assert_eq!(cache.iter_rows("t")[0].as_ref(), b"1new");
    }

    #[test]
    fn update_does_not_notify_insert_and_delete_only_observers_by_default() {
        let cache = ClientCache::new();
        cache.set_extractor("t", PrimaryKeyExtractor::FixedPrefix(1));
        cache.apply_delta("t", &[], &[row(b"1old")]);

        let deletes_seen = Arc::new(AtomicUsize::new(0));
        let inserts_seen = Arc::new(AtomicUsize::new(0));
        let d2 = deletes_seen.clone();
        let i2 = inserts_seen.clone();
        cache.observe_table_kind("t", EventKind::Delete, move |_| {
            d2.fetch_add(1, Ordering::Relaxed);
        });
        cache.observe_table_kind("t", EventKind::Insert, move |_| {
            i2.fetch_add(1, Ordering::Relaxed);
        });

        cache.apply_delta("t", &[row(b"1old")], &[row(b"1new")]);

        assert_eq!(deletes_seen.load(Ordering::Relaxed), 0);
        assert_eq!(inserts_seen.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn enable_legacy_update_events_opts_into_synthesized_notifications() {
        let cache = ClientCache::new();
        cache.set_extractor("t", PrimaryKeyExtractor::FixedPrefix(1));
        cache.enable_legacy_update_events();
        cache.apply_delta("t", &[], &[row(b"1old")]);

        let deletes_seen = Arc::new(AtomicUsize::new(0));
        let inserts_seen = Arc::new(AtomicUsize::new(0));
        let d2 = deletes_seen.clone();
        let i2 = inserts_seen.clone();
        cache.observe_table_kind("t", EventKind::Delete, move |_| {
            d2.fetch_add(1, Ordering::Relaxed);
        });
        cache.observe_table_kind("t", EventKind::Insert, move |_| {
            i2.fetch_add(1, Ordering::Relaxed);
        });

        cache.apply_delta("t", &[row(b"1old")], &[row(b"1new")]);

        assert_eq!(deletes_seen.load(Ordering::Relaxed), 1);
        assert_eq!(inserts_seen.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn clear_removes_rows_but_keeps_extractor_and_fires_no_events() {
        let cache = ClientCache::new();
        cache.set_extractor("t", PrimaryKeyExtractor::FixedPrefix(1));
        cache.apply_delta("t", &[], &[row(b"1x")]);

        let fired = Arc::new(AtomicUsize::new(0));
        let f2 = fired.clone();
        cache.observe_any(move |_| {
            f2.fetch_add(1, Ordering::Relaxed);
        });

        cache.clear();
        assert_eq!(cache.table_row_count("t"), 0);
        assert_eq!(fired.load(Ordering::Relaxed), 0);

        cache.apply_delta("t", &[], &[row(b"1y")]);
        assert_eq!(cache.stats().total_inserts, 1, "extractor preserved across clear");
    }

    #[test]
    fn reset_clears_tables_and_statistics() {
        let cache = ClientCache::new();
        cache.apply_delta("t", &[], &[row(b"1x")]);
        cache.reset();
        assert_eq!(cache.table_row_count("t"), 0);
        assert_eq!(cache.stats(), CacheStatsSnapshot::default());
    }

    #[test]
    fn unobserve_is_idempotent() {
        let cache = ClientCache::new();
        let handle = cache.observe_any(|_| {});
        cache.unobserve(handle);
        cache.unobserve(handle);
    }
}
