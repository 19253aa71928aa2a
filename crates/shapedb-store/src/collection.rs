//! Collections: named document containers over one datafile set.
//!
//! Each collection owns its shaper (the datafile set is the shaper's
//! definition sink, so attribute and shape definitions land in this
//! collection's own datafiles ahead of any document that uses them), a
//! primary index mapping keys to their newest marker, and the lock pair
//! that coordinates writers, dump readers and compaction.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use shapedb_error::{Result, ShapeDbError};
use shapedb_shaper::Shaper;
use shapedb_types::{CollectionId, DocValue, Tick, TickSource, TransactionId};

use crate::datafile::{DatafileSet, DatafileSnapshot, DEFAULT_JOURNAL_CAPACITY};
use crate::marker::{EdgeRef, Marker, MarkerBody};

/// Document vs edge collection. Edge collections store from/to references
/// and replicate their markers with the edge event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CollectionKind {
    Document,
    Edge,
}

/// Upper bounds on a collection's live documents. Exceeding either bound
/// drops the oldest live documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CapConstraint {
    /// Maximum number of live documents; 0 means unbounded.
    pub max_count: u64,
    /// Maximum cumulative shaped payload size in bytes; 0 means unbounded.
    pub max_size: u64,
}

pub struct Collection {
    cid: CollectionId,
    name: RwLock<String>,
    kind: CollectionKind,
    files: Arc<DatafileSet>,
    shaper: Arc<Shaper>,
    /// key -> newest data marker (absent once deleted or capped out).
    primary: RwLock<HashMap<String, Arc<Marker>>>,
    /// live documents in insertion tick order, for cap enforcement.
    live_order: RwLock<BTreeMap<Tick, String>>,
    live_bytes: RwLock<u64>,
    cap: RwLock<Option<CapConstraint>>,
    /// Collection-level reader/writer coordination (begin_read/begin_write).
    access: RwLock<()>,
    /// Held for read by dumps, for write by compaction.
    compaction: RwLock<()>,
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("cid", &self.cid)
            .field("name", &*self.name.read())
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl Collection {
    pub(crate) fn new(
        cid: CollectionId,
        name: String,
        kind: CollectionKind,
        tick_source: Arc<TickSource>,
        dir: Option<std::path::PathBuf>,
    ) -> Self {
        let files = Arc::new(DatafileSet::new(
            name.clone(),
            tick_source,
            dir,
            DEFAULT_JOURNAL_CAPACITY,
        ));
        let shaper = Arc::new(Shaper::new(Arc::clone(&files) as _));
        Self {
            cid,
            name: RwLock::new(name),
            kind,
            files,
            shaper,
            primary: RwLock::new(HashMap::new()),
            live_order: RwLock::new(BTreeMap::new()),
            live_bytes: RwLock::new(0),
            cap: RwLock::new(None),
            access: RwLock::new(()),
            compaction: RwLock::new(()),
        }
    }

    #[must_use]
    pub const fn cid(&self) -> CollectionId {
        self.cid
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub(crate) fn set_name(&self, name: String) {
        *self.name.write() = name;
    }

    #[must_use]
    pub const fn kind(&self) -> CollectionKind {
        self.kind
    }

    #[must_use]
    pub const fn is_edge(&self) -> bool {
        matches!(self.kind, CollectionKind::Edge)
    }

    /// System collections (reserved `_` name prefix) are excluded from
    /// replication.
    #[must_use]
    pub fn is_system(&self) -> bool {
        self.name.read().starts_with('_')
    }

    /// The shaper interpreting this collection's shaped payloads.
    #[must_use]
    pub fn shaper(&self) -> &Arc<Shaper> {
        &self.shaper
    }

    #[must_use]
    pub fn cap(&self) -> Option<CapConstraint> {
        *self.cap.read()
    }

    pub(crate) fn set_cap(&self, cap: Option<CapConstraint>) {
        *self.cap.write() = cap;
    }

    /// Collection-level write lock (spans one logical write operation).
    pub fn begin_write(&self) -> parking_lot::RwLockWriteGuard<'_, ()> {
        self.access.write()
    }

    /// Collection-level read lock.
    pub fn begin_read(&self) -> parking_lot::RwLockReadGuard<'_, ()> {
        self.access.read()
    }

    /// Taken for read by replication dumps so compaction cannot relocate
    /// markers mid-scan.
    pub fn compaction_lock(&self) -> &RwLock<()> {
        &self.compaction
    }

    // === Reads ===

    /// Newest live marker for `key`.
    #[must_use]
    pub fn read(&self, key: &str) -> Option<Arc<Marker>> {
        self.primary.read().get(key).cloned()
    }

    /// Number of live documents.
    #[must_use]
    pub fn count(&self) -> usize {
        self.primary.read().len()
    }

    /// All live documents in internal storage (tick) order. This is not a
    /// guaranteed logical order; queries that need one must sort.
    #[must_use]
    pub fn live_documents(&self) -> Vec<Arc<Marker>> {
        let primary = self.primary.read();
        let order = self.live_order.read();
        order
            .values()
            .filter_map(|key| primary.get(key).cloned())
            .collect()
    }

    /// Live documents whose key falls within `[from, to]`, in key order.
    /// Backs the index-range operator via the primary index.
    #[must_use]
    pub fn range_by_key(&self, from: &str, to: &str) -> Vec<Arc<Marker>> {
        let primary = self.primary.read();
        let mut hits: Vec<(&String, &Arc<Marker>)> = primary
            .iter()
            .filter(|(key, _)| key.as_str() >= from && key.as_str() <= to)
            .collect();
        hits.sort_by(|l, r| l.0.cmp(r.0));
        hits.into_iter().map(|(_, m)| Arc::clone(m)).collect()
    }

    /// A read-consistent datafile view for scans (replication dump,
    /// compaction planning).
    #[must_use]
    pub fn datafile_snapshot(&self) -> DatafileSnapshot {
        self.files.snapshot()
    }

    // === Writes ===
    //
    // All writes go through the collection write lock held by the caller
    // (transaction or standalone operation wrapper in the store).

    /// Insert a document. A missing key is generated from the marker tick.
    pub(crate) fn insert(
        &self,
        key: Option<String>,
        document: &DocValue,
        tid: Option<TransactionId>,
    ) -> Result<Arc<Marker>> {
        let shaped = self.shaper.shape(document)?;
        if let Some(key) = &key {
            if self.primary.read().contains_key(key) {
                return Err(ShapeDbError::DuplicateName { name: key.clone() });
            }
        }
        let marker = self.files.append_with(|tick| MarkerBody::Document {
            key: key.unwrap_or_else(|| tick.to_string()),
            rev: tick,
            shaped,
            tid,
        })?;
        let key = marker.key().unwrap_or_default().to_owned();
        self.index_live(&key, &marker);
        self.enforce_cap();
        Ok(marker)
    }

    /// Insert an edge document with from/to references.
    pub(crate) fn insert_edge(
        &self,
        key: Option<String>,
        document: &DocValue,
        from: EdgeRef,
        to: EdgeRef,
        tid: Option<TransactionId>,
    ) -> Result<Arc<Marker>> {
        if !self.is_edge() {
            return Err(ShapeDbError::invalid_state(format!(
                "collection '{}' is not an edge collection",
                self.name()
            )));
        }
        let shaped = self.shaper.shape(document)?;
        if let Some(key) = &key {
            if self.primary.read().contains_key(key) {
                return Err(ShapeDbError::DuplicateName { name: key.clone() });
            }
        }
        let marker = self.files.append_with(|tick| MarkerBody::Edge {
            key: key.unwrap_or_else(|| tick.to_string()),
            rev: tick,
            shaped,
            from,
            to,
            tid,
        })?;
        let key = marker.key().unwrap_or_default().to_owned();
        self.index_live(&key, &marker);
        self.enforce_cap();
        Ok(marker)
    }

    /// Replace the document stored under `key`.
    pub(crate) fn update(
        &self,
        key: &str,
        document: &DocValue,
        tid: Option<TransactionId>,
    ) -> Result<Arc<Marker>> {
        if self.read(key).is_none() {
            return Err(ShapeDbError::NotFound {
                what: "document",
                name: key.to_owned(),
            });
        }
        let shaped = self.shaper.shape(document)?;
        let marker = self.files.append_with(|tick| MarkerBody::Document {
            key: key.to_owned(),
            rev: tick,
            shaped,
            tid,
        })?;
        self.unindex_live(key);
        self.index_live(key, &marker);
        self.enforce_cap();
        Ok(marker)
    }

    /// Remove the document stored under `key`, writing a deletion marker.
    pub(crate) fn remove(
        &self,
        key: &str,
        tid: Option<TransactionId>,
    ) -> Result<Arc<Marker>> {
        if self.read(key).is_none() {
            return Err(ShapeDbError::NotFound {
                what: "document",
                name: key.to_owned(),
            });
        }
        let marker = self.files.append_with(|tick| MarkerBody::Deletion {
            key: key.to_owned(),
            rev: tick,
            tid,
        })?;
        self.unindex_live(key);
        Ok(marker)
    }

    /// Append a non-data marker (transaction boundaries) directly.
    pub(crate) fn append_raw(&self, body: MarkerBody) -> Result<Arc<Marker>> {
        self.files.append(body)
    }

    /// Undo the live-view effect of one aborted operation: re-derive the
    /// newest surviving revision of the key, ignoring the aborted
    /// transaction's markers. The markers themselves stay in the datafiles;
    /// dumps skip them via the failed-transaction set.
    pub(crate) fn rollback_op(&self, op: &crate::observer::LoggedOp) {
        let aborted_tid = op.tid;
        let survivor = self
            .files
            .all_markers()
            .into_iter()
            .rev()
            .find(|m| m.is_data() && m.key() == Some(op.key.as_str()) && m.tid() != aborted_tid);
        self.unindex_live(&op.key);
        if let Some(marker) = survivor {
            if !matches!(marker.body, MarkerBody::Deletion { .. }) {
                self.index_live(&op.key, &marker);
            }
        }
    }

    fn index_live(&self, key: &str, marker: &Arc<Marker>) {
        let size = marker.shaped().map_or(0, |s| s.byte_size() as u64);
        self.primary
            .write()
            .insert(key.to_owned(), Arc::clone(marker));
        self.live_order.write().insert(marker.tick, key.to_owned());
        *self.live_bytes.write() += size;
    }

    fn unindex_live(&self, key: &str) {
        let removed = self.primary.write().remove(key);
        if let Some(marker) = removed {
            self.live_order.write().remove(&marker.tick);
            let size = marker.shaped().map_or(0, |s| s.byte_size() as u64);
            let mut bytes = self.live_bytes.write();
            *bytes = bytes.saturating_sub(size);
        }
    }

    /// Drop the oldest live documents while a cap bound is exceeded. The
    /// markers stay in the datafiles (dumps still see them) until
    /// compaction; only the live view shrinks.
    fn enforce_cap(&self) {
        let Some(cap) = *self.cap.read() else {
            return;
        };
        loop {
            let over_count =
                cap.max_count > 0 && self.primary.read().len() as u64 > cap.max_count;
            let over_size = cap.max_size > 0 && *self.live_bytes.read() > cap.max_size;
            if !over_count && !over_size {
                return;
            }
            let oldest = self
                .live_order
                .read()
                .iter()
                .next()
                .map(|(_, key)| key.clone());
            match oldest {
                Some(key) => {
                    tracing::debug!(collection = %self.name(), key, "cap constraint dropped document");
                    self.unindex_live(&key);
                }
                None => return,
            }
        }
    }

    // === Replay (reopen) ===

    /// Apply one marker read back from disk. Markers arrive in tick order,
    /// so the live view can be maintained incrementally: definitions feed
    /// the shaper, a document/edge marker supersedes the previous revision,
    /// a deletion clears the slot.
    pub(crate) fn replay_marker(&self, marker: Marker, encoded_len: usize) {
        match &marker.body {
            MarkerBody::AttributeDef { aid, name } => {
                self.shaper.replay_attribute(*aid, name);
            }
            MarkerBody::ShapeDef { shape } => {
                self.shaper.replay_shape(shape.clone());
            }
            _ => {}
        }
        let marker = Arc::new(marker);
        if let Some(key) = marker.key().map(str::to_owned) {
            self.unindex_live(&key);
            if !matches!(marker.body, MarkerBody::Deletion { .. }) {
                self.index_live(&key, &marker);
            }
        }
        self.files.replay(marker, encoded_len);
    }

    /// Replay postlude: evict documents whose newest revision belongs to a
    /// transaction that never committed, then re-apply the cap bound.
    pub(crate) fn finish_replay(&self, failed: &HashSet<TransactionId>) {
        if !failed.is_empty() {
            let poisoned: Vec<String> = self
                .primary
                .read()
                .iter()
                .filter(|(_, m)| m.tid().is_some_and(|tid| failed.contains(&tid)))
                .map(|(key, _)| key.clone())
                .collect();
            for key in poisoned {
                let survivor = self.files.all_markers().into_iter().rev().find(|m| {
                    m.is_data()
                        && m.key() == Some(key.as_str())
                        && !m.tid().is_some_and(|tid| failed.contains(&tid))
                });
                self.unindex_live(&key);
                if let Some(marker) = survivor {
                    if !matches!(marker.body, MarkerBody::Deletion { .. }) {
                        self.index_live(&key, &marker);
                    }
                }
            }
        }
        self.enforce_cap();
    }

    // === Compaction ===

    /// Rewrite sealed datafiles, dropping data markers that are no longer
    /// live and whose tick lies below `horizon`. Definitions and
    /// transaction boundaries are always kept. Holds the compaction write
    /// lock, so it waits for in-flight dumps and blocks new ones.
    ///
    /// `horizon` must not exceed the replication logger's last log tick;
    /// the store enforces that at the call site.
    pub fn compact(&self, horizon: Tick) -> usize {
        let _guard = self.compaction.write();
        let snapshot = self.files.snapshot();
        let primary = self.primary.read();
        let live: HashSet<Tick> = primary.values().map(|m| m.tick).collect();
        drop(primary);

        let mut dropped = 0usize;
        let mut rebuilt = Vec::with_capacity(snapshot.sealed.len());
        for file in &snapshot.sealed {
            let kept: Vec<Arc<Marker>> = file
                .markers()
                .iter()
                .filter(|m| {
                    let dead = m.is_data() && m.tick < horizon && !live.contains(&m.tick);
                    if dead {
                        dropped += 1;
                    }
                    !dead
                })
                .cloned()
                .collect();
            if !kept.is_empty() {
                rebuilt.push(DatafileSet::build_sealed(file.fid(), kept));
            }
        }
        self.files.replace_sealed(rebuilt);
        if dropped > 0 {
            tracing::info!(collection = %self.name(), dropped, "compacted datafiles");
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collection() -> Collection {
        Collection::new(
            CollectionId(1),
            "c".to_owned(),
            CollectionKind::Document,
            Arc::new(TickSource::new()),
            None,
        )
    }

    fn doc(x: f64) -> DocValue {
        DocValue::object([("x", DocValue::Number(x))])
    }

    #[test]
    fn insert_read_update_remove() {
        let c = collection();
        let inserted = c.insert(Some("a".to_owned()), &doc(1.0), None).unwrap();
        assert_eq!(inserted.rev(), Some(inserted.tick));
        assert_eq!(c.count(), 1);

        let read = c.read("a").unwrap();
        assert_eq!(read.tick, inserted.tick);

        let updated = c.update("a", &doc(2.0), None).unwrap();
        assert!(updated.tick > inserted.tick);
        assert_eq!(c.read("a").unwrap().tick, updated.tick);
        assert_eq!(c.count(), 1);

        c.remove("a", None).unwrap();
        assert!(c.read("a").is_none());
        assert_eq!(c.count(), 0);
    }

    #[test]
    fn duplicate_key_rejected() {
        let c = collection();
        c.insert(Some("a".to_owned()), &doc(1.0), None).unwrap();
        let err = c.insert(Some("a".to_owned()), &doc(2.0), None).unwrap_err();
        assert!(matches!(err, ShapeDbError::DuplicateName { .. }));
    }

    #[test]
    fn update_missing_is_not_found() {
        let c = collection();
        let err = c.update("nope", &doc(1.0), None).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn live_documents_in_tick_order() {
        let c = collection();
        for (key, x) in [("b", 1.0), ("a", 2.0), ("z", 3.0)] {
            c.insert(Some(key.to_owned()), &doc(x), None).unwrap();
        }
        let keys: Vec<_> = c
            .live_documents()
            .iter()
            .map(|m| m.key().unwrap().to_owned())
            .collect();
        assert_eq!(keys, vec!["b", "a", "z"]);
    }

    #[test]
    fn cap_drops_oldest() {
        let c = collection();
        c.set_cap(Some(CapConstraint {
            max_count: 2,
            max_size: 0,
        }));
        for key in ["a", "b", "c", "d"] {
            c.insert(Some(key.to_owned()), &doc(1.0), None).unwrap();
        }
        assert_eq!(c.count(), 2);
        assert!(c.read("a").is_none());
        assert!(c.read("b").is_none());
        assert!(c.read("c").is_some());
        assert!(c.read("d").is_some());
    }

    #[test]
    fn range_by_key_is_sorted() {
        let c = collection();
        for key in ["d", "a", "c", "b"] {
            c.insert(Some(key.to_owned()), &doc(0.0), None).unwrap();
        }
        let keys: Vec<_> = c
            .range_by_key("b", "c")
            .iter()
            .map(|m| m.key().unwrap().to_owned())
            .collect();
        assert_eq!(keys, vec!["b", "c"]);
    }

    #[test]
    fn compact_drops_dead_markers() {
        // Tiny journal capacity so every marker seals into its own file.
        let tick = Arc::new(TickSource::new());
        let c = Collection::new(
            CollectionId(1),
            "c".to_owned(),
            CollectionKind::Document,
            tick,
            None,
        );
        // Reach into the files to force sealing via many updates instead:
        // update the same key many times, then compact at the max tick.
        c.insert(Some("a".to_owned()), &doc(0.0), None).unwrap();
        for i in 0..10 {
            c.update("a", &doc(f64::from(i)), None).unwrap();
        }
        // Nothing sealed yet (default capacity), so compaction drops
        // nothing even though most markers are superseded.
        assert_eq!(c.compact(Tick::MAX), 0);
    }
}
