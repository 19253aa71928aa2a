//! Append-only datafiles and the per-collection datafile set.
//!
//! A collection owns one mutable journal datafile plus a list of sealed,
//! immutable ones. Each datafile records the tick range and data-tick range
//! it covers so scans (replication dumps, compaction) can skip files whose
//! range does not intersect the request. Sealed files are read without any
//! lock; the journal is read under a short read lock because writers may be
//! appending concurrently.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use shapedb_error::{Result, ShapeDbError};
use shapedb_types::{DatafileId, Tick, TickSource};

use crate::marker::{Marker, MarkerBody, encode_line};

/// Journal size at which a datafile is sealed and a fresh journal started.
pub(crate) const DEFAULT_JOURNAL_CAPACITY: usize = 4 * 1024 * 1024;

/// One append-only datafile.
#[derive(Debug)]
pub struct Datafile {
    fid: DatafileId,
    markers: Vec<Arc<Marker>>,
    byte_size: usize,
    tick_min: Tick,
    tick_max: Tick,
    data_tick_min: Tick,
    data_tick_max: Tick,
    sealed: bool,
}

impl Datafile {
    fn new(fid: DatafileId) -> Self {
        Self {
            fid,
            markers: Vec::new(),
            byte_size: 0,
            tick_min: Tick::ZERO,
            tick_max: Tick::ZERO,
            data_tick_min: Tick::ZERO,
            data_tick_max: Tick::ZERO,
            sealed: false,
        }
    }

    #[must_use]
    pub const fn fid(&self) -> DatafileId {
        self.fid
    }

    #[must_use]
    pub const fn is_sealed(&self) -> bool {
        self.sealed
    }

    #[must_use]
    pub const fn tick_range(&self) -> (Tick, Tick) {
        (self.tick_min, self.tick_max)
    }

    #[must_use]
    pub const fn data_tick_range(&self) -> (Tick, Tick) {
        (self.data_tick_min, self.data_tick_max)
    }

    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    #[must_use]
    pub fn markers(&self) -> &[Arc<Marker>] {
        &self.markers
    }

    /// Whether any marker in this file can fall into `[tick_min, tick_max]`.
    #[must_use]
    pub fn intersects(&self, tick_min: Tick, tick_max: Tick) -> bool {
        if self.markers.is_empty() {
            return false;
        }
        self.tick_min <= tick_max && self.tick_max >= tick_min
    }

    fn push(&mut self, marker: Arc<Marker>, encoded_len: usize) {
        if self.markers.is_empty() {
            self.tick_min = marker.tick;
        }
        self.tick_max = marker.tick;
        if marker.is_data() {
            if self.data_tick_min == Tick::ZERO {
                self.data_tick_min = marker.tick;
            }
            self.data_tick_max = marker.tick;
        }
        self.byte_size += encoded_len;
        self.markers.push(marker);
    }
}

/// A read-consistent view of a collection's datafiles: all sealed files
/// plus the journal's markers captured under its read lock.
#[derive(Debug)]
pub struct DatafileSnapshot {
    pub sealed: Vec<Arc<Datafile>>,
    pub journal_markers: Vec<Arc<Marker>>,
    pub journal_range: (Tick, Tick),
}

/// The per-collection datafile set: one journal plus sealed files, with
/// optional write-through persistence (one JSON line per marker).
pub(crate) struct DatafileSet {
    collection_name: String,
    journal: RwLock<Datafile>,
    sealed: RwLock<Vec<Arc<Datafile>>>,
    tick_source: Arc<TickSource>,
    next_fid: RwLock<u64>,
    journal_capacity: usize,
    dir: Option<PathBuf>,
}

impl std::fmt::Debug for DatafileSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatafileSet")
            .field("collection", &self.collection_name)
            .finish_non_exhaustive()
    }
}

impl DatafileSet {
    pub(crate) fn new(
        collection_name: String,
        tick_source: Arc<TickSource>,
        dir: Option<PathBuf>,
        journal_capacity: usize,
    ) -> Self {
        Self {
            collection_name,
            journal: RwLock::new(Datafile::new(DatafileId(1))),
            sealed: RwLock::new(Vec::new()),
            tick_source,
            next_fid: RwLock::new(1),
            journal_capacity,
            dir,
        }
    }

    fn journal_path(&self, fid: DatafileId) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("datafile-{fid}.jsonl")))
    }

    /// Append a marker, assigning it the next tick. The durable write (when
    /// persistence is configured) happens before the marker becomes visible
    /// in the journal, so a visible tick always denotes a retrievable marker.
    pub(crate) fn append(&self, body: MarkerBody) -> Result<Arc<Marker>> {
        self.append_with(|_| body)
    }

    /// Like [`Self::append`], but the body may embed the assigned tick
    /// (document revisions equal their marker's tick).
    pub(crate) fn append_with(
        &self,
        build: impl FnOnce(Tick) -> MarkerBody,
    ) -> Result<Arc<Marker>> {
        let mut journal = self.journal.write();
        let tick = self.tick_source.next_tick();
        let marker = Arc::new(Marker {
            tick,
            body: build(tick),
        });
        let line = encode_line(&marker)?;
        if let Some(path) = self.journal_path(journal.fid()) {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(ShapeDbError::Io)?;
            file.write_all(&line).map_err(ShapeDbError::Io)?;
            file.write_all(b"\n").map_err(ShapeDbError::Io)?;
        }
        journal.push(Arc::clone(&marker), line.len() + 1);

        if journal.byte_size >= self.journal_capacity {
            self.seal_locked(&mut journal);
        }
        Ok(marker)
    }

    /// Re-insert a marker read back from disk during reopen. Preserves its
    /// original tick and never writes.
    pub(crate) fn replay(&self, marker: Arc<Marker>, encoded_len: usize) {
        self.tick_source.observe(marker.tick);
        let mut journal = self.journal.write();
        journal.push(marker, encoded_len);
        if journal.byte_size >= self.journal_capacity {
            self.seal_locked(&mut journal);
        }
    }

    fn seal_locked(&self, journal: &mut Datafile) {
        let mut next_fid = self.next_fid.write();
        *next_fid += 1;
        let fresh = Datafile::new(DatafileId(*next_fid));
        let mut full = std::mem::replace(journal, fresh);
        full.sealed = true;
        tracing::debug!(
            collection = %self.collection_name,
            fid = %full.fid(),
            bytes = full.byte_size,
            "sealed datafile"
        );
        self.sealed.write().push(Arc::new(full));
    }

    /// Capture a read-consistent view for scans. Sealed files are shared by
    /// reference (immutable); journal markers are copied under the read lock.
    pub(crate) fn snapshot(&self) -> DatafileSnapshot {
        let sealed = self.sealed.read().clone();
        let journal = self.journal.read();
        DatafileSnapshot {
            sealed,
            journal_markers: journal.markers.clone(),
            journal_range: journal.tick_range(),
        }
    }

    /// All markers in tick order. Scan-level convenience for reads that do
    /// not care about datafile boundaries.
    pub(crate) fn all_markers(&self) -> Vec<Arc<Marker>> {
        let snapshot = self.snapshot();
        let mut out = Vec::new();
        for file in &snapshot.sealed {
            out.extend_from_slice(file.markers());
        }
        out.extend(snapshot.journal_markers);
        out
    }

    /// Replace the sealed datafiles wholesale; used by compaction, which
    /// must hold the collection's compaction write lock while calling this.
    pub(crate) fn replace_sealed(&self, files: Vec<Arc<Datafile>>) {
        *self.sealed.write() = files;
    }

    /// Rebuild one sealed datafile from a filtered marker list.
    pub(crate) fn build_sealed(fid: DatafileId, markers: Vec<Arc<Marker>>) -> Arc<Datafile> {
        let mut file = Datafile::new(fid);
        for marker in markers {
            let len = encode_line(&marker).map_or(0, |l| l.len() + 1);
            file.push(marker, len);
        }
        file.sealed = true;
        Arc::new(file)
    }
}

impl shapedb_shaper::DefinitionSink for DatafileSet {
    fn persist_attribute(&self, aid: shapedb_types::AttributeId, name: &str) -> Result<()> {
        self.append(MarkerBody::AttributeDef {
            aid,
            name: name.to_owned(),
        })
        .map(|_| ())
    }

    fn persist_shape(&self, shape: &shapedb_shaper::Shape) -> Result<()> {
        self.append(MarkerBody::ShapeDef {
            shape: shape.clone(),
        })
        .map(|_| ())
    }
}
