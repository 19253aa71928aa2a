//! Datafile dumps: serving event and marker ranges to followers.
//!
//! Dumps scan a collection's datafiles directly rather than any in-memory
//! logger state, so they reflect durable markers even while the logger is
//! inactive. Sealed files are filtered by their recorded tick ranges and
//! read without locks; the journal's markers come from the snapshot taken
//! under its read lock. Collection dumps additionally hold the collection's
//! compaction read lock so no marker is relocated mid-scan.
//!
//! A chunk never splits or duplicates a marker: scanning stops after the
//! marker that overflowed the byte budget, and `last_included_tick` names
//! that marker so the caller resumes from the next tick.

use std::fmt::Write as _;
use std::sync::Arc;

use shapedb_error::Result;
use shapedb_store::{Collection, Marker, MarkerBody};
use shapedb_types::{Tick, TransactionId};

use crate::event::ReplicationEventType;
use crate::logger::ReplicationLogger;

pub const HEADER_CHECKMORE: &str = "x-arango-replication-checkmore";
pub const HEADER_LASTINCLUDED: &str = "x-arango-replication-lastincluded";
pub const HEADER_LASTTICK: &str = "x-arango-replication-lasttick";
pub const HEADER_ACTIVE: &str = "x-arango-replication-active";

/// Content type of a dump response body.
pub const CONTENT_TYPE_DUMP: &str = "application/x-arango-dump";

/// One chunk of a dump: newline-separated JSON objects plus the resumption
/// bookkeeping the response headers carry.
#[derive(Debug)]
pub struct DumpResult {
    pub buffer: String,
    /// More relevant markers exist past this chunk.
    pub has_more: bool,
    /// Tick of the last marker written into `buffer`; zero if none was.
    pub last_included_tick: Tick,
    /// Newest tick assigned by the store at scan time.
    pub last_tick: Tick,
    /// Whether the logger was active at scan time.
    pub active: bool,
}

impl DumpResult {
    /// The response headers a server puts on this chunk.
    #[must_use]
    pub fn headers(&self) -> [(&'static str, String); 4] {
        [
            (HEADER_CHECKMORE, self.has_more.to_string()),
            (HEADER_LASTINCLUDED, self.last_included_tick.to_string()),
            (HEADER_LASTTICK, self.last_tick.to_string()),
            (HEADER_ACTIVE, self.active.to_string()),
        ]
    }
}

impl ReplicationLogger {
    /// Serve a range of logged events from the `_replication` collection.
    ///
    /// Returns an empty chunk if the logger has never been started (the log
    /// collection does not exist yet).
    pub fn dump_log(&self, tick_min: Tick, tick_max: Tick, chunk_size: usize) -> Result<DumpResult> {
        let mut result = self.empty_result();
        let Some(collection) = self.log_collection() else {
            return Ok(result);
        };
        let markers = relevant_markers(&collection, tick_min, tick_max);
        let mut scan = Scan::new(self, chunk_size);
        for (index, marker) in markers.iter().enumerate() {
            if scan.skip_failed(marker) {
                continue;
            }
            let MarkerBody::Document { shaped, .. } = &marker.body else {
                continue;
            };
            let event = collection.shaper().unshape(shaped)?;
            let mut line = serde_json::Map::new();
            line.insert("tick".into(), marker.tick.to_string().into());
            if let serde_json::Value::Object(fields) = serde_json::Value::from(&event) {
                for (name, value) in fields {
                    line.insert(name, value);
                }
            }
            scan.write_line(&result_line(&line), marker.tick, &mut result);
            if scan.full {
                result.has_more = index + 1 < markers.len();
                break;
            }
        }
        Ok(result)
    }

    /// Serve a range of a collection's raw data markers.
    ///
    /// `with_ticks` controls whether each line carries its marker tick;
    /// `translate_ids` renders `_from`/`_to` with collection names instead
    /// of numeric ids.
    pub fn dump_collection(
        &self,
        collection: &Arc<Collection>,
        tick_min: Tick,
        tick_max: Tick,
        chunk_size: usize,
        with_ticks: bool,
        translate_ids: bool,
    ) -> Result<DumpResult> {
        let mut result = self.empty_result();
        // Compaction must not relocate markers while the scan runs.
        let _no_compaction = collection.compaction_lock().read();
        let markers = relevant_markers(collection, tick_min, tick_max);
        let mut scan = Scan::new(self, chunk_size);
        for (index, marker) in markers.iter().enumerate() {
            if scan.skip_failed(marker) {
                continue;
            }
            let Some(line) = self.marker_line(collection, marker, with_ticks, translate_ids)? else {
                continue;
            };
            scan.write_line(&line, marker.tick, &mut result);
            if scan.full {
                result.has_more = index + 1 < markers.len();
                break;
            }
        }
        Ok(result)
    }

    fn empty_result(&self) -> DumpResult {
        DumpResult {
            buffer: String::new(),
            has_more: false,
            last_included_tick: Tick::ZERO,
            last_tick: self.store().last_tick(),
            active: self.is_active(),
        }
    }

    fn marker_line(
        &self,
        collection: &Arc<Collection>,
        marker: &Marker,
        with_ticks: bool,
        translate_ids: bool,
    ) -> Result<Option<String>> {
        let (event, shaped, from, to) = match &marker.body {
            MarkerBody::Document { shaped, .. } => {
                (ReplicationEventType::MarkerDocument, Some(shaped), None, None)
            }
            MarkerBody::Edge {
                shaped, from, to, ..
            } => (
                ReplicationEventType::MarkerEdge,
                Some(shaped),
                Some(from),
                Some(to),
            ),
            MarkerBody::Deletion { .. } => (ReplicationEventType::MarkerRemove, None, None, None),
            _ => return Ok(None),
        };
        let key = marker.key().unwrap_or_default();
        let rev = marker.rev().unwrap_or(Tick::ZERO);
        let mut line = serde_json::Map::new();
        if with_ticks {
            line.insert("tick".into(), marker.tick.to_string().into());
        }
        line.insert("type".into(), event.code().into());
        line.insert("key".into(), key.into());
        line.insert("rev".into(), rev.to_string().into());
        if let Some(shaped) = shaped {
            let document = collection.shaper().unshape(shaped)?;
            let mut data = serde_json::Map::new();
            data.insert("_key".into(), key.into());
            data.insert("_rev".into(), rev.to_string().into());
            if let Some(from) = from {
                data.insert("_from".into(), self.edge_handle(from, translate_ids).into());
            }
            if let Some(to) = to {
                data.insert("_to".into(), self.edge_handle(to, translate_ids).into());
            }
            if let serde_json::Value::Object(attrs) = serde_json::Value::from(&document) {
                for (name, value) in attrs {
                    data.insert(name, value);
                }
            }
            line.insert("data".into(), serde_json::Value::Object(data));
        }
        Ok(Some(result_line(&line)))
    }

    fn edge_handle(&self, edge: &shapedb_store::EdgeRef, translate_ids: bool) -> String {
        if translate_ids {
            if let Some(collection) = self.store().collection_by_id(edge.cid) {
                return format!("{}/{}", collection.name(), edge.key);
            }
        }
        format!("{}/{}", edge.cid, edge.key)
    }
}

/// All data markers of `collection` whose tick falls in the inclusive
/// range, in tick order. Sealed files are pre-filtered by their recorded
/// ranges; the journal snapshot is filtered per marker.
fn relevant_markers(collection: &Arc<Collection>, tick_min: Tick, tick_max: Tick) -> Vec<Arc<Marker>> {
    let snapshot = collection.datafile_snapshot();
    let mut markers = Vec::new();
    for datafile in &snapshot.sealed {
        if !datafile.intersects(tick_min, tick_max) {
            continue;
        }
        for marker in datafile.markers() {
            if marker.is_data() && marker.tick >= tick_min && marker.tick <= tick_max {
                markers.push(Arc::clone(marker));
            }
        }
    }
    for marker in &snapshot.journal_markers {
        if marker.is_data() && marker.tick >= tick_min && marker.tick <= tick_max {
            markers.push(Arc::clone(marker));
        }
    }
    markers
}

fn result_line(fields: &serde_json::Map<String, serde_json::Value>) -> String {
    serde_json::Value::Object(fields.clone()).to_string()
}

/// Per-scan bookkeeping: the chunk budget and the one-entry failed
/// transaction cache (consecutive markers usually share a transaction).
struct Scan<'a> {
    logger: &'a ReplicationLogger,
    chunk_size: usize,
    last_tid: Option<(TransactionId, bool)>,
    full: bool,
}

impl<'a> Scan<'a> {
    fn new(logger: &'a ReplicationLogger, chunk_size: usize) -> Self {
        Self {
            logger,
            chunk_size,
            last_tid: None,
            full: false,
        }
    }

    /// Whether `marker` belongs to a failed transaction and must be hidden.
    fn skip_failed(&mut self, marker: &Marker) -> bool {
        let Some(tid) = marker.tid() else {
            return false;
        };
        match self.last_tid {
            Some((cached, failed)) if cached == tid => failed,
            _ => {
                let failed = self.logger.store().is_failed_transaction(tid);
                self.last_tid = Some((tid, failed));
                failed
            }
        }
    }

    fn write_line(&mut self, line: &str, tick: Tick, result: &mut DumpResult) {
        let _ = writeln!(result.buffer, "{line}");
        result.last_included_tick = tick;
        if result.buffer.len() >= self.chunk_size {
            self.full = true;
        }
    }
}
