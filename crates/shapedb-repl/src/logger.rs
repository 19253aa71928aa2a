//! The replication event logger.
//!
//! The logger observes every committed mutation and DDL change on a store
//! and appends one event document per change to the `_replication` system
//! collection, inside a single long-lived write transaction held for the
//! whole active period. Because the event documents go through the normal
//! write path they are durable before `last_log_tick` advances, so a client
//! that has seen tick T can always fetch everything up to T from the
//! datafiles.
//!
//! System collections (and any collection named in the exclusion list) are
//! never logged; in particular `_replication` itself is invisible to the
//! logger, which is what keeps the observer hook from feeding back into it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use shapedb_error::{Result, ShapeDbError};
use shapedb_store::{
    CapConstraint, Collection, CollectionKind, DdlEvent, DocumentStore, LoggedOp,
    MutationObserver, Transaction,
};
use shapedb_types::{CollectionId, DocValue, ServerId, Tick, TransactionId};

use crate::event::{ddl_payload, doc_op_payload, ReplicationEventType};

/// Name of the system collection holding the replication log.
pub const REPLICATION_COLLECTION: &str = "_replication";

/// Smallest permitted event-count cap when one is set at all.
pub const MIN_LOG_EVENTS: u64 = 1024;
/// Smallest permitted log size cap in bytes when one is set at all.
pub const MIN_LOG_SIZE: u64 = 1024 * 1024;

/// Logger configuration, validated by [`ReplicationLogger::new`].
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Cap on live event documents; 0 means unbounded.
    pub max_events: u64,
    /// Cap on cumulative live event payload bytes; 0 means unbounded.
    pub max_events_size: u64,
    /// Whether events originating on another server are logged too.
    pub log_remote_changes: bool,
    /// User collections excluded from logging, by name.
    pub excluded: Vec<String>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            max_events: 1_048_576,
            max_events_size: 128 * 1024 * 1024,
            log_remote_changes: false,
            excluded: Vec::new(),
        }
    }
}

impl LoggerConfig {
    fn validate(&self) -> Result<()> {
        if self.max_events != 0 && self.max_events < MIN_LOG_EVENTS {
            return Err(ShapeDbError::InvalidConfiguration {
                detail: format!("maximal events must be 0 or at least {MIN_LOG_EVENTS}"),
            });
        }
        if self.max_events_size != 0 && self.max_events_size < MIN_LOG_SIZE {
            return Err(ShapeDbError::InvalidConfiguration {
                detail: format!("maximal events size must be 0 or at least {MIN_LOG_SIZE}"),
            });
        }
        Ok(())
    }
}

/// One follower the leader has served, with the newest tick it was handed.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub server: ServerId,
    pub last_served_tick: Tick,
    pub time: SystemTime,
}

/// Snapshot of the logger's externally visible state.
#[derive(Debug, Clone, Copy)]
pub struct LoggerState {
    pub active: bool,
    pub last_log_tick: Tick,
    pub total_events: u64,
}

pub struct ReplicationLogger {
    store: Arc<DocumentStore>,
    config: LoggerConfig,
    local_server: ServerId,
    active: RwLock<bool>,
    /// The long-lived log transaction and its target collection, present
    /// exactly while the logger is active. Appends serialize on this lock.
    trx: Mutex<Option<(Transaction, Arc<Collection>)>>,
    last_log_tick: AtomicU64,
    total_events: AtomicU64,
    clients: RwLock<HashMap<ServerId, ClientInfo>>,
}

impl ReplicationLogger {
    /// Validate the config, build the logger and register it as the store's
    /// mutation observer. The logger starts inactive.
    pub fn new(
        store: Arc<DocumentStore>,
        config: LoggerConfig,
        local_server: ServerId,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let logger = Arc::new(Self {
            store,
            config,
            local_server,
            active: RwLock::new(false),
            trx: Mutex::new(None),
            last_log_tick: AtomicU64::new(0),
            total_events: AtomicU64::new(0),
            clients: RwLock::new(HashMap::new()),
        });
        logger
            .store
            .set_observer(Arc::clone(&logger) as Arc<dyn MutationObserver>);
        Ok(logger)
    }

    #[must_use]
    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        *self.active.read()
    }

    /// Newest tick of a durably written log event.
    #[must_use]
    pub fn last_log_tick(&self) -> Tick {
        Tick(self.last_log_tick.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn state(&self) -> LoggerState {
        LoggerState {
            active: self.is_active(),
            last_log_tick: self.last_log_tick(),
            total_events: self.total_events.load(Ordering::Relaxed),
        }
    }

    /// The log collection, once the logger has been started at least once.
    #[must_use]
    pub fn log_collection(&self) -> Option<Arc<Collection>> {
        self.store.collection(REPLICATION_COLLECTION)
    }

    /// Activate the logger: ensure the `_replication` collection exists with
    /// the configured cap, open the log transaction and write the start
    /// event. Starting an active logger is a no-op.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut active = self.active.write();
        if *active {
            return Ok(());
        }
        let collection = match self.store.collection(REPLICATION_COLLECTION) {
            Some(c) => c,
            None => self
                .store
                .create_system_collection(REPLICATION_COLLECTION, CollectionKind::Document)?,
        };
        if self.config.max_events != 0 || self.config.max_events_size != 0 {
            self.store.set_cap(
                REPLICATION_COLLECTION,
                Some(CapConstraint {
                    max_count: self.config.max_events,
                    max_size: self.config.max_events_size,
                }),
            )?;
        }
        let trx = self.store.begin_transaction();
        let payload = serde_json::json!({
            "lastTick": self.store.last_tick().to_string(),
        });
        let tick = append_event(&trx, &collection, ReplicationEventType::LoggerStarted, &payload)?;
        self.note_written(tick);
        *self.trx.lock() = Some((trx, collection));
        *active = true;
        tracing::info!(tick = %tick, "replication logger started");
        Ok(())
    }

    /// Deactivate the logger: write the stop event and commit the log
    /// transaction, making every logged event visible to reopen replay.
    /// Stopping an inactive logger is a no-op.
    pub fn stop(&self) -> Result<()> {
        let mut active = self.active.write();
        if !*active {
            return Ok(());
        }
        let taken = self.trx.lock().take();
        *active = false;
        if let Some((trx, collection)) = taken {
            let payload = serde_json::json!({
                "lastTick": self.store.last_tick().to_string(),
            });
            let tick =
                append_event(&trx, &collection, ReplicationEventType::LoggerStopped, &payload)?;
            self.note_written(tick);
            trx.commit()?;
            tracing::info!(tick = %tick, "replication logger stopped");
        }
        Ok(())
    }

    /// Append one event to the log. Returns `Ok(None)` without writing when
    /// the logger is inactive, or when the event originates on a remote
    /// server and remote logging is disabled.
    pub fn log_event(
        &self,
        origin: Option<ServerId>,
        event: ReplicationEventType,
        payload: &serde_json::Value,
    ) -> Result<Option<Tick>> {
        if !self.is_active() {
            return Ok(None);
        }
        if let Some(origin) = origin {
            if origin != self.local_server && !self.config.log_remote_changes {
                return Ok(None);
            }
        }
        let slot = self.trx.lock();
        let Some((trx, collection)) = slot.as_ref() else {
            return Ok(None);
        };
        let tick = append_event(trx, collection, event, payload)?;
        self.note_written(tick);
        Ok(Some(tick))
    }

    /// Record that a follower was served events up to `last_served_tick`.
    pub fn update_client(&self, server: ServerId, last_served_tick: Tick) {
        self.clients.write().insert(
            server,
            ClientInfo {
                server,
                last_served_tick,
                time: SystemTime::now(),
            },
        );
    }

    #[must_use]
    pub fn clients(&self) -> Vec<ClientInfo> {
        let mut list: Vec<_> = self.clients.read().values().cloned().collect();
        list.sort_by_key(|c| c.server);
        list
    }

    fn note_written(&self, tick: Tick) {
        self.last_log_tick.fetch_max(tick.get(), Ordering::AcqRel);
        self.total_events.fetch_add(1, Ordering::Relaxed);
    }

    fn is_excluded(&self, collection_name: &str) -> bool {
        collection_name.starts_with('_')
            || self.config.excluded.iter().any(|n| n == collection_name)
    }
}

impl std::fmt::Debug for ReplicationLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationLogger")
            .field("active", &self.is_active())
            .field("last_log_tick", &self.last_log_tick())
            .finish_non_exhaustive()
    }
}

impl MutationObserver for ReplicationLogger {
    fn document_op(&self, op: &LoggedOp) {
        if self.is_excluded(&op.collection_name) || !self.is_active() {
            return;
        }
        let event = ReplicationEventType::for_doc_op(op.kind, op.is_edge);
        let payload = doc_op_payload(op);
        if let Err(error) = self.log_event(None, event, &payload) {
            tracing::warn!(%error, collection = %op.collection_name, "failed to log document operation");
        }
    }

    fn transaction_committed(&self, tid: TransactionId, ops: &[LoggedOp]) {
        let logged: Vec<_> = ops
            .iter()
            .filter(|op| !self.is_excluded(&op.collection_name))
            .collect();
        if logged.is_empty() || !self.is_active() {
            return;
        }
        // One lock scope for the whole bracket, so no foreign event can
        // interleave between start and commit.
        let slot = self.trx.lock();
        let Some((trx, collection)) = slot.as_ref() else {
            return;
        };
        let mut per_collection: Vec<(CollectionId, String, usize)> = Vec::new();
        for op in &logged {
            match per_collection.iter_mut().find(|entry| entry.0 == op.cid) {
                Some(entry) => entry.2 += 1,
                None => per_collection.push((op.cid, op.collection_name.clone(), 1)),
            }
        }
        let collections: Vec<_> = per_collection
            .into_iter()
            .map(|(cid, name, operations)| {
                serde_json::json!({
                    "cid": cid.to_string(),
                    "name": name,
                    "operations": operations,
                })
            })
            .collect();
        let start = serde_json::json!({ "tid": tid.to_string(), "collections": collections });
        let commit = serde_json::json!({ "tid": tid.to_string() });
        let result = (|| -> Result<Tick> {
            append_event(trx, collection, ReplicationEventType::TransactionStart, &start)?;
            for op in &logged {
                let event = ReplicationEventType::for_doc_op(op.kind, op.is_edge);
                append_event(trx, collection, event, &doc_op_payload(op))?;
            }
            append_event(trx, collection, ReplicationEventType::TransactionCommit, &commit)
        })();
        match result {
            Ok(tick) => {
                self.last_log_tick.fetch_max(tick.get(), Ordering::AcqRel);
                self.total_events
                    .fetch_add(logged.len() as u64 + 2, Ordering::Relaxed);
            }
            Err(error) => {
                tracing::warn!(%error, tid = %tid, "failed to log transaction");
            }
        }
    }

    fn ddl(&self, event: &DdlEvent) {
        if self.is_excluded(event.collection_name()) || !self.is_active() {
            return;
        }
        let event_type = ReplicationEventType::for_ddl(event);
        let payload = ddl_payload(event);
        if let Err(error) = self.log_event(None, event_type, &payload) {
            tracing::warn!(%error, "failed to log schema change");
        }
    }
}

/// Build the event document and append it through the log transaction.
/// Returns the tick of the durably written marker.
fn append_event(
    trx: &Transaction,
    collection: &Arc<Collection>,
    event: ReplicationEventType,
    payload: &serde_json::Value,
) -> Result<Tick> {
    let mut doc = serde_json::Map::new();
    doc.insert("type".into(), event.code().into());
    if let serde_json::Value::Object(fields) = payload {
        for (name, value) in fields {
            doc.insert(name.clone(), value.clone());
        }
    }
    let document = DocValue::from(serde_json::Value::Object(doc));
    let marker = trx.insert(collection, None, &document)?;
    Ok(marker.tick)
}
