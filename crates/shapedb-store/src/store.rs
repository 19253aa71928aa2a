//! The document store: the collection namespace, transaction dispenser,
//! failed-transaction set and reopen/replay logic.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use shapedb_error::{Result, ShapeDbError};
use shapedb_types::{CollectionId, DocValue, Tick, TickSource, TransactionId};

use crate::collection::{CapConstraint, Collection, CollectionKind};
use crate::marker::{EdgeRef, Marker, decode_line};
use crate::observer::{DdlEvent, DocOpKind, LoggedOp, MutationObserver};
use crate::transaction::Transaction;

/// Per-collection metadata persisted as `meta.json` in its directory.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct CollectionMeta {
    cid: CollectionId,
    name: String,
    kind: CollectionKind,
    cap: Option<CapConstraint>,
}

pub struct DocumentStore {
    dir: Option<PathBuf>,
    tick: Arc<TickSource>,
    collections: RwLock<HashMap<String, Arc<Collection>>>,
    by_cid: RwLock<HashMap<CollectionId, Arc<Collection>>>,
    next_cid: AtomicU64,
    next_tid: AtomicU64,
    failed: RwLock<HashSet<TransactionId>>,
    observer: RwLock<Option<Arc<dyn MutationObserver>>>,
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore")
            .field("dir", &self.dir)
            .field("collections", &self.collections.read().len())
            .finish_non_exhaustive()
    }
}

impl DocumentStore {
    /// An in-memory store (markers are kept but not persisted).
    #[must_use]
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self::empty(None))
    }

    fn empty(dir: Option<PathBuf>) -> Self {
        Self {
            dir,
            tick: Arc::new(TickSource::new()),
            collections: RwLock::new(HashMap::new()),
            by_cid: RwLock::new(HashMap::new()),
            next_cid: AtomicU64::new(0),
            next_tid: AtomicU64::new(0),
            failed: RwLock::new(HashSet::new()),
            observer: RwLock::new(None),
        }
    }

    /// Open (or create) a persistent store rooted at `dir`, replaying every
    /// collection's datafiles. Definitions are replayed before the document
    /// markers that reference them because markers are applied in tick
    /// order and definitions always precede first use in the files.
    pub fn open(dir: impl AsRef<Path>) -> Result<Arc<Self>> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(ShapeDbError::Io)?;
        let store = Arc::new(Self::empty(Some(dir.clone())));

        let mut entries: Vec<PathBuf> = std::fs::read_dir(&dir)
            .map_err(ShapeDbError::Io)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect();
        entries.sort();
        for path in entries {
            store.reopen_collection(&path)?;
        }
        tracing::info!(
            collections = store.collections.read().len(),
            last_tick = %store.tick.last_tick(),
            "store opened"
        );
        Ok(store)
    }

    fn reopen_collection(&self, path: &Path) -> Result<()> {
        let dir_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_owned();
        let meta_raw = std::fs::read(path.join("meta.json")).map_err(|err| {
            ShapeDbError::CorruptedCollection {
                name: dir_name.clone(),
                detail: format!("missing meta.json: {err}"),
            }
        })?;
        let meta: CollectionMeta = serde_json::from_slice(&meta_raw).map_err(|err| {
            ShapeDbError::CorruptedCollection {
                name: dir_name.clone(),
                detail: format!("unparsable meta.json: {err}"),
            }
        })?;

        let collection = Arc::new(Collection::new(
            meta.cid,
            meta.name.clone(),
            meta.kind,
            Arc::clone(&self.tick),
            Some(path.to_path_buf()),
        ));
        collection.set_cap(meta.cap);
        self.next_cid.fetch_max(meta.cid.get(), Ordering::SeqCst);

        // Datafiles replay in fid order; ticks are increasing within and
        // across them.
        let mut datafiles: Vec<(u64, PathBuf)> = std::fs::read_dir(path)
            .map_err(ShapeDbError::Io)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter_map(|p| {
                let name = p.file_name()?.to_str()?;
                let fid: u64 = name
                    .strip_prefix("datafile-")?
                    .strip_suffix(".jsonl")?
                    .parse()
                    .ok()?;
                Some((fid, p))
            })
            .collect();
        datafiles.sort_by_key(|(fid, _)| *fid);

        let mut begun: HashSet<TransactionId> = HashSet::new();
        let mut aborted: HashSet<TransactionId> = HashSet::new();
        for (_, file) in datafiles {
            let raw = std::fs::read(&file).map_err(ShapeDbError::Io)?;
            for line in raw.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
                let marker: Marker = decode_line(&meta.name, line)?;
                self.next_tid
                    .fetch_max(marker.tid().map_or(0, TransactionId::get), Ordering::SeqCst);
                match &marker.body {
                    crate::marker::MarkerBody::TxnBegin { tid } => {
                        begun.insert(*tid);
                    }
                    crate::marker::MarkerBody::TxnCommit { tid } => {
                        begun.remove(tid);
                    }
                    crate::marker::MarkerBody::TxnAbort { tid } => {
                        begun.remove(tid);
                        aborted.insert(*tid);
                    }
                    _ => {}
                }
                collection.replay_marker(marker, line.len() + 1);
            }
        }
        // A transaction begun but never committed (crash mid-write) counts
        // as failed, same as an explicit abort: its markers must neither be
        // live nor reach replication consumers.
        aborted.extend(begun);
        collection.finish_replay(&aborted);
        if !aborted.is_empty() {
            self.failed.write().extend(aborted);
        }

        self.collections
            .write()
            .insert(meta.name, Arc::clone(&collection));
        self.by_cid.write().insert(meta.cid, collection);
        Ok(())
    }

    /// Attach the mutation observer (the replication logger).
    pub fn set_observer(&self, observer: Arc<dyn MutationObserver>) {
        *self.observer.write() = Some(observer);
    }

    pub fn clear_observer(&self) {
        *self.observer.write() = None;
    }

    #[must_use]
    pub fn tick_source(&self) -> &Arc<TickSource> {
        &self.tick
    }

    /// The most recently assigned tick.
    #[must_use]
    pub fn last_tick(&self) -> Tick {
        self.tick.last_tick()
    }

    // === Collection namespace ===

    /// Create a collection. User collection names must not start with the
    /// reserved `_` prefix; use [`Self::create_system_collection`] for
    /// internal ones.
    pub fn create_collection(
        self: &Arc<Self>,
        name: &str,
        kind: CollectionKind,
    ) -> Result<Arc<Collection>> {
        if name.is_empty() || name.starts_with('_') {
            return Err(ShapeDbError::InvalidConfiguration {
                detail: format!("illegal collection name '{name}'"),
            });
        }
        self.create_collection_inner(name, kind, true)
    }

    /// Create a system collection (reserved `_` prefix). System collections
    /// are excluded from replication.
    pub fn create_system_collection(
        self: &Arc<Self>,
        name: &str,
        kind: CollectionKind,
    ) -> Result<Arc<Collection>> {
        if !name.starts_with('_') {
            return Err(ShapeDbError::InvalidConfiguration {
                detail: format!("system collection name '{name}' must start with '_'"),
            });
        }
        self.create_collection_inner(name, kind, false)
    }

    fn create_collection_inner(
        self: &Arc<Self>,
        name: &str,
        kind: CollectionKind,
        replicate: bool,
    ) -> Result<Arc<Collection>> {
        let mut collections = self.collections.write();
        if collections.contains_key(name) {
            return Err(ShapeDbError::DuplicateName {
                name: name.to_owned(),
            });
        }
        let cid = CollectionId(self.next_cid.fetch_add(1, Ordering::SeqCst) + 1);
        let dir = match &self.dir {
            Some(root) => {
                let path = root.join(format!("collection-{cid}"));
                std::fs::create_dir_all(&path).map_err(ShapeDbError::Io)?;
                Some(path)
            }
            None => None,
        };
        let collection = Arc::new(Collection::new(
            cid,
            name.to_owned(),
            kind,
            Arc::clone(&self.tick),
            dir,
        ));
        self.persist_meta(&collection)?;
        collections.insert(name.to_owned(), Arc::clone(&collection));
        self.by_cid.write().insert(cid, Arc::clone(&collection));
        drop(collections);
        tracing::info!(%cid, name, "collection created");
        if replicate {
            self.notify_ddl(&DdlEvent::CollectionCreate {
                cid,
                name: name.to_owned(),
                is_edge: collection.is_edge(),
            });
        }
        Ok(collection)
    }

    fn persist_meta(&self, collection: &Collection) -> Result<()> {
        let Some(root) = &self.dir else {
            return Ok(());
        };
        let meta = CollectionMeta {
            cid: collection.cid(),
            name: collection.name(),
            kind: collection.kind(),
            cap: collection.cap(),
        };
        let path = root
            .join(format!("collection-{}", collection.cid()))
            .join("meta.json");
        let encoded = serde_json::to_vec_pretty(&meta)
            .map_err(|err| ShapeDbError::write_failed(format!("meta encoding: {err}")))?;
        std::fs::write(path, encoded).map_err(ShapeDbError::Io)?;
        Ok(())
    }

    #[must_use]
    pub fn collection(&self, name: &str) -> Option<Arc<Collection>> {
        self.collections.read().get(name).cloned()
    }

    #[must_use]
    pub fn collection_by_id(&self, cid: CollectionId) -> Option<Arc<Collection>> {
        self.by_cid.read().get(&cid).cloned()
    }

    #[must_use]
    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn drop_collection(self: &Arc<Self>, name: &str) -> Result<()> {
        let removed = self.collections.write().remove(name);
        let Some(collection) = removed else {
            return Err(ShapeDbError::collection_not_found(name));
        };
        self.by_cid.write().remove(&collection.cid());
        tracing::info!(cid = %collection.cid(), name, "collection dropped");
        if !collection.is_system() {
            self.notify_ddl(&DdlEvent::CollectionDrop {
                cid: collection.cid(),
                name: name.to_owned(),
            });
        }
        Ok(())
    }

    pub fn rename_collection(self: &Arc<Self>, old_name: &str, new_name: &str) -> Result<()> {
        if new_name.is_empty() || new_name.starts_with('_') {
            return Err(ShapeDbError::InvalidConfiguration {
                detail: format!("illegal collection name '{new_name}'"),
            });
        }
        let mut collections = self.collections.write();
        if collections.contains_key(new_name) {
            return Err(ShapeDbError::DuplicateName {
                name: new_name.to_owned(),
            });
        }
        let Some(collection) = collections.remove(old_name) else {
            return Err(ShapeDbError::collection_not_found(old_name));
        };
        collection.set_name(new_name.to_owned());
        collections.insert(new_name.to_owned(), Arc::clone(&collection));
        drop(collections);
        self.persist_meta(&collection)?;
        self.notify_ddl(&DdlEvent::CollectionRename {
            cid: collection.cid(),
            old_name: old_name.to_owned(),
            new_name: new_name.to_owned(),
        });
        Ok(())
    }

    /// Change collection properties (currently the cap constraint carried
    /// through the index-event pair, plus a free-form properties payload).
    pub fn change_properties(
        self: &Arc<Self>,
        name: &str,
        properties: serde_json::Value,
    ) -> Result<()> {
        let collection = self
            .collection(name)
            .ok_or_else(|| ShapeDbError::collection_not_found(name))?;
        self.notify_ddl(&DdlEvent::CollectionChange {
            cid: collection.cid(),
            name: name.to_owned(),
            properties,
        });
        Ok(())
    }

    /// Attach (or detach, with `None`) a cap constraint. Caps surface as
    /// index create/drop events to replication consumers.
    pub fn set_cap(self: &Arc<Self>, name: &str, cap: Option<CapConstraint>) -> Result<()> {
        let collection = self
            .collection(name)
            .ok_or_else(|| ShapeDbError::collection_not_found(name))?;
        let had = collection.cap().is_some();
        collection.set_cap(cap);
        self.persist_meta(&collection)?;
        if !collection.is_system() {
            match cap {
                Some(cap) => self.notify_ddl(&DdlEvent::IndexCreate {
                    cid: collection.cid(),
                    name: name.to_owned(),
                    index: serde_json::json!({
                        "type": "cap",
                        "size": cap.max_count,
                        "byteSize": cap.max_size,
                    }),
                }),
                None if had => self.notify_ddl(&DdlEvent::IndexDrop {
                    cid: collection.cid(),
                    name: name.to_owned(),
                    index_id: collection.cid().get(),
                }),
                None => {}
            }
        }
        Ok(())
    }

    // === Standalone document operations ===

    pub fn insert_document(
        self: &Arc<Self>,
        collection: &Arc<Collection>,
        key: Option<String>,
        document: &DocValue,
    ) -> Result<Arc<Marker>> {
        let _write = collection.begin_write();
        let marker = collection.insert(key, document, None)?;
        self.notify_document(collection, &marker, DocOpKind::Insert);
        Ok(marker)
    }

    pub fn insert_edge_document(
        self: &Arc<Self>,
        collection: &Arc<Collection>,
        key: Option<String>,
        document: &DocValue,
        from: EdgeRef,
        to: EdgeRef,
    ) -> Result<Arc<Marker>> {
        let _write = collection.begin_write();
        let marker = collection.insert_edge(key, document, from, to, None)?;
        self.notify_document(collection, &marker, DocOpKind::Insert);
        Ok(marker)
    }

    pub fn update_document(
        self: &Arc<Self>,
        collection: &Arc<Collection>,
        key: &str,
        document: &DocValue,
    ) -> Result<Arc<Marker>> {
        let _write = collection.begin_write();
        let marker = collection.update(key, document, None)?;
        self.notify_document(collection, &marker, DocOpKind::Update);
        Ok(marker)
    }

    pub fn remove_document(
        self: &Arc<Self>,
        collection: &Arc<Collection>,
        key: &str,
    ) -> Result<Arc<Marker>> {
        let _write = collection.begin_write();
        let marker = collection.remove(key, None)?;
        self.notify_document(collection, &marker, DocOpKind::Remove);
        Ok(marker)
    }

    // === Transactions ===

    pub fn begin_transaction(self: &Arc<Self>) -> Transaction {
        let tid = TransactionId(self.next_tid.fetch_add(1, Ordering::SeqCst) + 1);
        Transaction::new(tid, Arc::clone(self))
    }

    pub(crate) fn mark_failed(&self, tid: TransactionId) {
        self.failed.write().insert(tid);
    }

    /// Whether `tid` belongs to a failed/aborted transaction.
    #[must_use]
    pub fn is_failed_transaction(&self, tid: TransactionId) -> bool {
        self.failed.read().contains(&tid)
    }

    // === Observer plumbing ===

    fn notify_document(
        &self,
        collection: &Arc<Collection>,
        marker: &Marker,
        kind: DocOpKind,
    ) {
        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            observer.document_op(&LoggedOp::from_marker(collection, marker, kind));
        }
    }

    pub(crate) fn notify_transaction(&self, tid: TransactionId, ops: &[LoggedOp]) {
        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            observer.transaction_committed(tid, ops);
        }
    }

    fn notify_ddl(&self, event: &DdlEvent) {
        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            observer.ddl(event);
        }
    }
}
