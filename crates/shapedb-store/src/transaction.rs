//! Write transactions.
//!
//! A transaction brackets its data markers with begin/commit markers in
//! every collection it touches. Aborting registers the tid in the store's
//! failed-transaction set, which replication dumps consult to skip the
//! orphaned markers. Committing reports the full operation list to the
//! mutation observer in one call, so the logger can write the event
//! sequence under a single lock scope.

use std::sync::Arc;

use parking_lot::Mutex;
use shapedb_error::{Result, ShapeDbError};
use shapedb_types::{DocValue, TransactionId};

use crate::collection::Collection;
use crate::marker::{EdgeRef, Marker, MarkerBody};
use crate::observer::{DocOpKind, LoggedOp};
use crate::store::DocumentStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrxState {
    Running,
    Committed,
    Aborted,
}

pub struct Transaction {
    tid: TransactionId,
    store: Arc<DocumentStore>,
    touched: Mutex<Vec<Arc<Collection>>>,
    ops: Mutex<Vec<LoggedOp>>,
    state: Mutex<TrxState>,
}

impl Transaction {
    pub(crate) fn new(tid: TransactionId, store: Arc<DocumentStore>) -> Self {
        Self {
            tid,
            store,
            touched: Mutex::new(Vec::new()),
            ops: Mutex::new(Vec::new()),
            state: Mutex::new(TrxState::Running),
        }
    }

    #[must_use]
    pub const fn tid(&self) -> TransactionId {
        self.tid
    }

    fn check_running(&self) -> Result<()> {
        if *self.state.lock() == TrxState::Running {
            Ok(())
        } else {
            Err(ShapeDbError::TransactionAborted {
                tid: self.tid.get(),
            })
        }
    }

    /// Write the begin marker into `collection` on first touch.
    fn touch(&self, collection: &Arc<Collection>) -> Result<()> {
        let mut touched = self.touched.lock();
        if touched.iter().any(|c| c.cid() == collection.cid()) {
            return Ok(());
        }
        collection.append_raw(MarkerBody::TxnBegin { tid: self.tid })?;
        touched.push(Arc::clone(collection));
        Ok(())
    }

    pub fn insert(
        &self,
        collection: &Arc<Collection>,
        key: Option<String>,
        document: &DocValue,
    ) -> Result<Arc<Marker>> {
        self.check_running()?;
        let _write = collection.begin_write();
        self.touch(collection)?;
        let marker = collection.insert(key, document, Some(self.tid))?;
        self.ops.lock().push(LoggedOp::from_marker(
            collection,
            &marker,
            DocOpKind::Insert,
        ));
        Ok(marker)
    }

    pub fn insert_edge(
        &self,
        collection: &Arc<Collection>,
        key: Option<String>,
        document: &DocValue,
        from: EdgeRef,
        to: EdgeRef,
    ) -> Result<Arc<Marker>> {
        self.check_running()?;
        let _write = collection.begin_write();
        self.touch(collection)?;
        let marker = collection.insert_edge(key, document, from, to, Some(self.tid))?;
        self.ops.lock().push(LoggedOp::from_marker(
            collection,
            &marker,
            DocOpKind::Insert,
        ));
        Ok(marker)
    }

    pub fn update(
        &self,
        collection: &Arc<Collection>,
        key: &str,
        document: &DocValue,
    ) -> Result<Arc<Marker>> {
        self.check_running()?;
        let _write = collection.begin_write();
        self.touch(collection)?;
        let marker = collection.update(key, document, Some(self.tid))?;
        self.ops.lock().push(LoggedOp::from_marker(
            collection,
            &marker,
            DocOpKind::Update,
        ));
        Ok(marker)
    }

    pub fn remove(&self, collection: &Arc<Collection>, key: &str) -> Result<Arc<Marker>> {
        self.check_running()?;
        let _write = collection.begin_write();
        self.touch(collection)?;
        let marker = collection.remove(key, Some(self.tid))?;
        self.ops.lock().push(LoggedOp::from_marker(
            collection,
            &marker,
            DocOpKind::Remove,
        ));
        Ok(marker)
    }

    /// Commit: write the commit markers, then report the operation list to
    /// the observer in one call.
    pub fn commit(self) -> Result<()> {
        self.check_running()?;
        let touched = self.touched.lock();
        for collection in touched.iter() {
            collection.append_raw(MarkerBody::TxnCommit { tid: self.tid })?;
        }
        *self.state.lock() = TrxState::Committed;
        let ops = self.ops.lock();
        if !ops.is_empty() {
            self.store.notify_transaction(self.tid, &ops);
        }
        tracing::debug!(tid = %self.tid, ops = ops.len(), "transaction committed");
        Ok(())
    }

    /// Abort: write abort markers and register the tid in the failed set so
    /// dumps never surface this transaction's markers.
    pub fn abort(self) -> Result<()> {
        self.do_abort()
    }

    fn do_abort(&self) -> Result<()> {
        if *self.state.lock() != TrxState::Running {
            return Ok(());
        }
        *self.state.lock() = TrxState::Aborted;
        self.store.mark_failed(self.tid);
        for collection in self.touched.lock().iter() {
            collection.append_raw(MarkerBody::TxnAbort { tid: self.tid })?;
        }
        // The live view must forget this transaction's writes.
        for op in self.ops.lock().iter().rev() {
            if let Some(collection) = self.store.collection_by_id(op.cid) {
                collection.rollback_op(op);
            }
        }
        tracing::debug!(tid = %self.tid, "transaction aborted");
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        // A transaction neither committed nor aborted counts as failed.
        let _ = self.do_abort();
    }
}
