//! The operator contract and the query driver.
//!
//! Operators form a pull pipeline: the driver calls `get_some` on the root,
//! each operator pulls from its dependency, transforms, and hands blocks
//! up. Errors propagate as results through the same path and abort the
//! whole query. Cancellation is cooperative: every `get_some`/`skip_some`
//! call is a checkpoint against the query's kill flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use shapedb_error::{Result, ShapeDbError};
use shapedb_store::DocumentStore;
use shapedb_types::DocValue;

use crate::block::ItemBlock;
use crate::plan::{instantiate, PlanNode};

/// Default batch size the driver requests per pull.
pub const DEFAULT_BATCH: usize = 1000;

/// Sentinel for `remaining()`: the operator cannot answer without
/// executing; the caller must pull to find out.
pub const REMAINING_UNKNOWN: i64 = -1;

/// Shared per-query state: the store handle and the kill flag.
pub struct QueryContext {
    store: Arc<DocumentStore>,
    killed: AtomicBool,
}

impl QueryContext {
    #[must_use]
    pub fn new(store: Arc<DocumentStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            killed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    #[must_use]
    pub fn store_handle(&self) -> Arc<DocumentStore> {
        Arc::clone(&self.store)
    }

    /// Request cooperative abortion; observed at the next block boundary.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
    }

    pub fn check_killed(&self) -> Result<()> {
        if self.killed.load(Ordering::Acquire) {
            Err(ShapeDbError::QueryKilled)
        } else {
            Ok(())
        }
    }
}

/// One node of the physical plan at runtime.
///
/// Lifecycle: `initialize` once, then any number of `init_cursor` /
/// pull-to-exhaustion rounds, then `shutdown` once. `get_some` returns
/// `None` only when exhausted; a returned block always has at least one
/// row and, unless the operator ran dry, at least `at_least` of them.
pub trait ExecutionBlock: Send {
    fn initialize(&mut self) -> Result<()>;

    /// Reset iteration state. `input` carries the outer row when this
    /// pipeline runs as a subquery body.
    fn init_cursor(&mut self, input: Option<(&ItemBlock, usize)>) -> Result<()>;

    fn get_some(&mut self, at_least: usize, at_most: usize) -> Result<Option<ItemBlock>>;

    /// Discard up to `at_most` rows without materializing them for the
    /// caller. Returns the number discarded.
    fn skip_some(&mut self, at_least: usize, at_most: usize) -> Result<usize>;

    /// Approximate liveness; may report `true` for an exhausted operator
    /// that has not noticed yet.
    fn has_more(&mut self) -> bool;

    /// Exact remaining row count, or [`REMAINING_UNKNOWN`].
    fn remaining(&mut self) -> i64;

    fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A handle for aborting a running query from another thread.
#[derive(Clone)]
pub struct KillHandle {
    ctx: Arc<QueryContext>,
}

impl KillHandle {
    pub fn kill(&self) {
        self.ctx.kill();
    }
}

/// An instantiated, ready-to-run query.
pub struct Query {
    ctx: Arc<QueryContext>,
    root: Box<dyn ExecutionBlock>,
}

impl Query {
    /// Build the operator tree for `plan`, run static register analysis
    /// and initialize every operator.
    pub fn new(store: Arc<DocumentStore>, plan: &PlanNode) -> Result<Self> {
        let ctx = QueryContext::new(store);
        let mut root = instantiate(plan, &ctx)?;
        root.initialize()?;
        root.init_cursor(None)?;
        Ok(Self { ctx, root })
    }

    #[must_use]
    pub fn kill_handle(&self) -> KillHandle {
        KillHandle {
            ctx: Arc::clone(&self.ctx),
        }
    }

    /// Pull the pipeline to exhaustion. On error the pipeline is shut
    /// down and the first error is returned; partial results are dropped.
    pub fn execute(mut self) -> Result<Vec<ItemBlock>> {
        let mut blocks = Vec::new();
        loop {
            match self.root.get_some(1, DEFAULT_BATCH) {
                Ok(Some(block)) => blocks.push(block),
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!(error = %err, "query aborted");
                    let _ = self.root.shutdown();
                    return Err(err);
                }
            }
        }
        self.root.shutdown()?;
        Ok(blocks)
    }

    /// Run to exhaustion and materialize register 0 of every result row.
    pub fn execute_values(self) -> Result<Vec<DocValue>> {
        let ctx = Arc::clone(&self.ctx);
        let blocks = self.execute()?;
        let mut values = Vec::new();
        for block in &blocks {
            for row in 0..block.rows() {
                match block.get(row, 0) {
                    Some(cell) => values.push(cell.materialize(ctx.store())?),
                    None => values.push(DocValue::Null),
                }
            }
        }
        Ok(values)
    }
}
