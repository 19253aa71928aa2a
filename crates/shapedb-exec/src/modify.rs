//! Write operators: insert, update, replace and remove.
//!
//! All rows are consumed on the first pull and applied inside one write
//! transaction. A row failure either aborts the whole transaction or, with
//! `ignore_errors`, is counted and skipped. The store mirrors committed
//! writes to the replication observer, so nothing extra happens here.

use std::sync::Arc;

use shapedb_error::{Result, ShapeDbError};
use shapedb_store::{Collection, EdgeRef, Transaction};
use shapedb_types::DocValue;

use crate::block::{ItemBlock, RegisterId};
use crate::engine::{ExecutionBlock, QueryContext, DEFAULT_BATCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModOp {
    Insert,
    /// Merge the given top-level attributes into the existing document.
    Update,
    /// Swap the document body wholesale.
    Replace,
    Remove,
}

pub struct ModificationBlock {
    ctx: Arc<QueryContext>,
    dep: Box<dyn ExecutionBlock>,
    collection: Arc<Collection>,
    op: ModOp,
    reg: RegisterId,
    ignore_errors: bool,
    errors: usize,
    done: bool,
}

/// The system attributes of a document value, split from its payload.
struct SplitDoc {
    key: Option<String>,
    from: Option<String>,
    to: Option<String>,
    body: DocValue,
}

fn split_document(doc: DocValue) -> SplitDoc {
    let DocValue::Object(attrs) = doc else {
        return SplitDoc {
            key: None,
            from: None,
            to: None,
            body: doc,
        };
    };
    let mut key = None;
    let mut from = None;
    let mut to = None;
    let mut body = Vec::with_capacity(attrs.len());
    for (name, value) in attrs {
        match (name.as_str(), &value) {
            ("_key", DocValue::String(s)) => key = Some(s.clone()),
            ("_from", DocValue::String(s)) => from = Some(s.clone()),
            ("_to", DocValue::String(s)) => to = Some(s.clone()),
            ("_rev" | "_key" | "_from" | "_to", _) => {}
            _ => body.push((name, value)),
        }
    }
    SplitDoc {
        key,
        from,
        to,
        body: DocValue::Object(body),
    }
}

impl ModificationBlock {
    pub fn new(
        ctx: Arc<QueryContext>,
        dep: Box<dyn ExecutionBlock>,
        collection: Arc<Collection>,
        op: ModOp,
        reg: RegisterId,
        ignore_errors: bool,
    ) -> Self {
        Self {
            ctx,
            dep,
            collection,
            op,
            reg,
            ignore_errors,
            errors: 0,
            done: false,
        }
    }

    /// Rows that failed and were skipped under `ignore_errors`.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors
    }

    fn parse_edge_ref(&self, handle: &str) -> Result<EdgeRef> {
        let (name, key) = handle.split_once('/').ok_or_else(|| {
            ShapeDbError::aborted(format!("malformed edge reference '{handle}'"))
        })?;
        let target = self
            .ctx
            .store()
            .collection(name)
            .ok_or_else(|| ShapeDbError::collection_not_found(name))?;
        Ok(EdgeRef {
            cid: target.cid(),
            key: key.to_owned(),
        })
    }

    fn resolve_key(&self, value: &DocValue) -> Result<String> {
        let key = match value {
            DocValue::String(s) => Some(s.clone()),
            DocValue::Object(_) => value
                .get("_key")
                .and_then(DocValue::as_str)
                .map(str::to_owned),
            _ => None,
        };
        key.ok_or_else(|| ShapeDbError::aborted("row carries no document key"))
    }

    fn apply_row(&self, trx: &Transaction, value: &DocValue) -> Result<()> {
        match self.op {
            ModOp::Insert => {
                let split = split_document(value.clone());
                if self.collection.is_edge() {
                    let (Some(from), Some(to)) = (&split.from, &split.to) else {
                        return Err(ShapeDbError::aborted(
                            "edge document misses _from or _to",
                        ));
                    };
                    let from = self.parse_edge_ref(from)?;
                    let to = self.parse_edge_ref(to)?;
                    trx.insert_edge(&self.collection, split.key, &split.body, from, to)?;
                } else {
                    trx.insert(&self.collection, split.key, &split.body)?;
                }
            }
            ModOp::Update => {
                let split = split_document(value.clone());
                let key = split.key.ok_or_else(|| {
                    ShapeDbError::aborted("update row carries no document key")
                })?;
                let existing = self.collection.read(&key).ok_or_else(|| {
                    ShapeDbError::NotFound {
                        what: "document",
                        name: key.clone(),
                    }
                })?;
                let shaped = existing.shaped().ok_or_else(|| {
                    ShapeDbError::invalid_state("live marker without payload")
                })?;
                let merged = merge_objects(
                    self.collection.shaper().unshape(shaped)?,
                    split.body,
                );
                trx.update(&self.collection, &key, &merged)?;
            }
            ModOp::Replace => {
                let split = split_document(value.clone());
                let key = split.key.ok_or_else(|| {
                    ShapeDbError::aborted("replace row carries no document key")
                })?;
                trx.update(&self.collection, &key, &split.body)?;
            }
            ModOp::Remove => {
                let key = self.resolve_key(value)?;
                trx.remove(&self.collection, &key)?;
            }
        }
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        let store = self.ctx.store_handle();
        let trx = store.begin_transaction();
        while let Some(block) = self.dep.get_some(1, DEFAULT_BATCH)? {
            self.ctx.check_killed()?;
            for row in 0..block.rows() {
                let Some(cell) = block.get(row, self.reg) else {
                    continue;
                };
                let value = cell.materialize(&store)?;
                match self.apply_row(&trx, &value) {
                    Ok(()) => {}
                    Err(err) if self.ignore_errors => {
                        tracing::debug!(error = %err, "modification row skipped");
                        self.errors += 1;
                    }
                    // Dropping the transaction aborts and rolls it back.
                    Err(err) => return Err(err),
                }
            }
        }
        trx.commit()
    }
}

fn merge_objects(base: DocValue, patch: DocValue) -> DocValue {
    let (mut base, patch) = match (base, patch) {
        (DocValue::Object(base), DocValue::Object(patch)) => (base, patch),
        (_, patch) => return patch,
    };
    for (name, value) in patch {
        match base.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => base.push((name, value)),
        }
    }
    DocValue::Object(base)
}

impl ExecutionBlock for ModificationBlock {
    fn initialize(&mut self) -> Result<()> {
        self.dep.initialize()
    }

    fn init_cursor(&mut self, input: Option<(&ItemBlock, usize)>) -> Result<()> {
        self.done = false;
        self.errors = 0;
        self.dep.init_cursor(input)
    }

    fn get_some(&mut self, _at_least: usize, _at_most: usize) -> Result<Option<ItemBlock>> {
        self.ctx.check_killed()?;
        self.run()?;
        Ok(None)
    }

    fn skip_some(&mut self, _at_least: usize, _at_most: usize) -> Result<usize> {
        self.ctx.check_killed()?;
        self.run()?;
        Ok(0)
    }

    fn has_more(&mut self) -> bool {
        !self.done
    }

    fn remaining(&mut self) -> i64 {
        0
    }

    fn shutdown(&mut self) -> Result<()> {
        self.dep.shutdown()
    }
}
