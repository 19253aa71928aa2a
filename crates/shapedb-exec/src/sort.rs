//! Materializing operators: sort and aggregate (COLLECT).

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use shapedb_error::{Result, ShapeDbError};
use shapedb_types::DocValue;

use crate::block::{ItemBlock, RegisterId};
use crate::engine::{ExecutionBlock, QueryContext, DEFAULT_BATCH, REMAINING_UNKNOWN};
use crate::plan::SortCriterion;
use crate::value::{compare_doc_values, AqlValue};

/// Buffers the complete upstream input, sorts `(block, row)` pairs by the
/// chained criteria and emits in order. Callers must bound input size
/// upstream for large result sets; this operator holds everything.
pub struct SortBlock {
    ctx: Arc<QueryContext>,
    dep: Box<dyn ExecutionBlock>,
    criteria: Vec<SortCriterion>,
    stable: bool,
    clear: Vec<RegisterId>,
    buffer: Vec<ItemBlock>,
    /// Sorted (block index, row index) pairs; valid once `materialized`.
    order: Vec<(usize, usize)>,
    pos: usize,
    materialized: bool,
}

impl SortBlock {
    pub fn new(
        ctx: Arc<QueryContext>,
        dep: Box<dyn ExecutionBlock>,
        criteria: Vec<SortCriterion>,
        stable: bool,
        clear: Vec<RegisterId>,
    ) -> Self {
        Self {
            ctx,
            dep,
            criteria,
            stable,
            clear,
            buffer: Vec::new(),
            order: Vec::new(),
            pos: 0,
            materialized: false,
        }
    }

    fn materialize_input(&mut self) -> Result<()> {
        if self.materialized {
            return Ok(());
        }
        while let Some(block) = self.dep.get_some(1, DEFAULT_BATCH)? {
            self.ctx.check_killed()?;
            self.buffer.push(block);
        }

        // Precompute the sort keys once; comparisons then never touch the
        // store.
        let store = self.ctx.store_handle();
        let mut keys: Vec<Vec<DocValue>> = Vec::new();
        let mut order: Vec<(usize, usize)> = Vec::new();
        for (bi, block) in self.buffer.iter().enumerate() {
            for row in 0..block.rows() {
                let mut row_keys = Vec::with_capacity(self.criteria.len());
                for criterion in &self.criteria {
                    let key = match block.get(row, criterion.reg) {
                        Some(cell) => cell.materialize(&store)?,
                        None => DocValue::Null,
                    };
                    row_keys.push(key);
                }
                order.push((bi, row));
                keys.push(row_keys);
            }
        }

        let criteria = &self.criteria;
        let mut idx: Vec<usize> = (0..order.len()).collect();
        let cmp = |&a: &usize, &b: &usize| -> Ordering {
            for (ci, criterion) in criteria.iter().enumerate() {
                let c = compare_doc_values(&keys[a][ci], &keys[b][ci]);
                let c = if criterion.ascending { c } else { c.reverse() };
                if c != Ordering::Equal {
                    return c;
                }
            }
            Ordering::Equal
        };
        if self.stable {
            idx.sort_by(cmp);
        } else {
            idx.sort_unstable_by(cmp);
        }
        self.order = idx.into_iter().map(|i| order[i]).collect();
        self.materialized = true;
        Ok(())
    }
}

impl ExecutionBlock for SortBlock {
    fn initialize(&mut self) -> Result<()> {
        self.dep.initialize()
    }

    fn init_cursor(&mut self, input: Option<(&ItemBlock, usize)>) -> Result<()> {
        self.buffer.clear();
        self.order.clear();
        self.pos = 0;
        self.materialized = false;
        self.dep.init_cursor(input)
    }

    fn get_some(&mut self, _at_least: usize, at_most: usize) -> Result<Option<ItemBlock>> {
        self.ctx.check_killed()?;
        self.materialize_input()?;
        if self.pos >= self.order.len() {
            return Ok(None);
        }
        let end = (self.pos + at_most).min(self.order.len());
        let registers = self.buffer.first().map_or(0, ItemBlock::registers);
        let mut block = ItemBlock::new(end - self.pos, registers);
        for (dst, &(bi, row)) in self.order[self.pos..end].iter().enumerate() {
            block.copy_row(dst, &self.buffer[bi], row);
        }
        self.pos = end;
        block.clear_registers(&self.clear);
        Ok(Some(block))
    }

    fn skip_some(&mut self, _at_least: usize, at_most: usize) -> Result<usize> {
        self.ctx.check_killed()?;
        self.materialize_input()?;
        let skipped = at_most.min(self.order.len() - self.pos);
        self.pos += skipped;
        Ok(skipped)
    }

    fn has_more(&mut self) -> bool {
        !self.materialized || self.pos < self.order.len()
    }

    fn remaining(&mut self) -> i64 {
        if self.materialized {
            (self.order.len() - self.pos) as i64
        } else {
            REMAINING_UNKNOWN
        }
    }

    fn shutdown(&mut self) -> Result<()> {
        self.buffer.clear();
        self.order.clear();
        self.dep.shutdown()
    }
}

/// One group key: where it is read and where its value is emitted.
#[derive(Debug, Clone, Copy)]
pub struct GroupRegister {
    pub in_reg: RegisterId,
    pub out_reg: RegisterId,
}

/// Collect the values of `source` into a list register per group.
#[derive(Debug, Clone, Copy)]
pub struct CollectInto {
    pub source: RegisterId,
    pub out: RegisterId,
}

/// Grouping over pre-sorted input: emits one row per group when the key
/// changes. Rows must arrive grouped by key (the planner places a sort
/// upstream); a key recurring after its group closed is an error.
pub struct AggregateBlock {
    ctx: Arc<QueryContext>,
    dep: Box<dyn ExecutionBlock>,
    groups: Vec<GroupRegister>,
    into: Option<CollectInto>,
    registers: usize,
    clear: Vec<RegisterId>,
    /// Serialized keys of groups already emitted, for order violation
    /// detection.
    seen: HashSet<String>,
    result: Vec<ItemBlock>,
    pos: usize,
    materialized: bool,
}

struct OpenGroup {
    key: Vec<DocValue>,
    key_fingerprint: String,
    collected: Vec<DocValue>,
}

impl AggregateBlock {
    pub fn new(
        ctx: Arc<QueryContext>,
        dep: Box<dyn ExecutionBlock>,
        groups: Vec<GroupRegister>,
        into: Option<CollectInto>,
        registers: usize,
        clear: Vec<RegisterId>,
    ) -> Self {
        Self {
            ctx,
            dep,
            groups,
            into,
            registers,
            clear,
            seen: HashSet::new(),
            result: Vec::new(),
            pos: 0,
            materialized: false,
        }
    }

    fn fingerprint(key: &[DocValue]) -> String {
        serde_json::to_string(key).unwrap_or_default()
    }

    fn emit(&self, group: OpenGroup) -> ItemBlock {
        let mut block = ItemBlock::new(1, self.registers);
        for (reg, value) in self.groups.iter().zip(group.key) {
            block.set(0, reg.out_reg, AqlValue::json(value));
        }
        if let Some(into) = self.into {
            block.set(0, into.out, AqlValue::json(DocValue::List(group.collected)));
        }
        block
    }

    fn run(&mut self) -> Result<()> {
        if self.materialized {
            return Ok(());
        }
        let store = self.ctx.store_handle();
        let mut current: Option<OpenGroup> = None;
        let mut row_no = 0usize;
        while let Some(block) = self.dep.get_some(1, DEFAULT_BATCH)? {
            self.ctx.check_killed()?;
            for row in 0..block.rows() {
                let mut key = Vec::with_capacity(self.groups.len());
                for group in &self.groups {
                    let value = match block.get(row, group.in_reg) {
                        Some(cell) => cell.materialize(&store)?,
                        None => DocValue::Null,
                    };
                    key.push(value);
                }
                let changed = current.as_ref().map_or(true, |g| g.key != key);
                if changed {
                    if let Some(done) = current.take() {
                        self.seen.insert(done.key_fingerprint.clone());
                        let emitted = self.emit(done);
                        self.result.push(emitted);
                    }
                    let fingerprint = Self::fingerprint(&key);
                    if self.seen.contains(&fingerprint) {
                        return Err(ShapeDbError::GroupOrderViolated { row: row_no });
                    }
                    current = Some(OpenGroup {
                        key,
                        key_fingerprint: fingerprint,
                        collected: Vec::new(),
                    });
                }
                if let (Some(into), Some(group)) = (self.into, current.as_mut()) {
                    let value = match block.get(row, into.source) {
                        Some(cell) => cell.materialize(&store)?,
                        None => DocValue::Null,
                    };
                    group.collected.push(value);
                }
                row_no += 1;
            }
        }
        if let Some(done) = current.take() {
            let emitted = self.emit(done);
            self.result.push(emitted);
        }
        self.materialized = true;
        Ok(())
    }
}

impl ExecutionBlock for AggregateBlock {
    fn initialize(&mut self) -> Result<()> {
        self.dep.initialize()
    }

    fn init_cursor(&mut self, input: Option<(&ItemBlock, usize)>) -> Result<()> {
        self.seen.clear();
        self.result.clear();
        self.pos = 0;
        self.materialized = false;
        self.dep.init_cursor(input)
    }

    fn get_some(&mut self, _at_least: usize, at_most: usize) -> Result<Option<ItemBlock>> {
        self.ctx.check_killed()?;
        self.run()?;
        if self.pos >= self.result.len() {
            return Ok(None);
        }
        let end = (self.pos + at_most).min(self.result.len());
        let batch: Vec<ItemBlock> = self.result[self.pos..end].to_vec();
        self.pos = end;
        let mut block = ItemBlock::concatenate(batch)?;
        block.clear_registers(&self.clear);
        Ok(Some(block))
    }

    fn skip_some(&mut self, _at_least: usize, at_most: usize) -> Result<usize> {
        self.ctx.check_killed()?;
        self.run()?;
        let skipped = at_most.min(self.result.len() - self.pos);
        self.pos += skipped;
        Ok(skipped)
    }

    fn has_more(&mut self) -> bool {
        !self.materialized || self.pos < self.result.len()
    }

    fn remaining(&mut self) -> i64 {
        if self.materialized {
            (self.result.len() - self.pos) as i64
        } else {
            REMAINING_UNKNOWN
        }
    }

    fn shutdown(&mut self) -> Result<()> {
        self.result.clear();
        self.dep.shutdown()
    }
}
