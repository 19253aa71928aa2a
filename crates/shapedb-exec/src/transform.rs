//! Row-transforming operators: calculation, filter, limit and return.

use std::sync::Arc;

use shapedb_error::Result;

use crate::block::{ItemBlock, RegisterId};
use crate::engine::{ExecutionBlock, QueryContext, DEFAULT_BATCH, REMAINING_UNKNOWN};
use crate::expr::{evaluate_into, Expr};

/// Evaluates one expression per row into one output register. A bare
/// variable reference short-circuits to a cell copy.
pub struct CalculationBlock {
    ctx: Arc<QueryContext>,
    dep: Box<dyn ExecutionBlock>,
    expr: Expr,
    reference: Option<RegisterId>,
    out: RegisterId,
    clear: Vec<RegisterId>,
}

impl CalculationBlock {
    pub fn new(
        ctx: Arc<QueryContext>,
        dep: Box<dyn ExecutionBlock>,
        expr: Expr,
        out: RegisterId,
        clear: Vec<RegisterId>,
    ) -> Self {
        let reference = expr.as_reference();
        Self {
            ctx,
            dep,
            expr,
            reference,
            out,
            clear,
        }
    }
}

impl ExecutionBlock for CalculationBlock {
    fn initialize(&mut self) -> Result<()> {
        self.dep.initialize()
    }

    fn init_cursor(&mut self, input: Option<(&ItemBlock, usize)>) -> Result<()> {
        self.dep.init_cursor(input)
    }

    fn get_some(&mut self, at_least: usize, at_most: usize) -> Result<Option<ItemBlock>> {
        self.ctx.check_killed()?;
        let Some(mut block) = self.dep.get_some(at_least, at_most)? else {
            return Ok(None);
        };
        if let Some(reg) = self.reference {
            if let Some(cid) = block.owner(reg) {
                block.set_owner(self.out, cid);
            }
        }
        for row in 0..block.rows() {
            let value = evaluate_into(
                &self.expr,
                self.reference,
                &block,
                row,
                self.ctx.store(),
            )?;
            block.set(row, self.out, value);
        }
        block.clear_registers(&self.clear);
        Ok(Some(block))
    }

    fn skip_some(&mut self, at_least: usize, at_most: usize) -> Result<usize> {
        self.ctx.check_killed()?;
        self.dep.skip_some(at_least, at_most)
    }

    fn has_more(&mut self) -> bool {
        self.dep.has_more()
    }

    fn remaining(&mut self) -> i64 {
        self.dep.remaining()
    }

    fn shutdown(&mut self) -> Result<()> {
        self.dep.shutdown()
    }
}

/// Keeps rows whose condition register is true. Tracks the chosen row
/// indices per pulled block; selectivity is unknown in advance, so the
/// liveness queries are unsupported.
pub struct FilterBlock {
    ctx: Arc<QueryContext>,
    dep: Box<dyn ExecutionBlock>,
    condition: RegisterId,
    clear: Vec<RegisterId>,
    /// Filtered rows pulled past the caller's `at_most`, served first on
    /// the next call so no consumed row is ever dropped.
    buffer: Option<ItemBlock>,
    done: bool,
}

impl FilterBlock {
    pub fn new(
        ctx: Arc<QueryContext>,
        dep: Box<dyn ExecutionBlock>,
        condition: RegisterId,
        clear: Vec<RegisterId>,
    ) -> Self {
        Self {
            ctx,
            dep,
            condition,
            clear,
            buffer: None,
            done: false,
        }
    }

    fn chosen_rows(&self, block: &ItemBlock) -> Vec<usize> {
        (0..block.rows())
            .filter(|&row| {
                block.get(row, self.condition).is_some_and(|v| v.is_true())
            })
            .collect()
    }
}

impl ExecutionBlock for FilterBlock {
    fn initialize(&mut self) -> Result<()> {
        self.dep.initialize()
    }

    fn init_cursor(&mut self, input: Option<(&ItemBlock, usize)>) -> Result<()> {
        self.buffer = None;
        self.done = false;
        self.dep.init_cursor(input)
    }

    fn get_some(&mut self, at_least: usize, at_most: usize) -> Result<Option<ItemBlock>> {
        self.ctx.check_killed()?;
        let mut collected: Vec<ItemBlock> = Vec::new();
        let mut total = 0;
        if let Some(buffered) = self.buffer.take() {
            total += buffered.rows();
            collected.push(buffered);
        }
        while total < at_least && !self.done {
            let Some(mut block) = self.dep.get_some(1, DEFAULT_BATCH)? else {
                self.done = true;
                break;
            };
            let chosen = self.chosen_rows(&block);
            if chosen.is_empty() {
                continue;
            }
            total += chosen.len();
            if chosen.len() == block.rows() {
                collected.push(block);
            } else {
                collected.push(block.steal_chosen(&chosen, 0, chosen.len()));
            }
        }
        if collected.is_empty() {
            return Ok(None);
        }
        let mut block = if collected.len() == 1 {
            collected.pop().unwrap_or_else(|| unreachable!())
        } else {
            ItemBlock::concatenate(collected)?
        };
        if block.rows() > at_most {
            self.buffer = Some(block.slice(at_most, block.rows()));
            block.shrink(at_most);
        }
        block.clear_registers(&self.clear);
        Ok(Some(block))
    }

    fn skip_some(&mut self, _at_least: usize, at_most: usize) -> Result<usize> {
        self.ctx.check_killed()?;
        let mut skipped = 0;
        if let Some(mut buffered) = self.buffer.take() {
            if buffered.rows() > at_most {
                self.buffer = Some(buffered.slice(at_most, buffered.rows()));
                buffered.shrink(at_most);
            }
            skipped += buffered.rows();
        }
        while skipped < at_most && !self.done {
            let Some(mut block) = self.dep.get_some(1, DEFAULT_BATCH)? else {
                self.done = true;
                break;
            };
            let chosen = self.chosen_rows(&block);
            let want = at_most - skipped;
            if chosen.len() > want {
                let filtered = block.steal_chosen(&chosen, 0, chosen.len());
                self.buffer = Some(filtered.slice(want, filtered.rows()));
                skipped += want;
            } else {
                skipped += chosen.len();
            }
        }
        Ok(skipped)
    }

    fn has_more(&mut self) -> bool {
        self.buffer.is_some() || (!self.done && self.dep.has_more())
    }

    fn remaining(&mut self) -> i64 {
        REMAINING_UNKNOWN
    }

    fn shutdown(&mut self) -> Result<()> {
        self.dep.shutdown()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LimitState {
    BeforeOffset,
    Within,
    Done,
}

/// Offset/limit window: skips `offset` rows, emits up to `limit`, then
/// reports exhaustion regardless of upstream state.
pub struct LimitBlock {
    ctx: Arc<QueryContext>,
    dep: Box<dyn ExecutionBlock>,
    offset: usize,
    limit: usize,
    state: LimitState,
    emitted: usize,
    clear: Vec<RegisterId>,
}

impl LimitBlock {
    pub fn new(
        ctx: Arc<QueryContext>,
        dep: Box<dyn ExecutionBlock>,
        offset: usize,
        limit: usize,
        clear: Vec<RegisterId>,
    ) -> Self {
        Self {
            ctx,
            dep,
            offset,
            limit,
            state: LimitState::BeforeOffset,
            emitted: 0,
            clear,
        }
    }

    fn consume_offset(&mut self) -> Result<()> {
        let mut to_skip = self.offset;
        while to_skip > 0 {
            let skipped = self.dep.skip_some(1, to_skip)?;
            if skipped == 0 {
                break;
            }
            to_skip -= skipped;
        }
        self.state = if self.limit == 0 {
            LimitState::Done
        } else {
            LimitState::Within
        };
        Ok(())
    }
}

impl ExecutionBlock for LimitBlock {
    fn initialize(&mut self) -> Result<()> {
        self.dep.initialize()
    }

    fn init_cursor(&mut self, input: Option<(&ItemBlock, usize)>) -> Result<()> {
        self.state = LimitState::BeforeOffset;
        self.emitted = 0;
        self.dep.init_cursor(input)
    }

    fn get_some(&mut self, at_least: usize, at_most: usize) -> Result<Option<ItemBlock>> {
        self.ctx.check_killed()?;
        if self.state == LimitState::BeforeOffset {
            self.consume_offset()?;
        }
        if self.state == LimitState::Done {
            return Ok(None);
        }
        let window = self.limit - self.emitted;
        let at_most = at_most.min(window);
        let at_least = at_least.min(at_most);
        let Some(mut block) = self.dep.get_some(at_least.max(1), at_most)? else {
            self.state = LimitState::Done;
            return Ok(None);
        };
        if block.rows() > window {
            block.shrink(window);
        }
        self.emitted += block.rows();
        if self.emitted >= self.limit {
            self.state = LimitState::Done;
        }
        block.clear_registers(&self.clear);
        Ok(Some(block))
    }

    fn skip_some(&mut self, _at_least: usize, at_most: usize) -> Result<usize> {
        self.ctx.check_killed()?;
        if self.state == LimitState::BeforeOffset {
            self.consume_offset()?;
        }
        if self.state == LimitState::Done {
            return Ok(0);
        }
        let window = (self.limit - self.emitted).min(at_most);
        let skipped = self.dep.skip_some(1, window)?;
        self.emitted += skipped;
        if skipped == 0 || self.emitted >= self.limit {
            self.state = LimitState::Done;
        }
        Ok(skipped)
    }

    fn has_more(&mut self) -> bool {
        self.state != LimitState::Done
    }

    fn remaining(&mut self) -> i64 {
        match self.state {
            LimitState::Done => 0,
            _ => REMAINING_UNKNOWN,
        }
    }

    fn shutdown(&mut self) -> Result<()> {
        self.dep.shutdown()
    }
}

/// Projects a single register into single-column result blocks.
pub struct ReturnBlock {
    ctx: Arc<QueryContext>,
    dep: Box<dyn ExecutionBlock>,
    reg: RegisterId,
}

impl ReturnBlock {
    pub fn new(ctx: Arc<QueryContext>, dep: Box<dyn ExecutionBlock>, reg: RegisterId) -> Self {
        Self { ctx, dep, reg }
    }
}

impl ExecutionBlock for ReturnBlock {
    fn initialize(&mut self) -> Result<()> {
        self.dep.initialize()
    }

    fn init_cursor(&mut self, input: Option<(&ItemBlock, usize)>) -> Result<()> {
        self.dep.init_cursor(input)
    }

    fn get_some(&mut self, at_least: usize, at_most: usize) -> Result<Option<ItemBlock>> {
        self.ctx.check_killed()?;
        let Some(mut block) = self.dep.get_some(at_least, at_most)? else {
            return Ok(None);
        };
        let mut out = ItemBlock::new(block.rows(), 1);
        if let Some(cid) = block.owner(self.reg) {
            out.set_owner(0, cid);
        }
        for row in 0..block.rows() {
            if let Some(value) = block.get(row, self.reg).cloned() {
                block.erase(row, self.reg);
                out.set(row, 0, value);
            }
        }
        Ok(Some(out))
    }

    fn skip_some(&mut self, at_least: usize, at_most: usize) -> Result<usize> {
        self.ctx.check_killed()?;
        self.dep.skip_some(at_least, at_most)
    }

    fn has_more(&mut self) -> bool {
        self.dep.has_more()
    }

    fn remaining(&mut self) -> i64 {
        self.dep.remaining()
    }

    fn shutdown(&mut self) -> Result<()> {
        self.dep.shutdown()
    }
}
