//! The subquery operator: one full run of a nested pipeline per outer row.

use std::sync::Arc;

use shapedb_error::Result;

use crate::block::{ItemBlock, RegisterId};
use crate::engine::{ExecutionBlock, QueryContext, DEFAULT_BATCH};
use crate::value::AqlValue;

/// Re-runs its nested subtree once per outer row via repeated
/// `init_cursor`, materializing each run's blocks into a DOCVEC value in
/// the output register.
pub struct SubqueryBlock {
    ctx: Arc<QueryContext>,
    dep: Box<dyn ExecutionBlock>,
    sub: Box<dyn ExecutionBlock>,
    out: RegisterId,
    clear: Vec<RegisterId>,
}

impl SubqueryBlock {
    pub fn new(
        ctx: Arc<QueryContext>,
        dep: Box<dyn ExecutionBlock>,
        sub: Box<dyn ExecutionBlock>,
        out: RegisterId,
        clear: Vec<RegisterId>,
    ) -> Self {
        Self {
            ctx,
            dep,
            sub,
            out,
            clear,
        }
    }

    fn run_subquery(&mut self, outer: &ItemBlock, row: usize) -> Result<Vec<ItemBlock>> {
        self.sub.init_cursor(Some((outer, row)))?;
        let mut blocks = Vec::new();
        while let Some(block) = self.sub.get_some(1, DEFAULT_BATCH)? {
            blocks.push(block);
        }
        Ok(blocks)
    }
}

impl ExecutionBlock for SubqueryBlock {
    fn initialize(&mut self) -> Result<()> {
        self.dep.initialize()?;
        self.sub.initialize()
    }

    fn init_cursor(&mut self, input: Option<(&ItemBlock, usize)>) -> Result<()> {
        self.dep.init_cursor(input)
    }

    fn get_some(&mut self, at_least: usize, at_most: usize) -> Result<Option<ItemBlock>> {
        self.ctx.check_killed()?;
        let Some(mut block) = self.dep.get_some(at_least, at_most)? else {
            return Ok(None);
        };
        for row in 0..block.rows() {
            let result = self.run_subquery(&block, row)?;
            block.set(row, self.out, AqlValue::Docvec(Arc::new(result)));
        }
        block.clear_registers(&self.clear);
        Ok(Some(block))
    }

    fn skip_some(&mut self, at_least: usize, at_most: usize) -> Result<usize> {
        self.ctx.check_killed()?;
        // Skipped outer rows never run their subquery; side-effecting
        // subqueries must not sit below a skip, which the planner enforces.
        self.dep.skip_some(at_least, at_most)
    }

    fn has_more(&mut self) -> bool {
        self.dep.has_more()
    }

    fn remaining(&mut self) -> i64 {
        self.dep.remaining()
    }

    fn shutdown(&mut self) -> Result<()> {
        self.sub.shutdown()?;
        self.dep.shutdown()
    }
}
