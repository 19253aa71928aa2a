//! Producing operators: singleton, collection scans, list enumeration and
//! the no-results short circuit.

use std::sync::Arc;

use shapedb_error::Result;
use shapedb_store::{Collection, Marker};
use shapedb_types::DocValue;

use crate::block::{ItemBlock, RegisterId};
use crate::engine::{ExecutionBlock, QueryContext, REMAINING_UNKNOWN, DEFAULT_BATCH};
use crate::value::AqlValue;

/// Produces exactly one empty row, carrying the outer scope's register
/// values when running inside a subquery.
pub struct SingletonBlock {
    ctx: Arc<QueryContext>,
    registers: usize,
    clear: Vec<RegisterId>,
    /// Outer row snapshot, one entry per register.
    parent: Option<ItemBlock>,
    done: bool,
}

impl SingletonBlock {
    pub fn new(ctx: Arc<QueryContext>, registers: usize, clear: Vec<RegisterId>) -> Self {
        Self {
            ctx,
            registers,
            clear,
            parent: None,
            done: false,
        }
    }
}

impl ExecutionBlock for SingletonBlock {
    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    fn init_cursor(&mut self, input: Option<(&ItemBlock, usize)>) -> Result<()> {
        self.parent = input.map(|(block, row)| {
            let mut snapshot = ItemBlock::new(1, block.registers());
            snapshot.copy_row(0, block, row);
            snapshot
        });
        self.done = false;
        Ok(())
    }

    fn get_some(&mut self, _at_least: usize, _at_most: usize) -> Result<Option<ItemBlock>> {
        self.ctx.check_killed()?;
        if self.done {
            return Ok(None);
        }
        self.done = true;
        let mut block = ItemBlock::new(1, self.registers);
        if let Some(parent) = &self.parent {
            block.copy_row(0, parent, 0);
        }
        block.clear_registers(&self.clear);
        Ok(Some(block))
    }

    fn skip_some(&mut self, _at_least: usize, _at_most: usize) -> Result<usize> {
        self.ctx.check_killed()?;
        if self.done {
            return Ok(0);
        }
        self.done = true;
        Ok(1)
    }

    fn has_more(&mut self) -> bool {
        !self.done
    }

    fn remaining(&mut self) -> i64 {
        i64::from(!self.done)
    }
}

/// Streams the live documents of a collection (optionally restricted to a
/// primary-key range) once per input row, filling `out` with each document
/// and marking the register's owning collection.
///
/// The document snapshot is taken at `init_cursor`; `doc_pos` is the
/// internal skip position that survives across `get_some` calls.
pub struct CollectionScanBlock {
    ctx: Arc<QueryContext>,
    dep: Option<Box<dyn ExecutionBlock>>,
    collection: Arc<Collection>,
    range: Option<(String, String)>,
    out: RegisterId,
    registers: usize,
    clear: Vec<RegisterId>,
    docs: Vec<Arc<Marker>>,
    doc_pos: usize,
    input: Option<ItemBlock>,
    input_row: usize,
    done: bool,
}

impl CollectionScanBlock {
    pub fn new(
        ctx: Arc<QueryContext>,
        dep: Option<Box<dyn ExecutionBlock>>,
        collection: Arc<Collection>,
        range: Option<(String, String)>,
        out: RegisterId,
        registers: usize,
        clear: Vec<RegisterId>,
    ) -> Self {
        Self {
            ctx,
            dep,
            collection,
            range,
            out,
            registers,
            clear,
            docs: Vec::new(),
            doc_pos: 0,
            input: None,
            input_row: 0,
            done: false,
        }
    }

    fn load_snapshot(&mut self) {
        // Snapshot under the collection read lock so an in-flight write is
        // either fully visible or not at all.
        let _read = self.collection.begin_read();
        self.docs = match &self.range {
            Some((from, to)) => self.collection.range_by_key(from, to),
            None => self.collection.live_documents(),
        };
    }

    /// Pull the next input row, or report exhaustion. Without a dependency
    /// the scan acts over a single implicit empty row.
    fn advance_input(&mut self) -> Result<bool> {
        loop {
            if let Some(input) = &self.input {
                if self.input_row < input.rows() {
                    return Ok(true);
                }
                self.input = None;
            }
            match &mut self.dep {
                Some(dep) => match dep.get_some(1, DEFAULT_BATCH)? {
                    Some(block) => {
                        self.input = Some(block);
                        self.input_row = 0;
                        self.doc_pos = 0;
                    }
                    None => return Ok(false),
                },
                None => {
                    if self.done {
                        return Ok(false);
                    }
                    self.input = Some(ItemBlock::new(1, self.registers));
                    self.input_row = 0;
                    self.doc_pos = 0;
                }
            }
        }
    }

    fn step_row(&mut self) {
        self.input_row += 1;
        self.doc_pos = 0;
        if self
            .input
            .as_ref()
            .is_some_and(|b| self.input_row >= b.rows())
        {
            self.input = None;
            if self.dep.is_none() {
                self.done = true;
            }
        }
    }
}

impl ExecutionBlock for CollectionScanBlock {
    fn initialize(&mut self) -> Result<()> {
        if let Some(dep) = &mut self.dep {
            dep.initialize()?;
        }
        Ok(())
    }

    fn init_cursor(&mut self, input: Option<(&ItemBlock, usize)>) -> Result<()> {
        if let Some(dep) = &mut self.dep {
            dep.init_cursor(input)?;
        }
        self.load_snapshot();
        self.doc_pos = 0;
        self.input = None;
        self.input_row = 0;
        self.done = false;
        Ok(())
    }

    fn get_some(&mut self, at_least: usize, at_most: usize) -> Result<Option<ItemBlock>> {
        self.ctx.check_killed()?;
        if self.done && self.input.is_none() {
            return Ok(None);
        }
        // Collect (input row snapshot, marker) pairs, then materialize one
        // block of exactly that many rows.
        let mut picked: Vec<(ItemBlock, Arc<Marker>)> = Vec::new();
        while picked.len() < at_most {
            if !self.advance_input()? {
                self.done = true;
                break;
            }
            while picked.len() < at_most && self.doc_pos < self.docs.len() {
                let marker = Arc::clone(&self.docs[self.doc_pos]);
                let input = self.input.as_ref().unwrap_or_else(|| unreachable!());
                let mut row = ItemBlock::new(1, self.registers);
                row.copy_row(0, input, self.input_row);
                picked.push((row, marker));
                self.doc_pos += 1;
            }
            if self.doc_pos >= self.docs.len() {
                self.step_row();
            }
            if picked.len() >= at_least && self.input.is_none() {
                break;
            }
        }
        if picked.is_empty() {
            return Ok(None);
        }
        let mut block = ItemBlock::new(picked.len(), self.registers);
        block.set_owner(self.out, self.collection.cid());
        for (dst, (row, marker)) in picked.into_iter().enumerate() {
            block.copy_row(dst, &row, 0);
            block.set(
                dst,
                self.out,
                AqlValue::Shaped {
                    cid: self.collection.cid(),
                    marker,
                },
            );
        }
        block.clear_registers(&self.clear);
        Ok(Some(block))
    }

    fn skip_some(&mut self, _at_least: usize, at_most: usize) -> Result<usize> {
        self.ctx.check_killed()?;
        let mut skipped = 0;
        while skipped < at_most {
            if !self.advance_input()? {
                self.done = true;
                break;
            }
            let take = (self.docs.len() - self.doc_pos).min(at_most - skipped);
            self.doc_pos += take;
            skipped += take;
            if self.doc_pos >= self.docs.len() {
                self.step_row();
            }
        }
        Ok(skipped)
    }

    fn has_more(&mut self) -> bool {
        !(self.done && self.input.is_none())
    }

    fn remaining(&mut self) -> i64 {
        REMAINING_UNKNOWN
    }

    fn shutdown(&mut self) -> Result<()> {
        if let Some(dep) = &mut self.dep {
            dep.shutdown()?;
        }
        self.docs.clear();
        Ok(())
    }
}

/// Iterates a list-valued register, one output row per element. Handles
/// both plain JSON lists and DOCVEC values, the latter with bookkeeping
/// mapping the external index onto (sub-block, offset).
pub struct EnumerateListBlock {
    ctx: Arc<QueryContext>,
    dep: Box<dyn ExecutionBlock>,
    list: RegisterId,
    out: RegisterId,
    registers: usize,
    clear: Vec<RegisterId>,
    input: Option<ItemBlock>,
    input_row: usize,
    current: Option<ListSource>,
    list_pos: usize,
}

enum ListSource {
    Json(Arc<DocValue>),
    Docvec {
        blocks: Arc<Vec<ItemBlock>>,
        /// Cumulative row counts, one entry per sub-block.
        offsets: Vec<usize>,
        total: usize,
    },
}

impl ListSource {
    fn from_value(value: &AqlValue) -> Self {
        match value {
            AqlValue::Json(v) => Self::Json(Arc::clone(v)),
            AqlValue::Docvec(blocks) => {
                let mut offsets = Vec::with_capacity(blocks.len());
                let mut total = 0;
                for block in blocks.iter() {
                    offsets.push(total);
                    total += block.rows();
                }
                Self::Docvec {
                    blocks: Arc::clone(blocks),
                    offsets,
                    total,
                }
            }
            AqlValue::Shaped { .. } => Self::Json(Arc::new(DocValue::Null)),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Json(v) => match &**v {
                DocValue::List(items) => items.len(),
                _ => 0,
            },
            Self::Docvec { total, .. } => *total,
        }
    }

    fn element(&self, index: usize) -> AqlValue {
        match self {
            Self::Json(v) => match &**v {
                DocValue::List(items) => AqlValue::json(items[index].clone()),
                _ => AqlValue::json(DocValue::Null),
            },
            Self::Docvec { blocks, offsets, .. } => {
                let slot = offsets.partition_point(|&o| o <= index) - 1;
                let row = index - offsets[slot];
                blocks[slot]
                    .get(row, 0)
                    .cloned()
                    .unwrap_or_else(|| AqlValue::json(DocValue::Null))
            }
        }
    }
}

impl EnumerateListBlock {
    pub fn new(
        ctx: Arc<QueryContext>,
        dep: Box<dyn ExecutionBlock>,
        list: RegisterId,
        out: RegisterId,
        registers: usize,
        clear: Vec<RegisterId>,
    ) -> Self {
        Self {
            ctx,
            dep,
            list,
            out,
            registers,
            clear,
            input: None,
            input_row: 0,
            current: None,
            list_pos: 0,
        }
    }

    fn advance(&mut self) -> Result<bool> {
        loop {
            if let Some(source) = &self.current {
                if self.list_pos < source.len() {
                    return Ok(true);
                }
                self.current = None;
                self.input_row += 1;
            }
            let need_block = !self
                .input
                .as_ref()
                .is_some_and(|b| self.input_row < b.rows());
            if need_block {
                match self.dep.get_some(1, DEFAULT_BATCH)? {
                    Some(block) => {
                        self.input = Some(block);
                        self.input_row = 0;
                    }
                    None => return Ok(false),
                }
            }
            let input = self.input.as_ref().unwrap_or_else(|| unreachable!());
            self.current = Some(match input.get(self.input_row, self.list) {
                Some(value) => ListSource::from_value(value),
                None => ListSource::Json(Arc::new(DocValue::Null)),
            });
            self.list_pos = 0;
        }
    }
}

impl ExecutionBlock for EnumerateListBlock {
    fn initialize(&mut self) -> Result<()> {
        self.dep.initialize()
    }

    fn init_cursor(&mut self, input: Option<(&ItemBlock, usize)>) -> Result<()> {
        self.dep.init_cursor(input)?;
        self.input = None;
        self.input_row = 0;
        self.current = None;
        self.list_pos = 0;
        Ok(())
    }

    fn get_some(&mut self, at_least: usize, at_most: usize) -> Result<Option<ItemBlock>> {
        self.ctx.check_killed()?;
        let mut picked: Vec<(ItemBlock, AqlValue)> = Vec::new();
        while picked.len() < at_most {
            if !self.advance()? {
                break;
            }
            let source = self.current.as_ref().unwrap_or_else(|| unreachable!());
            let input = self.input.as_ref().unwrap_or_else(|| unreachable!());
            while picked.len() < at_most && self.list_pos < source.len() {
                let mut row = ItemBlock::new(1, self.registers);
                row.copy_row(0, input, self.input_row);
                picked.push((row, source.element(self.list_pos)));
                self.list_pos += 1;
            }
            if picked.len() >= at_least {
                break;
            }
        }
        if picked.is_empty() {
            return Ok(None);
        }
        let mut block = ItemBlock::new(picked.len(), self.registers);
        for (dst, (row, value)) in picked.into_iter().enumerate() {
            block.copy_row(dst, &row, 0);
            block.set(dst, self.out, value);
        }
        block.clear_registers(&self.clear);
        Ok(Some(block))
    }

    fn skip_some(&mut self, _at_least: usize, at_most: usize) -> Result<usize> {
        self.ctx.check_killed()?;
        let mut skipped = 0;
        while skipped < at_most {
            if !self.advance()? {
                break;
            }
            let len = self.current.as_ref().map_or(0, ListSource::len);
            let take = (len - self.list_pos).min(at_most - skipped);
            self.list_pos += take;
            skipped += take;
        }
        Ok(skipped)
    }

    fn has_more(&mut self) -> bool {
        self.current.is_some() || self.dep.has_more()
    }

    fn remaining(&mut self) -> i64 {
        REMAINING_UNKNOWN
    }

    fn shutdown(&mut self) -> Result<()> {
        self.dep.shutdown()
    }
}

/// Always exhausted.
pub struct NoResultsBlock;

impl NoResultsBlock {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl ExecutionBlock for NoResultsBlock {
    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    fn init_cursor(&mut self, _input: Option<(&ItemBlock, usize)>) -> Result<()> {
        Ok(())
    }

    fn get_some(&mut self, _at_least: usize, _at_most: usize) -> Result<Option<ItemBlock>> {
        Ok(None)
    }

    fn skip_some(&mut self, _at_least: usize, _at_most: usize) -> Result<usize> {
        Ok(0)
    }

    fn has_more(&mut self) -> bool {
        false
    }

    fn remaining(&mut self) -> i64 {
        0
    }
}
