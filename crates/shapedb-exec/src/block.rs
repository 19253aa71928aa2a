//! Item blocks: rows x registers batches passed between operators.
//!
//! Cells own their values through [`AqlValue`] (shared immutable payloads
//! behind `Arc`), so there is no separate count table: a value's resources
//! are released when the last cell holding it is erased or dropped. Moving
//! rows out of a block (`steal_chosen`) leaves the source cells empty, the
//! move itself guaranteeing the value is never released twice.

use shapedb_error::{Result, ShapeDbError};
use shapedb_types::CollectionId;

use crate::value::AqlValue;

/// Index of a register (plan variable slot) within a block.
pub type RegisterId = usize;

#[derive(Debug, Clone)]
pub struct ItemBlock {
    rows: usize,
    registers: usize,
    /// Row-major, `rows * registers` entries. `None` is the empty cell.
    cells: Vec<Option<AqlValue>>,
    /// Per-register owning collection, set once by the producing operator.
    owners: Vec<Option<CollectionId>>,
}

impl ItemBlock {
    /// A block with every cell empty.
    #[must_use]
    pub fn new(rows: usize, registers: usize) -> Self {
        Self {
            rows,
            registers,
            cells: vec![None; rows * registers],
            owners: vec![None; registers],
        }
    }

    #[must_use]
    pub const fn rows(&self) -> usize {
        self.rows
    }

    #[must_use]
    pub const fn registers(&self) -> usize {
        self.registers
    }

    #[inline]
    fn index(&self, row: usize, reg: RegisterId) -> usize {
        assert!(row < self.rows, "row {row} out of bounds ({})", self.rows);
        assert!(
            reg < self.registers,
            "register {reg} out of bounds ({})",
            self.registers
        );
        row * self.registers + reg
    }

    #[must_use]
    pub fn get(&self, row: usize, reg: RegisterId) -> Option<&AqlValue> {
        self.cells[self.index(row, reg)].as_ref()
    }

    /// Write a value into an empty cell. Cells are write-once: replacing a
    /// value requires an explicit [`Self::erase`] first.
    pub fn set(&mut self, row: usize, reg: RegisterId, value: AqlValue) {
        let idx = self.index(row, reg);
        assert!(
            self.cells[idx].is_none(),
            "cell ({row}, {reg}) already occupied"
        );
        self.cells[idx] = Some(value);
    }

    /// Empty one cell, releasing the value if this was its last holder.
    pub fn erase(&mut self, row: usize, reg: RegisterId) {
        let idx = self.index(row, reg);
        self.cells[idx] = None;
    }

    pub fn erase_all(&mut self) {
        self.cells.iter_mut().for_each(|c| *c = None);
    }

    /// Empty the given registers in every row. Used for the dead-register
    /// clearout after an operator has produced its output.
    pub fn clear_registers(&mut self, regs: &[RegisterId]) {
        for row in 0..self.rows {
            for &reg in regs {
                self.erase(row, reg);
            }
        }
    }

    /// Truncate to the first `n` rows.
    pub fn shrink(&mut self, n: usize) {
        assert!(n <= self.rows, "cannot grow a block via shrink");
        self.rows = n;
        self.cells.truncate(n * self.registers);
    }

    pub fn set_owner(&mut self, reg: RegisterId, cid: CollectionId) {
        assert!(reg < self.registers);
        self.owners[reg] = Some(cid);
    }

    #[must_use]
    pub fn owner(&self, reg: RegisterId) -> Option<CollectionId> {
        self.owners.get(reg).copied().flatten()
    }

    /// Copy every register of `src_row` in `src` into `dst_row` here. The
    /// destination cells must be empty; owners merge from the source.
    pub fn copy_row(&mut self, dst_row: usize, src: &ItemBlock, src_row: usize) {
        assert_eq!(self.registers, src.registers, "register count mismatch");
        for reg in 0..self.registers {
            if let Some(value) = src.get(src_row, reg) {
                self.set(dst_row, reg, value.clone());
            }
        }
        for reg in 0..self.registers {
            if let Some(cid) = src.owners[reg] {
                self.owners[reg] = Some(cid);
            }
        }
    }

    /// Copy rows `[from, to)` into a new independent block.
    #[must_use]
    pub fn slice(&self, from: usize, to: usize) -> ItemBlock {
        assert!(from <= to && to <= self.rows);
        let mut out = ItemBlock::new(to - from, self.registers);
        out.owners = self.owners.clone();
        for (dst, src) in (from..to).enumerate() {
            for reg in 0..self.registers {
                if let Some(value) = self.get(src, reg) {
                    out.set(dst, reg, value.clone());
                }
            }
        }
        out
    }

    /// Copy the chosen rows (indices within `[from, to)` of the `chosen`
    /// list) into a new block.
    #[must_use]
    pub fn slice_chosen(&self, chosen: &[usize], from: usize, to: usize) -> ItemBlock {
        assert!(from <= to && to <= chosen.len());
        let mut out = ItemBlock::new(to - from, self.registers);
        out.owners = self.owners.clone();
        for (dst, &src) in chosen[from..to].iter().enumerate() {
            for reg in 0..self.registers {
                if let Some(value) = self.get(src, reg) {
                    out.set(dst, reg, value.clone());
                }
            }
        }
        out
    }

    /// Move the chosen rows out into a new block. The source cells become
    /// empty; ownership transfers, so nothing is released twice.
    #[must_use]
    pub fn steal_chosen(&mut self, chosen: &[usize], from: usize, to: usize) -> ItemBlock {
        assert!(from <= to && to <= chosen.len());
        let mut out = ItemBlock::new(to - from, self.registers);
        out.owners = self.owners.clone();
        for (dst, &src) in chosen[from..to].iter().enumerate() {
            for reg in 0..self.registers {
                let idx = self.index(src, reg);
                if let Some(value) = self.cells[idx].take() {
                    out.set(dst, reg, value);
                }
            }
        }
        out
    }

    /// Stack multiple blocks into one, transferring ownership of every cell.
    /// All inputs must share one register count.
    pub fn concatenate(blocks: Vec<ItemBlock>) -> Result<ItemBlock> {
        let registers = blocks.first().map_or(0, ItemBlock::registers);
        let rows = blocks.iter().map(ItemBlock::rows).sum();
        let mut out = ItemBlock::new(rows, registers);
        let mut dst = 0;
        for mut block in blocks {
            if block.registers != registers {
                return Err(ShapeDbError::RegisterMismatch {
                    expected: registers,
                    actual: block.registers,
                });
            }
            for reg in 0..registers {
                if let Some(cid) = block.owners[reg] {
                    out.owners[reg] = Some(cid);
                }
            }
            for src in 0..block.rows {
                for reg in 0..registers {
                    let idx = src * registers + reg;
                    if let Some(value) = block.cells[idx].take() {
                        out.set(dst, reg, value);
                    }
                }
                dst += 1;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use shapedb_types::DocValue;
    use std::sync::Arc;

    fn v(n: f64) -> AqlValue {
        AqlValue::json(DocValue::Number(n))
    }

    #[test]
    fn set_get_erase() {
        let mut block = ItemBlock::new(2, 3);
        assert!(block.get(0, 0).is_none());
        block.set(0, 1, v(7.0));
        assert!(block.get(0, 1).is_some());
        block.erase(0, 1);
        assert!(block.get(0, 1).is_none());
    }

    #[test]
    #[should_panic(expected = "already occupied")]
    fn cells_are_write_once() {
        let mut block = ItemBlock::new(1, 1);
        block.set(0, 0, v(1.0));
        block.set(0, 0, v(2.0));
    }

    #[test]
    fn last_holder_releases_the_value() {
        let payload = Arc::new(DocValue::Number(1.0));
        let mut block = ItemBlock::new(1, 2);
        block.set(0, 0, AqlValue::Json(Arc::clone(&payload)));
        block.set(0, 1, AqlValue::Json(Arc::clone(&payload)));
        assert_eq!(Arc::strong_count(&payload), 3);
        block.erase(0, 0);
        assert_eq!(Arc::strong_count(&payload), 2);
        block.erase_all();
        assert_eq!(Arc::strong_count(&payload), 1);
    }

    #[test]
    fn slice_is_independent_of_the_source() {
        let payload = Arc::new(DocValue::Number(1.0));
        let mut block = ItemBlock::new(3, 1);
        block.set(1, 0, AqlValue::Json(Arc::clone(&payload)));
        let mut sliced = block.slice(1, 2);
        assert_eq!(sliced.rows(), 1);
        assert!(sliced.get(0, 0).is_some());

        sliced.erase(0, 0);
        sliced.set(0, 0, v(9.0));
        assert!(block.get(1, 0).is_some(), "source cell untouched");
        assert_eq!(Arc::strong_count(&payload), 2);
    }

    #[test]
    fn steal_empties_the_source_cells() {
        let payload = Arc::new(DocValue::Number(1.0));
        let mut block = ItemBlock::new(3, 1);
        for row in 0..3 {
            block.set(row, 0, AqlValue::Json(Arc::clone(&payload)));
        }
        let chosen = vec![0, 2];
        let stolen = block.steal_chosen(&chosen, 0, 2);
        assert_eq!(stolen.rows(), 2);
        assert!(block.get(0, 0).is_none());
        assert!(block.get(1, 0).is_some());
        assert!(block.get(2, 0).is_none());
        // one holder per live cell, one for the local binding
        assert_eq!(Arc::strong_count(&payload), 4);
    }

    #[test]
    fn concatenate_transfers_ownership() {
        let mut a = ItemBlock::new(1, 2);
        a.set(0, 0, v(1.0));
        let mut b = ItemBlock::new(2, 2);
        b.set(1, 1, v(2.0));
        let joined = ItemBlock::concatenate(vec![a, b]).unwrap();
        assert_eq!(joined.rows(), 3);
        assert!(joined.get(0, 0).is_some());
        assert!(joined.get(2, 1).is_some());
        assert!(joined.get(1, 0).is_none());
    }

    #[test]
    fn concatenate_rejects_register_mismatch() {
        let a = ItemBlock::new(1, 2);
        let b = ItemBlock::new(1, 3);
        let err = ItemBlock::concatenate(vec![a, b]).unwrap_err();
        assert!(matches!(err, ShapeDbError::RegisterMismatch { .. }));
    }

    #[test]
    fn shrink_truncates_rows() {
        let mut block = ItemBlock::new(4, 1);
        for row in 0..4 {
            block.set(row, 0, v(row as f64));
        }
        block.shrink(2);
        assert_eq!(block.rows(), 2);
    }

    proptest! {
        // Slicing a block at arbitrary cut points and concatenating the
        // pieces conserves every row and value.
        #[test]
        fn slice_then_concatenate_conserves_rows(
            rows in 1usize..40,
            cuts in proptest::collection::vec(0usize..40, 0..4),
        ) {
            let mut block = ItemBlock::new(rows, 2);
            for row in 0..rows {
                block.set(row, 0, v(row as f64));
            }
            let mut points: Vec<usize> = cuts.into_iter().map(|c| c % rows).collect();
            points.push(0);
            points.push(rows);
            points.sort_unstable();
            points.dedup();
            let pieces: Vec<ItemBlock> = points
                .windows(2)
                .map(|w| block.slice(w[0], w[1]))
                .collect();
            let rebuilt = ItemBlock::concatenate(pieces).unwrap();
            prop_assert_eq!(rebuilt.rows(), rows);
            for row in 0..rows {
                match rebuilt.get(row, 0) {
                    Some(AqlValue::Json(value)) => {
                        prop_assert_eq!(value.as_ref(), &DocValue::Number(row as f64));
                    }
                    other => prop_assert!(false, "row {} holds {:?}", row, other),
                }
            }
        }
    }
}
