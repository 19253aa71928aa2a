//! Row-level scalar expressions, evaluated by the calculation operator.
//!
//! Expressions come pre-resolved from the planner: variables are register
//! indices, not names. A bare register reference is detected up front so
//! the calculation operator can copy the cell without materializing it.

use std::cmp::Ordering;

use shapedb_error::Result;
use shapedb_store::DocumentStore;
use shapedb_types::DocValue;

use crate::block::{ItemBlock, RegisterId};
use crate::value::{compare_doc_values, AqlValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Constant(DocValue),
    Reference(RegisterId),
    /// Attribute access on the base value, with dotted paths flattened.
    Attribute { base: Box<Expr>, path: String },
    Index { base: Box<Expr>, index: Box<Expr> },
    List(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

impl Expr {
    /// Shorthand for `Reference(reg).path`.
    #[must_use]
    pub fn attribute(reg: RegisterId, path: &str) -> Self {
        Self::Attribute {
            base: Box::new(Self::Reference(reg)),
            path: path.to_owned(),
        }
    }

    #[must_use]
    pub fn binary(op: BinOp, left: Expr, right: Expr) -> Self {
        Self::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// The register this expression is a bare reference to, if any.
    #[must_use]
    pub const fn as_reference(&self) -> Option<RegisterId> {
        match self {
            Self::Reference(reg) => Some(*reg),
            _ => None,
        }
    }

    /// Collect every register this expression reads.
    pub fn referenced_registers(&self, out: &mut Vec<RegisterId>) {
        match self {
            Self::Constant(_) => {}
            Self::Reference(reg) => out.push(*reg),
            Self::Attribute { base, .. } | Self::Not(base) | Self::Neg(base) => {
                base.referenced_registers(out);
            }
            Self::Index { base, index } => {
                base.referenced_registers(out);
                index.referenced_registers(out);
            }
            Self::List(items) => {
                for item in items {
                    item.referenced_registers(out);
                }
            }
            Self::Object(attrs) => {
                for (_, value) in attrs {
                    value.referenced_registers(out);
                }
            }
            Self::Binary { left, right, .. } => {
                left.referenced_registers(out);
                right.referenced_registers(out);
            }
        }
    }

    /// Evaluate against one row. An empty referenced cell reads as null;
    /// arithmetic on non-numbers yields null rather than an error.
    pub fn evaluate(
        &self,
        block: &ItemBlock,
        row: usize,
        store: &DocumentStore,
    ) -> Result<DocValue> {
        match self {
            Self::Constant(value) => Ok(value.clone()),
            Self::Reference(reg) => match block.get(row, *reg) {
                Some(cell) => cell.materialize(store),
                None => Ok(DocValue::Null),
            },
            Self::Attribute { base, path } => {
                let base = base.evaluate(block, row, store)?;
                Ok(base.get_path(path).cloned().unwrap_or(DocValue::Null))
            }
            Self::Index { base, index } => {
                let base = base.evaluate(block, row, store)?;
                let index = index.evaluate(block, row, store)?;
                let value = match index {
                    DocValue::Number(n) if n >= 0.0 => base.at(n as usize).cloned(),
                    DocValue::String(name) => base.get(&name).cloned(),
                    _ => None,
                };
                Ok(value.unwrap_or(DocValue::Null))
            }
            Self::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(item.evaluate(block, row, store)?);
                }
                Ok(DocValue::List(out))
            }
            Self::Object(attrs) => {
                let mut out = Vec::with_capacity(attrs.len());
                for (name, value) in attrs {
                    out.push((name.clone(), value.evaluate(block, row, store)?));
                }
                Ok(DocValue::Object(out))
            }
            Self::Not(operand) => {
                let value = operand.evaluate(block, row, store)?;
                Ok(DocValue::Bool(!value.is_true()))
            }
            Self::Neg(operand) => {
                let value = operand.evaluate(block, row, store)?;
                Ok(value
                    .as_number()
                    .map_or(DocValue::Null, |n| DocValue::Number(-n)))
            }
            Self::Binary { op, left, right } => {
                // Logical operators short-circuit on the left operand.
                if *op == BinOp::And {
                    let l = left.evaluate(block, row, store)?;
                    if !l.is_true() {
                        return Ok(DocValue::Bool(false));
                    }
                    let r = right.evaluate(block, row, store)?;
                    return Ok(DocValue::Bool(r.is_true()));
                }
                if *op == BinOp::Or {
                    let l = left.evaluate(block, row, store)?;
                    if l.is_true() {
                        return Ok(DocValue::Bool(true));
                    }
                    let r = right.evaluate(block, row, store)?;
                    return Ok(DocValue::Bool(r.is_true()));
                }
                let l = left.evaluate(block, row, store)?;
                let r = right.evaluate(block, row, store)?;
                Ok(apply_binary(*op, &l, &r))
            }
        }
    }
}

fn apply_binary(op: BinOp, left: &DocValue, right: &DocValue) -> DocValue {
    match op {
        BinOp::Eq => DocValue::Bool(compare_doc_values(left, right) == Ordering::Equal),
        BinOp::Ne => DocValue::Bool(compare_doc_values(left, right) != Ordering::Equal),
        BinOp::Lt => DocValue::Bool(compare_doc_values(left, right) == Ordering::Less),
        BinOp::Le => DocValue::Bool(compare_doc_values(left, right) != Ordering::Greater),
        BinOp::Gt => DocValue::Bool(compare_doc_values(left, right) == Ordering::Greater),
        BinOp::Ge => DocValue::Bool(compare_doc_values(left, right) != Ordering::Less),
        BinOp::And | BinOp::Or => unreachable!("short-circuited above"),
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
            let (Some(a), Some(b)) = (left.as_number(), right.as_number()) else {
                return DocValue::Null;
            };
            let result = match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div | BinOp::Mod if b == 0.0 => return DocValue::Null,
                BinOp::Div => a / b,
                BinOp::Mod => a % b,
                _ => unreachable!(),
            };
            DocValue::Number(result)
        }
    }
}

/// Evaluate an expression row into a register value, using the reference
/// fast path when precomputed.
pub(crate) fn evaluate_into(
    expr: &Expr,
    reference: Option<RegisterId>,
    block: &ItemBlock,
    row: usize,
    store: &DocumentStore,
) -> Result<AqlValue> {
    if let Some(reg) = reference {
        return Ok(block
            .get(row, reg)
            .cloned()
            .unwrap_or_else(|| AqlValue::json(DocValue::Null)));
    }
    Ok(AqlValue::json(expr.evaluate(block, row, store)?))
}
