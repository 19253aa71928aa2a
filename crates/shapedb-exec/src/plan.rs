//! Physical plan descriptors and static analysis.
//!
//! The planner (out of scope here) hands over a tree of operator
//! descriptors with variables already resolved to register indices. Before
//! instantiation we run one analysis pass that sizes the register file and
//! computes, per operator, which registers are dead after it executes; the
//! operator nulls those out so downstream blocks do not retain needless
//! references.

use std::collections::HashSet;
use std::sync::Arc;

use shapedb_error::{Result, ShapeDbError};
use shapedb_types::DocValue;

use crate::block::RegisterId;
use crate::engine::{ExecutionBlock, QueryContext};
use crate::expr::Expr;
use crate::modify::{ModOp, ModificationBlock};
use crate::scan::{CollectionScanBlock, EnumerateListBlock, NoResultsBlock, SingletonBlock};
use crate::sort::{AggregateBlock, CollectInto, GroupRegister, SortBlock};
use crate::subquery::SubqueryBlock;
use crate::transform::{CalculationBlock, FilterBlock, LimitBlock, ReturnBlock};

/// One sort key: a register and its direction.
#[derive(Debug, Clone, Copy)]
pub struct SortCriterion {
    pub reg: RegisterId,
    pub ascending: bool,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Exactly one empty row; the root of plans without an enumeration.
    Singleton,
    EnumerateCollection {
        collection: String,
        out: RegisterId,
    },
    /// Primary-index range scan over `[from_key, to_key]` inclusive.
    IndexRange {
        collection: String,
        from_key: String,
        to_key: String,
        out: RegisterId,
    },
    EnumerateList {
        list: RegisterId,
        out: RegisterId,
    },
    Calculation {
        expr: Expr,
        out: RegisterId,
    },
    Filter {
        condition: RegisterId,
    },
    Aggregate {
        /// `(input register, output register)` per group key.
        groups: Vec<(RegisterId, RegisterId)>,
        /// Collect the values of a source register into a list per group.
        into: Option<(RegisterId, RegisterId)>,
    },
    Sort {
        criteria: Vec<SortCriterion>,
        stable: bool,
    },
    Limit {
        offset: usize,
        limit: usize,
    },
    Return {
        reg: RegisterId,
    },
    Insert {
        collection: String,
        reg: RegisterId,
        ignore_errors: bool,
    },
    Update {
        collection: String,
        reg: RegisterId,
        ignore_errors: bool,
    },
    Replace {
        collection: String,
        reg: RegisterId,
        ignore_errors: bool,
    },
    Remove {
        collection: String,
        reg: RegisterId,
        ignore_errors: bool,
    },
    Subquery {
        subplan: Box<PlanNode>,
        out: RegisterId,
    },
    /// Always exhausted; short-circuits statically unsatisfiable plans.
    NoResults,
}

#[derive(Debug, Clone)]
pub struct PlanNode {
    pub kind: NodeKind,
    pub dependency: Option<Box<PlanNode>>,
}

impl PlanNode {
    #[must_use]
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            dependency: None,
        }
    }

    /// Chain: `self` becomes the dependency of a new node of `kind`.
    #[must_use]
    pub fn then(self, kind: NodeKind) -> Self {
        Self {
            kind,
            dependency: Some(Box::new(self)),
        }
    }

    /// Shorthand for a constant-expression calculation.
    #[must_use]
    pub fn constant(value: DocValue, out: RegisterId) -> NodeKind {
        NodeKind::Calculation {
            expr: Expr::Constant(value),
            out,
        }
    }
}

fn flatten<'a>(node: &'a PlanNode, out: &mut Vec<&'a PlanNode>) {
    if let Some(dep) = &node.dependency {
        flatten(dep, out);
    }
    out.push(node);
}

/// Registers this node writes.
fn node_outputs(kind: &NodeKind, out: &mut Vec<RegisterId>) {
    match kind {
        NodeKind::EnumerateCollection { out: reg, .. }
        | NodeKind::IndexRange { out: reg, .. }
        | NodeKind::EnumerateList { out: reg, .. }
        | NodeKind::Calculation { out: reg, .. }
        | NodeKind::Subquery { out: reg, .. } => out.push(*reg),
        NodeKind::Aggregate { groups, into } => {
            out.extend(groups.iter().map(|(_, o)| *o));
            if let Some((_, reg)) = into {
                out.push(*reg);
            }
        }
        NodeKind::Return { .. }
        | NodeKind::Singleton
        | NodeKind::Filter { .. }
        | NodeKind::Sort { .. }
        | NodeKind::Limit { .. }
        | NodeKind::Insert { .. }
        | NodeKind::Update { .. }
        | NodeKind::Replace { .. }
        | NodeKind::Remove { .. }
        | NodeKind::NoResults => {}
    }
}

/// Registers this node reads, including everything a subquery body reads.
fn node_uses(node: &PlanNode, out: &mut Vec<RegisterId>) {
    match &node.kind {
        NodeKind::EnumerateList { list, .. } => out.push(*list),
        NodeKind::Calculation { expr, .. } => expr.referenced_registers(out),
        NodeKind::Filter { condition } => out.push(*condition),
        NodeKind::Aggregate { groups, into } => {
            out.extend(groups.iter().map(|(i, _)| *i));
            if let Some((source, _)) = into {
                out.push(*source);
            }
        }
        NodeKind::Sort { criteria, .. } => out.extend(criteria.iter().map(|c| c.reg)),
        NodeKind::Return { reg }
        | NodeKind::Insert { reg, .. }
        | NodeKind::Update { reg, .. }
        | NodeKind::Replace { reg, .. }
        | NodeKind::Remove { reg, .. } => out.push(*reg),
        NodeKind::Subquery { subplan, .. } => {
            let mut chain = Vec::new();
            flatten(subplan, &mut chain);
            for sub in chain {
                node_uses(sub, out);
            }
        }
        NodeKind::Singleton
        | NodeKind::EnumerateCollection { .. }
        | NodeKind::IndexRange { .. }
        | NodeKind::Limit { .. }
        | NodeKind::NoResults => {}
    }
}

fn max_register(node: &PlanNode) -> usize {
    let mut chain = Vec::new();
    flatten(node, &mut chain);
    let mut regs = Vec::new();
    for n in &chain {
        node_outputs(&n.kind, &mut regs);
        node_uses(n, &mut regs);
        if let NodeKind::Subquery { subplan, .. } = &n.kind {
            regs.push(max_register(subplan));
        }
    }
    regs.into_iter().max().unwrap_or(0)
}

/// Per-node dead-register lists for one chain. `protected` registers (the
/// outer scope of a subquery body) are never cleared.
fn clear_lists(chain: &[&PlanNode], protected: &HashSet<RegisterId>) -> Vec<Vec<RegisterId>> {
    let mut last_use: Vec<(RegisterId, usize)> = Vec::new();
    let mut note = |reg: RegisterId, at: usize, last_use: &mut Vec<(RegisterId, usize)>| {
        match last_use.iter_mut().find(|(r, _)| *r == reg) {
            Some((_, pos)) => *pos = (*pos).max(at),
            None => last_use.push((reg, at)),
        }
    };
    for (i, node) in chain.iter().enumerate() {
        let mut regs = Vec::new();
        node_outputs(&node.kind, &mut regs);
        node_uses(node, &mut regs);
        for reg in regs {
            note(reg, i, &mut last_use);
        }
    }
    let top = chain.len().saturating_sub(1);
    let mut lists = vec![Vec::new(); chain.len()];
    for (reg, at) in last_use {
        if at < top && !protected.contains(&reg) {
            lists[at].push(reg);
        }
    }
    lists
}

/// Build the runtime operator tree for `root`.
pub(crate) fn instantiate(
    root: &PlanNode,
    ctx: &Arc<QueryContext>,
) -> Result<Box<dyn ExecutionBlock>> {
    let register_count = max_register(root) + 1;
    build_chain(root, ctx, register_count, &HashSet::new())
}

fn build_chain(
    root: &PlanNode,
    ctx: &Arc<QueryContext>,
    register_count: usize,
    protected: &HashSet<RegisterId>,
) -> Result<Box<dyn ExecutionBlock>> {
    let mut chain = Vec::new();
    flatten(root, &mut chain);
    let clears = clear_lists(&chain, protected);

    let mut current: Option<Box<dyn ExecutionBlock>> = None;
    for (node, clear) in chain.iter().zip(clears) {
        current = Some(build_node(node, current, ctx, register_count, clear, protected)?);
    }
    current.ok_or_else(|| ShapeDbError::invalid_state("empty plan"))
}

fn require_dep(
    dep: Option<Box<dyn ExecutionBlock>>,
    what: &str,
) -> Result<Box<dyn ExecutionBlock>> {
    dep.ok_or_else(|| ShapeDbError::invalid_state(format!("{what} operator needs a dependency")))
}

fn build_node(
    node: &PlanNode,
    dep: Option<Box<dyn ExecutionBlock>>,
    ctx: &Arc<QueryContext>,
    register_count: usize,
    clear: Vec<RegisterId>,
    protected: &HashSet<RegisterId>,
) -> Result<Box<dyn ExecutionBlock>> {
    let lookup = |name: &str| {
        ctx.store()
            .collection(name)
            .ok_or_else(|| ShapeDbError::collection_not_found(name))
    };
    Ok(match &node.kind {
        NodeKind::Singleton => Box::new(SingletonBlock::new(
            Arc::clone(ctx),
            register_count,
            clear,
        )),
        NodeKind::EnumerateCollection { collection, out } => Box::new(CollectionScanBlock::new(
            Arc::clone(ctx),
            dep,
            lookup(collection)?,
            None,
            *out,
            register_count,
            clear,
        )),
        NodeKind::IndexRange {
            collection,
            from_key,
            to_key,
            out,
        } => Box::new(CollectionScanBlock::new(
            Arc::clone(ctx),
            dep,
            lookup(collection)?,
            Some((from_key.clone(), to_key.clone())),
            *out,
            register_count,
            clear,
        )),
        NodeKind::EnumerateList { list, out } => Box::new(EnumerateListBlock::new(
            Arc::clone(ctx),
            require_dep(dep, "enumerate-list")?,
            *list,
            *out,
            register_count,
            clear,
        )),
        NodeKind::Calculation { expr, out } => Box::new(CalculationBlock::new(
            Arc::clone(ctx),
            require_dep(dep, "calculation")?,
            expr.clone(),
            *out,
            clear,
        )),
        NodeKind::Filter { condition } => Box::new(FilterBlock::new(
            Arc::clone(ctx),
            require_dep(dep, "filter")?,
            *condition,
            clear,
        )),
        NodeKind::Aggregate { groups, into } => Box::new(AggregateBlock::new(
            Arc::clone(ctx),
            require_dep(dep, "aggregate")?,
            groups
                .iter()
                .map(|&(in_reg, out_reg)| GroupRegister { in_reg, out_reg })
                .collect(),
            into.map(|(source, out)| CollectInto { source, out }),
            register_count,
            clear,
        )),
        NodeKind::Sort { criteria, stable } => Box::new(SortBlock::new(
            Arc::clone(ctx),
            require_dep(dep, "sort")?,
            criteria.clone(),
            *stable,
            clear,
        )),
        NodeKind::Limit { offset, limit } => Box::new(LimitBlock::new(
            Arc::clone(ctx),
            require_dep(dep, "limit")?,
            *offset,
            *limit,
            clear,
        )),
        NodeKind::Return { reg } => Box::new(ReturnBlock::new(
            Arc::clone(ctx),
            require_dep(dep, "return")?,
            *reg,
        )),
        NodeKind::Insert {
            collection,
            reg,
            ignore_errors,
        } => Box::new(ModificationBlock::new(
            Arc::clone(ctx),
            require_dep(dep, "insert")?,
            lookup(collection)?,
            ModOp::Insert,
            *reg,
            *ignore_errors,
        )),
        NodeKind::Update {
            collection,
            reg,
            ignore_errors,
        } => Box::new(ModificationBlock::new(
            Arc::clone(ctx),
            require_dep(dep, "update")?,
            lookup(collection)?,
            ModOp::Update,
            *reg,
            *ignore_errors,
        )),
        NodeKind::Replace {
            collection,
            reg,
            ignore_errors,
        } => Box::new(ModificationBlock::new(
            Arc::clone(ctx),
            require_dep(dep, "replace")?,
            lookup(collection)?,
            ModOp::Replace,
            *reg,
            *ignore_errors,
        )),
        NodeKind::Remove {
            collection,
            reg,
            ignore_errors,
        } => Box::new(ModificationBlock::new(
            Arc::clone(ctx),
            require_dep(dep, "remove")?,
            lookup(collection)?,
            ModOp::Remove,
            *reg,
            *ignore_errors,
        )),
        NodeKind::Subquery { subplan, out } => {
            // The body must not clear registers the outer chain still
            // needs; protect everything visible from outside.
            let mut outer: HashSet<RegisterId> = protected.clone();
            outer.extend(0..register_count);
            let mut inner_protected = outer;
            let mut sub_outputs = Vec::new();
            let mut sub_chain = Vec::new();
            flatten(subplan, &mut sub_chain);
            for sub in &sub_chain {
                node_outputs(&sub.kind, &mut sub_outputs);
            }
            for reg in sub_outputs {
                inner_protected.remove(&reg);
            }
            let sub = build_chain(subplan, ctx, register_count, &inner_protected)?;
            Box::new(SubqueryBlock::new(
                Arc::clone(ctx),
                require_dep(dep, "subquery")?,
                sub,
                *out,
                clear,
            ))
        }
        NodeKind::NoResults => Box::new(NoResultsBlock::new()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::BinOp;

    #[test]
    fn register_sizing_covers_subplans() {
        let sub = PlanNode::new(NodeKind::Singleton)
            .then(NodeKind::Calculation {
                expr: Expr::Reference(5),
                out: 6,
            })
            .then(NodeKind::Return { reg: 6 });
        let plan = PlanNode::new(NodeKind::Singleton)
            .then(PlanNode::constant(DocValue::Number(1.0), 0))
            .then(NodeKind::Subquery {
                subplan: Box::new(sub),
                out: 1,
            })
            .then(NodeKind::Return { reg: 1 });
        assert_eq!(max_register(&plan), 6);
    }

    #[test]
    fn clear_lists_drop_registers_after_last_use() {
        let plan = PlanNode::new(NodeKind::Singleton)
            .then(PlanNode::constant(DocValue::Number(2.0), 0))
            .then(NodeKind::Calculation {
                expr: Expr::binary(
                    BinOp::Gt,
                    Expr::Reference(0),
                    Expr::Constant(DocValue::Number(1.0)),
                ),
                out: 1,
            })
            .then(NodeKind::Filter { condition: 1 })
            .then(NodeKind::Return { reg: 0 });
        let mut chain = Vec::new();
        flatten(&plan, &mut chain);
        let lists = clear_lists(&chain, &HashSet::new());
        // register 1 (the condition) dies at the filter, register 0 only
        // at the return.
        assert_eq!(lists[3], vec![1]);
        assert!(lists[4].is_empty());
        assert!(lists[1].is_empty());
    }
}
