// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! The plan-node operator framework. Every operator implements the iterator
//! contract `prepare / open / get_next / close`; blocking operators consume
//! their input in `open`. Operators exchange data exclusively as row
//! batches.

pub mod aggregation_node;
pub mod analytic_node;
pub mod data_sink;
pub mod exchange_node;
pub mod hash_join_node;
pub mod merge_join_node;
pub mod scan_node;
pub mod select_node;
pub mod sort_node;
pub mod topn_node;
pub mod union_node;

use std::collections::VecDeque;

use crate::common::status::{Result, Status};
use crate::exprs::{eval_conjuncts, Expr};
use crate::plan::{PlanNode, PlanNodeKind};
use crate::runtime::descriptors::{Datum, TupleDescriptor};
use crate::runtime::profile::{CounterRef, CounterUnit, RuntimeProfile};
use crate::runtime::row_batch::RowBatch;
use crate::runtime::runtime_state::RuntimeState;

/// The iterator contract every operator implements.
///
/// `get_next` fills the caller's output batch and returns true at end of
/// stream; the final batch may still carry rows. `close` must run exactly
/// once, release all memory, and be safe on the error path.
pub trait ExecNode: Send {
    fn prepare(&mut self, state: &RuntimeState) -> Result<()>;
    fn open(&mut self, state: &RuntimeState) -> Result<()>;
    fn get_next(&mut self, state: &RuntimeState, batch: &mut RowBatch) -> Result<bool>;
    fn close(&mut self, state: &RuntimeState);
    /// Schema of the batches this node fills; parents size child batches
    /// with it.
    fn output_desc(&self) -> &TupleDescriptor;
}

/// State common to all operators: conjuncts, limit accounting, the node's
/// profile and the row buffer bridging child batches to output batches.
pub struct NodeShared {
    pub id: i32,
    pub conjuncts: Vec<Expr>,
    pub limit: Option<i64>,
    pub output_desc: TupleDescriptor,
    pub profile: RuntimeProfile,
    pub rows_returned: CounterRef,
    rows_returned_total: i64,
    pending: VecDeque<Vec<Datum>>,
    closed: bool,
}

impl NodeShared {
    pub fn from_plan(node: &PlanNode, state: &RuntimeState) -> Self {
        let profile = state
            .profile()
            .child(format!("{} (id={})", node.kind.name(), node.id));
        let rows_returned = profile.add_counter("RowsReturned", CounterUnit::Unit);
        Self {
            id: node.id,
            conjuncts: node.conjuncts.clone(),
            limit: node.limit,
            output_desc: node.output_tuple.clone(),
            profile,
            rows_returned,
            rows_returned_total: 0,
            pending: VecDeque::new(),
            closed: false,
        }
    }

    /// Bind conjuncts eagerly unless codegen is disabled.
    pub fn prepare_conjuncts(&self, state: &RuntimeState, input_desc: &TupleDescriptor) -> Result<()> {
        if state.options().disable_codegen {
            self.profile.add_info_string("Codegen", "disabled");
            return Ok(());
        }
        self.profile.add_info_string("Codegen", "bound");
        for conjunct in &self.conjuncts {
            conjunct.bind(input_desc)?;
        }
        Ok(())
    }

    pub fn reached_limit(&self) -> bool {
        self.limit
            .is_some_and(|limit| self.rows_returned_total >= limit)
    }

    pub fn pending_is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Filter a source batch through the conjuncts into the pending buffer,
    /// honouring the limit.
    pub fn absorb_batch(&mut self, batch: &RowBatch) -> Result<()> {
        for row in 0..batch.num_rows() {
            if self.limit.is_some_and(|l| {
                self.rows_returned_total + self.pending.len() as i64 >= l
            }) {
                break;
            }
            if eval_conjuncts(&self.conjuncts, batch, row)? {
                self.pending.push_back(batch.row(row));
            }
        }
        Ok(())
    }

    /// Move pending rows into `out` until it fills. Returns true when the
    /// pending buffer drained completely.
    pub fn flush_pending(&mut self, out: &mut RowBatch) -> Result<bool> {
        while !out.is_full() {
            let Some(row) = self.pending.pop_front() else {
                return Ok(true);
            };
            out.add_row(&row)?;
            self.rows_returned_total += 1;
            self.rows_returned.add(1);
            if self.reached_limit() {
                self.pending.clear();
                return Ok(true);
            }
        }
        Ok(self.pending.is_empty())
    }

    /// Guard making `close` idempotent; true on the first call.
    pub fn mark_closed(&mut self) -> bool {
        !std::mem::replace(&mut self.closed, true)
    }
}

/// Evaluate sort-key expressions for one row.
pub fn eval_sort_keys(
    keys: &[crate::plan::SortKey],
    batch: &RowBatch,
    row: usize,
) -> Result<Vec<Datum>> {
    keys.iter().map(|k| k.expr.eval(batch, row)).collect()
}

/// Lexicographic comparison of two key vectors under per-key sort order.
pub fn cmp_sort_keys(
    keys: &[crate::plan::SortKey],
    a: &[Datum],
    b: &[Datum],
) -> std::cmp::Ordering {
    for (i, key) in keys.iter().enumerate() {
        let ord = crate::runtime::descriptors::cmp_datum(&a[i], &b[i]);
        let ord = if key.ascending { ord } else { ord.reverse() };
        if ord != std::cmp::Ordering::Equal {
            return ord;
        }
    }
    std::cmp::Ordering::Equal
}

/// Rough per-row footprint used for tracker accounting of materialised rows
/// (hash tables, sort runs).
pub fn materialized_row_bytes(row: &[Datum]) -> usize {
    let mut total = std::mem::size_of::<Vec<Datum>>();
    for datum in row {
        total += std::mem::size_of::<Datum>();
        if let Datum::Varchar(s) = datum {
            total += s.len();
        }
    }
    total
}

/// Build the operator tree of one fragment instance from its plan subtree.
pub fn build_exec_tree(state: &RuntimeState, plan: &PlanNode) -> Result<Box<dyn ExecNode>> {
    let mut children = Vec::with_capacity(plan.children.len());
    for child in &plan.children {
        children.push(build_exec_tree(state, child)?);
    }
    let node: Box<dyn ExecNode> = match &plan.kind {
        PlanNodeKind::Scan { table } => {
            if !children.is_empty() {
                return Err(Status::internal("scan node cannot have children"));
            }
            Box::new(scan_node::ScanNode::new(state, plan, table.clone()))
        }
        PlanNodeKind::Select => {
            let child = take_only_child(&mut children, "select")?;
            Box::new(select_node::SelectNode::new(state, plan, child))
        }
        PlanNodeKind::Union => Box::new(union_node::UnionNode::new(state, plan, children)),
        PlanNodeKind::Aggregate {
            group_by,
            aggregates,
            mode,
        } => {
            let child = take_only_child(&mut children, "aggregate")?;
            Box::new(aggregation_node::AggregationNode::new(
                state,
                plan,
                group_by.clone(),
                aggregates.clone(),
                *mode,
                child,
            ))
        }
        PlanNodeKind::HashJoin {
            join_op,
            left_keys,
            right_keys,
        } => {
            let (left, right) = take_two_children(&mut children, "hash join")?;
            Box::new(hash_join_node::HashJoinNode::new(
                state,
                plan,
                *join_op,
                left_keys.clone(),
                right_keys.clone(),
                left,
                right,
            ))
        }
        PlanNodeKind::MergeJoin {
            left_keys,
            right_keys,
        } => {
            let (left, right) = take_two_children(&mut children, "merge join")?;
            Box::new(merge_join_node::MergeJoinNode::new(
                state,
                plan,
                left_keys.clone(),
                right_keys.clone(),
                left,
                right,
            ))
        }
        PlanNodeKind::Sort { keys } => {
            let child = take_only_child(&mut children, "sort")?;
            Box::new(sort_node::SortNode::new(state, plan, keys.clone(), child))
        }
        PlanNodeKind::TopN { keys, limit } => {
            let child = take_only_child(&mut children, "top-n")?;
            Box::new(topn_node::TopNNode::new(
                state,
                plan,
                keys.clone(),
                *limit,
                child,
            ))
        }
        PlanNodeKind::Exchange { input_tuple } => {
            if !children.is_empty() {
                return Err(Status::internal(
                    "exchange node is fed by the stream fabric, not local children",
                ));
            }
            Box::new(exchange_node::ExchangeNode::new(
                state,
                plan,
                input_tuple.clone(),
            ))
        }
        PlanNodeKind::Analytic {
            partition_by,
            order_by,
            functions,
        } => {
            let child = take_only_child(&mut children, "analytic")?;
            Box::new(analytic_node::AnalyticNode::new(
                state,
                plan,
                partition_by.clone(),
                order_by.clone(),
                functions.clone(),
                child,
            ))
        }
    };
    Ok(node)
}

fn take_only_child(
    children: &mut Vec<Box<dyn ExecNode>>,
    what: &str,
) -> Result<Box<dyn ExecNode>> {
    if children.len() != 1 {
        return Err(Status::internal(format!(
            "{what} node requires exactly one child, got {}",
            children.len()
        )));
    }
    Ok(children.remove(0))
}

fn take_two_children(
    children: &mut Vec<Box<dyn ExecNode>>,
    what: &str,
) -> Result<(Box<dyn ExecNode>, Box<dyn ExecNode>)> {
    if children.len() != 2 {
        return Err(Status::internal(format!(
            "{what} node requires exactly two children, got {}",
            children.len()
        )));
    }
    let right = children.remove(1);
    let left = children.remove(0);
    Ok((left, right))
}
