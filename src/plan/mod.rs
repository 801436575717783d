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

//! The serialisable plan-fragment model handed over by the planner. The plan
//! is a strict tree: parents own children by value; fragments reference each
//! other only through indices and exchange node ids.

pub mod builder;

use serde::{Deserialize, Serialize};

use crate::common::status::{Result, Status};
use crate::exprs::{AggExpr, AnalyticFunc, Expr};
use crate::runtime::descriptors::TupleDescriptor;

/// The unit of work assigned to a scan-bearing fragment instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanRange {
    pub file: String,
    pub offset: u64,
    pub length: u64,
    /// Hostnames holding a replica of this range.
    pub replicas: Vec<String>,
}

/// Location hint tying a scan range to the plan node that reads it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanRangeLocations {
    pub node_id: i32,
    pub range: ScanRange,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum JoinOp {
    Inner,
    LeftOuter,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum AggMode {
    /// First phase: consume raw input rows, emit partial states.
    Partial,
    /// Second phase: merge partial states, emit final values.
    MergeFinalize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SortKey {
    pub expr: Expr,
    pub ascending: bool,
}

/// Kind-specific payload of a plan node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PlanNodeKind {
    Scan {
        table: String,
    },
    Aggregate {
        group_by: Vec<Expr>,
        aggregates: Vec<AggExpr>,
        mode: AggMode,
    },
    HashJoin {
        join_op: JoinOp,
        left_keys: Vec<Expr>,
        right_keys: Vec<Expr>,
    },
    MergeJoin {
        left_keys: Vec<Expr>,
        right_keys: Vec<Expr>,
    },
    Union,
    Sort {
        keys: Vec<SortKey>,
    },
    TopN {
        keys: Vec<SortKey>,
        limit: usize,
    },
    /// Receive side of an exchange; the upstream fragment's sink feeds it.
    Exchange {
        input_tuple: TupleDescriptor,
    },
    Select,
    Analytic {
        partition_by: Vec<Expr>,
        order_by: Vec<SortKey>,
        functions: Vec<AnalyticFunc>,
    },
}

impl PlanNodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            PlanNodeKind::Scan { .. } => "SCAN",
            PlanNodeKind::Aggregate { .. } => "AGGREGATE",
            PlanNodeKind::HashJoin { .. } => "HASH_JOIN",
            PlanNodeKind::MergeJoin { .. } => "MERGE_JOIN",
            PlanNodeKind::Union => "UNION",
            PlanNodeKind::Sort { .. } => "SORT",
            PlanNodeKind::TopN { .. } => "TOP_N",
            PlanNodeKind::Exchange { .. } => "EXCHANGE",
            PlanNodeKind::Select => "SELECT",
            PlanNodeKind::Analytic { .. } => "ANALYTIC",
        }
    }

    /// A node is blocking iff it must fully consume at least one input
    /// before producing output. The planner cuts fragments at these points.
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            PlanNodeKind::Aggregate { .. }
                | PlanNodeKind::HashJoin { .. }
                | PlanNodeKind::Sort { .. }
                | PlanNodeKind::TopN { .. }
                | PlanNodeKind::Analytic { .. }
        )
    }
}

/// One typed operator of the plan tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    /// Unique within the query.
    pub id: i32,
    pub kind: PlanNodeKind,
    pub children: Vec<PlanNode>,
    /// Conjunctive predicates applied to this node's output rows.
    pub conjuncts: Vec<Expr>,
    pub output_tuple: TupleDescriptor,
    pub limit: Option<i64>,
    /// Planner cardinality estimate, preserved for runtime sizing decisions.
    pub cardinality: i64,
    pub avg_row_bytes: i64,
}

impl PlanNode {
    pub fn new(id: i32, kind: PlanNodeKind, output_tuple: TupleDescriptor) -> Self {
        Self {
            id,
            kind,
            children: Vec::new(),
            conjuncts: Vec::new(),
            output_tuple,
            limit: None,
            cardinality: -1,
            avg_row_bytes: -1,
        }
    }

    pub fn with_children(mut self, children: Vec<PlanNode>) -> Self {
        self.children = children;
        self
    }

    pub fn with_conjuncts(mut self, conjuncts: Vec<Expr>) -> Self {
        self.conjuncts = conjuncts;
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Pre-order walk (self first, then children left-to-right). This is the
    /// root-first ordered-list view of the fragment.
    pub fn preorder(&self) -> Vec<&PlanNode> {
        let mut out = Vec::new();
        self.preorder_into(&mut out);
        out
    }

    fn preorder_into<'a>(&'a self, out: &mut Vec<&'a PlanNode>) {
        out.push(self);
        for child in &self.children {
            child.preorder_into(out);
        }
    }

    pub fn find(&self, id: i32) -> Option<&PlanNode> {
        self.preorder().into_iter().find(|n| n.id == id)
    }
}

/// Declared data distribution of a fragment boundary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PartitionSpec {
    Unpartitioned,
    Random,
    Hash(Vec<Expr>),
}

/// Terminal component of a fragment: where its output rows go.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DataSinkSpec {
    /// Buffer rows at the coordinator for client fetch.
    Result,
    /// Replicate every batch to all destination instances.
    Broadcast {
        dest_fragment: usize,
        dest_node_id: i32,
    },
    /// Route each row by hash of the partition exprs.
    HashPartitioned {
        dest_fragment: usize,
        dest_node_id: i32,
        exprs: Vec<Expr>,
    },
    /// Single destination instance.
    Unpartitioned {
        dest_fragment: usize,
        dest_node_id: i32,
    },
}

impl DataSinkSpec {
    pub fn dest_fragment(&self) -> Option<usize> {
        match self {
            DataSinkSpec::Result => None,
            DataSinkSpec::Broadcast { dest_fragment, .. }
            | DataSinkSpec::HashPartitioned { dest_fragment, .. }
            | DataSinkSpec::Unpartitioned { dest_fragment, .. } => Some(*dest_fragment),
        }
    }

    pub fn dest_node_id(&self) -> Option<i32> {
        match self {
            DataSinkSpec::Result => None,
            DataSinkSpec::Broadcast { dest_node_id, .. }
            | DataSinkSpec::HashPartitioned { dest_node_id, .. }
            | DataSinkSpec::Unpartitioned { dest_node_id, .. } => Some(*dest_node_id),
        }
    }
}

/// A subtree of operators plus a sink; the atomic unit of distribution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanFragment {
    pub idx: usize,
    pub root: PlanNode,
    pub sink: DataSinkSpec,
    pub input_partition: PartitionSpec,
    pub output_partition: PartitionSpec,
    /// Pin every instance (and all its scan ranges) to the coordinator.
    pub exec_at_coord: bool,
}

impl PlanFragment {
    /// Ids of scan nodes in this fragment, in plan order.
    pub fn scan_node_ids(&self) -> Vec<i32> {
        self.root
            .preorder()
            .into_iter()
            .filter(|n| matches!(n.kind, PlanNodeKind::Scan { .. }))
            .map(|n| n.id)
            .collect()
    }

    /// Ids of exchange nodes in this fragment, in plan order.
    pub fn exchange_node_ids(&self) -> Vec<i32> {
        self.root
            .preorder()
            .into_iter()
            .filter(|n| matches!(n.kind, PlanNodeKind::Exchange { .. }))
            .map(|n| n.id)
            .collect()
    }

    /// Id of the leftmost exchange input, if the fragment is exchange-fed.
    pub fn leftmost_exchange(&self) -> Option<i32> {
        let mut node = &self.root;
        loop {
            if let PlanNodeKind::Exchange { .. } = node.kind {
                return Some(node.id);
            }
            node = node.children.first()?;
        }
    }
}

/// The typed plan consumed from the planner: fragment 0 is the coordinator
/// (root) fragment; leaves come last.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub fragments: Vec<PlanFragment>,
}

impl QueryPlan {
    pub fn root_fragment(&self) -> &PlanFragment {
        &self.fragments[0]
    }

    pub fn validate(&self) -> Result<()> {
        if self.fragments.is_empty() {
            return Err(Status::internal("plan has no fragments"));
        }
        if self.fragments[0].sink != DataSinkSpec::Result {
            return Err(Status::internal("root fragment must have a result sink"));
        }
        let mut seen_node_ids = std::collections::HashSet::new();
        for (pos, fragment) in self.fragments.iter().enumerate() {
            if fragment.idx != pos {
                return Err(Status::internal(format!(
                    "fragment index {} out of order at position {pos}",
                    fragment.idx
                )));
            }
            for node in fragment.root.preorder() {
                if !seen_node_ids.insert(node.id) {
                    return Err(Status::internal(format!(
                        "duplicate plan node id {}",
                        node.id
                    )));
                }
            }
            if let Some(dest) = fragment.sink.dest_fragment() {
                let dest_node = fragment.sink.dest_node_id().expect("stream sink");
                let Some(dest_fragment) = self.fragments.get(dest) else {
                    return Err(Status::internal(format!(
                        "sink of fragment {} targets missing fragment {dest}",
                        fragment.idx
                    )));
                };
                let is_exchange = dest_fragment
                    .root
                    .find(dest_node)
                    .is_some_and(|n| matches!(n.kind, PlanNodeKind::Exchange { .. }));
                if !is_exchange {
                    return Err(Status::internal(format!(
                        "sink of fragment {} targets node {dest_node} which is not an exchange",
                        fragment.idx
                    )));
                }
            } else if pos != 0 {
                return Err(Status::internal(format!(
                    "non-root fragment {} lacks a stream sink",
                    fragment.idx
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::builder;
    use super::*;
    use crate::runtime::descriptors::ColumnType;

    #[test]
    fn preorder_is_root_first() {
        let desc = TupleDescriptor::new(vec![ColumnType::BigInt]);
        let leaf = PlanNode::new(2, PlanNodeKind::Scan { table: "t".into() }, desc.clone());
        let root = PlanNode::new(1, PlanNodeKind::Select, desc).with_children(vec![leaf]);
        let order: Vec<i32> = root.preorder().iter().map(|n| n.id).collect();
        assert_eq!(order, vec![1, 2]);
    }

    #[test]
    fn blocking_nodes_are_the_fragment_cut_points() {
        assert!(PlanNodeKind::Aggregate {
            group_by: vec![],
            aggregates: vec![],
            mode: AggMode::Partial,
        }
        .is_blocking());
        assert!(!PlanNodeKind::Union.is_blocking());
        assert!(!PlanNodeKind::Select.is_blocking());
    }

    #[test]
    fn plan_serde_round_trip() {
        let desc = TupleDescriptor::new(vec![ColumnType::BigInt, ColumnType::Varchar]);
        let plan = builder::scan_plan("t", desc, vec![], None);
        plan.validate().expect("valid");
        let json = serde_json::to_string(&plan).expect("serialize");
        let back: QueryPlan = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(plan, back);
    }

    #[test]
    fn validate_rejects_duplicate_node_ids() {
        let desc = TupleDescriptor::new(vec![ColumnType::BigInt]);
        let node = PlanNode::new(1, PlanNodeKind::Scan { table: "t".into() }, desc.clone());
        let dup = PlanNode::new(1, PlanNodeKind::Select, desc).with_children(vec![node]);
        let plan = QueryPlan {
            fragments: vec![PlanFragment {
                idx: 0,
                root: dup,
                sink: DataSinkSpec::Result,
                input_partition: PartitionSpec::Unpartitioned,
                output_partition: PartitionSpec::Unpartitioned,
                exec_at_coord: true,
            }],
        };
        assert!(plan.validate().is_err());
    }
}
