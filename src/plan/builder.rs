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

//! Hand-assembly helpers for the distributed plan shapes the runtime is
//! exercised with. The SQL frontend normally produces these; tests and the
//! demo binary build them directly.

use crate::exprs::{AggExpr, Expr};
use crate::plan::{
    AggMode, DataSinkSpec, JoinOp, PartitionSpec, PlanFragment, PlanNode, PlanNodeKind, QueryPlan,
};
use crate::runtime::descriptors::{ColumnType, TupleDescriptor};

/// `SELECT <cols> FROM t [WHERE ...] [LIMIT n]` over a partitioned table:
/// one scan fragment fanned across workers, gathered at the coordinator.
pub fn scan_plan(
    table: &str,
    desc: TupleDescriptor,
    conjuncts: Vec<Expr>,
    limit: Option<i64>,
) -> QueryPlan {
    // The planner pushes a bare LIMIT into the scan itself, so a LIMIT 0
    // query ships no batches at all.
    let mut scan = PlanNode::new(
        1,
        PlanNodeKind::Scan {
            table: table.to_string(),
        },
        desc.clone(),
    )
    .with_conjuncts(conjuncts);
    scan.limit = limit;

    let mut exchange = PlanNode::new(
        0,
        PlanNodeKind::Exchange {
            input_tuple: desc.clone(),
        },
        desc,
    );
    exchange.limit = limit;

    QueryPlan {
        fragments: vec![
            PlanFragment {
                idx: 0,
                root: exchange,
                sink: DataSinkSpec::Result,
                input_partition: PartitionSpec::Random,
                output_partition: PartitionSpec::Unpartitioned,
                exec_at_coord: true,
            },
            PlanFragment {
                idx: 1,
                root: scan,
                sink: DataSinkSpec::Unpartitioned {
                    dest_fragment: 0,
                    dest_node_id: 0,
                },
                input_partition: PartitionSpec::Random,
                output_partition: PartitionSpec::Unpartitioned,
                exec_at_coord: false,
            },
        ],
    }
}

/// `SELECT count(*) FROM t`: per-worker partial counts merged by a single
/// aggregate instance on the coordinator.
pub fn count_star_plan(table: &str, desc: TupleDescriptor) -> QueryPlan {
    let count_tuple = TupleDescriptor::new(vec![ColumnType::BigInt]);

    let scan = PlanNode::new(
        2,
        PlanNodeKind::Scan {
            table: table.to_string(),
        },
        desc,
    );
    let partial = PlanNode::new(
        1,
        PlanNodeKind::Aggregate {
            group_by: vec![],
            aggregates: vec![AggExpr::count_star()],
            mode: AggMode::Partial,
        },
        count_tuple.clone(),
    )
    .with_children(vec![scan]);

    let exchange = PlanNode::new(
        3,
        PlanNodeKind::Exchange {
            input_tuple: count_tuple.clone(),
        },
        count_tuple.clone(),
    );
    let merge = PlanNode::new(
        0,
        PlanNodeKind::Aggregate {
            group_by: vec![],
            aggregates: vec![AggExpr::count_star()],
            mode: AggMode::MergeFinalize,
        },
        count_tuple,
    )
    .with_children(vec![exchange]);

    QueryPlan {
        fragments: vec![
            PlanFragment {
                idx: 0,
                root: merge,
                sink: DataSinkSpec::Result,
                input_partition: PartitionSpec::Random,
                output_partition: PartitionSpec::Unpartitioned,
                exec_at_coord: true,
            },
            PlanFragment {
                idx: 1,
                root: partial,
                sink: DataSinkSpec::Unpartitioned {
                    dest_fragment: 0,
                    dest_node_id: 3,
                },
                input_partition: PartitionSpec::Random,
                output_partition: PartitionSpec::Unpartitioned,
                exec_at_coord: false,
            },
        ],
    }
}

/// `SELECT a, sum(b) FROM t GROUP BY a` with a hash-partitioned shuffle on
/// `a`: N scan/pre-aggregate instances, N merge instances, coordinator
/// gather.
pub fn grouped_agg_plan(
    table: &str,
    desc: TupleDescriptor,
    group_col: usize,
    sum_col: usize,
) -> QueryPlan {
    let group_type = desc.column_type(group_col).expect("group column");
    let sum_type = match desc.column_type(sum_col).expect("sum column") {
        ColumnType::Double => ColumnType::Double,
        _ => ColumnType::BigInt,
    };
    let agg_tuple = TupleDescriptor::new(vec![group_type, sum_type]);

    let scan = PlanNode::new(
        4,
        PlanNodeKind::Scan {
            table: table.to_string(),
        },
        desc,
    );
    let partial = PlanNode::new(
        3,
        PlanNodeKind::Aggregate {
            group_by: vec![Expr::slot(group_col)],
            aggregates: vec![AggExpr::sum(Expr::slot(sum_col))],
            mode: AggMode::Partial,
        },
        agg_tuple.clone(),
    )
    .with_children(vec![scan]);

    let shuffle_exchange = PlanNode::new(
        5,
        PlanNodeKind::Exchange {
            input_tuple: agg_tuple.clone(),
        },
        agg_tuple.clone(),
    );
    // Post-shuffle rows are (group, partial sum): merge on slot 0, sum slot 1.
    let merge = PlanNode::new(
        2,
        PlanNodeKind::Aggregate {
            group_by: vec![Expr::slot(0)],
            aggregates: vec![AggExpr::sum(Expr::slot(1))],
            mode: AggMode::MergeFinalize,
        },
        agg_tuple.clone(),
    )
    .with_children(vec![shuffle_exchange]);

    let gather_exchange = PlanNode::new(
        1,
        PlanNodeKind::Exchange {
            input_tuple: agg_tuple.clone(),
        },
        agg_tuple,
    );

    QueryPlan {
        fragments: vec![
            PlanFragment {
                idx: 0,
                root: gather_exchange,
                sink: DataSinkSpec::Result,
                input_partition: PartitionSpec::Hash(vec![Expr::slot(0)]),
                output_partition: PartitionSpec::Unpartitioned,
                exec_at_coord: true,
            },
            PlanFragment {
                idx: 1,
                root: merge,
                sink: DataSinkSpec::Unpartitioned {
                    dest_fragment: 0,
                    dest_node_id: 1,
                },
                input_partition: PartitionSpec::Hash(vec![Expr::slot(0)]),
                output_partition: PartitionSpec::Hash(vec![Expr::slot(0)]),
                exec_at_coord: false,
            },
            PlanFragment {
                idx: 2,
                root: partial,
                sink: DataSinkSpec::HashPartitioned {
                    dest_fragment: 1,
                    dest_node_id: 5,
                    exprs: vec![Expr::slot(0)],
                },
                input_partition: PartitionSpec::Random,
                output_partition: PartitionSpec::Hash(vec![Expr::slot(0)]),
                exec_at_coord: false,
            },
        ],
    }
}

/// A coordinator-local hash join of two scans (`t_left JOIN t_right ON
/// left_key = right_key`); the build side is the right input.
pub fn hash_join_plan(
    left_table: &str,
    left_desc: TupleDescriptor,
    right_table: &str,
    right_desc: TupleDescriptor,
    left_key: usize,
    right_key: usize,
) -> QueryPlan {
    let mut out_cols: Vec<ColumnType> = left_desc.columns().to_vec();
    out_cols.extend_from_slice(right_desc.columns());
    let out_tuple = TupleDescriptor::new(out_cols);

    let left = PlanNode::new(
        1,
        PlanNodeKind::Scan {
            table: left_table.to_string(),
        },
        left_desc,
    );
    let right = PlanNode::new(
        2,
        PlanNodeKind::Scan {
            table: right_table.to_string(),
        },
        right_desc,
    );
    let join = PlanNode::new(
        0,
        PlanNodeKind::HashJoin {
            join_op: JoinOp::Inner,
            left_keys: vec![Expr::slot(left_key)],
            right_keys: vec![Expr::slot(right_key)],
        },
        out_tuple,
    )
    .with_children(vec![left, right]);

    QueryPlan {
        fragments: vec![PlanFragment {
            idx: 0,
            root: join,
            sink: DataSinkSpec::Result,
            input_partition: PartitionSpec::Unpartitioned,
            output_partition: PartitionSpec::Unpartitioned,
            exec_at_coord: true,
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_col_desc() -> TupleDescriptor {
        TupleDescriptor::new(vec![ColumnType::Varchar, ColumnType::BigInt])
    }

    #[test]
    fn built_plans_validate() {
        scan_plan("t", two_col_desc(), vec![], Some(0))
            .validate()
            .expect("scan plan");
        count_star_plan("t", two_col_desc())
            .validate()
            .expect("count plan");
        grouped_agg_plan("t", two_col_desc(), 0, 1)
            .validate()
            .expect("grouped plan");
        hash_join_plan("l", two_col_desc(), "r", two_col_desc(), 1, 1)
            .validate()
            .expect("join plan");
    }

    #[test]
    fn grouped_plan_has_hash_shuffle() {
        let plan = grouped_agg_plan("t", two_col_desc(), 0, 1);
        assert!(matches!(
            plan.fragments[2].sink,
            DataSinkSpec::HashPartitioned { dest_fragment: 1, .. }
        ));
        assert_eq!(plan.fragments[1].leftmost_exchange(), Some(5));
    }

    #[test]
    fn scan_plan_carries_limit_on_coordinator_exchange() {
        let plan = scan_plan("t", two_col_desc(), vec![], Some(0));
        assert_eq!(plan.fragments[0].root.limit, Some(0));
    }
}
