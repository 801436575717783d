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
//! Operator coverage through coordinator-local single-fragment plans.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use kestrel::exec::scan_node::MemTableProvider;
use kestrel::exprs::{AnalyticFunc, CmpOp, Expr};
use kestrel::plan::{
    DataSinkSpec, PartitionSpec, PlanFragment, PlanNode, PlanNodeKind, QueryPlan, ScanRange,
    SortKey,
};
use kestrel::runtime::descriptors::{ColumnType, Datum, TupleDescriptor};
use kestrel::service::query_exec_state::{QueryExecRequest, ResultSet};

use common::{default_options, kv_desc, whole_file_range, TestCluster};

fn single_fragment_plan(root: PlanNode) -> QueryPlan {
    QueryPlan {
        fragments: vec![PlanFragment {
            idx: 0,
            root,
            sink: DataSinkSpec::Result,
            input_partition: PartitionSpec::Unpartitioned,
            output_partition: PartitionSpec::Unpartitioned,
            exec_at_coord: true,
        }],
    }
}

fn scan(id: i32, table: &str, desc: TupleDescriptor) -> PlanNode {
    PlanNode::new(
        id,
        PlanNodeKind::Scan {
            table: table.to_string(),
        },
        desc,
    )
}

fn run_query(
    tc: &TestCluster,
    plan: QueryPlan,
    scan_locations: HashMap<i32, Vec<ScanRange>>,
) -> Vec<Vec<Datum>> {
    let session = tc.sessions.open_session();
    let query_id = tc
        .sessions
        .submit(
            session,
            QueryExecRequest {
                plan,
                scan_locations,
                options: default_options(),
            },
        )
        .expect("submit");
    let mut out = Vec::new();
    loop {
        match tc.sessions.fetch(query_id, 1024).expect("fetch") {
            ResultSet::Rows { rows, eos } => {
                out.extend(rows);
                if eos {
                    break;
                }
            }
            other => panic!("unexpected result shape: {other:?}"),
        }
    }
    tc.sessions
        .wait(query_id, Duration::from_secs(20))
        .expect("wait");
    tc.sessions.close(query_id).expect("close");
    out
}

fn kv_file(values: &[(&str, i64)]) -> Vec<Vec<Datum>> {
    values
        .iter()
        .map(|(k, v)| vec![Datum::Varchar(k.to_string()), Datum::BigInt(*v)])
        .collect()
}

#[test]
fn sort_orders_descending() {
    let tc = TestCluster::new(1);
    let table = MemTableProvider::new();
    table.add_file("f", kv_file(&[("a", 3), ("b", 1), ("c", 2)]));
    tc.register_table("t", table);

    let root = PlanNode::new(
        0,
        PlanNodeKind::Sort {
            keys: vec![SortKey {
                expr: Expr::slot(1),
                ascending: false,
            }],
        },
        kv_desc(),
    )
    .with_children(vec![scan(1, "t", kv_desc())]);

    let rows = run_query(
        &tc,
        single_fragment_plan(root),
        common::scan_locations_for(1, vec![whole_file_range("f", 3, "coord")]),
    );
    let values: Vec<i64> = rows
        .iter()
        .map(|r| r[1].as_bigint().expect("bigint"))
        .collect();
    assert_eq!(values, vec![3, 2, 1]);
}

#[test]
fn top_n_keeps_the_n_smallest() {
    let tc = TestCluster::new(1);
    let table = MemTableProvider::new();
    table.add_file(
        "f",
        (0..100)
            .rev()
            .map(|i| vec![Datum::Varchar(format!("k{i}")), Datum::BigInt(i)])
            .collect(),
    );
    tc.register_table("t", table);

    let root = PlanNode::new(
        0,
        PlanNodeKind::TopN {
            keys: vec![SortKey {
                expr: Expr::slot(1),
                ascending: true,
            }],
            limit: 5,
        },
        kv_desc(),
    )
    .with_children(vec![scan(1, "t", kv_desc())]);

    let rows = run_query(
        &tc,
        single_fragment_plan(root),
        common::scan_locations_for(1, vec![whole_file_range("f", 100, "coord")]),
    );
    let values: Vec<i64> = rows
        .iter()
        .map(|r| r[1].as_bigint().expect("bigint"))
        .collect();
    assert_eq!(values, vec![0, 1, 2, 3, 4]);
}

#[test]
fn union_all_concatenates_children() {
    let tc = TestCluster::new(1);
    let t1 = MemTableProvider::new();
    t1.add_file("f", kv_file(&[("a", 1), ("b", 2)]));
    tc.register_table("t1", t1);
    let t2 = MemTableProvider::new();
    t2.add_file("f", kv_file(&[("c", 3)]));
    tc.register_table("t2", t2);

    let root = PlanNode::new(0, PlanNodeKind::Union, kv_desc()).with_children(vec![
        scan(1, "t1", kv_desc()),
        scan(2, "t2", kv_desc()),
    ]);

    let mut locations = HashMap::new();
    locations.insert(1, vec![whole_file_range("f", 2, "coord")]);
    locations.insert(2, vec![whole_file_range("f", 1, "coord")]);
    let rows = run_query(&tc, single_fragment_plan(root), locations);
    assert_eq!(rows.len(), 3);
    let values: Vec<i64> = rows
        .iter()
        .map(|r| r[1].as_bigint().expect("bigint"))
        .collect();
    assert_eq!(values, vec![1, 2, 3]);
}

#[test]
fn select_node_reapplies_conjuncts() {
    let tc = TestCluster::new(1);
    let table = MemTableProvider::new();
    table.add_file("f", kv_file(&[("a", 1), ("b", 2), ("c", 3), ("d", 4)]));
    tc.register_table("t", table);

    let root = PlanNode::new(0, PlanNodeKind::Select, kv_desc())
        .with_children(vec![scan(1, "t", kv_desc())])
        .with_conjuncts(vec![Expr::cmp(
            CmpOp::Gt,
            Expr::slot(1),
            Expr::lit(Datum::BigInt(2)),
        )]);

    let rows = run_query(
        &tc,
        single_fragment_plan(root),
        common::scan_locations_for(1, vec![whole_file_range("f", 4, "coord")]),
    );
    assert_eq!(rows.len(), 2);
}

#[test]
fn merge_join_matches_sorted_inputs() {
    let tc = TestCluster::new(1);
    // Both inputs sorted ascending on the join column (slot 1).
    let left = MemTableProvider::new();
    left.add_file("f", kv_file(&[("l1", 1), ("l2", 2), ("l2b", 2), ("l4", 4)]));
    tc.register_table("t_left", left);
    let right = MemTableProvider::new();
    right.add_file("f", kv_file(&[("r2", 2), ("r3", 3), ("r4", 4), ("r4b", 4)]));
    tc.register_table("t_right", right);

    let out_desc = TupleDescriptor::new(vec![
        ColumnType::Varchar,
        ColumnType::BigInt,
        ColumnType::Varchar,
        ColumnType::BigInt,
    ]);
    let root = PlanNode::new(
        0,
        PlanNodeKind::MergeJoin {
            left_keys: vec![Expr::slot(1)],
            right_keys: vec![Expr::slot(1)],
        },
        out_desc,
    )
    .with_children(vec![
        scan(1, "t_left", kv_desc()),
        scan(2, "t_right", kv_desc()),
    ]);

    let mut locations = HashMap::new();
    locations.insert(1, vec![whole_file_range("f", 4, "coord")]);
    locations.insert(2, vec![whole_file_range("f", 4, "coord")]);
    let mut rows = run_query(&tc, single_fragment_plan(root), locations);
    rows.sort_by_key(|r| {
        (
            r[1].as_bigint().expect("bigint"),
            format!("{:?}{:?}", r[0], r[2]),
        )
    });

    // key 2: two left rows x one right row; key 4: one left x two right.
    assert_eq!(rows.len(), 4);
    assert!(rows
        .iter()
        .all(|r| r[1].as_bigint() == r[3].as_bigint()));
    let keys: Vec<i64> = rows
        .iter()
        .map(|r| r[1].as_bigint().expect("bigint"))
        .collect();
    assert_eq!(keys, vec![2, 2, 4, 4]);
}

#[test]
fn analytic_running_functions_over_one_partition() {
    let tc = TestCluster::new(1);
    let table = MemTableProvider::new();
    table.add_file("f", kv_file(&[("a", 10), ("b", 20), ("c", 30)]));
    tc.register_table("t", table);

    let out_desc = TupleDescriptor::new(vec![
        ColumnType::Varchar,
        ColumnType::BigInt,
        ColumnType::BigInt,
        ColumnType::BigInt,
    ]);
    let root = PlanNode::new(
        0,
        PlanNodeKind::Analytic {
            partition_by: vec![],
            order_by: vec![SortKey {
                expr: Expr::slot(1),
                ascending: true,
            }],
            functions: vec![
                AnalyticFunc::RowNumber,
                AnalyticFunc::RunningSum(Expr::slot(1)),
            ],
        },
        out_desc,
    )
    .with_children(vec![scan(1, "t", kv_desc())]);

    let rows = run_query(
        &tc,
        single_fragment_plan(root),
        common::scan_locations_for(1, vec![whole_file_range("f", 3, "coord")]),
    );
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0][2], Datum::BigInt(1));
    assert_eq!(rows[1][2], Datum::BigInt(2));
    assert_eq!(rows[2][2], Datum::BigInt(3));
    assert_eq!(rows[0][3], Datum::BigInt(10));
    assert_eq!(rows[1][3], Datum::BigInt(30));
    assert_eq!(rows[2][3], Datum::BigInt(60));
}

#[test]
fn analytic_resets_at_partition_boundaries() {
    let tc = TestCluster::new(1);
    let table = MemTableProvider::new();
    // Sorted by (partition key, order key).
    table.add_file(
        "f",
        kv_file(&[("a", 1), ("a", 2), ("b", 5), ("b", 6), ("b", 7)]),
    );
    tc.register_table("t", table);

    let out_desc = TupleDescriptor::new(vec![
        ColumnType::Varchar,
        ColumnType::BigInt,
        ColumnType::BigInt,
    ]);
    let root = PlanNode::new(
        0,
        PlanNodeKind::Analytic {
            partition_by: vec![Expr::slot(0)],
            order_by: vec![SortKey {
                expr: Expr::slot(1),
                ascending: true,
            }],
            functions: vec![AnalyticFunc::RowNumber],
        },
        out_desc,
    )
    .with_children(vec![scan(1, "t", kv_desc())]);

    let rows = run_query(
        &tc,
        single_fragment_plan(root),
        common::scan_locations_for(1, vec![whole_file_range("f", 5, "coord")]),
    );
    let numbers: Vec<i64> = rows
        .iter()
        .map(|r| r[2].as_bigint().expect("bigint"))
        .collect();
    assert_eq!(numbers, vec![1, 2, 1, 2, 3]);
}
