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
//! End-to-end distributed execution tests against the in-process cluster.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use kestrel::common::config::QueryOptions;
use kestrel::exec::scan_node::MemTableProvider;
use kestrel::plan::builder;
use kestrel::runtime::coordinator::QueryState;
use kestrel::runtime::descriptors::Datum;
use kestrel::runtime::profile::ProfileSnapshot;
use kestrel::service::query_exec_state::{QueryExecRequest, ResultSet};
use kestrel::StatusCode;

use common::{
    default_options, kv_desc, kv_rows, scan_locations_for, whole_file_range, TestCluster,
};

fn counter_sum(profile: &ProfileSnapshot, name: &str) -> i64 {
    let mut total = profile.counter_value(name).unwrap_or(0);
    for child in &profile.children {
        total += counter_sum(child, name);
    }
    total
}

fn fetch_all(tc: &TestCluster, query_id: kestrel::QueryId) -> Vec<Vec<Datum>> {
    let mut out = Vec::new();
    loop {
        match tc.sessions.fetch(query_id, 1024).expect("fetch") {
            ResultSet::Rows { rows, eos } => {
                out.extend(rows);
                if eos {
                    return out;
                }
            }
            other => panic!("unexpected result shape: {other:?}"),
        }
    }
}

#[test]
fn limit_zero_ships_no_batches() {
    let tc = TestCluster::new(2);
    let table = MemTableProvider::new();
    table.add_file("f1", kv_rows(5000, 7));
    table.add_file("f2", kv_rows(3000, 7));
    tc.register_table("t", table);

    let session = tc.sessions.open_session();
    let query_id = tc
        .sessions
        .submit(
            session,
            QueryExecRequest {
                plan: builder::scan_plan("t", kv_desc(), vec![], Some(0)),
                scan_locations: scan_locations_for(
                    1,
                    vec![
                        whole_file_range("f1", 5000, "worker-1"),
                        whole_file_range("f2", 3000, "worker-2"),
                    ],
                ),
                options: default_options(),
            },
        )
        .expect("submit");

    // Client sees eos on the first fetch.
    match tc.sessions.fetch(query_id, 100).expect("fetch") {
        ResultSet::Rows { rows, eos } => {
            assert!(rows.is_empty());
            assert!(eos);
        }
        other => panic!("unexpected result shape: {other:?}"),
    }
    tc.sessions
        .wait(query_id, Duration::from_secs(20))
        .expect("wait");

    let profile = tc.sessions.query(query_id).expect("query").profile();
    assert_eq!(counter_sum(&profile, "BytesSent"), 0);
    assert_eq!(counter_sum(&profile, "BatchesSent"), 0);
    assert_eq!(counter_sum(&profile, "RowsFetched"), 0);
    tc.sessions.close(query_id).expect("close");
}

#[test]
fn count_star_sums_per_worker_partials() {
    let tc = TestCluster::new(2);
    let table = MemTableProvider::new();
    table.add_file("f1", kv_rows(1000, 7));
    table.add_file("f2", kv_rows(400, 7));
    tc.register_table("t", table);

    let session = tc.sessions.open_session();
    let query_id = tc
        .sessions
        .submit(
            session,
            QueryExecRequest {
                plan: builder::count_star_plan("t", kv_desc()),
                scan_locations: scan_locations_for(
                    2,
                    vec![
                        whole_file_range("f1", 1000, "worker-1"),
                        whole_file_range("f2", 400, "worker-2"),
                    ],
                ),
                options: default_options(),
            },
        )
        .expect("submit");

    let rows = fetch_all(&tc, query_id);
    assert_eq!(rows, vec![vec![Datum::BigInt(1400)]]);

    assert_eq!(
        tc.sessions
            .wait(query_id, Duration::from_secs(20))
            .expect("wait"),
        QueryState::Finished
    );
    let profile = tc.sessions.query(query_id).expect("query").profile();
    // Two partial batches crossed the wire (one per scan instance), and
    // bytes are conserved across the exchange.
    assert_eq!(counter_sum(&profile, "BatchesReceived"), 2);
    assert_eq!(
        counter_sum(&profile, "BytesSent"),
        counter_sum(&profile, "BytesReceived")
    );
    assert!(counter_sum(&profile, "BytesSent") > 0);
    tc.sessions.close(query_id).expect("close");
}

#[test]
fn grouped_aggregation_partitions_keys_disjointly() {
    let distinct = 23usize;
    let tc = TestCluster::new(2);
    let table = MemTableProvider::new();
    table.add_file("f1", kv_rows(6000, distinct));
    table.add_file("f2", kv_rows(4000, distinct));
    tc.register_table("t", table);

    let session = tc.sessions.open_session();
    let query_id = tc
        .sessions
        .submit(
            session,
            QueryExecRequest {
                plan: builder::grouped_agg_plan("t", kv_desc(), 0, 1),
                scan_locations: scan_locations_for(
                    4,
                    vec![
                        whole_file_range("f1", 6000, "worker-1"),
                        whole_file_range("f2", 4000, "worker-2"),
                    ],
                ),
                options: default_options(),
            },
        )
        .expect("submit");

    let rows = fetch_all(&tc, query_id);
    tc.sessions
        .wait(query_id, Duration::from_secs(20))
        .expect("wait");

    // Expected per-key sums over both files.
    let mut expected: HashMap<String, i64> = HashMap::new();
    for rows_src in [kv_rows(6000, distinct), kv_rows(4000, distinct)] {
        for row in rows_src {
            let (Datum::Varchar(k), Datum::BigInt(v)) = (&row[0], &row[1]) else {
                unreachable!()
            };
            *expected.entry(k.clone()).or_insert(0) += *v;
        }
    }

    // Union of output keys equals the distinct key set, each exactly once:
    // a key landing in two aggregate instances would surface twice.
    let mut seen: HashMap<String, i64> = HashMap::new();
    for row in &rows {
        let (Datum::Varchar(k), Datum::BigInt(v)) = (&row[0], &row[1]) else {
            panic!("unexpected row shape: {row:?}")
        };
        assert!(
            seen.insert(k.clone(), *v).is_none(),
            "key {k} appeared in two aggregate outputs"
        );
    }
    assert_eq!(seen, expected);
    tc.sessions.close(query_id).expect("close");
}

#[test]
fn cancel_after_first_batch_releases_everything() {
    let tc = TestCluster::new(2);
    let table = MemTableProvider::new();
    table.add_file("f1", kv_rows(20_000, 7));
    table.add_file("f2", kv_rows(20_000, 7));
    tc.register_table("t", table);

    let session = tc.sessions.open_session();
    let query_id = tc
        .sessions
        .submit(
            session,
            QueryExecRequest {
                plan: builder::scan_plan("t", kv_desc(), vec![], None),
                scan_locations: scan_locations_for(
                    1,
                    vec![
                        whole_file_range("f1", 20_000, "worker-1"),
                        whole_file_range("f2", 20_000, "worker-2"),
                    ],
                ),
                options: default_options(),
            },
        )
        .expect("submit");

    // One batch for the client, then cancel.
    match tc.sessions.fetch(query_id, 256).expect("first fetch") {
        ResultSet::Rows { rows, .. } => assert!(!rows.is_empty()),
        other => panic!("unexpected result shape: {other:?}"),
    }
    tc.sessions.cancel(query_id).expect("cancel");
    // Cancel is idempotent.
    tc.sessions.cancel(query_id).expect("cancel again");

    let state = tc
        .sessions
        .wait(query_id, Duration::from_secs(20))
        .expect("all instances report done");
    assert_eq!(state, QueryState::Cancelled);

    let err = tc.sessions.fetch(query_id, 256).expect_err("cancelled");
    assert_eq!(err.code, StatusCode::Cancelled);

    tc.sessions.close(query_id).expect("close");
    assert!(
        tc.wait_for_no_active_fragments(Duration::from_secs(10)),
        "orphan fragments survived cancellation"
    );
    assert!(
        tc.wait_for_zero_tracked_bytes(Duration::from_secs(10)),
        "tracked bytes did not return to pre-query level: {}",
        tc.total_tracked_bytes()
    );
}

#[test]
fn mem_limit_aborts_hash_join_build() {
    let tc = TestCluster::new(1);
    let left = MemTableProvider::new();
    left.add_file("l", kv_rows(10, 5));
    tc.register_table("t_left", left);

    // Build side far beyond the 1 MiB query limit.
    let right = MemTableProvider::new();
    right.add_file(
        "r",
        (0..20_000)
            .map(|i| {
                vec![
                    Datum::Varchar(format!("{i:0>100}")),
                    Datum::BigInt(i),
                ]
            })
            .collect(),
    );
    tc.register_table("t_right", right);

    let options = QueryOptions {
        mem_limit: 1024 * 1024,
        ..default_options()
    };
    let mut scan_locations = HashMap::new();
    scan_locations.insert(1, vec![whole_file_range("l", 10, "coord")]);
    scan_locations.insert(2, vec![whole_file_range("r", 20_000, "coord")]);

    let session = tc.sessions.open_session();
    let query_id = tc
        .sessions
        .submit(
            session,
            QueryExecRequest {
                plan: builder::hash_join_plan("t_left", kv_desc(), "t_right", kv_desc(), 1, 1),
                scan_locations,
                options,
            },
        )
        .expect("submit");

    let err = loop {
        match tc.sessions.fetch(query_id, 256) {
            Ok(ResultSet::Rows { eos: false, .. }) => continue,
            Ok(other) => panic!("query should have failed, got {other:?}"),
            Err(err) => break err,
        }
    };
    assert_eq!(err.code, StatusCode::MemLimitExceeded);
    assert!(
        err.message.contains("memory limit exceeded"),
        "message: {}",
        err.message
    );
    // The offending tracker is named in the surfaced error.
    let all = format!("{} {}", err.message, err.details.join(" "));
    assert!(all.contains("tracker=query"), "error log: {all}");

    let _ = tc.sessions.wait(query_id, Duration::from_secs(20));
    tc.sessions.close(query_id).expect("close");
    assert!(tc.wait_for_zero_tracked_bytes(Duration::from_secs(10)));
}

#[test]
fn worker_exit_during_exec_fails_the_query() {
    let tc = TestCluster::new(2);
    let table = MemTableProvider::new();
    table.add_file("f1", kv_rows(80_000, 31));
    table.add_file("f2", kv_rows(80_000, 31));
    tc.register_table("t", table);

    let session = tc.sessions.open_session();
    let query_id = tc
        .sessions
        .submit(
            session,
            QueryExecRequest {
                plan: builder::grouped_agg_plan("t", kv_desc(), 0, 1),
                scan_locations: scan_locations_for(
                    4,
                    vec![
                        whole_file_range("f1", 80_000, "worker-1"),
                        whole_file_range("f2", 80_000, "worker-2"),
                    ],
                ),
                options: default_options(),
            },
        )
        .expect("submit");

    // Let the scans get going, then take a worker down mid-flight.
    std::thread::sleep(Duration::from_millis(10));
    tc.kill_worker(2);

    let err = loop {
        match tc.sessions.fetch(query_id, 1024) {
            Ok(ResultSet::Rows { eos: false, .. }) => continue,
            Ok(other) => panic!("query should have failed, got {other:?}"),
            Err(err) => break err,
        }
    };
    assert_eq!(err.code, StatusCode::InternalError);

    let _ = tc.sessions.wait(query_id, Duration::from_secs(30));
    tc.sessions.close(query_id).expect("close");
}

#[test]
fn worker_missing_at_prepare_fails_with_no_orphans() {
    let tc = TestCluster::new(2);
    let table = MemTableProvider::new();
    table.add_file("f1", kv_rows(1000, 7));
    table.add_file("f2", kv_rows(1000, 7));
    tc.register_table("t", table);

    // The worker drops off the transport but the membership snapshot has
    // not caught up, so the scheduler still targets it.
    tc.cluster.remove(&tc.backends[2].0);

    let session = tc.sessions.open_session();
    let err = tc
        .sessions
        .submit(
            session,
            QueryExecRequest {
                plan: builder::count_star_plan("t", kv_desc()),
                scan_locations: scan_locations_for(
                    2,
                    vec![
                        whole_file_range("f1", 1000, "worker-1"),
                        whole_file_range("f2", 1000, "worker-2"),
                    ],
                ),
                options: default_options(),
            },
        )
        .expect_err("prepare against a vanished worker must fail");
    assert_eq!(err.code, StatusCode::InternalError);

    assert!(
        tc.wait_for_no_active_fragments(Duration::from_secs(10)),
        "orphan fragments on surviving workers"
    );
}

#[test]
fn empty_input_reports_eos_immediately() {
    let tc = TestCluster::new(2);
    let table = MemTableProvider::new();
    table.add_file("f1", Vec::new());
    tc.register_table("t", table);

    let session = tc.sessions.open_session();
    let query_id = tc
        .sessions
        .submit(
            session,
            QueryExecRequest {
                plan: builder::scan_plan("t", kv_desc(), vec![], None),
                scan_locations: scan_locations_for(
                    1,
                    vec![whole_file_range("f1", 0, "worker-1")],
                ),
                options: default_options(),
            },
        )
        .expect("submit");

    let rows = fetch_all(&tc, query_id);
    assert!(rows.is_empty());
    tc.sessions
        .wait(query_id, Duration::from_secs(20))
        .expect("wait");
    tc.sessions.close(query_id).expect("close");
}

#[test]
fn conjuncts_filter_on_the_workers() {
    use kestrel::exprs::{CmpOp, Expr};

    let tc = TestCluster::new(2);
    let table = MemTableProvider::new();
    table.add_file("f1", kv_rows(1000, 7));
    tc.register_table("t", table);

    // b >= 990
    let conjunct = Expr::cmp(
        CmpOp::Ge,
        Expr::slot(1),
        Expr::lit(Datum::BigInt(990)),
    );
    let session = tc.sessions.open_session();
    let query_id = tc
        .sessions
        .submit(
            session,
            QueryExecRequest {
                plan: builder::scan_plan("t", kv_desc(), vec![conjunct], None),
                scan_locations: scan_locations_for(
                    1,
                    vec![whole_file_range("f1", 1000, "worker-1")],
                ),
                options: default_options(),
            },
        )
        .expect("submit");

    let rows = fetch_all(&tc, query_id);
    assert_eq!(rows.len(), 10);
    assert!(rows
        .iter()
        .all(|r| matches!(r[1], Datum::BigInt(v) if v >= 990)));
    tc.sessions
        .wait(query_id, Duration::from_secs(20))
        .expect("wait");
    tc.sessions.close(query_id).expect("close");
}
