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

//! kestreld demo entry point: boots a single-process three-backend cluster,
//! loads a small in-memory table, runs a distributed aggregation and prints
//! the result set with the aggregated query profile.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};

use kestrel::common::config::{EngineConfig, QueryOptions};
use kestrel::common::logging;
use kestrel::common::types::BackendAddress;
use kestrel::exec::scan_node::MemTableProvider;
use kestrel::plan::{builder, ScanRange};
use kestrel::runtime::coordinator::CoordinatorRegistry;
use kestrel::runtime::descriptors::{ColumnType, Datum, TupleDescriptor};
use kestrel::runtime::exec_env::ExecEnv;
use kestrel::service::backend_service::BackendServer;
use kestrel::service::query_exec_state::{QueryExecRequest, ResultSet};
use kestrel::service::rpc::{BackendDescriptor, ClusterMembership, InProcessCluster};
use kestrel::service::session::SessionManager;

fn main() -> anyhow::Result<()> {
    let config = EngineConfig::load_from_env_or_default().context("load configuration")?;
    logging::init_with_level(&config.effective_log_filter());

    let cluster = InProcessCluster::new();
    let membership = ClusterMembership::new();
    let hosts = ["coord", "worker-1", "worker-2"];
    let mut backends = Vec::new();
    let mut envs = Vec::new();
    for (i, host) in hosts.iter().enumerate() {
        let address = BackendAddress::new(*host, config.server.backend_port + i as u16);
        let env = ExecEnv::new(
            config.clone(),
            address.clone(),
            cluster.clone(),
            Arc::clone(&membership),
        );
        let server = BackendServer::new(Arc::clone(&env), CoordinatorRegistry::new());
        cluster.register(address.clone(), server.clone());
        backends.push((address.clone(), server));
        envs.push(env);
        membership.update(
            backends
                .iter()
                .map(|(addr, _)| BackendDescriptor {
                    address: addr.clone(),
                    hostname: addr.host.clone(),
                })
                .collect(),
        );
    }

    // One in-memory table, two files, one per worker.
    let desc = TupleDescriptor::new(vec![ColumnType::Varchar, ColumnType::BigInt]);
    let table = MemTableProvider::new();
    table.add_file(
        "part-1",
        (0..1000)
            .map(|i| vec![Datum::Varchar(format!("k{}", i % 7)), Datum::BigInt(i)])
            .collect(),
    );
    table.add_file(
        "part-2",
        (0..400)
            .map(|i| vec![Datum::Varchar(format!("k{}", i % 7)), Datum::BigInt(i)])
            .collect(),
    );
    for env in &envs {
        env.register_scan_provider("t", table.clone());
    }

    let coord_server = backends[0].1.clone();
    let sessions = SessionManager::new(
        Arc::clone(coord_server.env()),
        Arc::clone(coord_server.coordinators()),
        None,
    );

    let plan = builder::count_star_plan("t", desc);
    let mut scan_locations = HashMap::new();
    scan_locations.insert(
        2,
        vec![
            ScanRange {
                file: "part-1".to_string(),
                offset: 0,
                length: 1000,
                replicas: vec!["worker-1".to_string()],
            },
            ScanRange {
                file: "part-2".to_string(),
                offset: 0,
                length: 400,
                replicas: vec!["worker-2".to_string()],
            },
        ],
    );

    let session = sessions.open_session();
    let query_id = sessions
        .submit(
            session,
            QueryExecRequest {
                plan,
                scan_locations,
                options: QueryOptions::default(),
            },
        )
        .map_err(|e| anyhow!("submit failed: {e}"))?;

    match sessions
        .fetch(query_id, 1024)
        .map_err(|e| anyhow!("fetch failed: {e}"))?
    {
        ResultSet::Rows { rows, eos } => {
            for row in &rows {
                println!("{row:?}");
            }
            println!("eos={eos}");
        }
        other => println!("{other:?}"),
    }
    sessions
        .wait(query_id, Duration::from_secs(30))
        .map_err(|e| anyhow!("wait failed: {e}"))?;

    let profile = sessions
        .query(query_id)
        .map_err(|e| anyhow!("query lookup failed: {e}"))?
        .profile();
    println!("{}", profile.pretty_print());

    sessions.close(query_id).ok();
    sessions.close_session(session);
    sessions.shutdown();
    Ok(())
}
