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
//! In-process multi-backend cluster fixture shared by integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kestrel::common::config::{EngineConfig, QueryOptions};
use kestrel::common::types::BackendAddress;
use kestrel::exec::scan_node::{MemTableProvider, ScanProvider};
use kestrel::plan::ScanRange;
use kestrel::runtime::coordinator::CoordinatorRegistry;
use kestrel::runtime::descriptors::{ColumnType, Datum, TupleDescriptor};
use kestrel::runtime::exec_env::ExecEnv;
use kestrel::service::backend_service::BackendServer;
use kestrel::service::rpc::{BackendDescriptor, ClusterMembership, InProcessCluster};
use kestrel::service::session::SessionManager;

pub struct TestCluster {
    pub cluster: Arc<InProcessCluster>,
    pub membership: Arc<ClusterMembership>,
    /// Index 0 is the coordinator, the rest are workers 1..n.
    pub backends: Vec<(BackendAddress, Arc<BackendServer>)>,
    pub sessions: Arc<SessionManager>,
}

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.runtime.exec_threads = 4;
    config.runtime.cancel_check_interval_ms = 20;
    config.runtime.counter_sample_interval_ms = 100;
    config.runtime.exchange_receive_timeout_ms = 5_000;
    config
}

impl TestCluster {
    /// Coordinator plus `num_workers` workers, wired through the in-process
    /// transport.
    pub fn new(num_workers: usize) -> Self {
        kestrel::kestrel_logging::init_with_level("warn");
        let cluster = InProcessCluster::new();
        let membership = ClusterMembership::new();
        let config = test_config();

        let mut backends = Vec::new();
        let mut hostnames = vec!["coord".to_string()];
        for i in 1..=num_workers {
            hostnames.push(format!("worker-{i}"));
        }
        for (i, host) in hostnames.iter().enumerate() {
            let address = BackendAddress::new(host.clone(), 21000 + i as u16);
            let env = ExecEnv::new(
                config.clone(),
                address.clone(),
                cluster.clone(),
                Arc::clone(&membership),
            );
            let server = BackendServer::new(env, CoordinatorRegistry::new());
            cluster.register(address.clone(), server.clone());
            backends.push((address, server));
        }
        membership.update(
            backends
                .iter()
                .map(|(addr, _)| BackendDescriptor {
                    address: addr.clone(),
                    hostname: addr.host.clone(),
                })
                .collect(),
        );

        let coord = backends[0].1.clone();
        let sessions = SessionManager::new(
            Arc::clone(coord.env()),
            Arc::clone(coord.coordinators()),
            None,
        );
        Self {
            cluster,
            membership,
            backends,
            sessions,
        }
    }

    pub fn coordinator_address(&self) -> BackendAddress {
        self.backends[0].0.clone()
    }

    pub fn worker_hostname(&self, i: usize) -> String {
        format!("worker-{i}")
    }

    pub fn register_table(&self, name: &str, provider: Arc<MemTableProvider>) {
        for (_, server) in &self.backends {
            let p: Arc<dyn ScanProvider> = provider.clone();
            server.env().register_scan_provider(name, p);
        }
    }

    /// Simulate a worker process exit: unreachable over the transport and
    /// gone from membership. In-flight sends to it fail transiently.
    pub fn kill_worker(&self, i: usize) {
        let addr = self.backends[i].0.clone();
        self.cluster.remove(&addr);
        self.membership.remove(&addr);
    }

    /// Sum of current consumption across every backend's process tracker.
    pub fn total_tracked_bytes(&self) -> i64 {
        self.backends
            .iter()
            .map(|(_, s)| s.env().process_mem_tracker().consumption())
            .sum()
    }

    /// Poll until all process trackers drain back to zero.
    pub fn wait_for_zero_tracked_bytes(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.total_tracked_bytes() == 0 {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    /// Poll until no backend holds an active fragment.
    pub fn wait_for_no_active_fragments(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self
                .backends
                .iter()
                .all(|(_, s)| s.num_active_fragments() == 0)
            {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }
}

pub fn kv_desc() -> TupleDescriptor {
    TupleDescriptor::new(vec![ColumnType::Varchar, ColumnType::BigInt])
}

/// (key, value) rows: key cycles over `distinct_keys`, value is the row
/// index.
pub fn kv_rows(n: usize, distinct_keys: usize) -> Vec<Vec<Datum>> {
    (0..n)
        .map(|i| {
            vec![
                Datum::Varchar(format!("k{}", i % distinct_keys.max(1))),
                Datum::BigInt(i as i64),
            ]
        })
        .collect()
}

/// One scan range covering all `rows` of `file`, replicated on `host`.
pub fn whole_file_range(file: &str, rows: usize, host: &str) -> ScanRange {
    ScanRange {
        file: file.to_string(),
        offset: 0,
        length: rows as u64,
        replicas: vec![host.to_string()],
    }
}

pub fn default_options() -> QueryOptions {
    QueryOptions {
        fetch_timeout_ms: 30_000,
        ..QueryOptions::default()
    }
}

pub fn scan_locations_for(
    node_id: i32,
    ranges: Vec<ScanRange>,
) -> HashMap<i32, Vec<ScanRange>> {
    let mut map = HashMap::new();
    map.insert(node_id, ranges);
    map
}
