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

//! Process-lifecycle environment of one backend. Everything that would
//! otherwise be a global singleton (process memory tracker, the exchange
//! registry, the RPC client, thread pools, the periodic counter updater)
//! is owned here and passed by reference.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use threadpool::ThreadPool;

use crate::common::config::EngineConfig;
use crate::common::logging::debug;
use crate::common::status::{Result, Status};
use crate::common::types::{BackendAddress, QueryId};
use crate::exec::scan_node::ScanProvider;
use crate::runtime::data_stream_mgr::DataStreamMgr;
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::profile::RuntimeProfile;
use crate::service::rpc::{ClusterClient, ClusterMembership};

pub struct ExecEnv {
    config: EngineConfig,
    address: BackendAddress,
    process_tracker: Arc<MemTracker>,
    stream_mgr: Arc<DataStreamMgr>,
    cluster: Arc<dyn ClusterClient>,
    membership: Arc<ClusterMembership>,
    pool: ThreadPool,
    query_trackers: Mutex<HashMap<QueryId, Weak<MemTracker>>>,
    scan_providers: Mutex<HashMap<String, Arc<dyn ScanProvider>>>,
    sampled_profiles: Mutex<Vec<(RuntimeProfile, Arc<AtomicBool>)>>,
    stopped: AtomicBool,
}

impl ExecEnv {
    pub fn new(
        config: EngineConfig,
        address: BackendAddress,
        cluster: Arc<dyn ClusterClient>,
        membership: Arc<ClusterMembership>,
    ) -> Arc<Self> {
        let stream_mgr = DataStreamMgr::new(
            Duration::from_millis(config.runtime.cancel_check_interval_ms),
            Duration::from_millis(config.runtime.exchange_receive_timeout_ms),
        );
        let pool = ThreadPool::with_name(
            format!("exec-{}", address.port),
            config.runtime.exec_threads.max(2),
        );
        let sample_interval = Duration::from_millis(config.runtime.counter_sample_interval_ms);
        let env = Arc::new(Self {
            config,
            address,
            process_tracker: MemTracker::new_root("process", None),
            stream_mgr,
            cluster,
            membership,
            pool,
            query_trackers: Mutex::new(HashMap::new()),
            scan_providers: Mutex::new(HashMap::new()),
            sampled_profiles: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        });

        // Periodic counter updater: one thread drives every registered
        // profile's rate/sample counters.
        let weak = Arc::downgrade(&env);
        thread::Builder::new()
            .name("counter-sampler".to_string())
            .spawn(move || loop {
                thread::sleep(sample_interval);
                let Some(env) = weak.upgrade() else {
                    return;
                };
                if env.stopped.load(Ordering::Acquire) {
                    return;
                }
                env.sample_registered_profiles();
            })
            .expect("spawn counter sampler");

        env
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn address(&self) -> &BackendAddress {
        &self.address
    }

    pub fn process_mem_tracker(&self) -> Arc<MemTracker> {
        Arc::clone(&self.process_tracker)
    }

    pub fn stream_mgr(&self) -> Arc<DataStreamMgr> {
        Arc::clone(&self.stream_mgr)
    }

    pub fn cluster(&self) -> Arc<dyn ClusterClient> {
        Arc::clone(&self.cluster)
    }

    pub fn membership(&self) -> Arc<ClusterMembership> {
        Arc::clone(&self.membership)
    }

    pub fn cancel_check_interval(&self) -> Duration {
        Duration::from_millis(self.config.runtime.cancel_check_interval_ms)
    }

    /// Run `task` on the shared fragment-exec pool.
    pub fn spawn(&self, task: impl FnOnce() + Send + 'static) {
        self.pool.execute(task);
    }

    /// The per-query tracker shared by all fragment instances of `query_id`
    /// on this backend. Reference-counted: the tracker dies with the last
    /// instance holding it, and the registry entry is reaped lazily.
    pub fn query_mem_tracker(&self, query_id: QueryId, limit: Option<i64>) -> Arc<MemTracker> {
        let mut guard = self.query_trackers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = guard.get(&query_id).and_then(Weak::upgrade) {
            return existing;
        }
        let tracker = MemTracker::new_child(
            format!("query {query_id}"),
            limit,
            &self.process_tracker,
        );
        guard.insert(query_id, Arc::downgrade(&tracker));
        guard.retain(|_, weak| weak.strong_count() > 0);
        tracker
    }

    pub fn register_scan_provider(&self, table: impl Into<String>, provider: Arc<dyn ScanProvider>) {
        let mut guard = self.scan_providers.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(table.into(), provider);
    }

    pub fn scan_provider(&self, table: &str) -> Result<Arc<dyn ScanProvider>> {
        let guard = self.scan_providers.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .get(table)
            .cloned()
            .ok_or_else(|| Status::internal(format!("no scan provider registered for table {table}")))
    }

    /// Register a profile for periodic time-series sampling; sampling stops
    /// once `active` is cleared and the entry is reaped.
    pub fn register_profile_for_sampling(&self, profile: RuntimeProfile, active: Arc<AtomicBool>) {
        let mut guard = self
            .sampled_profiles
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        guard.push((profile, active));
    }

    fn sample_registered_profiles(&self) {
        let mut guard = self
            .sampled_profiles
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        guard.retain(|(profile, active)| {
            if !active.load(Ordering::Acquire) {
                return false;
            }
            profile.sample_time_series();
            true
        });
    }

    pub fn shutdown(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            debug!("exec env shutting down: {}", self.address);
        }
        self.pool.join();
    }
}

impl Drop for ExecEnv {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::Release);
    }
}
