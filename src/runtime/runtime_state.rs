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

//! Per-fragment-instance execution context: query options, the tracker
//! chain, the cancel flag and the error log. Exclusively owned by one
//! fragment executor and lent to its operator tree.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::common::config::QueryOptions;
use crate::common::status::ErrorLog;
use crate::common::types::{FragmentInstanceId, QueryId};
use crate::plan::ScanRange;
use crate::runtime::exec_env::ExecEnv;
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::profile::RuntimeProfile;
use crate::service::rpc::{ExecPlanFragmentRequest, FragmentDestination};

pub struct RuntimeState {
    env: Arc<ExecEnv>,
    query_id: QueryId,
    fragment_instance_id: FragmentInstanceId,
    backend_num: i32,
    options: QueryOptions,
    query_tracker: Arc<MemTracker>,
    instance_tracker: Arc<MemTracker>,
    profile: RuntimeProfile,
    cancel_flag: Arc<AtomicBool>,
    error_log: Mutex<ErrorLog>,
    scan_ranges: HashMap<i32, Vec<ScanRange>>,
    num_senders: HashMap<i32, usize>,
    destinations: Vec<FragmentDestination>,
}

impl RuntimeState {
    pub fn new(env: Arc<ExecEnv>, req: &ExecPlanFragmentRequest) -> Self {
        let query_tracker = env.query_mem_tracker(req.query_id, req.options.mem_limit_bytes());
        let instance_tracker = MemTracker::new_child(
            format!("fragment instance {}", req.instance_id),
            None,
            &query_tracker,
        );
        let profile = RuntimeProfile::new(format!("Fragment {}", req.fragment_idx));
        let max_errors = req.options.max_errors;
        Self {
            env,
            query_id: req.query_id,
            fragment_instance_id: req.instance_id,
            backend_num: req.backend_num,
            options: req.options.clone(),
            query_tracker,
            instance_tracker,
            profile,
            cancel_flag: Arc::new(AtomicBool::new(false)),
            error_log: Mutex::new(ErrorLog::new(max_errors)),
            scan_ranges: req.scan_ranges.clone(),
            num_senders: req.num_senders.clone(),
            destinations: req.destinations.clone(),
        }
    }

    pub fn env(&self) -> &Arc<ExecEnv> {
        &self.env
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn fragment_instance_id(&self) -> FragmentInstanceId {
        self.fragment_instance_id
    }

    /// Worker number within the query; also the sender index of this
    /// instance's sink channels.
    pub fn backend_num(&self) -> i32 {
        self.backend_num
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    pub fn batch_size(&self) -> usize {
        self.options.batch_size
    }

    pub fn query_mem_tracker(&self) -> &Arc<MemTracker> {
        &self.query_tracker
    }

    pub fn instance_mem_tracker(&self) -> &Arc<MemTracker> {
        &self.instance_tracker
    }

    pub fn profile(&self) -> &RuntimeProfile {
        &self.profile
    }

    pub fn cancel_flag(&self) -> &Arc<AtomicBool> {
        &self.cancel_flag
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_flag.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::Release);
    }

    pub fn cancel_check_interval(&self) -> Duration {
        self.env.cancel_check_interval()
    }

    pub fn log_error(&self, line: impl Into<String>) {
        let mut guard = self.error_log.lock().unwrap_or_else(|e| e.into_inner());
        guard.add(line);
    }

    /// Error lines appended since `mark`; returns the new mark.
    pub fn error_log_delta(&self, mark: usize) -> (Vec<String>, usize) {
        let guard = self.error_log.lock().unwrap_or_else(|e| e.into_inner());
        guard.delta_since(mark)
    }

    pub fn scan_ranges(&self, node_id: i32) -> &[ScanRange] {
        self.scan_ranges
            .get(&node_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn num_senders(&self, node_id: i32) -> usize {
        self.num_senders.get(&node_id).copied().unwrap_or(0)
    }

    pub fn destinations(&self) -> &[FragmentDestination] {
        &self.destinations
    }
}
