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

//! Per-query orchestrator on the client-facing node: schedules, fans out
//! prepare and exec RPCs, runs the coordinator-local root instance, merges
//! status reports (first error wins), broadcasts idempotent cancellation,
//! and feeds the client fetch queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::common::config::QueryOptions;
use crate::common::logging::{debug, info, warn};
use crate::common::status::{ErrorLog, Result, Status, StatusCode};
use crate::common::types::{FragmentInstanceId, QueryId};
use crate::plan::{QueryPlan, ScanRange};
use crate::runtime::descriptors::Datum;
use crate::runtime::exec_env::ExecEnv;
use crate::runtime::fragment_executor::FragmentExecutor;
use crate::runtime::profile::{AggregatedProfile, ProfileSnapshot};
use crate::runtime::result_queue::ResultQueue;
use crate::runtime::scheduler::{
    QuerySchedule, ReservationRequest, ResourceBroker, Scheduler,
};
use crate::service::rpc::{
    CancelInstanceRequest, ExecInstanceRequest, ExecPlanFragmentRequest, InsertStats,
    ReportExecStatusRequest, RPC_VERSION,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum QueryState {
    Created,
    Running,
    Finished,
    Cancelled,
    Failed,
}

struct InstanceStatus {
    backend: crate::common::types::BackendAddress,
    done: bool,
    last_seq: u64,
}

struct CoordInner {
    state: QueryState,
    instances: HashMap<FragmentInstanceId, InstanceStatus>,
    latched: Option<Status>,
    error_log: ErrorLog,
    insert_stats: InsertStats,
    num_done: usize,
}

/// Routes worker status reports to the owning coordinator on this backend.
#[derive(Default)]
pub struct CoordinatorRegistry {
    coordinators: Mutex<HashMap<QueryId, Weak<Coordinator>>>,
}

impl CoordinatorRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, query_id: QueryId, coordinator: &Arc<Coordinator>) {
        let mut guard = self.coordinators.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(query_id, Arc::downgrade(coordinator));
        guard.retain(|_, weak| weak.strong_count() > 0);
    }

    pub fn unregister(&self, query_id: QueryId) {
        let mut guard = self.coordinators.lock().unwrap_or_else(|e| e.into_inner());
        guard.remove(&query_id);
    }

    pub fn lookup(&self, query_id: QueryId) -> Option<Arc<Coordinator>> {
        let guard = self.coordinators.lock().unwrap_or_else(|e| e.into_inner());
        guard.get(&query_id).and_then(Weak::upgrade)
    }
}

pub struct Coordinator {
    env: Arc<ExecEnv>,
    query_id: QueryId,
    plan: QueryPlan,
    options: QueryOptions,
    registry: Arc<CoordinatorRegistry>,
    broker: Option<Arc<dyn ResourceBroker>>,
    result_queue: Arc<ResultQueue>,
    profile: AggregatedProfile,
    inner: Mutex<CoordInner>,
    done_cv: Condvar,
    cancel_issued: AtomicBool,
    schedule: Mutex<Option<QuerySchedule>>,
    local_executor: Mutex<Option<Arc<FragmentExecutor>>>,
    exec_start: Mutex<Option<Instant>>,
}

impl Coordinator {
    pub fn new(
        env: Arc<ExecEnv>,
        query_id: QueryId,
        plan: QueryPlan,
        options: QueryOptions,
        registry: Arc<CoordinatorRegistry>,
        broker: Option<Arc<dyn ResourceBroker>>,
    ) -> Arc<Self> {
        let max_errors = options.max_errors;
        let result_queue = ResultQueue::new(
            options.batch_size.max(1024) * 4,
            env.cancel_check_interval(),
        );
        Arc::new(Self {
            env,
            query_id,
            plan,
            options,
            registry,
            broker,
            result_queue,
            profile: AggregatedProfile::new(),
            inner: Mutex::new(CoordInner {
                state: QueryState::Created,
                instances: HashMap::new(),
                latched: None,
                error_log: ErrorLog::new(max_errors),
                insert_stats: InsertStats::default(),
                num_done: 0,
            }),
            done_cv: Condvar::new(),
            cancel_issued: AtomicBool::new(false),
            schedule: Mutex::new(None),
            local_executor: Mutex::new(None),
            exec_start: Mutex::new(None),
        })
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn state(&self) -> QueryState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    /// Schedule the query and start every fragment instance. On return the
    /// query is running and rows flow into the result queue.
    pub fn exec(
        self: &Arc<Self>,
        scan_locations: &HashMap<i32, Vec<ScanRange>>,
    ) -> Result<()> {
        self.options.validate()?;
        self.plan.validate()?;
        *self.exec_start.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());

        let (membership_version, membership) = self.env.membership().snapshot();
        let scheduler = Scheduler::new(self.env.address().clone());
        let schedule =
            scheduler.schedule(self.query_id, &self.plan, scan_locations, &membership)?;
        debug!(
            "query {} scheduled: {} instances (membership v{})",
            self.query_id,
            schedule.num_instances(),
            membership_version
        );

        if let Some(broker) = &self.broker {
            let request = ReservationRequest {
                instances_per_backend: schedule.instances_per_backend(),
                memory_per_instance_bytes: self.options.mem_limit_bytes().unwrap_or(0),
            };
            let this = Arc::downgrade(self);
            broker.reserve(
                self.query_id,
                &request,
                Box::new(move |status| {
                    if let Some(coord) = this.upgrade() {
                        coord.cancel_with_status(status);
                    }
                }),
            )?;
        }

        self.registry.register(self.query_id, self);
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            for fragment in &schedule.fragments {
                for instance in &fragment.instances {
                    inner.instances.insert(
                        instance.instance_id,
                        InstanceStatus {
                            backend: instance.backend.clone(),
                            done: false,
                            last_seq: 0,
                        },
                    );
                }
            }
            inner.state = QueryState::Running;
        }

        let result = self.start_instances(&schedule);
        *self.schedule.lock().unwrap_or_else(|e| e.into_inner()) = Some(schedule);
        if let Err(err) = result {
            self.cancel_with_status(err.clone());
            return Err(err);
        }
        Ok(())
    }

    /// Prepare everything (parallel), then exec everything. Every exec RPC
    /// is preceded by a successful prepare on that instance.
    fn start_instances(self: &Arc<Self>, schedule: &QuerySchedule) -> Result<()> {
        let mut requests: Vec<(crate::common::types::BackendAddress, ExecPlanFragmentRequest)> =
            Vec::new();
        for fragment in &schedule.fragments {
            let plan_fragment = &self.plan.fragments[fragment.fragment_idx];
            for instance in &fragment.instances {
                requests.push((
                    instance.backend.clone(),
                    ExecPlanFragmentRequest {
                        version: RPC_VERSION,
                        query_id: self.query_id,
                        instance_id: instance.instance_id,
                        fragment_idx: fragment.fragment_idx,
                        fragment: plan_fragment.clone(),
                        backend_num: instance.backend_num,
                        scan_ranges: instance.per_node_scan_ranges.clone(),
                        num_senders: instance.num_senders.clone(),
                        destinations: instance.destinations.clone(),
                        coord: self.env.address().clone(),
                        options: self.options.clone(),
                    },
                ));
            }
        }

        // The root fragment's single instance runs in-process with the
        // result queue attached; everything else goes through the RPC seam.
        let root_instance_id = schedule.fragment(0).instances[0].instance_id;
        let (root_requests, remote_requests): (Vec<_>, Vec<_>) = requests
            .into_iter()
            .partition(|(_, r)| r.instance_id == root_instance_id);

        let local_executor = FragmentExecutor::new(
            Arc::clone(&self.env),
            root_requests.into_iter().next().expect("root instance").1,
            Some(Arc::clone(&self.result_queue)),
        )?;
        local_executor.prepare()?;
        *self
            .local_executor
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&local_executor));

        // Concurrent prepare fan-out; all must acknowledge.
        let (tx, rx) = mpsc::channel::<Result<()>>();
        let num_remote = remote_requests.len();
        for (backend, req) in &remote_requests {
            let backend = backend.clone();
            let req = req.clone();
            let env = Arc::clone(&self.env);
            let tx = tx.clone();
            self.env.spawn(move || {
                let outcome = env
                    .cluster()
                    .backend(&backend)
                    .and_then(|stub| stub.exec_plan_fragment(req));
                let _ = tx.send(outcome);
            });
        }
        drop(tx);
        let mut first_err: Option<Status> = None;
        for _ in 0..num_remote {
            match rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if first_err.is_none() {
                        first_err = Some(err.into_fatal());
                    }
                }
                Err(_) => {
                    if first_err.is_none() {
                        first_err = Some(Status::internal("prepare worker vanished"));
                    }
                }
            }
        }
        if let Some(err) = first_err {
            return Err(err);
        }

        // Exec RPCs, then the local root instance on the shared pool.
        for (backend, req) in &remote_requests {
            let stub = self
                .env
                .cluster()
                .backend(backend)
                .map_err(Status::into_fatal)?;
            stub.exec_instance(ExecInstanceRequest {
                version: RPC_VERSION,
                query_id: self.query_id,
                instance_id: req.instance_id,
            })
            .map_err(Status::into_fatal)?;
        }
        let root = Arc::clone(&local_executor);
        self.env.spawn(move || root.run());
        info!(
            "query {} started: {} remote instances + coordinator instance",
            self.query_id, num_remote
        );
        Ok(())
    }

    /// Merge one worker status report. Tolerates duplicates and reordering
    /// through per-instance sequence numbers; the first non-OK status wins
    /// and triggers cancellation of everything else.
    pub fn report(&self, report: ReportExecStatusRequest) -> Result<()> {
        let mut newly_failed: Option<Status> = None;
        let mut all_done = false;
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let Some(instance) = inner.instances.get_mut(&report.instance_id) else {
                return Err(Status::cancelled(format!(
                    "unknown fragment instance {}",
                    report.instance_id
                )));
            };
            if report.seq <= instance.last_seq {
                debug!(
                    "stale status report dropped: finst={} seq={}",
                    report.instance_id, report.seq
                );
                return Ok(());
            }
            instance.last_seq = report.seq;
            let was_done = instance.done;
            if report.done {
                instance.done = true;
            }
            if report.done && !was_done {
                inner.num_done += 1;
            }
            self.profile.apply(
                report.instance_id.to_string(),
                report.seq,
                report.profile.clone(),
            );
            inner.error_log.merge(&report.error_log_delta);
            if let Some(stats) = &report.insert_stats {
                inner.insert_stats.rows_appended += stats.rows_appended;
                inner.insert_stats.bytes_written += stats.bytes_written;
            }
            if let Some(status) = &report.status {
                if !status.is_cancelled() && inner.latched.is_none() {
                    inner.latched = Some(status.clone());
                    newly_failed = Some(status.clone());
                } else if let Some(latched) = &inner.latched {
                    if status != latched {
                        inner.error_log.add(status.to_string());
                    }
                }
            }
            if inner.num_done == inner.instances.len() {
                all_done = true;
            }
        }

        if let Some(status) = newly_failed {
            warn!(
                "query {} failed by instance {}: {}",
                self.query_id, report.instance_id, status
            );
            self.cancel_with_status(status);
        }
        if all_done {
            self.mark_complete();
        }

        // A latched failure tells still-running instances to stand down.
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match (&inner.latched, report.done) {
            (Some(status), false) => Err(status.clone()),
            _ => Ok(()),
        }
    }

    fn mark_complete(&self) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.state = match &inner.latched {
                None => QueryState::Finished,
                Some(s) if s.is_cancelled() => QueryState::Cancelled,
                Some(_) => QueryState::Failed,
            };
            info!("query {} complete: {:?}", self.query_id, inner.state);
        }
        if let Some(broker) = &self.broker {
            broker.release(self.query_id);
        }
        self.done_cv.notify_all();
    }

    /// Client- or error-initiated cancellation; idempotent.
    pub fn cancel(&self) {
        self.cancel_with_status(Status::cancelled("cancelled by client"));
    }

    pub fn cancel_with_status(&self, status: Status) {
        if self.cancel_issued.swap(true, Ordering::AcqRel) {
            debug!("query {} cancel (again)", self.query_id);
            return;
        }
        info!("query {} cancelling: {}", self.query_id, status);
        let targets = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.latched.is_none() {
                inner.latched = Some(status.clone());
            }
            inner
                .instances
                .iter()
                .filter(|(_, s)| !s.done)
                .map(|(id, s)| (*id, s.backend.clone()))
                .collect::<Vec<_>>()
        };

        // Wake anything blocked on this query's exchanges or fetches.
        self.env.stream_mgr().cancel_query(self.query_id, status.clone());
        self.result_queue.fail(status.clone());
        if let Some(executor) = self
            .local_executor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            executor.cancel(&status.message);
        }

        // Best-effort parallel broadcast; failures only get logged, the
        // final state converges through status reports.
        for (instance_id, backend) in targets {
            let env = Arc::clone(&self.env);
            let query_id = self.query_id;
            let reason = status.message.clone();
            self.env.spawn(move || {
                let outcome = env.cluster().backend(&backend).and_then(|stub| {
                    stub.cancel_instance(CancelInstanceRequest {
                        version: RPC_VERSION,
                        query_id,
                        instance_id,
                        reason: reason.clone(),
                    })
                });
                if let Err(err) = outcome {
                    warn!(
                        "cancel rpc failed: query={} finst={} backend={} err={}",
                        query_id, instance_id, backend, err
                    );
                }
            });
        }
    }

    /// Block until every instance reported done (or the wait times out).
    pub fn wait_completion(&self, timeout: Duration) -> Result<QueryState> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if inner.num_done == inner.instances.len() && !inner.instances.is_empty() {
                // mark_complete may still be in flight on another thread.
                if inner.state == QueryState::Running {
                    inner.state = match &inner.latched {
                        None => QueryState::Finished,
                        Some(s) if s.is_cancelled() => QueryState::Cancelled,
                        Some(_) => QueryState::Failed,
                    };
                }
                return Ok(inner.state);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Status::timed_out("query did not complete in time"));
            }
            let wait = self.env.cancel_check_interval().min(deadline - now);
            let (next, _) = self
                .done_cv
                .wait_timeout(inner, wait)
                .unwrap_or_else(|e| e.into_inner());
            inner = next;
        }
    }

    /// Client fetch path. Blocks until at least one row, eos or error.
    pub fn fetch_rows(&self, max_rows: usize) -> Result<(Vec<Vec<Datum>>, bool)> {
        if let Some(latched) = self.latched_status() {
            if !latched.is_cancelled() || self.state() == QueryState::Cancelled {
                return Err(self.status_with_error_log(latched));
            }
        }
        let timeout = Duration::from_millis(self.options.fetch_timeout_ms.max(1));
        self.result_queue
            .fetch(max_rows, timeout)
            .map_err(|err| self.status_with_error_log(err))
    }

    fn status_with_error_log(&self, mut status: Status) -> Status {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for line in inner.error_log.lines() {
            if *line != status.to_string() && !status.details.contains(line) {
                status.details.push(line.clone());
            }
        }
        status
    }

    pub fn latched_status(&self) -> Option<Status> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .latched
            .clone()
    }

    pub fn error_log(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .error_log
            .lines()
            .to_vec()
    }

    pub fn insert_stats(&self) -> InsertStats {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert_stats
            .clone()
    }

    /// Aggregated profile across all instances, latest report of each.
    pub fn query_profile(&self) -> ProfileSnapshot {
        let mut root = self.profile.render(&format!("Query {}", self.query_id));
        if let Some(start) = *self.exec_start.lock().unwrap_or_else(|e| e.into_inner()) {
            root.info_strings.push((
                "QueryDuration".to_string(),
                format!("{:?}", start.elapsed()),
            ));
        }
        root
    }

    /// Exit-code-style status for the client surface; None is OK.
    pub fn final_code(&self) -> Option<StatusCode> {
        self.latched_status().map(|status| status.code)
    }

    pub fn teardown(&self) {
        self.registry.unregister(self.query_id);
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.registry.unregister(self.query_id);
    }
}
