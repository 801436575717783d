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

//! Drives one plan fragment on one worker: `prepare` builds the runtime
//! state, operator tree and sink; `run` opens the sink, pulls batches from
//! the root into it until eos, error or cancellation; a per-instance
//! reporting thread streams status packets to the coordinator and sends one
//! final packet with `done=true`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crate::common::logging::{debug, info, warn};
use crate::common::status::{Result, Status};
use crate::exec::data_sink::{build_sink, DataSink};
use crate::exec::{build_exec_tree, ExecNode};
use crate::runtime::exec_env::ExecEnv;
use crate::runtime::profile::CounterUnit;
use crate::runtime::result_queue::ResultQueue;
use crate::runtime::row_batch::RowBatch;
use crate::runtime::runtime_state::RuntimeState;
use crate::service::rpc::{ExecPlanFragmentRequest, ReportExecStatusRequest, RPC_VERSION};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InstanceExecState {
    Created,
    Prepared,
    Running,
    Finished,
    Cancelled,
    Failed,
}

struct Inner {
    exec_state: InstanceExecState,
    tree: Option<Box<dyn ExecNode>>,
    sink: Option<Box<dyn DataSink>>,
    latched: Option<Status>,
}

pub struct FragmentExecutor {
    env: Arc<ExecEnv>,
    request: ExecPlanFragmentRequest,
    runtime_state: Arc<RuntimeState>,
    result_queue: Option<Arc<ResultQueue>>,
    inner: Mutex<Inner>,
    done: AtomicBool,
    done_cv: Condvar,
    done_mu: Mutex<bool>,
    report_seq: AtomicU64,
    profile_active: Arc<AtomicBool>,
}

impl FragmentExecutor {
    pub fn new(
        env: Arc<ExecEnv>,
        request: ExecPlanFragmentRequest,
        result_queue: Option<Arc<ResultQueue>>,
    ) -> Result<Arc<Self>> {
        request.version.check()?;
        request.options.validate()?;
        let runtime_state = Arc::new(RuntimeState::new(Arc::clone(&env), &request));
        Ok(Arc::new(Self {
            env,
            request,
            runtime_state,
            result_queue,
            inner: Mutex::new(Inner {
                exec_state: InstanceExecState::Created,
                tree: None,
                sink: None,
                latched: None,
            }),
            done: AtomicBool::new(false),
            done_cv: Condvar::new(),
            done_mu: Mutex::new(false),
            report_seq: AtomicU64::new(0),
            profile_active: Arc::new(AtomicBool::new(true)),
        }))
    }

    pub fn instance_id(&self) -> crate::common::types::FragmentInstanceId {
        self.request.instance_id
    }

    pub fn runtime_state(&self) -> &Arc<RuntimeState> {
        &self.runtime_state
    }

    pub fn exec_state(&self) -> InstanceExecState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).exec_state
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Construct the operator tree and sink. Returns before any row is
    /// produced; `run` may only be called after a successful prepare.
    pub fn prepare(self: &Arc<Self>) -> Result<()> {
        let result = self.prepare_internal();
        if let Err(err) = &result {
            self.latch_status(err.clone());
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.exec_state = InstanceExecState::Failed;
        }
        result
    }

    fn prepare_internal(self: &Arc<Self>) -> Result<()> {
        let state = &*self.runtime_state;
        let _t = state.profile().scoped_timer("PrepareTime");
        state
            .profile()
            .add_info_string("InstanceId", self.request.instance_id.to_string());
        state.profile().add_info_string(
            "ExecState",
            "prepared",
        );

        let mut tree = build_exec_tree(state, &self.request.fragment.root)?;
        tree.prepare(state)?;
        let mut sink = build_sink(
            &self.request.fragment.sink,
            tree.output_desc(),
            self.result_queue.clone(),
            &state.profile().child("Sink"),
        )?;
        sink.prepare(state)?;

        // Rate counters sampled by the periodic updater.
        let rows = state
            .profile()
            .add_counter("RowsProduced", CounterUnit::Unit);
        state
            .profile()
            .add_time_series_counter("RowsProducedSeries", CounterUnit::Unit, &rows);
        self.env
            .register_profile_for_sampling(state.profile().clone(), Arc::clone(&self.profile_active));

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.exec_state != InstanceExecState::Created {
            return Err(Status::internal(format!(
                "prepare in unexpected state {:?}",
                inner.exec_state
            )));
        }
        inner.tree = Some(tree);
        inner.sink = Some(sink);
        inner.exec_state = InstanceExecState::Prepared;
        debug!(
            "fragment instance prepared: finst={} fragment={}",
            self.request.instance_id, self.request.fragment_idx
        );
        Ok(())
    }

    /// Execute to completion on the calling thread. Spawns the per-instance
    /// reporting thread and sends the final `done=true` packet through it.
    pub fn run(self: &Arc<Self>) {
        let reporter = {
            let this = Arc::clone(self);
            thread::Builder::new()
                .name(format!("report-{}", self.request.instance_id))
                .spawn(move || this.report_loop())
                .expect("spawn report thread")
        };

        let status = self.open_and_exec();
        self.finish(status);

        {
            let mut done = self.done_mu.lock().unwrap_or_else(|e| e.into_inner());
            *done = true;
            self.done_cv.notify_all();
        }
        let _ = reporter.join();
        self.stop_sampling();
    }

    fn open_and_exec(self: &Arc<Self>) -> Result<()> {
        let state = &*self.runtime_state;
        let (mut tree, mut sink) = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.exec_state != InstanceExecState::Prepared {
                return Err(Status::internal(format!(
                    "exec in unexpected state {:?}",
                    inner.exec_state
                )));
            }
            inner.exec_state = InstanceExecState::Running;
            (
                inner.tree.take().expect("tree built in prepare"),
                inner.sink.take().expect("sink built in prepare"),
            )
        };
        state.profile().add_info_string("ExecState", "running");

        let result = self.drive(state, tree.as_mut(), sink.as_mut());
        tree.close(state);
        let close_result = sink.close(state, result.is_ok());
        result.and(close_result)
    }

    fn drive(
        &self,
        state: &RuntimeState,
        tree: &mut dyn ExecNode,
        sink: &mut dyn DataSink,
    ) -> Result<()> {
        let _t = state.profile().scoped_timer("ExecTime");
        sink.open(state)?;
        tree.open(state)?;
        let rows_produced = state
            .profile()
            .add_counter("RowsProduced", CounterUnit::Unit);
        loop {
            if state.is_cancelled() {
                return Err(Status::cancelled("fragment instance cancelled"));
            }
            let mut batch = RowBatch::new(tree.output_desc().clone(), state.batch_size());
            let eos = tree.get_next(state, &mut batch)?;
            if batch.num_rows() > 0 {
                rows_produced.add(batch.num_rows() as i64);
                sink.send(state, &batch)?;
            }
            if eos {
                return Ok(());
            }
        }
    }

    fn finish(&self, result: Result<()>) {
        let status = match result {
            Ok(()) => None,
            Err(err) => {
                self.runtime_state.log_error(err.to_string());
                Some(err)
            }
        };
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(err) = status {
            if inner.latched.is_none() {
                inner.latched = Some(err);
            }
        }
        inner.exec_state = match (&inner.latched, self.runtime_state.is_cancelled()) {
            (Some(err), _) if err.is_cancelled() => InstanceExecState::Cancelled,
            (Some(_), _) => InstanceExecState::Failed,
            (None, true) => InstanceExecState::Cancelled,
            (None, false) => InstanceExecState::Finished,
        };
        self.runtime_state.profile().add_info_string(
            "ExecState",
            match inner.exec_state {
                InstanceExecState::Finished => "finished",
                InstanceExecState::Cancelled => "cancelled",
                _ => "failed",
            },
        );
        self.done.store(true, Ordering::Release);
        info!(
            "fragment instance done: finst={} state={:?}",
            self.request.instance_id, inner.exec_state
        );
    }

    /// Idempotent; checked at every batch boundary and inside blocking
    /// waits, which wake within the configured interval.
    pub fn cancel(&self, reason: &str) {
        if self.runtime_state.is_cancelled() {
            debug!(
                "fragment instance cancel (again): finst={}",
                self.request.instance_id
            );
            return;
        }
        info!(
            "fragment instance cancel: finst={} reason={}",
            self.request.instance_id, reason
        );
        self.latch_status(Status::cancelled(reason));
        self.runtime_state.cancel();
    }

    fn latch_status(&self, status: Status) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.latched.is_none() {
            inner.latched = Some(status);
        }
    }

    fn latched_status(&self) -> Option<Status> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .latched
            .clone()
    }

    fn report_loop(self: Arc<Self>) {
        let interval = Duration::from_millis(
            self.request.options.status_report_interval_ms.max(10),
        );
        let mut error_mark = 0usize;
        loop {
            let done = {
                let guard = self.done_mu.lock().unwrap_or_else(|e| e.into_inner());
                let (guard, _) = self
                    .done_cv
                    .wait_timeout(guard, interval)
                    .unwrap_or_else(|e| e.into_inner());
                *guard
            };
            let is_final = done || self.done.load(Ordering::Acquire);
            if !is_final {
                self.maintenance_check();
            }
            error_mark = self.send_report(is_final, error_mark);
            if is_final {
                return;
            }
        }
    }

    fn stop_sampling(&self) {
        self.profile_active.store(false, Ordering::Release);
    }

    /// Periodic sweep between reports. `try_consume` rejects checked
    /// allocations up front; this catches unchecked growth (e.g. exchange
    /// queue accounting) pushing an ancestor over its limit.
    fn maintenance_check(&self) {
        if self.runtime_state.is_cancelled() {
            return;
        }
        let tracker = self.runtime_state.query_mem_tracker();
        if tracker.any_limit_exceeded() {
            let status = Status::mem_limit_exceeded(format!(
                "memory limit exceeded (periodic check): tracker={} consumption={}",
                tracker.label(),
                tracker.consumption()
            ));
            self.runtime_state.log_error(status.to_string());
            self.latch_status(status);
            self.runtime_state.cancel();
        }
    }

    /// Build and send one status packet; returns the new error-log mark.
    fn send_report(&self, is_final: bool, error_mark: usize) -> usize {
        let (delta, new_mark) = self.runtime_state.error_log_delta(error_mark);
        let status = if is_final { self.latched_status() } else { None };
        let report = ReportExecStatusRequest {
            version: RPC_VERSION,
            query_id: self.request.query_id,
            instance_id: self.request.instance_id,
            seq: self.report_seq.fetch_add(1, Ordering::AcqRel) + 1,
            done: is_final,
            status,
            profile: self.runtime_state.profile().snapshot(),
            error_log_delta: delta,
            insert_stats: None,
        };
        let coord = self.request.coord.clone();
        let outcome = self
            .env
            .cluster()
            .backend(&coord)
            .and_then(|stub| stub.report_exec_status(report));
        if let Err(err) = outcome {
            warn!(
                "status report failed: finst={} coord={} err={}",
                self.request.instance_id, coord, err
            );
            // The coordinator is gone or has disowned the query; stop work.
            if !is_final {
                self.cancel("status report rejected by coordinator");
            }
        }
        new_mark
    }
}

impl Drop for FragmentExecutor {
    fn drop(&mut self) {
        self.stop_sampling();
    }
}
