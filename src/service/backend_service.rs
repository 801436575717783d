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

//! One backend's implementation of the internal service: the fragment
//! manager for incoming prepare/exec/cancel, the transmit endpoints of the
//! exchange fabric, and coordinator-side report dispatch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::common::logging::debug;
use crate::common::status::{Result, Status};
use crate::common::types::FragmentInstanceId;
use crate::runtime::coordinator::CoordinatorRegistry;
use crate::runtime::data_stream_mgr::TransmitResult;
use crate::runtime::exec_env::ExecEnv;
use crate::runtime::fragment_executor::FragmentExecutor;
use crate::service::rpc::{
    CancelInstanceRequest, ExecInstanceRequest, ExecPlanFragmentRequest, InternalService,
    ReportExecStatusRequest, TransmitDataRequest, TransmitEosRequest,
};

type FragmentMap = Arc<Mutex<HashMap<FragmentInstanceId, Arc<FragmentExecutor>>>>;

pub struct BackendServer {
    env: Arc<ExecEnv>,
    coordinators: Arc<CoordinatorRegistry>,
    fragments: FragmentMap,
}

impl BackendServer {
    pub fn new(env: Arc<ExecEnv>, coordinators: Arc<CoordinatorRegistry>) -> Arc<Self> {
        Arc::new(Self {
            env,
            coordinators,
            fragments: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn env(&self) -> &Arc<ExecEnv> {
        &self.env
    }

    pub fn coordinators(&self) -> &Arc<CoordinatorRegistry> {
        &self.coordinators
    }

    pub fn num_active_fragments(&self) -> usize {
        self.fragments.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn executor(&self, instance_id: FragmentInstanceId) -> Option<Arc<FragmentExecutor>> {
        self.fragments
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&instance_id)
            .cloned()
    }
}

impl InternalService for BackendServer {
    fn exec_plan_fragment(&self, req: ExecPlanFragmentRequest) -> Result<()> {
        let instance_id = req.instance_id;
        debug!(
            "prepare fragment instance: finst={} fragment={} on {}",
            instance_id,
            req.fragment_idx,
            self.env.address()
        );
        let executor = FragmentExecutor::new(Arc::clone(&self.env), req, None)?;
        executor.prepare()?;
        let mut guard = self.fragments.lock().unwrap_or_else(|e| e.into_inner());
        if guard.contains_key(&instance_id) {
            return Err(Status::internal(format!(
                "fragment instance already registered: {instance_id}"
            )));
        }
        guard.insert(instance_id, executor);
        Ok(())
    }

    fn exec_instance(&self, req: ExecInstanceRequest) -> Result<()> {
        let executor = self.executor(req.instance_id).ok_or_else(|| {
            Status::internal(format!(
                "exec for unknown fragment instance {}",
                req.instance_id
            ))
        })?;
        let fragments = Arc::clone(&self.fragments);
        let instance_id = req.instance_id;
        self.env.spawn(move || {
            executor.run();
            fragments
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&instance_id);
        });
        Ok(())
    }

    fn cancel_instance(&self, req: CancelInstanceRequest) -> Result<()> {
        match self.executor(req.instance_id) {
            Some(executor) => {
                executor.cancel(&req.reason);
                // An instance cancelled before its exec RPC arrived will
                // never run; reap it so no orphan fragments survive.
                use crate::runtime::fragment_executor::InstanceExecState;
                if matches!(
                    executor.exec_state(),
                    InstanceExecState::Created | InstanceExecState::Prepared
                ) {
                    self.fragments
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&req.instance_id);
                }
                Ok(())
            }
            // Second and later cancels of a finished instance are no-ops.
            None => {
                debug!(
                    "cancel for unknown/finished instance {} (no-op)",
                    req.instance_id
                );
                Ok(())
            }
        }
    }

    fn transmit(&self, req: TransmitDataRequest) -> Result<TransmitResult> {
        self.env
            .stream_mgr()
            .transmit(req.dest, req.sender_idx, req.seq, &req.payload)
    }

    fn transmit_eos(&self, req: TransmitEosRequest) -> Result<TransmitResult> {
        self.env.stream_mgr().transmit_eos(req.dest, req.sender_idx)
    }

    fn report_exec_status(&self, req: ReportExecStatusRequest) -> Result<()> {
        match self.coordinators.lookup(req.query_id) {
            Some(coordinator) => coordinator.report(req),
            None => Err(Status::cancelled(format!(
                "no coordinator for query {}",
                req.query_id
            ))),
        }
    }
}
