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
//! Admission-broker behaviour: denied reservations and preemption of a
//! granted one.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use kestrel::common::status::Status;
use kestrel::common::types::{QueryId, UniqueId};
use kestrel::exec::scan_node::MemTableProvider;
use kestrel::plan::builder;
use kestrel::runtime::coordinator::{Coordinator, QueryState};
use kestrel::runtime::scheduler::{
    PreemptionHook, ReservationRequest, ResourceBroker, ResourceGrant,
};
use kestrel::StatusCode;

use common::{default_options, kv_desc, kv_rows, scan_locations_for, whole_file_range, TestCluster};

struct DenyingBroker;

impl ResourceBroker for DenyingBroker {
    fn reserve(
        &self,
        _query_id: QueryId,
        _request: &ReservationRequest,
        _on_preemption: PreemptionHook,
    ) -> kestrel::Result<ResourceGrant> {
        Err(Status::admission_denied("cluster at capacity"))
    }

    fn release(&self, _query_id: QueryId) {}
}

#[derive(Default)]
struct PreemptingBroker {
    hooks: Mutex<Vec<PreemptionHook>>,
}

impl PreemptingBroker {
    fn preempt_all(&self) {
        let hooks = self.hooks.lock().expect("hooks lock");
        for hook in hooks.iter() {
            hook(Status::preempted("reservation reclaimed"));
        }
    }
}

impl ResourceBroker for PreemptingBroker {
    fn reserve(
        &self,
        _query_id: QueryId,
        request: &ReservationRequest,
        on_preemption: PreemptionHook,
    ) -> kestrel::Result<ResourceGrant> {
        assert!(!request.instances_per_backend.is_empty());
        self.hooks.lock().expect("hooks lock").push(on_preemption);
        Ok(ResourceGrant { grant_id: 1 })
    }

    fn release(&self, _query_id: QueryId) {}
}

fn coordinator_with_broker(
    tc: &TestCluster,
    broker: Arc<dyn ResourceBroker>,
) -> Arc<Coordinator> {
    let coord_server = &tc.backends[0].1;
    Coordinator::new(
        Arc::clone(coord_server.env()),
        UniqueId::generate(),
        builder::count_star_plan("t", kv_desc()),
        default_options(),
        Arc::clone(coord_server.coordinators()),
        Some(broker),
    )
}

#[test]
fn denied_reservation_fails_before_any_instance_starts() {
    let tc = TestCluster::new(1);
    let table = MemTableProvider::new();
    table.add_file("f", kv_rows(100, 3));
    tc.register_table("t", table);

    let coordinator = coordinator_with_broker(&tc, Arc::new(DenyingBroker));
    let locations = scan_locations_for(2, vec![whole_file_range("f", 100, "worker-1")]);
    let err = coordinator.exec(&locations).expect_err("must be denied");
    assert_eq!(err.code, StatusCode::AdmissionDenied);
    assert!(tc.wait_for_no_active_fragments(Duration::from_secs(5)));
}

#[test]
fn preemption_cancels_a_running_query() {
    let tc = TestCluster::new(1);
    let table = MemTableProvider::new();
    table.add_file("f", kv_rows(100, 3));
    tc.register_table("t", table);

    let broker = Arc::new(PreemptingBroker::default());
    let coordinator = coordinator_with_broker(&tc, broker.clone());
    let locations = scan_locations_for(2, vec![whole_file_range("f", 100, "worker-1")]);
    coordinator.exec(&locations).expect("admitted");

    broker.preempt_all();

    let state = coordinator
        .wait_completion(Duration::from_secs(20))
        .expect("instances report done");
    // Preemption is query-fatal with its own code, not a plain user cancel.
    if state == QueryState::Failed {
        let latched = coordinator.latched_status().expect("latched");
        assert_eq!(latched.code, StatusCode::ResourcePreempted);
    } else {
        // The query may have raced to completion before the preemption
        // landed; either way the broker hook must not wedge anything.
        assert_eq!(state, QueryState::Finished);
    }
}
