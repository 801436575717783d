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

//! Locality-aware assignment of scan ranges to workers and of fragment
//! instances to backends. Round-robin state is private to one schedule
//! computation: membership is snapshotted at query start and an in-flight
//! query never resees a membership change.

use std::collections::HashMap;

use crate::common::logging::debug;
use crate::common::status::{Result, Status};
use crate::common::types::{BackendAddress, QueryId};
use crate::plan::{DataSinkSpec, PlanFragment, QueryPlan, ScanRange};
use crate::service::rpc::{BackendDescriptor, FragmentDestination};

/// Per-instance parameters produced by scheduling, consumed by the
/// coordinator to build prepare RPCs.
#[derive(Clone, Debug)]
pub struct InstanceParams {
    pub instance_id: crate::common::types::FragmentInstanceId,
    pub backend: BackendAddress,
    /// Index of this instance within its fragment; doubles as the sender
    /// index of its sink channels and drives partition-to-worker mapping.
    pub backend_num: i32,
    pub per_node_scan_ranges: HashMap<i32, Vec<ScanRange>>,
    pub destinations: Vec<FragmentDestination>,
    pub num_senders: HashMap<i32, usize>,
}

#[derive(Clone, Debug)]
pub struct FragmentSchedule {
    pub fragment_idx: usize,
    pub instances: Vec<InstanceParams>,
}

/// The complete schedule of one query: fragment id → instance list, plus
/// assignment statistics.
#[derive(Clone, Debug, Default)]
pub struct QuerySchedule {
    pub fragments: Vec<FragmentSchedule>,
    pub local_assignments: u64,
    pub total_assignments: u64,
}

impl QuerySchedule {
    pub fn num_instances(&self) -> usize {
        self.fragments.iter().map(|f| f.instances.len()).sum()
    }

    pub fn fragment(&self, idx: usize) -> &FragmentSchedule {
        &self.fragments[idx]
    }

    /// Instances of each backend, for reservation requests.
    pub fn instances_per_backend(&self) -> HashMap<BackendAddress, usize> {
        let mut out = HashMap::new();
        for fragment in &self.fragments {
            for instance in &fragment.instances {
                *out.entry(instance.backend.clone()).or_insert(0) += 1;
            }
        }
        out
    }
}

/// Admission request derived from a schedule when an external resource
/// broker is configured.
#[derive(Clone, Debug)]
pub struct ReservationRequest {
    pub instances_per_backend: HashMap<BackendAddress, usize>,
    pub memory_per_instance_bytes: i64,
}

#[derive(Clone, Debug, Default)]
pub struct ResourceGrant {
    pub grant_id: u64,
}

/// Callback fired when a granted reservation is preempted; the coordinator
/// cancels the query with the supplied status.
pub type PreemptionHook = Box<dyn Fn(Status) + Send + Sync>;

/// External admission broker seam. Absent a broker, queries admit
/// immediately.
pub trait ResourceBroker: Send + Sync {
    fn reserve(
        &self,
        query_id: QueryId,
        request: &ReservationRequest,
        on_preemption: PreemptionHook,
    ) -> Result<ResourceGrant>;
    fn release(&self, query_id: QueryId);
}

pub struct Scheduler {
    coord: BackendAddress,
}

impl Scheduler {
    pub fn new(coord: BackendAddress) -> Self {
        Self { coord }
    }

    /// Compute the schedule: scan-range assignment, instance placement and
    /// sink destination wiring.
    pub fn schedule(
        &self,
        query_id: QueryId,
        plan: &QueryPlan,
        scan_locations: &HashMap<i32, Vec<ScanRange>>,
        membership: &[BackendDescriptor],
    ) -> Result<QuerySchedule> {
        if membership.is_empty() {
            return Err(Status::internal("no live backends to schedule on"));
        }
        let mut schedule = QuerySchedule::default();
        let mut rr = RoundRobinState::default();

        // Pass 1, leaves first: scan assignment and instance placement.
        // Fragments whose placement depends on a not-yet-placed neighbour
        // (broadcast senders) defer to later sweeps.
        let mut placements: Vec<Option<FragmentPlacement>> = vec![None; plan.fragments.len()];
        let mut remaining = plan.fragments.len();
        while remaining > 0 {
            let mut progressed = false;
            for fragment in plan.fragments.iter().rev() {
                if placements[fragment.idx].is_some() {
                    continue;
                }
                if let Some(placement) = self.place_fragment(
                    fragment,
                    plan,
                    scan_locations,
                    membership,
                    &placements,
                    &mut rr,
                    &mut schedule,
                )? {
                    placements[fragment.idx] = Some(placement);
                    remaining -= 1;
                    progressed = true;
                }
            }
            if !progressed {
                return Err(Status::internal(
                    "fragment placement did not converge (cyclic exchange dependencies)",
                ));
            }
        }

        // Assign instance ids in fragment order.
        let mut ordinal = 0i32;
        let mut fragments: Vec<FragmentSchedule> = Vec::with_capacity(plan.fragments.len());
        for (idx, placement) in placements.iter().enumerate() {
            let placement = placement.as_ref().expect("all fragments placed");
            let mut instances = Vec::with_capacity(placement.backends.len());
            for (backend_num, (backend, ranges)) in placement
                .backends
                .iter()
                .zip(placement.scan_ranges.iter())
                .enumerate()
            {
                instances.push(InstanceParams {
                    instance_id: query_id.instance(ordinal),
                    backend: backend.clone(),
                    backend_num: backend_num as i32,
                    per_node_scan_ranges: ranges.clone(),
                    destinations: Vec::new(),
                    num_senders: HashMap::new(),
                });
                ordinal += 1;
            }
            fragments.push(FragmentSchedule {
                fragment_idx: idx,
                instances,
            });
        }

        // Pass 2: wire sink destinations and exchange sender counts.
        for fragment in &plan.fragments {
            let Some(dest_idx) = fragment.sink.dest_fragment() else {
                continue;
            };
            let dest_node = fragment.sink.dest_node_id().expect("stream sink");
            let num_senders = fragments[fragment.idx].instances.len();
            let destinations: Vec<FragmentDestination> = fragments[dest_idx]
                .instances
                .iter()
                .map(|i| FragmentDestination {
                    finst_id: i.instance_id,
                    backend: i.backend.clone(),
                })
                .collect();
            let destinations = match fragment.sink {
                // A single-destination sink targets the first instance.
                DataSinkSpec::Unpartitioned { .. } => destinations[..1].to_vec(),
                _ => destinations,
            };
            for instance in &mut fragments[fragment.idx].instances {
                instance.destinations = destinations.clone();
            }
            match fragment.sink {
                DataSinkSpec::Unpartitioned { .. } => {
                    // Only the targeted instance expects these senders.
                    let target = destinations[0].finst_id;
                    for instance in &mut fragments[dest_idx].instances {
                        if instance.instance_id == target {
                            *instance.num_senders.entry(dest_node).or_insert(0) += num_senders;
                        }
                    }
                }
                _ => {
                    for instance in &mut fragments[dest_idx].instances {
                        *instance.num_senders.entry(dest_node).or_insert(0) += num_senders;
                    }
                }
            }
        }

        schedule.fragments = fragments;
        debug!(
            "schedule computed: query={} instances={} local={} total={}",
            query_id,
            schedule.num_instances(),
            schedule.local_assignments,
            schedule.total_assignments
        );
        Ok(schedule)
    }

    #[allow(clippy::too_many_arguments)]
    fn place_fragment(
        &self,
        fragment: &PlanFragment,
        plan: &QueryPlan,
        scan_locations: &HashMap<i32, Vec<ScanRange>>,
        membership: &[BackendDescriptor],
        placements: &[Option<FragmentPlacement>],
        rr: &mut RoundRobinState,
        schedule: &mut QuerySchedule,
    ) -> Result<Option<FragmentPlacement>> {
        let scan_nodes = fragment.scan_node_ids();

        // Unpartitioned fragments and coordinator-pinned fragments run one
        // instance on the coordinator, taking all their scan ranges along.
        if fragment.exec_at_coord
            || (scan_nodes.is_empty() && fragment.leftmost_exchange().is_none())
        {
            let mut ranges: HashMap<i32, Vec<ScanRange>> = HashMap::new();
            for node_id in &scan_nodes {
                if let Some(node_ranges) = scan_locations.get(node_id) {
                    schedule.total_assignments += node_ranges.len() as u64;
                    ranges.insert(*node_id, node_ranges.clone());
                }
            }
            return Ok(Some(FragmentPlacement {
                backends: vec![self.coord.clone()],
                scan_ranges: vec![ranges],
            }));
        }

        if !scan_nodes.is_empty() {
            // Scan-bearing: one instance per distinct worker that received
            // a range in locality-aware assignment.
            let mut per_backend: HashMap<BackendAddress, HashMap<i32, Vec<ScanRange>>> =
                HashMap::new();
            for node_id in &scan_nodes {
                let Some(node_ranges) = scan_locations.get(node_id) else {
                    continue;
                };
                for range in node_ranges {
                    let backend = assign_range(range, membership, rr, schedule);
                    per_backend
                        .entry(backend)
                        .or_default()
                        .entry(*node_id)
                        .or_default()
                        .push(range.clone());
                }
            }
            if per_backend.is_empty() {
                // No ranges at all: a single instance still runs (it will
                // observe an empty input and report eos).
                let backend = membership[0].address.clone();
                return Ok(Some(FragmentPlacement {
                    backends: vec![backend],
                    scan_ranges: vec![HashMap::new()],
                }));
            }
            // Deterministic instance order: membership order.
            let mut backends = Vec::new();
            let mut scan_ranges = Vec::new();
            for member in membership {
                if let Some(ranges) = per_backend.remove(&member.address) {
                    backends.push(member.address.clone());
                    scan_ranges.push(ranges);
                }
            }
            return Ok(Some(FragmentPlacement {
                backends,
                scan_ranges,
            }));
        }

        // Broadcast senders replicate one instance per downstream worker.
        if let DataSinkSpec::Broadcast { dest_fragment, .. } = fragment.sink {
            let Some(dest) = placements[dest_fragment].as_ref() else {
                return Ok(None);
            };
            let backends = dest.backends.clone();
            let scan_ranges = vec![HashMap::new(); backends.len()];
            return Ok(Some(FragmentPlacement {
                backends,
                scan_ranges,
            }));
        }

        // Exchange-fed: inherit the distinct workers of the fragments that
        // send into the leftmost exchange.
        let leftmost = fragment
            .leftmost_exchange()
            .ok_or_else(|| Status::internal("unplaceable fragment"))?;
        let mut backends: Vec<BackendAddress> = Vec::new();
        for sender in &plan.fragments {
            if sender.sink.dest_fragment() != Some(fragment.idx)
                || sender.sink.dest_node_id() != Some(leftmost)
            {
                continue;
            }
            let Some(sender_placement) = placements[sender.idx].as_ref() else {
                return Ok(None);
            };
            for backend in &sender_placement.backends {
                if !backends.contains(backend) {
                    backends.push(backend.clone());
                }
            }
        }
        if backends.is_empty() {
            backends.push(self.coord.clone());
        }
        let scan_ranges = vec![HashMap::new(); backends.len()];
        Ok(Some(FragmentPlacement {
            backends,
            scan_ranges,
        }))
    }
}

#[derive(Clone, Debug)]
struct FragmentPlacement {
    backends: Vec<BackendAddress>,
    scan_ranges: Vec<HashMap<i32, Vec<ScanRange>>>,
}

#[derive(Default)]
struct RoundRobinState {
    local: HashMap<Vec<String>, usize>,
    remote: usize,
}

/// Replica-local round-robin with a remote fallback, counting local and
/// total assignments.
fn assign_range(
    range: &ScanRange,
    membership: &[BackendDescriptor],
    rr: &mut RoundRobinState,
    schedule: &mut QuerySchedule,
) -> BackendAddress {
    schedule.total_assignments += 1;
    let local_backends: Vec<&BackendDescriptor> = membership
        .iter()
        .filter(|b| range.replicas.iter().any(|r| *r == b.hostname))
        .collect();
    if !local_backends.is_empty() {
        let key = {
            let mut hosts: Vec<String> =
                local_backends.iter().map(|b| b.hostname.clone()).collect();
            hosts.sort();
            hosts
        };
        let next = rr.local.entry(key).or_insert(0);
        let chosen = local_backends[*next % local_backends.len()].address.clone();
        *next += 1;
        schedule.local_assignments += 1;
        return chosen;
    }
    let chosen = membership[rr.remote % membership.len()].address.clone();
    rr.remote += 1;
    chosen
}
