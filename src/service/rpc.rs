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

//! The internal RPC surface between the coordinator and workers. Requests
//! and responses are serde types carrying a protocol version; the transport
//! is a trait, so the in-process cluster used by tests and single-node
//! deployments plugs in behind the same seam as a network client. The
//! in-process path still round-trips every message through its serialised
//! form, keeping the wire contract honest.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::common::config::QueryOptions;
use crate::common::status::{Result, Status};
use crate::common::types::{BackendAddress, FragmentInstanceId, QueryId};
use crate::plan::{PlanFragment, ScanRange};
use crate::runtime::data_stream_mgr::{ReceiverKey, TransmitResult};
use crate::runtime::profile::ProfileSnapshot;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RpcVersion {
    pub major: u16,
    pub minor: u16,
}

pub const RPC_VERSION: RpcVersion = RpcVersion { major: 1, minor: 0 };

impl RpcVersion {
    pub fn check(&self) -> Result<()> {
        if self.major != RPC_VERSION.major {
            return Err(Status::internal(format!(
                "incompatible rpc version {}.{} (supported {}.{})",
                self.major, self.minor, RPC_VERSION.major, RPC_VERSION.minor
            )));
        }
        Ok(())
    }
}

/// One downstream target of a fragment's stream sink.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FragmentDestination {
    pub finst_id: FragmentInstanceId,
    pub backend: BackendAddress,
}

/// Everything one worker needs to prepare one fragment instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecPlanFragmentRequest {
    pub version: RpcVersion,
    pub query_id: QueryId,
    pub instance_id: FragmentInstanceId,
    pub fragment_idx: usize,
    pub fragment: PlanFragment,
    /// Worker number within the query; doubles as the sender index of this
    /// instance's sink channels.
    pub backend_num: i32,
    /// Scan ranges per scan node id (possibly empty).
    pub scan_ranges: HashMap<i32, Vec<ScanRange>>,
    /// Expected sender count per exchange node id of this fragment.
    pub num_senders: HashMap<i32, usize>,
    /// Destinations of the sink, ordered by destination worker number.
    pub destinations: Vec<FragmentDestination>,
    pub coord: BackendAddress,
    pub options: QueryOptions,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecInstanceRequest {
    pub version: RpcVersion,
    pub query_id: QueryId,
    pub instance_id: FragmentInstanceId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CancelInstanceRequest {
    pub version: RpcVersion,
    pub query_id: QueryId,
    pub instance_id: FragmentInstanceId,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransmitDataRequest {
    pub version: RpcVersion,
    pub dest: ReceiverKey,
    pub sender_idx: usize,
    pub seq: u64,
    /// Serialised row batch; base64 on text transports.
    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,
}

mod payload_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransmitEosRequest {
    pub version: RpcVersion,
    pub dest: ReceiverKey,
    pub sender_idx: usize,
}

/// Row/byte counts for sinks that append to tables. Carried in status
/// reports when present and surfaced through the coordinator.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InsertStats {
    pub rows_appended: i64,
    pub bytes_written: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReportExecStatusRequest {
    pub version: RpcVersion,
    pub query_id: QueryId,
    pub instance_id: FragmentInstanceId,
    /// Strictly increasing per instance; the coordinator merges tolerantly.
    pub seq: u64,
    pub done: bool,
    /// None reports OK.
    pub status: Option<Status>,
    pub profile: ProfileSnapshot,
    pub error_log_delta: Vec<String>,
    pub insert_stats: Option<InsertStats>,
}

/// The coordinator-to-worker and worker-to-coordinator service, implemented
/// by every backend process.
pub trait InternalService: Send + Sync {
    fn exec_plan_fragment(&self, req: ExecPlanFragmentRequest) -> Result<()>;
    fn exec_instance(&self, req: ExecInstanceRequest) -> Result<()>;
    fn cancel_instance(&self, req: CancelInstanceRequest) -> Result<()>;
    fn transmit(&self, req: TransmitDataRequest) -> Result<TransmitResult>;
    fn transmit_eos(&self, req: TransmitEosRequest) -> Result<TransmitResult>;
    /// A non-OK return instructs the reporting instance to cancel itself.
    fn report_exec_status(&self, req: ReportExecStatusRequest) -> Result<()>;
}

/// Resolves a backend address to a service stub. Resolution failures are
/// transient: the caller retries within its backoff budget.
pub trait ClusterClient: Send + Sync {
    fn backend(&self, addr: &BackendAddress) -> Result<Arc<dyn InternalService>>;
}

/// One member of the cluster as seen by the membership subscription.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub address: BackendAddress,
    pub hostname: String,
}

/// Snapshot-versioned membership list; the gossip subscription feeds
/// `update` and schedulers read a consistent snapshot per query.
#[derive(Debug, Default)]
pub struct ClusterMembership {
    members: Mutex<Vec<BackendDescriptor>>,
    version: AtomicU64,
}

impl ClusterMembership {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn update(&self, members: Vec<BackendDescriptor>) {
        let mut guard = self.members.lock().unwrap_or_else(|e| e.into_inner());
        *guard = members;
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    pub fn remove(&self, addr: &BackendAddress) {
        let mut guard = self.members.lock().unwrap_or_else(|e| e.into_inner());
        guard.retain(|b| b.address != *addr);
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    pub fn snapshot(&self) -> (u64, Vec<BackendDescriptor>) {
        let guard = self.members.lock().unwrap_or_else(|e| e.into_inner());
        (self.version.load(Ordering::Acquire), guard.clone())
    }
}

fn wire_roundtrip<T: Serialize + DeserializeOwned>(value: &T) -> Result<T> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| Status::internal(format!("rpc serialisation failed: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Status::internal(format!("rpc deserialisation failed: {e}")))
}

/// Stub that pushes every request and response through its serialised form
/// before touching the peer service, so in-process calls exercise the same
/// wire shapes a network transport would.
struct SerializedStub {
    inner: Arc<dyn InternalService>,
}

impl InternalService for SerializedStub {
    fn exec_plan_fragment(&self, req: ExecPlanFragmentRequest) -> Result<()> {
        req.version.check()?;
        self.inner.exec_plan_fragment(wire_roundtrip(&req)?)
    }

    fn exec_instance(&self, req: ExecInstanceRequest) -> Result<()> {
        req.version.check()?;
        self.inner.exec_instance(wire_roundtrip(&req)?)
    }

    fn cancel_instance(&self, req: CancelInstanceRequest) -> Result<()> {
        req.version.check()?;
        self.inner.cancel_instance(wire_roundtrip(&req)?)
    }

    fn transmit(&self, req: TransmitDataRequest) -> Result<TransmitResult> {
        req.version.check()?;
        let result = self.inner.transmit(wire_roundtrip(&req)?)?;
        wire_roundtrip(&result)
    }

    fn transmit_eos(&self, req: TransmitEosRequest) -> Result<TransmitResult> {
        req.version.check()?;
        let result = self.inner.transmit_eos(wire_roundtrip(&req)?)?;
        wire_roundtrip(&result)
    }

    fn report_exec_status(&self, req: ReportExecStatusRequest) -> Result<()> {
        req.version.check()?;
        self.inner.report_exec_status(wire_roundtrip(&req)?)
    }
}

/// Backend registry standing in for the network: every registered backend is
/// reachable through a serialising stub, and removing one makes subsequent
/// calls fail transiently, exactly like a worker process disappearing.
#[derive(Default)]
pub struct InProcessCluster {
    backends: Mutex<HashMap<BackendAddress, Arc<dyn InternalService>>>,
}

impl InProcessCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, addr: BackendAddress, service: Arc<dyn InternalService>) {
        let stub: Arc<dyn InternalService> = Arc::new(SerializedStub { inner: service });
        let mut guard = self.backends.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(addr, stub);
    }

    /// Simulate a worker process exit.
    pub fn remove(&self, addr: &BackendAddress) {
        let mut guard = self.backends.lock().unwrap_or_else(|e| e.into_inner());
        guard.remove(addr);
    }
}

impl ClusterClient for InProcessCluster {
    fn backend(&self, addr: &BackendAddress) -> Result<Arc<dyn InternalService>> {
        let guard = self.backends.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .get(addr)
            .cloned()
            .ok_or_else(|| Status::transient(format!("backend unreachable: {addr}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::UniqueId;

    struct EchoService;

    impl InternalService for EchoService {
        fn exec_plan_fragment(&self, _req: ExecPlanFragmentRequest) -> Result<()> {
            Ok(())
        }
        fn exec_instance(&self, _req: ExecInstanceRequest) -> Result<()> {
            Ok(())
        }
        fn cancel_instance(&self, req: CancelInstanceRequest) -> Result<()> {
            assert!(!req.reason.is_empty());
            Ok(())
        }
        fn transmit(&self, req: TransmitDataRequest) -> Result<TransmitResult> {
            assert_eq!(req.payload, vec![1u8, 2, 3]);
            Ok(TransmitResult::Accepted)
        }
        fn transmit_eos(&self, _req: TransmitEosRequest) -> Result<TransmitResult> {
            Ok(TransmitResult::Accepted)
        }
        fn report_exec_status(&self, _req: ReportExecStatusRequest) -> Result<()> {
            Err(Status::cancelled("unknown query"))
        }
    }

    #[test]
    fn cluster_resolves_and_loses_backends() {
        let cluster = InProcessCluster::new();
        let addr = BackendAddress::new("w1", 21000);
        cluster.register(addr.clone(), Arc::new(EchoService));
        assert!(cluster.backend(&addr).is_ok());

        cluster.remove(&addr);
        let err = match cluster.backend(&addr) {
            Err(e) => e,
            Ok(_) => panic!("gone"),
        };
        assert!(err.is_recoverable());
    }

    #[test]
    fn requests_survive_the_serialised_path() {
        let cluster = InProcessCluster::new();
        let addr = BackendAddress::new("w1", 21000);
        cluster.register(addr.clone(), Arc::new(EchoService));
        let stub = cluster.backend(&addr).expect("stub");

        let query_id = UniqueId::new(1, 0);
        let req = TransmitDataRequest {
            version: RPC_VERSION,
            dest: ReceiverKey {
                query_id,
                finst_id: query_id.instance(0),
                node_id: 7,
            },
            sender_idx: 2,
            seq: 9,
            payload: vec![1, 2, 3],
        };
        assert_eq!(stub.transmit(req).expect("transmit"), TransmitResult::Accepted);

        let report = ReportExecStatusRequest {
            version: RPC_VERSION,
            query_id,
            instance_id: query_id.instance(0),
            seq: 1,
            done: false,
            status: None,
            profile: ProfileSnapshot::new("Instance"),
            error_log_delta: vec![],
            insert_stats: None,
        };
        let err = stub.report_exec_status(report).expect_err("unknown query");
        assert!(err.is_cancelled());
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let cluster = InProcessCluster::new();
        let addr = BackendAddress::new("w1", 21000);
        cluster.register(addr.clone(), Arc::new(EchoService));
        let stub = cluster.backend(&addr).expect("stub");
        let req = ExecInstanceRequest {
            version: RpcVersion { major: 99, minor: 0 },
            query_id: UniqueId::new(1, 0),
            instance_id: UniqueId::new(1, 1),
        };
        assert!(stub.exec_instance(req).is_err());
    }

    #[test]
    fn membership_snapshots_are_versioned() {
        let membership = ClusterMembership::new();
        let (v0, list) = membership.snapshot();
        assert!(list.is_empty());
        membership.update(vec![BackendDescriptor {
            address: BackendAddress::new("w1", 21000),
            hostname: "w1".into(),
        }]);
        let (v1, list) = membership.snapshot();
        assert_eq!(list.len(), 1);
        assert!(v1 > v0);
    }
}
