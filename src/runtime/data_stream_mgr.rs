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

//! Per-worker registry of tuple-stream receivers. Senders (local sinks or
//! remote workers over the transmit RPC) push serialised row batches at a
//! receiver identified by `(query_id, dest_instance_id, node_id)`; the
//! receiver hands decoded batches to its exchange node with backpressure
//! measured in bytes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::common::logging::debug;
use crate::common::status::{Result, Status};
use crate::common::types::{FragmentInstanceId, QueryId};
use crate::runtime::descriptors::TupleDescriptor;
use crate::runtime::mem_tracker::{MemTracker, TrackedBytes};
use crate::runtime::profile::{CounterRef, CounterUnit, RuntimeProfile};
use crate::runtime::row_batch::RowBatch;

const TOMBSTONE_TTL: Duration = Duration::from_secs(600);
const TOMBSTONE_MAX: usize = 8192;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ReceiverKey {
    pub query_id: QueryId,
    pub finst_id: FragmentInstanceId,
    pub node_id: i32,
}

/// Outcome of one transmit as seen by the sender.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TransmitResult {
    Accepted,
    ReceiverClosed,
    QueryCancelled,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum ReceiverState {
    Open,
    Draining,
    Closed,
}

struct QueuedBatch {
    batch: RowBatch,
    _accounting: TrackedBytes,
}

struct RecvInner {
    state: ReceiverState,
    queue: VecDeque<QueuedBatch>,
    buffered_bytes: usize,
    closed_senders: HashSet<usize>,
    last_seq: HashMap<usize, u64>,
    cancel_status: Option<Status>,
}

struct Receiver {
    key: ReceiverKey,
    desc: TupleDescriptor,
    num_senders: usize,
    buffer_limit_bytes: usize,
    mem_tracker: Arc<MemTracker>,
    mu: Mutex<RecvInner>,
    data_cv: Condvar,
    space_cv: Condvar,
    bytes_received: CounterRef,
    batches_received: CounterRef,
    deserialize_timer: CounterRef,
}

impl Receiver {
    fn all_senders_closed(inner: &RecvInner, num_senders: usize) -> bool {
        inner.closed_senders.len() >= num_senders
    }
}

/// Why a tombstone exists for a receiver key that is no longer registered.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Tombstone {
    Closed,
    Cancelled,
}

/// Handle owned by the exchange node of the receiving fragment instance.
pub struct DataStreamRecvr {
    mgr: Arc<DataStreamMgr>,
    receiver: Arc<Receiver>,
}

impl DataStreamRecvr {
    pub fn key(&self) -> ReceiverKey {
        self.receiver.key
    }

    /// Block until a batch is available (Some), every expected sender has
    /// closed (None), the query is cancelled, or the receive timeout lapses.
    /// `cancel_flag` is the owning instance's flag; the wait re-checks it at
    /// the manager's bounded interval.
    pub fn get_batch(&self, cancel_flag: &AtomicBool) -> Result<Option<RowBatch>> {
        let r = &*self.receiver;
        let deadline = Instant::now() + self.mgr.receive_timeout;
        let mut inner = r.mu.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(status) = inner.cancel_status.clone() {
                return Err(status);
            }
            if cancel_flag.load(Ordering::Acquire) {
                return Err(Status::cancelled("fragment instance cancelled"));
            }
            if let Some(queued) = inner.queue.pop_front() {
                inner.buffered_bytes = inner
                    .buffered_bytes
                    .saturating_sub(queued.batch.byte_size());
                self.mgr.notify_space(r, &inner);
                return Ok(Some(queued.batch));
            }
            if inner.state == ReceiverState::Closed {
                return Ok(None);
            }
            if r.num_senders == 0 || Receiver::all_senders_closed(&inner, r.num_senders) {
                inner.state = ReceiverState::Closed;
                return Ok(None);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Status::timed_out(format!(
                    "exchange receive timed out: finst={} node_id={} closed_senders={}/{}",
                    r.key.finst_id,
                    r.key.node_id,
                    inner.closed_senders.len(),
                    r.num_senders
                )));
            }
            let wait = self.mgr.cancel_check_interval.min(deadline - now);
            let (next, _) = r
                .data_cv
                .wait_timeout(inner, wait)
                .unwrap_or_else(|e| e.into_inner());
            inner = next;
        }
    }

    /// Mark the receiver done. In-flight transmits observe receiver-closed
    /// and discard their payloads.
    pub fn close(&self) {
        self.mgr.close_receiver(self.receiver.key);
    }
}

impl Drop for DataStreamRecvr {
    fn drop(&mut self) {
        self.mgr.close_receiver(self.receiver.key);
    }
}

/// Process-wide exchange registry, owned by `ExecEnv`.
pub struct DataStreamMgr {
    receivers: Mutex<HashMap<ReceiverKey, Arc<Receiver>>>,
    tombstones: Mutex<HashMap<ReceiverKey, (Tombstone, Instant)>>,
    /// Signals registration of new receivers to early transmitters.
    registry_cv: Condvar,
    cancel_check_interval: Duration,
    receive_timeout: Duration,
}

impl DataStreamMgr {
    pub fn new(cancel_check_interval: Duration, receive_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            receivers: Mutex::new(HashMap::new()),
            tombstones: Mutex::new(HashMap::new()),
            registry_cv: Condvar::new(),
            cancel_check_interval,
            receive_timeout,
        })
    }

    /// Register the receiving end of one exchange. All key parts together
    /// form the lookup key; the buffer is bounded in bytes.
    pub fn create_receiver(
        self: &Arc<Self>,
        key: ReceiverKey,
        desc: TupleDescriptor,
        num_senders: usize,
        buffer_bytes: usize,
        mem_tracker: Arc<MemTracker>,
        profile: &RuntimeProfile,
    ) -> Result<DataStreamRecvr> {
        if let Some(status) = self.tombstone_status(&key) {
            return Err(status);
        }
        let receiver = Arc::new(Receiver {
            key,
            desc,
            num_senders,
            buffer_limit_bytes: buffer_bytes.max(1),
            mem_tracker,
            mu: Mutex::new(RecvInner {
                state: ReceiverState::Open,
                queue: VecDeque::new(),
                buffered_bytes: 0,
                closed_senders: HashSet::new(),
                last_seq: HashMap::new(),
                cancel_status: None,
            }),
            data_cv: Condvar::new(),
            space_cv: Condvar::new(),
            bytes_received: profile.add_counter("BytesReceived", CounterUnit::Bytes),
            batches_received: profile.add_counter("BatchesReceived", CounterUnit::Unit),
            deserialize_timer: profile.add_timer("DeserializeRowBatchTime"),
        });
        let mut guard = self.receivers.lock().unwrap_or_else(|e| e.into_inner());
        if guard.contains_key(&key) {
            return Err(Status::internal(format!(
                "exchange receiver already registered: finst={} node_id={}",
                key.finst_id, key.node_id
            )));
        }
        guard.insert(key, Arc::clone(&receiver));
        self.registry_cv.notify_all();
        drop(guard);
        debug!(
            "exchange receiver created: finst={} node_id={} num_senders={}",
            key.finst_id, key.node_id, num_senders
        );
        Ok(DataStreamRecvr {
            mgr: Arc::clone(self),
            receiver,
        })
    }

    /// Enqueue a serialised batch at the receiver, blocking while its buffer
    /// is full. Called from the transmit RPC handler.
    pub fn transmit(
        &self,
        key: ReceiverKey,
        sender_idx: usize,
        seq: u64,
        payload: &[u8],
    ) -> Result<TransmitResult> {
        let receiver = match self.wait_for_receiver(&key)? {
            Ok(receiver) => receiver,
            Err(result) => return Ok(result),
        };

        let decode_start = Instant::now();
        let batch = RowBatch::from_wire(receiver.desc.clone(), payload)?;
        receiver
            .deserialize_timer
            .add(i64::try_from(decode_start.elapsed().as_nanos()).unwrap_or(i64::MAX));
        let batch_bytes = batch.byte_size();

        let mut inner = receiver.mu.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if inner.cancel_status.is_some() {
                // A cancelled receiver still accepts and discards transmits.
                return Ok(TransmitResult::QueryCancelled);
            }
            if inner.state == ReceiverState::Closed {
                return Ok(TransmitResult::ReceiverClosed);
            }
            let last = inner.last_seq.get(&sender_idx).copied();
            if last.is_some_and(|l| seq <= l) {
                // Duplicate delivery from a sender retry.
                debug!(
                    "exchange transmit duplicate dropped: finst={} node_id={} sender={} seq={}",
                    key.finst_id, key.node_id, sender_idx, seq
                );
                return Ok(TransmitResult::Accepted);
            }
            if inner.buffered_bytes + batch_bytes <= receiver.buffer_limit_bytes
                || inner.queue.is_empty()
            {
                break;
            }
            let (next, _) = receiver
                .space_cv
                .wait_timeout(inner, self.cancel_check_interval)
                .unwrap_or_else(|e| e.into_inner());
            inner = next;
        }

        inner.last_seq.insert(sender_idx, seq);
        inner.buffered_bytes += batch_bytes;
        receiver.bytes_received.add(payload.len() as i64);
        receiver.batches_received.add(1);
        let accounting = TrackedBytes::new(batch_bytes, Arc::clone(&receiver.mem_tracker));
        inner.queue.push_back(QueuedBatch {
            batch,
            _accounting: accounting,
        });
        receiver.data_cv.notify_all();
        Ok(TransmitResult::Accepted)
    }

    /// Deliver one sender's closed marker; idempotent within a query.
    pub fn transmit_eos(&self, key: ReceiverKey, sender_idx: usize) -> Result<TransmitResult> {
        let receiver = match self.wait_for_receiver(&key)? {
            Ok(receiver) => receiver,
            Err(result) => return Ok(result),
        };
        let mut inner = receiver.mu.lock().unwrap_or_else(|e| e.into_inner());
        if inner.cancel_status.is_some() {
            return Ok(TransmitResult::QueryCancelled);
        }
        if inner.state == ReceiverState::Closed {
            return Ok(TransmitResult::ReceiverClosed);
        }
        inner.closed_senders.insert(sender_idx);
        if Receiver::all_senders_closed(&inner, receiver.num_senders)
            && inner.state == ReceiverState::Open
        {
            inner.state = ReceiverState::Draining;
            debug!(
                "exchange receiver draining: finst={} node_id={} senders={}",
                key.finst_id, key.node_id, receiver.num_senders
            );
        }
        receiver.data_cv.notify_all();
        Ok(TransmitResult::Accepted)
    }

    /// Cancel every receiver belonging to `query_id`; blocked consumers and
    /// producers wake within the bounded check interval.
    pub fn cancel_query(&self, query_id: QueryId, status: Status) {
        let keys: Vec<ReceiverKey> = {
            let guard = self.receivers.lock().unwrap_or_else(|e| e.into_inner());
            guard
                .keys()
                .filter(|k| k.query_id == query_id)
                .copied()
                .collect()
        };
        for key in keys {
            self.remove_receiver(key, Tombstone::Cancelled, Some(status.clone()));
        }
        // Future creates/transmits for this query observe cancellation too.
        let mut tombs = self.tombstones.lock().unwrap_or_else(|e| e.into_inner());
        cleanup_tombstones(&mut tombs);
    }

    fn close_receiver(&self, key: ReceiverKey) {
        self.remove_receiver(key, Tombstone::Closed, None);
    }

    fn remove_receiver(&self, key: ReceiverKey, tombstone: Tombstone, status: Option<Status>) {
        let receiver = {
            let mut guard = self.receivers.lock().unwrap_or_else(|e| e.into_inner());
            guard.remove(&key)
        };
        let Some(receiver) = receiver else {
            return;
        };
        {
            let mut tombs = self.tombstones.lock().unwrap_or_else(|e| e.into_inner());
            cleanup_tombstones(&mut tombs);
            tombs.insert(key, (tombstone, Instant::now()));
        }
        let mut inner = receiver.mu.lock().unwrap_or_else(|e| e.into_inner());
        inner.state = ReceiverState::Closed;
        if let Some(status) = status {
            if inner.cancel_status.is_none() {
                inner.cancel_status = Some(status);
            }
        }
        // Drop buffered batches; accounting guards release on drop.
        inner.queue.clear();
        inner.buffered_bytes = 0;
        receiver.data_cv.notify_all();
        receiver.space_cv.notify_all();
        debug!(
            "exchange receiver closed: finst={} node_id={} reason={:?}",
            key.finst_id, key.node_id, tombstone
        );
    }

    /// Resolve the receiver for a transmit, parking briefly if the sender
    /// raced ahead of receiver registration.
    #[allow(clippy::type_complexity)]
    fn wait_for_receiver(
        &self,
        key: &ReceiverKey,
    ) -> Result<std::result::Result<Arc<Receiver>, TransmitResult>> {
        let deadline = Instant::now() + self.receive_timeout;
        let mut guard = self.receivers.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(receiver) = guard.get(key) {
                return Ok(Ok(Arc::clone(receiver)));
            }
            match self.tombstone_kind(key) {
                Some(Tombstone::Cancelled) => return Ok(Err(TransmitResult::QueryCancelled)),
                Some(Tombstone::Closed) => return Ok(Err(TransmitResult::ReceiverClosed)),
                None => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Status::timed_out(format!(
                    "no exchange receiver registered: finst={} node_id={}",
                    key.finst_id, key.node_id
                )));
            }
            let wait = self.cancel_check_interval.min(deadline - now);
            let (next, _) = self
                .registry_cv
                .wait_timeout(guard, wait)
                .unwrap_or_else(|e| e.into_inner());
            guard = next;
        }
    }

    fn notify_space(&self, receiver: &Receiver, _inner: &RecvInner) {
        receiver.space_cv.notify_all();
    }

    fn tombstone_kind(&self, key: &ReceiverKey) -> Option<Tombstone> {
        let guard = self.tombstones.lock().unwrap_or_else(|e| e.into_inner());
        guard.get(key).map(|(t, _)| *t)
    }

    fn tombstone_status(&self, key: &ReceiverKey) -> Option<Status> {
        match self.tombstone_kind(key)? {
            Tombstone::Cancelled => Some(Status::cancelled(format!(
                "exchange cancelled: finst={} node_id={}",
                key.finst_id, key.node_id
            ))),
            Tombstone::Closed => Some(Status::internal(format!(
                "exchange receiver already closed: finst={} node_id={}",
                key.finst_id, key.node_id
            ))),
        }
    }
}

fn cleanup_tombstones(tombs: &mut HashMap<ReceiverKey, (Tombstone, Instant)>) {
    let now = Instant::now();
    tombs.retain(|_, (_, ts)| now.duration_since(*ts) <= TOMBSTONE_TTL);
    if tombs.len() > TOMBSTONE_MAX {
        tombs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::UniqueId;
    use crate::runtime::descriptors::{ColumnType, Datum};
    use std::thread;

    fn test_mgr() -> Arc<DataStreamMgr> {
        DataStreamMgr::new(Duration::from_millis(10), Duration::from_secs(2))
    }

    fn test_key() -> ReceiverKey {
        let query_id = UniqueId::new(11, 0);
        ReceiverKey {
            query_id,
            finst_id: query_id.instance(0),
            node_id: 3,
        }
    }

    fn bigint_desc() -> TupleDescriptor {
        TupleDescriptor::new(vec![ColumnType::BigInt])
    }

    fn batch_of(values: &[i64]) -> RowBatch {
        let mut batch = RowBatch::new(bigint_desc(), values.len().max(1));
        for v in values {
            batch.add_row(&[Datum::BigInt(*v)]).expect("add");
        }
        batch
    }

    fn make_recvr(mgr: &Arc<DataStreamMgr>, key: ReceiverKey, num_senders: usize) -> DataStreamRecvr {
        let tracker = MemTracker::new_root("test", None);
        let profile = RuntimeProfile::new("recvr");
        mgr.create_receiver(
            key,
            bigint_desc(),
            num_senders,
            1024 * 1024,
            tracker,
            &profile,
        )
        .expect("create")
    }

    #[test]
    fn zero_senders_is_immediate_eos() {
        let mgr = test_mgr();
        let recvr = make_recvr(&mgr, test_key(), 0);
        let cancel = AtomicBool::new(false);
        assert!(recvr.get_batch(&cancel).expect("get").is_none());
    }

    #[test]
    fn batches_flow_then_eos() {
        let mgr = test_mgr();
        let key = test_key();
        let recvr = make_recvr(&mgr, key, 1);
        let cancel = AtomicBool::new(false);

        let wire = batch_of(&[1, 2, 3]).to_wire();
        assert_eq!(
            mgr.transmit(key, 0, 1, &wire).expect("transmit"),
            TransmitResult::Accepted
        );
        assert_eq!(
            mgr.transmit_eos(key, 0).expect("eos"),
            TransmitResult::Accepted
        );

        let batch = recvr.get_batch(&cancel).expect("get").expect("batch");
        assert_eq!(batch.num_rows(), 3);
        assert!(recvr.get_batch(&cancel).expect("get").is_none());
    }

    #[test]
    fn duplicate_sequence_is_dropped() {
        let mgr = test_mgr();
        let key = test_key();
        let recvr = make_recvr(&mgr, key, 1);
        let cancel = AtomicBool::new(false);

        let wire = batch_of(&[7]).to_wire();
        mgr.transmit(key, 0, 1, &wire).expect("transmit");
        mgr.transmit(key, 0, 1, &wire).expect("retry duplicate");
        mgr.transmit_eos(key, 0).expect("eos");

        assert!(recvr.get_batch(&cancel).expect("get").is_some());
        assert!(recvr.get_batch(&cancel).expect("get").is_none());
    }

    #[test]
    fn cancel_unblocks_consumer_and_discards_transmits() {
        let mgr = test_mgr();
        let key = test_key();
        let recvr = make_recvr(&mgr, key, 1);
        let cancel = AtomicBool::new(false);

        let mgr2 = Arc::clone(&mgr);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            mgr2.cancel_query(key.query_id, Status::cancelled("client cancel"));
        });
        let err = recvr.get_batch(&cancel).expect_err("cancelled");
        assert!(err.is_cancelled());
        handle.join().expect("join");

        // Late transmits are accepted-and-discarded, not deadlocked.
        let wire = batch_of(&[1]).to_wire();
        assert_eq!(
            mgr.transmit(key, 0, 2, &wire).expect("transmit"),
            TransmitResult::QueryCancelled
        );
    }

    #[test]
    fn closed_receiver_reports_closed_to_senders() {
        let mgr = test_mgr();
        let key = test_key();
        let recvr = make_recvr(&mgr, key, 1);
        recvr.close();
        let wire = batch_of(&[1]).to_wire();
        assert_eq!(
            mgr.transmit(key, 0, 1, &wire).expect("transmit"),
            TransmitResult::ReceiverClosed
        );
    }

    #[test]
    fn backpressure_blocks_until_consumer_drains() {
        let mgr = DataStreamMgr::new(Duration::from_millis(5), Duration::from_secs(5));
        let key = test_key();
        let tracker = MemTracker::new_root("test", None);
        let profile = RuntimeProfile::new("recvr");
        let recvr = mgr
            .create_receiver(key, bigint_desc(), 1, 1, tracker, &profile)
            .expect("create");
        let cancel = AtomicBool::new(false);

        let wire = batch_of(&[1, 2, 3, 4]).to_wire();
        // First batch always fits (empty-queue override).
        mgr.transmit(key, 0, 1, &wire).expect("first");

        let mgr2 = Arc::clone(&mgr);
        let wire2 = wire.clone();
        let sender = thread::spawn(move || {
            let start = Instant::now();
            mgr2.transmit(key, 0, 2, &wire2).expect("second");
            start.elapsed()
        });
        thread::sleep(Duration::from_millis(80));
        // Drain one batch to open space.
        recvr.get_batch(&cancel).expect("get").expect("batch");
        let blocked_for = sender.join().expect("join");
        assert!(blocked_for >= Duration::from_millis(50));
    }

    #[test]
    fn mem_tracker_returns_to_zero_after_drain() {
        let mgr = test_mgr();
        let key = test_key();
        let tracker = MemTracker::new_root("test", None);
        let profile = RuntimeProfile::new("recvr");
        let recvr = mgr
            .create_receiver(
                key,
                bigint_desc(),
                1,
                1024 * 1024,
                Arc::clone(&tracker),
                &profile,
            )
            .expect("create");
        let cancel = AtomicBool::new(false);

        mgr.transmit(key, 0, 1, &batch_of(&[1, 2]).to_wire())
            .expect("transmit");
        assert!(tracker.consumption() > 0);
        mgr.transmit_eos(key, 0).expect("eos");
        recvr.get_batch(&cancel).expect("get").expect("batch");
        assert!(recvr.get_batch(&cancel).expect("get").is_none());
        assert_eq!(tracker.consumption(), 0);
    }
}
