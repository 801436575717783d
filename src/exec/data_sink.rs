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

//! Fragment sinks: the result sink feeding the coordinator's fetch queue,
//! and the stream sink family (broadcast / hash-partitioned / unpartitioned)
//! transmitting serialised batches to downstream exchange receivers with
//! bounded retry on transient transport failures.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::common::logging::{debug, warn};
use crate::common::status::{Result, Status};
use crate::exprs::{hash_row, Expr};
use crate::plan::DataSinkSpec;
use crate::runtime::data_stream_mgr::{ReceiverKey, TransmitResult};
use crate::runtime::descriptors::TupleDescriptor;
use crate::runtime::profile::{CounterRef, CounterUnit, RuntimeProfile};
use crate::runtime::result_queue::ResultQueue;
use crate::runtime::row_batch::RowBatch;
use crate::runtime::runtime_state::RuntimeState;
use crate::service::rpc::{
    FragmentDestination, TransmitDataRequest, TransmitEosRequest, RPC_VERSION,
};

const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(50);

/// Terminal consumer of a fragment's output batches.
pub trait DataSink: Send {
    fn prepare(&mut self, state: &RuntimeState) -> Result<()>;
    fn open(&mut self, state: &RuntimeState) -> Result<()>;
    fn send(&mut self, state: &RuntimeState, batch: &RowBatch) -> Result<()>;
    /// Runs exactly once. `success` controls whether buffered rows flush and
    /// end-of-stream markers go out.
    fn close(&mut self, state: &RuntimeState, success: bool) -> Result<()>;
}

/// Build the sink of one fragment instance. A result sink only exists on
/// the coordinator fragment, whose executor supplies the queue.
pub fn build_sink(
    spec: &DataSinkSpec,
    output_desc: &TupleDescriptor,
    result_queue: Option<Arc<ResultQueue>>,
    profile: &RuntimeProfile,
) -> Result<Box<dyn DataSink>> {
    match spec {
        DataSinkSpec::Result => {
            let queue = result_queue.ok_or_else(|| {
                Status::internal("result sink requires coordinator-local execution")
            })?;
            Ok(Box::new(ResultSink::new(queue, profile)))
        }
        DataSinkSpec::Broadcast { dest_node_id, .. } => Ok(Box::new(ExchangeSink::new(
            Routing::Broadcast,
            *dest_node_id,
            output_desc.clone(),
            profile,
        ))),
        DataSinkSpec::HashPartitioned {
            dest_node_id,
            exprs,
            ..
        } => Ok(Box::new(ExchangeSink::new(
            Routing::Hash(exprs.clone()),
            *dest_node_id,
            output_desc.clone(),
            profile,
        ))),
        DataSinkSpec::Unpartitioned { dest_node_id, .. } => Ok(Box::new(ExchangeSink::new(
            Routing::Single,
            *dest_node_id,
            output_desc.clone(),
            profile,
        ))),
    }
}

/// Materialises output rows into the coordinator's fetch queue.
pub struct ResultSink {
    queue: Arc<ResultQueue>,
    rows_produced: CounterRef,
}

impl ResultSink {
    pub fn new(queue: Arc<ResultQueue>, profile: &RuntimeProfile) -> Self {
        Self {
            rows_produced: profile.add_counter("RowsProduced", CounterUnit::Unit),
            queue,
        }
    }
}

impl DataSink for ResultSink {
    fn prepare(&mut self, _state: &RuntimeState) -> Result<()> {
        Ok(())
    }

    fn open(&mut self, _state: &RuntimeState) -> Result<()> {
        Ok(())
    }

    fn send(&mut self, state: &RuntimeState, batch: &RowBatch) -> Result<()> {
        let rows: Vec<_> = (0..batch.num_rows()).map(|r| batch.row(r)).collect();
        self.rows_produced.add(rows.len() as i64);
        self.queue.push_rows(rows, state.cancel_flag())
    }

    fn close(&mut self, _state: &RuntimeState, success: bool) -> Result<()> {
        if success {
            self.queue.mark_eos();
        }
        Ok(())
    }
}

enum Routing {
    Broadcast,
    Hash(Vec<Expr>),
    Single,
}

struct Channel {
    dest: FragmentDestination,
    buffer: RowBatch,
    next_seq: u64,
    closed: bool,
}

/// Send side of an exchange: one channel per destination instance, FIFO per
/// channel. Transient transport errors retry with exponential backoff up to
/// `transmit_max_attempts`; exhaustion promotes to a fatal query status.
pub struct ExchangeSink {
    routing: Routing,
    dest_node_id: i32,
    output_desc: TupleDescriptor,
    channels: Vec<Channel>,
    bytes_sent: CounterRef,
    batches_sent: CounterRef,
    transmit_timer: CounterRef,
    eos_sent: CounterRef,
}

impl ExchangeSink {
    pub fn new(
        routing: Routing,
        dest_node_id: i32,
        output_desc: TupleDescriptor,
        profile: &RuntimeProfile,
    ) -> Self {
        Self {
            routing,
            dest_node_id,
            output_desc,
            channels: Vec::new(),
            bytes_sent: profile.add_counter("BytesSent", CounterUnit::Bytes),
            batches_sent: profile.add_counter("BatchesSent", CounterUnit::Unit),
            transmit_timer: profile.add_timer("TransmitDataRPCTime"),
            eos_sent: profile.add_counter("EosSent", CounterUnit::Unit),
        }
    }

    fn receiver_key(&self, state: &RuntimeState, dest: &FragmentDestination) -> ReceiverKey {
        ReceiverKey {
            query_id: state.query_id(),
            finst_id: dest.finst_id,
            node_id: self.dest_node_id,
        }
    }

    /// One transmit with bounded retry. Returns false when the receiver is
    /// closed (the channel stops sending data).
    fn transmit_with_retry(
        &self,
        state: &RuntimeState,
        dest: &FragmentDestination,
        payload: Option<Vec<u8>>,
        seq: u64,
    ) -> Result<bool> {
        let max_attempts = state.options().transmit_max_attempts;
        let mut backoff = RETRY_BACKOFF_BASE;
        let mut last_err = Status::transient("transmit not attempted");
        for attempt in 0..max_attempts {
            if state.is_cancelled() {
                return Err(Status::cancelled("transmit cancelled"));
            }
            let call = || -> Result<TransmitResult> {
                let stub = state.env().cluster().backend(&dest.backend)?;
                match &payload {
                    Some(bytes) => stub.transmit(TransmitDataRequest {
                        version: RPC_VERSION,
                        dest: self.receiver_key(state, dest),
                        sender_idx: state.backend_num() as usize,
                        seq,
                        payload: bytes.clone(),
                    }),
                    None => stub.transmit_eos(TransmitEosRequest {
                        version: RPC_VERSION,
                        dest: self.receiver_key(state, dest),
                        sender_idx: state.backend_num() as usize,
                    }),
                }
            };
            match call() {
                Ok(TransmitResult::Accepted) => return Ok(true),
                Ok(TransmitResult::ReceiverClosed) => return Ok(false),
                Ok(TransmitResult::QueryCancelled) => {
                    return Err(Status::cancelled("destination reports query cancelled"));
                }
                Err(err) if err.is_recoverable() => {
                    warn!(
                        "transmit attempt {}/{} failed: dest={} err={}",
                        attempt + 1,
                        max_attempts,
                        dest.backend,
                        err
                    );
                    last_err = err;
                    std::thread::sleep(backoff.min(state.cancel_check_interval()));
                    backoff *= 2;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err
            .with_detail(format!(
                "transmit retries exhausted after {max_attempts} attempts to {}",
                dest.backend
            ))
            .into_fatal())
    }

    fn flush_channel(&mut self, state: &RuntimeState, idx: usize) -> Result<()> {
        if self.channels[idx].buffer.is_empty() || self.channels[idx].closed {
            let desc = self.output_desc.clone();
            self.channels[idx].buffer = RowBatch::new(desc, state.batch_size());
            return Ok(());
        }
        let payload = self.channels[idx].buffer.to_wire();
        let seq = self.channels[idx].next_seq;
        let dest = self.channels[idx].dest.clone();
        let start = Instant::now();
        let accepted = self.transmit_with_retry(state, &dest, Some(payload.clone()), seq)?;
        self.transmit_timer
            .add(i64::try_from(start.elapsed().as_nanos()).unwrap_or(i64::MAX));
        if accepted {
            self.channels[idx].next_seq += 1;
            self.bytes_sent.add(payload.len() as i64);
            self.batches_sent.add(1);
        } else {
            debug!(
                "exchange channel closed by receiver: dest={} node_id={}",
                self.channels[idx].dest.backend, self.dest_node_id
            );
            self.channels[idx].closed = true;
        }
        self.channels[idx].buffer = RowBatch::new(self.output_desc.clone(), state.batch_size());
        Ok(())
    }

    fn add_row_to_channel(
        &mut self,
        state: &RuntimeState,
        idx: usize,
        row: &[crate::runtime::descriptors::Datum],
    ) -> Result<()> {
        if self.channels[idx].closed {
            return Ok(());
        }
        if self.channels[idx].buffer.is_full() {
            self.flush_channel(state, idx)?;
        }
        if self.channels[idx].closed {
            return Ok(());
        }
        self.channels[idx].buffer.add_row(row)
    }
}

impl DataSink for ExchangeSink {
    fn prepare(&mut self, state: &RuntimeState) -> Result<()> {
        if state.destinations().is_empty() {
            return Err(Status::internal("stream sink has no destinations"));
        }
        self.channels = state
            .destinations()
            .iter()
            .map(|dest| Channel {
                dest: dest.clone(),
                buffer: RowBatch::new(self.output_desc.clone(), state.batch_size()),
                next_seq: 1,
                closed: false,
            })
            .collect();
        if let Routing::Hash(exprs) = &self.routing {
            if !state.options().disable_codegen {
                for expr in exprs {
                    expr.bind(&self.output_desc)?;
                }
            }
        }
        Ok(())
    }

    fn open(&mut self, _state: &RuntimeState) -> Result<()> {
        Ok(())
    }

    fn send(&mut self, state: &RuntimeState, batch: &RowBatch) -> Result<()> {
        match &self.routing {
            Routing::Broadcast => {
                for idx in 0..self.channels.len() {
                    for row in 0..batch.num_rows() {
                        let values = batch.row(row);
                        self.add_row_to_channel(state, idx, &values)?;
                    }
                }
            }
            Routing::Single => {
                for row in 0..batch.num_rows() {
                    let values = batch.row(row);
                    self.add_row_to_channel(state, 0, &values)?;
                }
            }
            Routing::Hash(exprs) => {
                let exprs = exprs.clone();
                let num = self.channels.len() as u64;
                for row in 0..batch.num_rows() {
                    let idx = (hash_row(&exprs, batch, row)? % num) as usize;
                    let values = batch.row(row);
                    self.add_row_to_channel(state, idx, &values)?;
                }
            }
        }
        Ok(())
    }

    fn close(&mut self, state: &RuntimeState, success: bool) -> Result<()> {
        if !success {
            return Ok(());
        }
        for idx in 0..self.channels.len() {
            self.flush_channel(state, idx)?;
            let dest = self.channels[idx].dest.clone();
            // Eos goes out even to closed channels; it is idempotent and the
            // receiver may still be counting senders.
            self.transmit_with_retry(state, &dest, None, self.channels[idx].next_seq)?;
            self.eos_sent.add(1);
        }
        Ok(())
    }
}
