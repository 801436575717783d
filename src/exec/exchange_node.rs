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
use crate::common::status::{Result, Status};
use crate::exec::{ExecNode, NodeShared};
use crate::plan::PlanNode;
use crate::runtime::data_stream_mgr::{DataStreamRecvr, ReceiverKey};
use crate::runtime::descriptors::TupleDescriptor;
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::row_batch::RowBatch;
use crate::runtime::runtime_state::RuntimeState;

/// Receive side of an exchange: the root of every non-leaf fragment. Pulls
/// decoded batches off this instance's stream receiver; interleaving across
/// senders follows arrival order (a merging variant is future work).
pub struct ExchangeNode {
    shared: NodeShared,
    input_desc: TupleDescriptor,
    recvr: Option<DataStreamRecvr>,
    stream_eos: bool,
}

impl ExchangeNode {
    pub fn new(state: &RuntimeState, plan: &PlanNode, input_desc: TupleDescriptor) -> Self {
        Self {
            shared: NodeShared::from_plan(plan, state),
            input_desc,
            recvr: None,
            stream_eos: false,
        }
    }

    fn receiver_key(&self, state: &RuntimeState) -> ReceiverKey {
        ReceiverKey {
            query_id: state.query_id(),
            finst_id: state.fragment_instance_id(),
            node_id: self.shared.id,
        }
    }
}

impl ExecNode for ExchangeNode {
    fn prepare(&mut self, state: &RuntimeState) -> Result<()> {
        self.shared
            .prepare_conjuncts(state, &self.shared.output_desc)?;
        let key = self.receiver_key(state);
        let num_senders = state.num_senders(self.shared.id);
        let queue_tracker = MemTracker::new_child(
            format!("exchange receiver (node_id={})", self.shared.id),
            None,
            state.instance_mem_tracker(),
        );
        let recvr = state.env().stream_mgr().create_receiver(
            key,
            self.input_desc.clone(),
            num_senders,
            state.options().exchange_receive_buffer_bytes,
            queue_tracker,
            &self.shared.profile,
        )?;
        self.shared
            .profile
            .add_info_string("NumSenders", num_senders.to_string());
        self.recvr = Some(recvr);
        Ok(())
    }

    fn open(&mut self, _state: &RuntimeState) -> Result<()> {
        Ok(())
    }

    fn get_next(&mut self, state: &RuntimeState, batch: &mut RowBatch) -> Result<bool> {
        loop {
            if state.is_cancelled() {
                return Err(Status::cancelled("exchange cancelled"));
            }
            if !self.shared.flush_pending(batch)? || batch.is_full() {
                return Ok(false);
            }
            if self.shared.reached_limit() {
                // Upstream senders observe receiver-closed and stop.
                if let Some(recvr) = self.recvr.take() {
                    recvr.close();
                }
                return Ok(true);
            }
            if self.stream_eos {
                return Ok(self.shared.pending_is_empty());
            }
            let Some(recvr) = self.recvr.as_ref() else {
                return Ok(true);
            };
            match recvr.get_batch(state.cancel_flag())? {
                Some(incoming) => self.shared.absorb_batch(&incoming)?,
                None => self.stream_eos = true,
            }
        }
    }

    fn close(&mut self, _state: &RuntimeState) {
        if !self.shared.mark_closed() {
            return;
        }
        if let Some(recvr) = self.recvr.take() {
            recvr.close();
        }
    }

    fn output_desc(&self) -> &TupleDescriptor {
        &self.shared.output_desc
    }
}
