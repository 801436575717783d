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

//! Hash join. Blocking on the build (right) side: `open` consumes the whole
//! right input into an in-memory table accounted against the instance
//! tracker, then probes stream from the left. Output rows are the left
//! columns followed by the right columns; left-outer rows pad the right
//! side with NULLs.

use std::collections::HashMap;

use crate::common::status::{Result, Status};
use crate::exec::{materialized_row_bytes, ExecNode, NodeShared};
use crate::exprs::{encode_group_key, Expr};
use crate::plan::{JoinOp, PlanNode};
use crate::runtime::descriptors::{Datum, TupleDescriptor};
use crate::runtime::profile::CounterUnit;
use crate::runtime::row_batch::RowBatch;
use crate::runtime::runtime_state::RuntimeState;

pub struct HashJoinNode {
    shared: NodeShared,
    join_op: JoinOp,
    left_keys: Vec<Expr>,
    right_keys: Vec<Expr>,
    left: Box<dyn ExecNode>,
    right: Box<dyn ExecNode>,
    hash_table: HashMap<Vec<u8>, Vec<Vec<Datum>>>,
    right_width: usize,
    consumed_bytes: i64,
    left_eos: bool,
}

impl HashJoinNode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: &RuntimeState,
        plan: &PlanNode,
        join_op: JoinOp,
        left_keys: Vec<Expr>,
        right_keys: Vec<Expr>,
        left: Box<dyn ExecNode>,
        right: Box<dyn ExecNode>,
    ) -> Self {
        let right_width = right.output_desc().num_columns();
        Self {
            shared: NodeShared::from_plan(plan, state),
            join_op,
            left_keys,
            right_keys,
            left,
            right,
            hash_table: HashMap::new(),
            right_width,
            consumed_bytes: 0,
            left_eos: false,
        }
    }

    /// Consume the entire build side. This is where a too-large build input
    /// trips the query memory limit.
    fn build(&mut self, state: &RuntimeState) -> Result<()> {
        let _t = self.shared.profile.scoped_timer("BuildTime");
        self.right.open(state)?;
        let build_rows = self
            .shared
            .profile
            .add_counter("BuildRows", CounterUnit::Unit);
        loop {
            if state.is_cancelled() {
                return Err(Status::cancelled("hash join build cancelled"));
            }
            let mut batch = RowBatch::new(self.right.output_desc().clone(), state.batch_size());
            let eos = self.right.get_next(state, &mut batch)?;
            for row in 0..batch.num_rows() {
                let key = encode_group_key(&self.right_keys, &batch, row)?;
                let values = batch.row(row);
                let entry_bytes = (key.len() + materialized_row_bytes(&values)) as i64;
                state
                    .instance_mem_tracker()
                    .try_consume(entry_bytes)
                    .map_err(|e| {
                        e.with_detail(format!(
                            "hash join build side (node_id={})",
                            self.shared.id
                        ))
                    })?;
                self.consumed_bytes += entry_bytes;
                self.hash_table.entry(key).or_default().push(values);
                build_rows.add(1);
            }
            if eos {
                break;
            }
        }
        Ok(())
    }

    /// Join one probe batch; matches run through this node's conjuncts and
    /// limit via the shared pending buffer.
    fn probe_batch(&mut self, state: &RuntimeState, batch: &RowBatch) -> Result<()> {
        let mut scratch = RowBatch::new(self.shared.output_desc.clone(), state.batch_size());
        for row in 0..batch.num_rows() {
            let key = encode_group_key(&self.left_keys, batch, row)?;
            let left_values = batch.row(row);
            let mut emit = |out: Vec<Datum>,
                            scratch: &mut RowBatch,
                            shared: &mut NodeShared|
             -> Result<()> {
                if scratch.is_full() {
                    shared.absorb_batch(scratch)?;
                    *scratch = RowBatch::new(shared.output_desc.clone(), state.batch_size());
                }
                scratch.add_row(&out)
            };
            match self.hash_table.get(&key) {
                Some(matches) => {
                    for right_values in matches {
                        let mut out = left_values.clone();
                        out.extend(right_values.iter().cloned());
                        emit(out, &mut scratch, &mut self.shared)?;
                    }
                }
                None => {
                    if self.join_op == JoinOp::LeftOuter {
                        let mut out = left_values.clone();
                        out.extend(std::iter::repeat(Datum::Null).take(self.right_width));
                        emit(out, &mut scratch, &mut self.shared)?;
                    }
                }
            }
        }
        self.shared.absorb_batch(&scratch)
    }
}

impl ExecNode for HashJoinNode {
    fn prepare(&mut self, state: &RuntimeState) -> Result<()> {
        self.left.prepare(state)?;
        self.right.prepare(state)?;
        if !state.options().disable_codegen {
            let left_desc = self.left.output_desc().clone();
            let right_desc = self.right.output_desc().clone();
            for key in &self.left_keys {
                key.bind(&left_desc)?;
            }
            for key in &self.right_keys {
                key.bind(&right_desc)?;
            }
        }
        self.shared
            .prepare_conjuncts(state, &self.shared.output_desc)
    }

    fn open(&mut self, state: &RuntimeState) -> Result<()> {
        self.build(state)?;
        self.left.open(state)
    }

    fn get_next(&mut self, state: &RuntimeState, batch: &mut RowBatch) -> Result<bool> {
        loop {
            if state.is_cancelled() {
                return Err(Status::cancelled("hash join cancelled"));
            }
            if !self.shared.flush_pending(batch)? || batch.is_full() {
                return Ok(false);
            }
            if self.shared.reached_limit() {
                return Ok(true);
            }
            if self.left_eos {
                return Ok(self.shared.pending_is_empty());
            }
            let mut probe = RowBatch::new(self.left.output_desc().clone(), state.batch_size());
            self.left_eos = self.left.get_next(state, &mut probe)?;
            self.probe_batch(state, &probe)?;
        }
    }

    fn close(&mut self, state: &RuntimeState) {
        if !self.shared.mark_closed() {
            return;
        }
        self.hash_table.clear();
        if self.consumed_bytes > 0 {
            state.instance_mem_tracker().release(self.consumed_bytes);
            self.consumed_bytes = 0;
        }
        self.left.close(state);
        self.right.close(state);
    }

    fn output_desc(&self) -> &TupleDescriptor {
        &self.shared.output_desc
    }
}
