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

//! Hash aggregation. Blocking: `open` consumes the entire child input into
//! the grouping hash table before the first output row. In `Partial` mode
//! raw input rows update the accumulators; in `MergeFinalize` mode the
//! input rows are partial states produced upstream (group columns first,
//! one state column per aggregate, in plan order).

use std::collections::HashMap;

use crate::common::status::{Result, Status};
use crate::exec::{materialized_row_bytes, ExecNode, NodeShared};
use crate::exprs::{encode_group_key, AggExpr, Expr};
use crate::plan::{AggMode, PlanNode};
use crate::runtime::descriptors::Datum;
use crate::runtime::profile::CounterUnit;
use crate::runtime::row_batch::RowBatch;
use crate::runtime::runtime_state::RuntimeState;

struct Group {
    keys: Vec<Datum>,
    states: Vec<Datum>,
}

pub struct AggregationNode {
    shared: NodeShared,
    group_by: Vec<Expr>,
    aggregates: Vec<AggExpr>,
    mode: AggMode,
    child: Box<dyn ExecNode>,
    groups: HashMap<Vec<u8>, Group>,
    output: Vec<Group>,
    output_pos: usize,
    consumed_bytes: i64,
    opened: bool,
}

impl AggregationNode {
    pub fn new(
        state: &RuntimeState,
        plan: &PlanNode,
        group_by: Vec<Expr>,
        aggregates: Vec<AggExpr>,
        mode: AggMode,
        child: Box<dyn ExecNode>,
    ) -> Self {
        Self {
            shared: NodeShared::from_plan(plan, state),
            group_by,
            aggregates,
            mode,
            child,
            groups: HashMap::new(),
            output: Vec::new(),
            output_pos: 0,
            consumed_bytes: 0,
            opened: false,
        }
    }

    fn consume_row(&mut self, state: &RuntimeState, batch: &RowBatch, row: usize) -> Result<()> {
        let key = encode_group_key(&self.group_by, batch, row)?;
        if !self.groups.contains_key(&key) {
            let keys: Vec<Datum> = self
                .group_by
                .iter()
                .map(|e| e.eval(batch, row))
                .collect::<Result<_>>()?;
            let states: Vec<Datum> = self.aggregates.iter().map(AggExpr::init_state).collect();
            let entry_bytes =
                (key.len() + materialized_row_bytes(&keys) + materialized_row_bytes(&states))
                    as i64;
            state.instance_mem_tracker().try_consume(entry_bytes)?;
            self.consumed_bytes += entry_bytes;
            self.groups.insert(key.clone(), Group { keys, states });
        }
        let group = self.groups.get_mut(&key).expect("group just ensured");
        match self.mode {
            AggMode::Partial => {
                for (agg, acc) in self.aggregates.iter().zip(group.states.iter_mut()) {
                    agg.update(acc, batch, row)?;
                }
            }
            AggMode::MergeFinalize => {
                // Partial-state columns follow the group columns.
                let base = self.group_by.len();
                for (i, (agg, acc)) in self
                    .aggregates
                    .iter()
                    .zip(group.states.iter_mut())
                    .enumerate()
                {
                    let partial = batch.get(row, base + i);
                    agg.merge(acc, &partial)?;
                }
            }
        }
        Ok(())
    }
}

impl ExecNode for AggregationNode {
    fn prepare(&mut self, state: &RuntimeState) -> Result<()> {
        self.child.prepare(state)?;
        self.shared
            .prepare_conjuncts(state, &self.shared.output_desc)?;
        if !state.options().disable_codegen {
            let child_desc = self.child.output_desc().clone();
            for expr in &self.group_by {
                expr.bind(&child_desc)?;
            }
            for agg in &self.aggregates {
                if let Some(input) = &agg.input {
                    input.bind(&child_desc)?;
                }
            }
        }
        self.shared.profile.add_info_string(
            "AggregationMode",
            match self.mode {
                AggMode::Partial => "partial",
                AggMode::MergeFinalize => "merge/finalize",
            },
        );
        self.shared
            .profile
            .add_high_water_counter("PeakGroupCount", CounterUnit::Unit);
        Ok(())
    }

    fn open(&mut self, state: &RuntimeState) -> Result<()> {
        let _t = self.shared.profile.scoped_timer("BuildTime");
        self.child.open(state)?;
        let peak_groups = self
            .shared
            .profile
            .add_high_water_counter("PeakGroupCount", CounterUnit::Unit);
        loop {
            if state.is_cancelled() {
                return Err(Status::cancelled("aggregation cancelled"));
            }
            let mut child_batch =
                RowBatch::new(self.child.output_desc().clone(), state.batch_size());
            let child_eos = self.child.get_next(state, &mut child_batch)?;
            for row in 0..child_batch.num_rows() {
                self.consume_row(state, &child_batch, row)?;
            }
            peak_groups.update_max(self.groups.len() as i64);
            if child_eos {
                break;
            }
        }
        // Ungrouped aggregation always produces exactly one row.
        if self.group_by.is_empty() && self.groups.is_empty() {
            let states: Vec<Datum> = self.aggregates.iter().map(AggExpr::init_state).collect();
            self.groups.insert(
                Vec::new(),
                Group {
                    keys: Vec::new(),
                    states,
                },
            );
        }
        self.output = self.groups.drain().map(|(_, g)| g).collect();
        self.opened = true;
        Ok(())
    }

    fn get_next(&mut self, state: &RuntimeState, batch: &mut RowBatch) -> Result<bool> {
        if !self.opened {
            return Err(Status::internal("aggregation get_next before open"));
        }
        loop {
            if state.is_cancelled() {
                return Err(Status::cancelled("aggregation cancelled"));
            }
            if !self.shared.flush_pending(batch)? || batch.is_full() {
                return Ok(false);
            }
            if self.shared.reached_limit() {
                return Ok(true);
            }
            if self.output_pos >= self.output.len() {
                return Ok(self.shared.pending_is_empty());
            }
            // Materialise a run of groups into the pending buffer, applying
            // this node's conjuncts (HAVING-style) via a scratch batch.
            let mut scratch =
                RowBatch::new(self.shared.output_desc.clone(), state.batch_size());
            while self.output_pos < self.output.len() && !scratch.is_full() {
                let group = &self.output[self.output_pos];
                let mut row: Vec<Datum> = group.keys.clone();
                row.extend(group.states.iter().cloned());
                scratch.add_row(&row)?;
                self.output_pos += 1;
            }
            self.shared.absorb_batch(&scratch)?;
        }
    }

    fn close(&mut self, state: &RuntimeState) {
        if !self.shared.mark_closed() {
            return;
        }
        self.groups.clear();
        self.output.clear();
        if self.consumed_bytes > 0 {
            state.instance_mem_tracker().release(self.consumed_bytes);
            self.consumed_bytes = 0;
        }
        self.child.close(state);
    }

    fn output_desc(&self) -> &crate::runtime::descriptors::TupleDescriptor {
        &self.shared.output_desc
    }
}
