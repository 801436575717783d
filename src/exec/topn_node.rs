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

//! Top-N: sort bounded to the N smallest rows under the sort order.
//! Blocking, but memory is bounded by N rather than the input size.

use crate::common::status::{Result, Status};
use crate::exec::{cmp_sort_keys, eval_sort_keys, ExecNode, NodeShared};
use crate::plan::{PlanNode, SortKey};
use crate::runtime::descriptors::{Datum, TupleDescriptor};
use crate::runtime::row_batch::RowBatch;
use crate::runtime::runtime_state::RuntimeState;

pub struct TopNNode {
    shared: NodeShared,
    keys: Vec<SortKey>,
    top_n: usize,
    child: Box<dyn ExecNode>,
    // Kept sorted ascending by key; never longer than top_n.
    rows: Vec<(Vec<Datum>, Vec<Datum>)>,
    next_row: usize,
}

impl TopNNode {
    pub fn new(
        state: &RuntimeState,
        plan: &PlanNode,
        keys: Vec<SortKey>,
        top_n: usize,
        child: Box<dyn ExecNode>,
    ) -> Self {
        Self {
            shared: NodeShared::from_plan(plan, state),
            keys,
            top_n,
            child,
            rows: Vec::new(),
            next_row: 0,
        }
    }
}

impl ExecNode for TopNNode {
    fn prepare(&mut self, state: &RuntimeState) -> Result<()> {
        self.child.prepare(state)?;
        if !state.options().disable_codegen {
            let child_desc = self.child.output_desc().clone();
            for key in &self.keys {
                key.expr.bind(&child_desc)?;
            }
        }
        self.shared
            .prepare_conjuncts(state, &self.shared.output_desc)
    }

    fn open(&mut self, state: &RuntimeState) -> Result<()> {
        let _t = self.shared.profile.scoped_timer("InsertTime");
        self.child.open(state)?;
        if self.top_n == 0 {
            return Ok(());
        }
        loop {
            if state.is_cancelled() {
                return Err(Status::cancelled("top-n cancelled"));
            }
            let mut batch = RowBatch::new(self.child.output_desc().clone(), state.batch_size());
            let eos = self.child.get_next(state, &mut batch)?;
            for row in 0..batch.num_rows() {
                let key_values = eval_sort_keys(&self.keys, &batch, row)?;
                if self.rows.len() >= self.top_n {
                    let worst = &self.rows[self.rows.len() - 1].0;
                    if cmp_sort_keys(&self.keys, &key_values, worst)
                        != std::cmp::Ordering::Less
                    {
                        continue;
                    }
                }
                let pos = self
                    .rows
                    .partition_point(|(k, _)| {
                        cmp_sort_keys(&self.keys, k, &key_values) != std::cmp::Ordering::Greater
                    });
                self.rows.insert(pos, (key_values, batch.row(row)));
                self.rows.truncate(self.top_n);
            }
            if eos {
                break;
            }
        }
        Ok(())
    }

    fn get_next(&mut self, state: &RuntimeState, batch: &mut RowBatch) -> Result<bool> {
        loop {
            if state.is_cancelled() {
                return Err(Status::cancelled("top-n cancelled"));
            }
            if !self.shared.flush_pending(batch)? || batch.is_full() {
                return Ok(false);
            }
            if self.shared.reached_limit() {
                return Ok(true);
            }
            if self.next_row >= self.rows.len() {
                return Ok(self.shared.pending_is_empty());
            }
            let mut scratch = RowBatch::new(self.shared.output_desc.clone(), state.batch_size());
            while self.next_row < self.rows.len() && !scratch.is_full() {
                scratch.add_row(&self.rows[self.next_row].1)?;
                self.next_row += 1;
            }
            self.shared.absorb_batch(&scratch)?;
        }
    }

    fn close(&mut self, state: &RuntimeState) {
        if !self.shared.mark_closed() {
            return;
        }
        self.rows.clear();
        self.child.close(state);
    }

    fn output_desc(&self) -> &TupleDescriptor {
        &self.shared.output_desc
    }
}
