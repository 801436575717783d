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
use crate::runtime::row_batch::RowBatch;
use crate::runtime::runtime_state::RuntimeState;

/// Selection: re-evaluates its conjuncts over the child's output. Used where
/// predicates cannot be pushed into the producing node.
pub struct SelectNode {
    shared: NodeShared,
    child: Box<dyn ExecNode>,
    child_eos: bool,
}

impl SelectNode {
    pub fn new(state: &RuntimeState, plan: &PlanNode, child: Box<dyn ExecNode>) -> Self {
        Self {
            shared: NodeShared::from_plan(plan, state),
            child,
            child_eos: false,
        }
    }
}

impl ExecNode for SelectNode {
    fn prepare(&mut self, state: &RuntimeState) -> Result<()> {
        self.child.prepare(state)?;
        self.shared
            .prepare_conjuncts(state, &self.shared.output_desc)
    }

    fn open(&mut self, state: &RuntimeState) -> Result<()> {
        self.child.open(state)
    }

    fn get_next(&mut self, state: &RuntimeState, batch: &mut RowBatch) -> Result<bool> {
        loop {
            if state.is_cancelled() {
                return Err(Status::cancelled("select cancelled"));
            }
            if !self.shared.flush_pending(batch)? || batch.is_full() {
                return Ok(false);
            }
            if self.shared.reached_limit() {
                return Ok(true);
            }
            if self.child_eos {
                return Ok(self.shared.pending_is_empty());
            }
            let mut child_batch =
                RowBatch::new(self.child.output_desc().clone(), state.batch_size());
            self.child_eos = self.child.get_next(state, &mut child_batch)?;
            self.shared.absorb_batch(&child_batch)?;
        }
    }

    fn close(&mut self, state: &RuntimeState) {
        if !self.shared.mark_closed() {
            return;
        }
        self.child.close(state);
    }

    fn output_desc(&self) -> &crate::runtime::descriptors::TupleDescriptor {
        &self.shared.output_desc
    }
}
