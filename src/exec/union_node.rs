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

/// UNION ALL: children share the output schema and are drained in order.
/// Non-blocking; children open lazily as the previous one exhausts.
pub struct UnionNode {
    shared: NodeShared,
    children: Vec<Box<dyn ExecNode>>,
    current: usize,
    current_eos: bool,
}

impl UnionNode {
    pub fn new(state: &RuntimeState, plan: &PlanNode, children: Vec<Box<dyn ExecNode>>) -> Self {
        Self {
            shared: NodeShared::from_plan(plan, state),
            children,
            current: 0,
            current_eos: false,
        }
    }
}

impl ExecNode for UnionNode {
    fn prepare(&mut self, state: &RuntimeState) -> Result<()> {
        for child in &mut self.children {
            child.prepare(state)?;
        }
        self.shared
            .prepare_conjuncts(state, &self.shared.output_desc)
    }

    fn open(&mut self, state: &RuntimeState) -> Result<()> {
        for child in &mut self.children {
            child.open(state)?;
        }
        Ok(())
    }

    fn get_next(&mut self, state: &RuntimeState, batch: &mut RowBatch) -> Result<bool> {
        loop {
            if state.is_cancelled() {
                return Err(Status::cancelled("union cancelled"));
            }
            if !self.shared.flush_pending(batch)? || batch.is_full() {
                return Ok(false);
            }
            if self.shared.reached_limit() {
                return Ok(true);
            }
            if self.current >= self.children.len() {
                return Ok(self.shared.pending_is_empty());
            }
            if self.current_eos {
                self.current += 1;
                self.current_eos = false;
                continue;
            }
            let child = &mut self.children[self.current];
            let mut child_batch =
                RowBatch::new(child.output_desc().clone(), state.batch_size());
            self.current_eos = child.get_next(state, &mut child_batch)?;
            self.shared.absorb_batch(&child_batch)?;
        }
    }

    fn close(&mut self, state: &RuntimeState) {
        if !self.shared.mark_closed() {
            return;
        }
        for child in &mut self.children {
            child.close(state);
        }
    }

    fn output_desc(&self) -> &crate::runtime::descriptors::TupleDescriptor {
        &self.shared.output_desc
    }
}
