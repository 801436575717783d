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

//! Merge join over inputs already sorted ascending on the join keys (the
//! planner guarantees the ordering). Streams both sides; only the current
//! right-side duplicate group is buffered. Inner join; NULL keys never
//! match and are skipped.

use std::cmp::Ordering;

use crate::common::status::{Result, Status};
use crate::exec::{ExecNode, NodeShared};
use crate::exprs::Expr;
use crate::plan::PlanNode;
use crate::runtime::descriptors::{cmp_datum, Datum, TupleDescriptor};
use crate::runtime::row_batch::RowBatch;
use crate::runtime::runtime_state::RuntimeState;

struct RowCursor {
    node: Box<dyn ExecNode>,
    keys: Vec<Expr>,
    batch: Option<RowBatch>,
    pos: usize,
    input_eos: bool,
}

impl RowCursor {
    fn new(node: Box<dyn ExecNode>, keys: Vec<Expr>) -> Self {
        Self {
            node,
            keys,
            batch: None,
            pos: 0,
            input_eos: false,
        }
    }

    /// Next row with a fully non-NULL key, as (key values, row values).
    fn next(&mut self, state: &RuntimeState) -> Result<Option<(Vec<Datum>, Vec<Datum>)>> {
        loop {
            if let Some(batch) = self.batch.as_ref() {
                if self.pos < batch.num_rows() {
                    let row = self.pos;
                    self.pos += 1;
                    let key: Vec<Datum> = self
                        .keys
                        .iter()
                        .map(|k| k.eval(batch, row))
                        .collect::<Result<_>>()?;
                    if key.iter().any(Datum::is_null) {
                        continue;
                    }
                    let values = batch.row(row);
                    return Ok(Some((key, values)));
                }
            }
            if self.input_eos {
                return Ok(None);
            }
            let mut batch = RowBatch::new(self.node.output_desc().clone(), state.batch_size());
            self.input_eos = self.node.get_next(state, &mut batch)?;
            self.pos = 0;
            self.batch = Some(batch);
        }
    }
}

fn cmp_keys(a: &[Datum], b: &[Datum]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = cmp_datum(x, y);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

pub struct MergeJoinNode {
    shared: NodeShared,
    left: Option<RowCursor>,
    right: Option<RowCursor>,
    current_left: Option<(Vec<Datum>, Vec<Datum>)>,
    /// Buffered right rows sharing `group_key`, plus the lookahead row that
    /// ended the group.
    group_key: Option<Vec<Datum>>,
    group_rows: Vec<Vec<Datum>>,
    right_lookahead: Option<(Vec<Datum>, Vec<Datum>)>,
    right_eos: bool,
    done: bool,
}

impl MergeJoinNode {
    pub fn new(
        state: &RuntimeState,
        plan: &PlanNode,
        left_keys: Vec<Expr>,
        right_keys: Vec<Expr>,
        left: Box<dyn ExecNode>,
        right: Box<dyn ExecNode>,
    ) -> Self {
        Self {
            shared: NodeShared::from_plan(plan, state),
            left: Some(RowCursor::new(left, left_keys)),
            right: Some(RowCursor::new(right, right_keys)),
            current_left: None,
            group_key: None,
            group_rows: Vec::new(),
            right_lookahead: None,
            right_eos: false,
            done: false,
        }
    }

    /// Load the next right-side duplicate group starting from the lookahead.
    fn load_next_group(&mut self, state: &RuntimeState) -> Result<()> {
        self.group_rows.clear();
        self.group_key = None;
        let right = self.right.as_mut().expect("cursor live until close");
        let head = match self.right_lookahead.take() {
            Some(row) => Some(row),
            None => right.next(state)?,
        };
        let Some((key, values)) = head else {
            self.right_eos = true;
            return Ok(());
        };
        self.group_rows.push(values);
        loop {
            match right.next(state)? {
                Some((next_key, next_values)) => {
                    if cmp_keys(&next_key, &key) == Ordering::Equal {
                        self.group_rows.push(next_values);
                    } else {
                        self.right_lookahead = Some((next_key, next_values));
                        break;
                    }
                }
                None => break,
            }
        }
        self.group_key = Some(key);
        Ok(())
    }

    fn join_step(&mut self, state: &RuntimeState) -> Result<bool> {
        loop {
            if state.is_cancelled() {
                return Err(Status::cancelled("merge join cancelled"));
            }
            if self.current_left.is_none() {
                let left = self.left.as_mut().expect("cursor live until close");
                self.current_left = left.next(state)?;
            }
            let Some((left_key, left_values)) = self.current_left.clone() else {
                return Ok(true);
            };
            if self.group_key.is_none() {
                if self.right_eos {
                    return Ok(true);
                }
                self.load_next_group(state)?;
                continue;
            }
            let group_key = self.group_key.clone().expect("group loaded");
            match cmp_keys(&left_key, &group_key) {
                Ordering::Less => {
                    self.current_left = None;
                }
                Ordering::Greater => {
                    self.group_key = None;
                    if self.right_eos && self.right_lookahead.is_none() {
                        return Ok(true);
                    }
                }
                Ordering::Equal => {
                    let mut scratch =
                        RowBatch::new(self.shared.output_desc.clone(), state.batch_size());
                    for right_values in &self.group_rows {
                        if scratch.is_full() {
                            self.shared.absorb_batch(&scratch)?;
                            scratch = RowBatch::new(
                                self.shared.output_desc.clone(),
                                state.batch_size(),
                            );
                        }
                        let mut out = left_values.clone();
                        out.extend(right_values.iter().cloned());
                        scratch.add_row(&out)?;
                    }
                    self.shared.absorb_batch(&scratch)?;
                    self.current_left = None;
                    return Ok(false);
                }
            }
        }
    }
}

impl ExecNode for MergeJoinNode {
    fn prepare(&mut self, state: &RuntimeState) -> Result<()> {
        let left = self.left.as_mut().expect("cursor live until close");
        left.node.prepare(state)?;
        let right = self.right.as_mut().expect("cursor live until close");
        right.node.prepare(state)?;
        if !state.options().disable_codegen {
            let left_desc = left.node.output_desc().clone();
            for key in &left.keys {
                key.bind(&left_desc)?;
            }
            let right_desc = right.node.output_desc().clone();
            for key in &right.keys {
                key.bind(&right_desc)?;
            }
        }
        self.shared
            .prepare_conjuncts(state, &self.shared.output_desc)
    }

    fn open(&mut self, state: &RuntimeState) -> Result<()> {
        self.left
            .as_mut()
            .expect("cursor live until close")
            .node
            .open(state)?;
        self.right
            .as_mut()
            .expect("cursor live until close")
            .node
            .open(state)
    }

    fn get_next(&mut self, state: &RuntimeState, batch: &mut RowBatch) -> Result<bool> {
        loop {
            if !self.shared.flush_pending(batch)? || batch.is_full() {
                return Ok(false);
            }
            if self.shared.reached_limit() {
                return Ok(true);
            }
            if self.done {
                return Ok(self.shared.pending_is_empty());
            }
            self.done = self.join_step(state)?;
        }
    }

    fn close(&mut self, state: &RuntimeState) {
        if !self.shared.mark_closed() {
            return;
        }
        self.group_rows.clear();
        if let Some(mut cursor) = self.left.take() {
            cursor.node.close(state);
        }
        if let Some(mut cursor) = self.right.take() {
            cursor.node.close(state);
        }
    }

    fn output_desc(&self) -> &TupleDescriptor {
        &self.shared.output_desc
    }
}
