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

//! Analytic evaluation over input sorted by (partition keys, order keys).
//! The supported functions have running semantics, so only per-partition
//! accumulators are kept: the node streams. Output rows are the input
//! columns followed by one column per analytic function.

use crate::common::status::{Result, Status};
use crate::exec::{ExecNode, NodeShared};
use crate::exprs::{AnalyticFunc, Expr};
use crate::plan::{PlanNode, SortKey};
use crate::runtime::descriptors::{cmp_datum, Datum, TupleDescriptor};
use crate::runtime::row_batch::RowBatch;
use crate::runtime::runtime_state::RuntimeState;

pub struct AnalyticNode {
    shared: NodeShared,
    partition_by: Vec<Expr>,
    #[allow(dead_code)]
    order_by: Vec<SortKey>,
    functions: Vec<AnalyticFunc>,
    child: Box<dyn ExecNode>,
    child_eos: bool,
    current_partition: Option<Vec<Datum>>,
    row_number: i64,
    running: Vec<Datum>,
}

impl AnalyticNode {
    pub fn new(
        state: &RuntimeState,
        plan: &PlanNode,
        partition_by: Vec<Expr>,
        order_by: Vec<SortKey>,
        functions: Vec<AnalyticFunc>,
        child: Box<dyn ExecNode>,
    ) -> Self {
        let running = functions.iter().map(|_| Datum::Null).collect();
        Self {
            shared: NodeShared::from_plan(plan, state),
            partition_by,
            order_by,
            functions,
            child,
            child_eos: false,
            current_partition: None,
            row_number: 0,
            running,
        }
    }

    fn reset_partition(&mut self, keys: Vec<Datum>) {
        self.current_partition = Some(keys);
        self.row_number = 0;
        self.running = self.functions.iter().map(|_| Datum::Null).collect();
    }

    fn partition_changed(&self, keys: &[Datum]) -> bool {
        match &self.current_partition {
            None => true,
            Some(current) => current
                .iter()
                .zip(keys.iter())
                .any(|(a, b)| cmp_datum(a, b) != std::cmp::Ordering::Equal),
        }
    }

    fn process_row(&mut self, batch: &RowBatch, row: usize) -> Result<Vec<Datum>> {
        let keys: Vec<Datum> = self
            .partition_by
            .iter()
            .map(|e| e.eval(batch, row))
            .collect::<Result<_>>()?;
        if self.partition_changed(&keys) {
            self.reset_partition(keys);
        }
        self.row_number += 1;

        let mut out = batch.row(row);
        for (i, func) in self.functions.iter().enumerate() {
            let value = match func {
                AnalyticFunc::RowNumber => Datum::BigInt(self.row_number),
                AnalyticFunc::RunningCount => {
                    let next = self.running[i].as_bigint().unwrap_or(0) + 1;
                    self.running[i] = Datum::BigInt(next);
                    self.running[i].clone()
                }
                AnalyticFunc::RunningSum(expr) => {
                    let v = expr.eval(batch, row)?;
                    if !v.is_null() {
                        self.running[i] = match (&self.running[i], &v) {
                            (Datum::Null, v) => v.clone(),
                            (Datum::BigInt(a), Datum::BigInt(b)) => {
                                Datum::BigInt(a.wrapping_add(*b))
                            }
                            (Datum::Double(a), Datum::Double(b)) => Datum::Double(a + b),
                            (Datum::BigInt(a), Datum::Double(b)) => {
                                Datum::Double(*a as f64 + b)
                            }
                            (Datum::Double(a), Datum::BigInt(b)) => {
                                Datum::Double(a + *b as f64)
                            }
                            (acc, v) => {
                                return Err(Status::internal(format!(
                                    "running sum over incompatible values {acc:?}, {v:?}"
                                )));
                            }
                        };
                    }
                    self.running[i].clone()
                }
            };
            out.push(value);
        }
        Ok(out)
    }
}

impl ExecNode for AnalyticNode {
    fn prepare(&mut self, state: &RuntimeState) -> Result<()> {
        self.child.prepare(state)?;
        if !state.options().disable_codegen {
            let child_desc = self.child.output_desc().clone();
            for expr in &self.partition_by {
                expr.bind(&child_desc)?;
            }
            for key in &self.order_by {
                key.expr.bind(&child_desc)?;
            }
            for func in &self.functions {
                if let AnalyticFunc::RunningSum(expr) = func {
                    expr.bind(&child_desc)?;
                }
            }
        }
        self.shared
            .prepare_conjuncts(state, &self.shared.output_desc)
    }

    fn open(&mut self, state: &RuntimeState) -> Result<()> {
        self.child.open(state)
    }

    fn get_next(&mut self, state: &RuntimeState, batch: &mut RowBatch) -> Result<bool> {
        loop {
            if state.is_cancelled() {
                return Err(Status::cancelled("analytic cancelled"));
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
            let mut scratch = RowBatch::new(self.shared.output_desc.clone(), state.batch_size());
            for row in 0..child_batch.num_rows() {
                if scratch.is_full() {
                    self.shared.absorb_batch(&scratch)?;
                    scratch =
                        RowBatch::new(self.shared.output_desc.clone(), state.batch_size());
                }
                let out = self.process_row(&child_batch, row)?;
                scratch.add_row(&out)?;
            }
            self.shared.absorb_batch(&scratch)?;
        }
    }

    fn close(&mut self, state: &RuntimeState) {
        if !self.shared.mark_closed() {
            return;
        }
        self.child.close(state);
    }

    fn output_desc(&self) -> &TupleDescriptor {
        &self.shared.output_desc
    }
}
