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

//! Scan node: drives the pluggable row-batch producer seam over the scan
//! ranges assigned to this instance. File-format readers live behind
//! [`ScanProvider`]; the crate ships an in-memory table provider used by
//! tests and the demo binary.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::common::status::{Result, Status};
use crate::exec::{ExecNode, NodeShared};
use crate::plan::{PlanNode, ScanRange};
use crate::runtime::descriptors::{Datum, TupleDescriptor};
use crate::runtime::profile::CounterUnit;
use crate::runtime::row_batch::RowBatch;
use crate::runtime::runtime_state::RuntimeState;

/// Produces the rows of one scan range.
pub trait RowBatchProducer: Send {
    /// Append rows into `batch` until it fills or the range is exhausted;
    /// returns true at end of range.
    fn fill(&mut self, batch: &mut RowBatch) -> Result<bool>;
}

/// Factory for range producers of one table; the seam file-format scanners
/// plug into.
pub trait ScanProvider: Send + Sync {
    fn open(&self, range: &ScanRange, desc: &TupleDescriptor) -> Result<Box<dyn RowBatchProducer>>;
}

pub struct ScanNode {
    shared: NodeShared,
    table: String,
    ranges: Vec<ScanRange>,
    provider: Option<Arc<dyn ScanProvider>>,
    producer: Option<Box<dyn RowBatchProducer>>,
    next_range: usize,
    scratch: Option<RowBatch>,
}

impl ScanNode {
    pub fn new(state: &RuntimeState, plan: &PlanNode, table: String) -> Self {
        let ranges = state.scan_ranges(plan.id).to_vec();
        Self {
            shared: NodeShared::from_plan(plan, state),
            table,
            ranges,
            provider: None,
            producer: None,
            next_range: 0,
            scratch: None,
        }
    }

    fn advance_range(&mut self) -> Result<bool> {
        let Some(range) = self.ranges.get(self.next_range) else {
            self.producer = None;
            return Ok(false);
        };
        let provider = self
            .provider
            .as_ref()
            .ok_or_else(|| Status::internal("scan node used before prepare"))?;
        self.producer = Some(provider.open(range, &self.shared.output_desc)?);
        self.next_range += 1;
        Ok(true)
    }
}

impl ExecNode for ScanNode {
    fn prepare(&mut self, state: &RuntimeState) -> Result<()> {
        self.provider = Some(state.env().scan_provider(&self.table)?);
        self.shared
            .prepare_conjuncts(state, &self.shared.output_desc)?;
        self.shared
            .profile
            .add_info_string("Table", self.table.clone());
        self.shared
            .profile
            .add_counter("ScanRangesComplete", CounterUnit::Unit);
        self.scratch = Some(RowBatch::new(
            self.shared.output_desc.clone(),
            state.batch_size(),
        ));
        Ok(())
    }

    fn open(&mut self, _state: &RuntimeState) -> Result<()> {
        self.advance_range()?;
        Ok(())
    }

    fn get_next(&mut self, state: &RuntimeState, batch: &mut RowBatch) -> Result<bool> {
        let _t = self.shared.profile.scoped_timer("GetNextTime");
        loop {
            if state.is_cancelled() {
                return Err(Status::cancelled("scan cancelled"));
            }
            if !self.shared.flush_pending(batch)? || batch.is_full() {
                return Ok(false);
            }
            if self.shared.reached_limit() {
                return Ok(true);
            }
            let Some(producer) = self.producer.as_mut() else {
                return Ok(self.shared.pending_is_empty());
            };
            let mut scratch = self
                .scratch
                .take()
                .unwrap_or_else(|| RowBatch::new(self.shared.output_desc.clone(), state.batch_size()));
            let range_eos = producer.fill(&mut scratch)?;
            self.shared.absorb_batch(&scratch)?;
            scratch = RowBatch::new(self.shared.output_desc.clone(), state.batch_size());
            self.scratch = Some(scratch);
            if range_eos {
                self.shared
                    .profile
                    .add_counter("ScanRangesComplete", CounterUnit::Unit)
                    .add(1);
                if !self.advance_range()? {
                    // Drain whatever is pending, then eos.
                    let drained = self.shared.flush_pending(batch)?;
                    return Ok(drained);
                }
            }
        }
    }

    fn close(&mut self, _state: &RuntimeState) {
        if !self.shared.mark_closed() {
            return;
        }
        self.producer = None;
        self.scratch = None;
    }

    fn output_desc(&self) -> &TupleDescriptor {
        &self.shared.output_desc
    }
}

/// In-memory table registered with the environment: rows keyed by "file"
/// name, with `(offset, length)` of a scan range addressing a row interval.
#[derive(Default)]
pub struct MemTableProvider {
    files: Mutex<HashMap<String, Vec<Vec<Datum>>>>,
}

impl MemTableProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_file(&self, file: impl Into<String>, rows: Vec<Vec<Datum>>) {
        let mut guard = self.files.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(file.into(), rows);
    }

    pub fn file_len(&self, file: &str) -> u64 {
        let guard = self.files.lock().unwrap_or_else(|e| e.into_inner());
        guard.get(file).map(|rows| rows.len() as u64).unwrap_or(0)
    }
}

struct MemRangeProducer {
    rows: Vec<Vec<Datum>>,
    pos: usize,
}

impl RowBatchProducer for MemRangeProducer {
    fn fill(&mut self, batch: &mut RowBatch) -> Result<bool> {
        while self.pos < self.rows.len() && !batch.is_full() {
            batch.add_row(&self.rows[self.pos])?;
            self.pos += 1;
        }
        Ok(self.pos >= self.rows.len())
    }
}

impl ScanProvider for MemTableProvider {
    fn open(&self, range: &ScanRange, _desc: &TupleDescriptor) -> Result<Box<dyn RowBatchProducer>> {
        let guard = self.files.lock().unwrap_or_else(|e| e.into_inner());
        let rows = guard
            .get(&range.file)
            .ok_or_else(|| Status::internal(format!("unknown scan file {}", range.file)))?;
        let start = (range.offset as usize).min(rows.len());
        let end = (range.offset as usize + range.length as usize).min(rows.len());
        Ok(Box::new(MemRangeProducer {
            rows: rows[start..end].to_vec(),
            pos: 0,
        }))
    }
}
