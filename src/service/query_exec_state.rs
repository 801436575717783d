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

//! The client-visible query handle: `exec / wait / fetch_rows / close` over
//! the coordinator, with a single-reader fetch lock, a refcount plus
//! last-active timestamp for idle expiration, and a materialisation timer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::common::config::QueryOptions;
use crate::common::logging::debug;
use crate::common::status::{Result, Status};
use crate::common::types::QueryId;
use crate::plan::{QueryPlan, ScanRange};
use crate::runtime::coordinator::{Coordinator, QueryState};
use crate::runtime::descriptors::Datum;
use crate::runtime::profile::{CounterUnit, ProfileSnapshot, RuntimeProfile};

/// A typed, analysed statement as handed over by the planner frontend.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryExecRequest {
    pub plan: QueryPlan,
    pub scan_locations: HashMap<i32, Vec<ScanRange>>,
    pub options: QueryOptions,
}

/// Result payload shapes for the mixed client surface.
#[derive(Clone, Debug, PartialEq)]
pub enum ResultSet {
    /// SELECT-shaped: materialised rows plus the sticky eos flag.
    Rows {
        rows: Vec<Vec<Datum>>,
        eos: bool,
    },
    /// DML-shaped: per-query append totals.
    Summary {
        rows_appended: i64,
        bytes_written: i64,
    },
    /// EXPLAIN-shaped: preformatted lines.
    Text(Vec<String>),
}

pub struct QueryExecState {
    query_id: QueryId,
    coordinator: Arc<Coordinator>,
    scan_locations: HashMap<i32, Vec<ScanRange>>,
    options: QueryOptions,
    fetch_lock: Mutex<()>,
    eos: AtomicBool,
    refcount: AtomicU32,
    last_active: Mutex<Instant>,
    client_profile: RuntimeProfile,
}

impl QueryExecState {
    pub fn new(
        coordinator: Arc<Coordinator>,
        scan_locations: HashMap<i32, Vec<ScanRange>>,
        options: QueryOptions,
    ) -> Arc<Self> {
        let client_profile = RuntimeProfile::new("ClientFetch");
        Arc::new(Self {
            query_id: coordinator.query_id(),
            coordinator,
            scan_locations,
            options,
            fetch_lock: Mutex::new(()),
            eos: AtomicBool::new(false),
            refcount: AtomicU32::new(1),
            last_active: Mutex::new(Instant::now()),
            client_profile,
        })
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Start execution; rows begin flowing into the coordinator's queue.
    pub fn exec(self: &Arc<Self>) -> Result<()> {
        self.touch();
        let coordinator = Arc::clone(&self.coordinator);
        coordinator.exec(&self.scan_locations)
    }

    /// Block until every fragment instance reported done.
    pub fn wait(&self, timeout: Duration) -> Result<QueryState> {
        self.touch();
        self.coordinator.wait_completion(timeout)
    }

    /// Fetch up to `max_rows`. One reader at a time; eos is sticky.
    pub fn fetch_rows(&self, max_rows: usize) -> Result<ResultSet> {
        let _guard = self.fetch_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.touch();
        if self.eos.load(Ordering::Acquire) {
            return Ok(ResultSet::Rows {
                rows: Vec::new(),
                eos: true,
            });
        }
        let _t = self.client_profile.scoped_timer("RowMaterializationTimer");
        let (rows, eos) = self.coordinator.fetch_rows(max_rows)?;
        self.client_profile
            .add_counter("RowsFetched", CounterUnit::Unit)
            .add(rows.len() as i64);
        if eos {
            self.eos.store(true, Ordering::Release);
        }
        self.touch();
        Ok(ResultSet::Rows { rows, eos })
    }

    /// Cancel on behalf of the client; idempotent.
    pub fn cancel(&self) {
        self.touch();
        self.coordinator.cancel();
    }

    /// Drop the client's interest. Cancels a still-running query, waits
    /// briefly for teardown, and unregisters the coordinator.
    pub fn close(&self) {
        if self.coordinator.state() == QueryState::Running {
            self.coordinator.cancel();
            let _ = self
                .coordinator
                .wait_completion(Duration::from_millis(self.options.fetch_timeout_ms.min(2000)));
        }
        self.coordinator.teardown();
        debug!("query handle closed: {}", self.query_id);
    }

    /// Query profile with the client-side fetch counters attached.
    pub fn profile(&self) -> ProfileSnapshot {
        let mut profile = self.coordinator.query_profile();
        profile.children.push(self.client_profile.snapshot());
        profile
    }

    pub fn inc_ref(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns true when the last reference dropped.
    pub fn dec_ref(&self) -> bool {
        self.refcount.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    /// True when the idle-expiration policy says this query should die.
    pub fn idle_expired(&self) -> bool {
        let timeout = self.options.idle_query_timeout_s;
        timeout > 0 && self.idle_for() >= Duration::from_secs(timeout)
    }

    pub fn latched_status(&self) -> Option<Status> {
        self.coordinator.latched_status()
    }

    fn touch(&self) {
        *self.last_active.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }
}
