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

//! Session registry on the client-facing node: owns query handles, applies
//! the session idle timeout and per-query idle expiration, and dispatches
//! client cancellation. The actual client wire protocol (SQL session,
//! fetch-rows endpoints) is an external collaborator sitting on top.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::common::logging::{debug, info};
use crate::common::status::{Result, Status};
use crate::common::types::{QueryId, UniqueId};
use crate::runtime::coordinator::{Coordinator, CoordinatorRegistry, QueryState};
use crate::runtime::exec_env::ExecEnv;
use crate::runtime::scheduler::ResourceBroker;
use crate::service::query_exec_state::{QueryExecRequest, QueryExecState, ResultSet};

pub type SessionId = u64;

struct Session {
    queries: Vec<QueryId>,
    last_active: Instant,
}

/// The per-node session/query registry.
pub struct SessionManager {
    env: Arc<ExecEnv>,
    coordinators: Arc<CoordinatorRegistry>,
    broker: Option<Arc<dyn ResourceBroker>>,
    sessions: Mutex<HashMap<SessionId, Session>>,
    queries: Mutex<HashMap<QueryId, Arc<QueryExecState>>>,
    next_session: AtomicU64,
    stopped: AtomicBool,
}

impl SessionManager {
    pub fn new(
        env: Arc<ExecEnv>,
        coordinators: Arc<CoordinatorRegistry>,
        broker: Option<Arc<dyn ResourceBroker>>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            env,
            coordinators,
            broker,
            sessions: Mutex::new(HashMap::new()),
            queries: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
        });
        let weak = Arc::downgrade(&manager);
        thread::Builder::new()
            .name("session-sweeper".to_string())
            .spawn(move || sweeper_loop(weak))
            .expect("spawn session sweeper");
        manager
    }

    pub fn open_session(&self) -> SessionId {
        let id = self.next_session.fetch_add(1, Ordering::AcqRel);
        let mut guard = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(
            id,
            Session {
                queries: Vec::new(),
                last_active: Instant::now(),
            },
        );
        debug!("session opened: {id}");
        id
    }

    /// Submit a typed plan for execution; returns the query id immediately,
    /// with rows flowing in the background.
    pub fn submit(&self, session_id: SessionId, request: QueryExecRequest) -> Result<QueryId> {
        self.touch_session(session_id)?;
        request.options.validate()?;
        let query_id = UniqueId::generate();
        let coordinator = Coordinator::new(
            Arc::clone(&self.env),
            query_id,
            request.plan,
            request.options.clone(),
            Arc::clone(&self.coordinators),
            self.broker.clone(),
        );
        let exec_state =
            QueryExecState::new(coordinator, request.scan_locations, request.options);
        exec_state.exec()?;
        {
            let mut guard = self.queries.lock().unwrap_or_else(|e| e.into_inner());
            guard.insert(query_id, Arc::clone(&exec_state));
        }
        {
            let mut guard = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(session) = guard.get_mut(&session_id) {
                session.queries.push(query_id);
            }
        }
        info!("query submitted: session={session_id} query={query_id}");
        Ok(query_id)
    }

    pub fn wait(&self, query_id: QueryId, timeout: Duration) -> Result<QueryState> {
        self.query(query_id)?.wait(timeout)
    }

    pub fn fetch(&self, query_id: QueryId, max_rows: usize) -> Result<ResultSet> {
        self.query(query_id)?.fetch_rows(max_rows)
    }

    pub fn cancel(&self, query_id: QueryId) -> Result<()> {
        self.query(query_id)?.cancel();
        Ok(())
    }

    /// Close the handle; the query is cancelled if still running and the
    /// handle is dropped once the last reference goes away.
    pub fn close(&self, query_id: QueryId) -> Result<()> {
        let state = {
            let mut guard = self.queries.lock().unwrap_or_else(|e| e.into_inner());
            guard.remove(&query_id)
        };
        let Some(state) = state else {
            return Err(Status::internal(format!("unknown query {query_id}")));
        };
        if state.dec_ref() {
            state.close();
        }
        Ok(())
    }

    pub fn close_session(&self, session_id: SessionId) {
        let queries = {
            let mut guard = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            guard.remove(&session_id).map(|s| s.queries).unwrap_or_default()
        };
        for query_id in queries {
            let _ = self.close(query_id);
        }
        debug!("session closed: {session_id}");
    }

    pub fn query(&self, query_id: QueryId) -> Result<Arc<QueryExecState>> {
        self.queries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&query_id)
            .cloned()
            .ok_or_else(|| Status::internal(format!("unknown query {query_id}")))
    }

    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    fn touch_session(&self, session_id: SessionId) -> Result<()> {
        let mut guard = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let session = guard
            .get_mut(&session_id)
            .ok_or_else(|| Status::not_authorized(format!("unknown session {session_id}")))?;
        session.last_active = Instant::now();
        Ok(())
    }

    /// One sweep: expire idle queries, then idle sessions.
    fn sweep(&self) {
        let expired_queries: Vec<QueryId> = {
            let guard = self.queries.lock().unwrap_or_else(|e| e.into_inner());
            guard
                .iter()
                .filter(|(_, q)| q.idle_expired())
                .map(|(id, _)| *id)
                .collect()
        };
        for query_id in expired_queries {
            info!("query {query_id} idle-expired; cancelling");
            if let Ok(state) = self.query(query_id) {
                state.cancel();
            }
            let _ = self.close(query_id);
        }

        let idle_timeout =
            Duration::from_secs(self.env.config().runtime.session_idle_timeout_s.max(1));
        let expired_sessions: Vec<SessionId> = {
            let guard = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            guard
                .iter()
                .filter(|(_, s)| s.last_active.elapsed() >= idle_timeout)
                .map(|(id, _)| *id)
                .collect()
        };
        for session_id in expired_sessions {
            info!("session {session_id} idle-expired; closing");
            self.close_session(session_id);
        }
    }
}

fn sweeper_loop(manager: Weak<SessionManager>) {
    loop {
        thread::sleep(Duration::from_millis(500));
        let Some(manager) = manager.upgrade() else {
            return;
        };
        if manager.stopped.load(Ordering::Acquire) {
            return;
        }
        manager.sweep();
    }
}
