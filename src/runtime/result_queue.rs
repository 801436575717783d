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

//! Bounded queue between the coordinator fragment's result sink and the
//! client fetch path. The producer blocks when the client stops fetching
//! (backpressure all the way down the plan); eos and the first error are
//! sticky.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::common::status::{Result, Status};
use crate::runtime::descriptors::Datum;

struct QueueInner {
    rows: VecDeque<Vec<Datum>>,
    eos: bool,
    status: Option<Status>,
}

pub struct ResultQueue {
    inner: Mutex<QueueInner>,
    data_cv: Condvar,
    space_cv: Condvar,
    max_buffered_rows: usize,
    check_interval: Duration,
}

impl ResultQueue {
    pub fn new(max_buffered_rows: usize, check_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(QueueInner {
                rows: VecDeque::new(),
                eos: false,
                status: None,
            }),
            data_cv: Condvar::new(),
            space_cv: Condvar::new(),
            max_buffered_rows: max_buffered_rows.max(1),
            check_interval,
        })
    }

    /// Producer side; blocks while the buffer is full. Wakes within the
    /// check interval of `cancel_flag` being set.
    pub fn push_rows(&self, rows: Vec<Vec<Datum>>, cancel_flag: &AtomicBool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for row in rows {
            loop {
                if let Some(status) = inner.status.clone() {
                    return Err(status);
                }
                if cancel_flag.load(Ordering::Acquire) {
                    return Err(Status::cancelled("result queue producer cancelled"));
                }
                if inner.rows.len() < self.max_buffered_rows {
                    break;
                }
                let (next, _) = self
                    .space_cv
                    .wait_timeout(inner, self.check_interval)
                    .unwrap_or_else(|e| e.into_inner());
                inner = next;
            }
            inner.rows.push_back(row);
            self.data_cv.notify_all();
        }
        Ok(())
    }

    pub fn mark_eos(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.eos = true;
        self.data_cv.notify_all();
    }

    /// Latch a failure; the first status wins and pending rows are dropped.
    pub fn fail(&self, status: Status) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.status.is_none() {
            inner.status = Some(status);
        }
        inner.rows.clear();
        self.data_cv.notify_all();
        self.space_cv.notify_all();
    }

    /// Client side: up to `max_rows` rows, plus the sticky eos flag. Blocks
    /// until at least one row is available, eos, error, or timeout.
    pub fn fetch(&self, max_rows: usize, timeout: Duration) -> Result<(Vec<Vec<Datum>>, bool)> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(status) = inner.status.clone() {
                return Err(status);
            }
            if !inner.rows.is_empty() {
                let take = max_rows.max(1).min(inner.rows.len());
                let rows: Vec<Vec<Datum>> = inner.rows.drain(..take).collect();
                let eos = inner.eos && inner.rows.is_empty();
                self.space_cv.notify_all();
                return Ok((rows, eos));
            }
            if inner.eos {
                return Ok((Vec::new(), true));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Status::timed_out("fetch timed out waiting for rows"));
            }
            let wait = self.check_interval.min(deadline - now);
            let (next, _) = self
                .data_cv
                .wait_timeout(inner, wait)
                .unwrap_or_else(|e| e.into_inner());
            inner = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn fetch_blocks_until_rows_arrive() {
        let queue = ResultQueue::new(16, Duration::from_millis(5));
        let q2 = Arc::clone(&queue);
        let pusher = thread::spawn(move || {
            thread::sleep(Duration::from_millis(40));
            let flag = AtomicBool::new(false);
            q2.push_rows(vec![vec![Datum::BigInt(1)]], &flag).expect("push");
            q2.mark_eos();
        });
        let (rows, eos) = queue.fetch(10, Duration::from_secs(2)).expect("fetch");
        assert_eq!(rows.len(), 1);
        assert!(eos);
        pusher.join().expect("join");
    }

    #[test]
    fn error_is_sticky_and_drops_rows() {
        let queue = ResultQueue::new(16, Duration::from_millis(5));
        let flag = AtomicBool::new(false);
        queue
            .push_rows(vec![vec![Datum::BigInt(1)]], &flag)
            .expect("push");
        queue.fail(Status::mem_limit_exceeded("boom"));
        queue.fail(Status::internal("later"));
        let err = queue.fetch(10, Duration::from_millis(50)).expect_err("err");
        assert!(err.is_mem_limit_exceeded());
    }

    #[test]
    fn producer_backpressure_respects_cancel() {
        let queue = ResultQueue::new(1, Duration::from_millis(5));
        let flag = Arc::new(AtomicBool::new(false));
        queue
            .push_rows(vec![vec![Datum::BigInt(1)]], &flag)
            .expect("first push");
        let q2 = Arc::clone(&queue);
        let f2 = Arc::clone(&flag);
        let pusher = thread::spawn(move || q2.push_rows(vec![vec![Datum::BigInt(2)]], &f2));
        thread::sleep(Duration::from_millis(30));
        flag.store(true, Ordering::Release);
        let err = pusher.join().expect("join").expect_err("cancelled");
        assert!(err.is_cancelled());
    }

    #[test]
    fn empty_stream_reports_eos_on_first_fetch() {
        let queue = ResultQueue::new(4, Duration::from_millis(5));
        queue.mark_eos();
        let (rows, eos) = queue.fetch(10, Duration::from_millis(50)).expect("fetch");
        assert!(rows.is_empty());
        assert!(eos);
    }
}
