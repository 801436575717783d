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
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::common::status::Status;

/// Tracks logical memory usage for a component and its ancestors.
///
/// Trackers form a tree (process → query → fragment instance → operator);
/// consumption reported at a leaf is visible at every ancestor, so for any
/// subtree `parent.consumption >= sum(children.consumption)` holds at all
/// times. A tracker may carry a byte limit; `try_consume` enforces the limit
/// of every ancestor on the path.
#[derive(Debug)]
pub struct MemTracker {
    label: String,
    limit: Option<i64>,
    parent: Option<Arc<MemTracker>>,
    consumption: AtomicI64,
    peak: AtomicI64,
    children: Mutex<Vec<Weak<MemTracker>>>,
}

impl MemTracker {
    pub fn new_root(label: impl Into<String>, limit: Option<i64>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            limit,
            parent: None,
            consumption: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            children: Mutex::new(Vec::new()),
        })
    }

    pub fn new_child(
        label: impl Into<String>,
        limit: Option<i64>,
        parent: &Arc<MemTracker>,
    ) -> Arc<Self> {
        let child = Arc::new(Self {
            label: label.into(),
            limit,
            parent: Some(Arc::clone(parent)),
            consumption: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            children: Mutex::new(Vec::new()),
        });
        parent
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::downgrade(&child));
        child
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn limit(&self) -> Option<i64> {
        self.limit
    }

    pub fn consumption(&self) -> i64 {
        self.consumption.load(Ordering::Acquire)
    }

    pub fn peak_consumption(&self) -> i64 {
        self.peak.load(Ordering::Acquire)
    }

    pub fn children(&self) -> Vec<Arc<MemTracker>> {
        let guard = self.children.lock().unwrap_or_else(|e| e.into_inner());
        guard.iter().filter_map(Weak::upgrade).collect()
    }

    /// Account `bytes` against this tracker and every ancestor, failing
    /// without any side effect if a limit anywhere on the path would be
    /// exceeded. On failure the tracker whose limit blocked the consume is
    /// named in the returned status.
    pub fn try_consume(self: &Arc<Self>, bytes: i64) -> Result<(), Status> {
        if bytes <= 0 {
            return Ok(());
        }
        let mut tracker: Option<&Arc<MemTracker>> = Some(self);
        let mut consumed_up_to: Option<*const MemTracker> = None;
        let mut failed: Option<Status> = None;

        // Optimistically consume upward; roll back on the first overshoot.
        while let Some(current) = tracker {
            let new_value = current.consumption.fetch_add(bytes, Ordering::AcqRel) + bytes;
            if let Some(limit) = current.limit {
                if new_value > limit {
                    current.consumption.fetch_sub(bytes, Ordering::AcqRel);
                    failed = Some(Status::mem_limit_exceeded(format!(
                        "memory limit exceeded: tracker={} limit={} would_consume={}",
                        current.label, limit, new_value
                    )));
                    break;
                }
            }
            current.update_peak(new_value);
            consumed_up_to = Some(Arc::as_ptr(current));
            tracker = current.parent.as_ref();
        }

        let Some(status) = failed else {
            return Ok(());
        };

        // Walk the already-consumed prefix again and release it.
        if consumed_up_to.is_some() {
            let mut tracker: Option<&Arc<MemTracker>> = Some(self);
            while let Some(current) = tracker {
                current.consumption.fetch_sub(bytes, Ordering::AcqRel);
                if Some(Arc::as_ptr(current)) == consumed_up_to {
                    break;
                }
                tracker = current.parent.as_ref();
            }
        }
        Err(status)
    }

    /// Unchecked accounting for callers that already hold a grant.
    pub fn consume(&self, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(current) = tracker {
            let new_value = current.consumption.fetch_add(bytes, Ordering::AcqRel) + bytes;
            current.update_peak(new_value);
            tracker = current.parent.as_deref();
        }
    }

    pub fn release(&self, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(current) = tracker {
            current.consumption.fetch_sub(bytes, Ordering::AcqRel);
            tracker = current.parent.as_deref();
        }
    }

    /// Conservative check used by periodic sweeps: true if this tracker or
    /// any ancestor currently sits above its limit.
    pub fn any_limit_exceeded(&self) -> bool {
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(current) = tracker {
            if let Some(limit) = current.limit {
                if current.consumption() > limit {
                    return true;
                }
            }
            tracker = current.parent.as_deref();
        }
        false
    }

    fn update_peak(&self, value: i64) {
        let mut prev = self.peak.load(Ordering::Relaxed);
        while value > prev {
            match self
                .peak
                .compare_exchange(prev, value, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }
    }
}

/// RAII guard over bytes accounted to a tracker; the accounting follows the
/// current holder when batches move between components (e.g. into an
/// exchange receiver queue).
#[derive(Debug)]
pub struct TrackedBytes {
    bytes: i64,
    tracker: Arc<MemTracker>,
}

impl TrackedBytes {
    pub fn new(bytes: usize, tracker: Arc<MemTracker>) -> Self {
        let bytes = i64::try_from(bytes).unwrap_or(i64::MAX);
        tracker.consume(bytes);
        Self { bytes, tracker }
    }

    pub fn try_new(bytes: usize, tracker: Arc<MemTracker>) -> Result<Self, Status> {
        let bytes = i64::try_from(bytes).unwrap_or(i64::MAX);
        tracker.try_consume(bytes)?;
        Ok(Self { bytes, tracker })
    }

    pub fn bytes(&self) -> i64 {
        self.bytes
    }

    pub fn transfer_to(&mut self, tracker: &Arc<MemTracker>) {
        if Arc::ptr_eq(&self.tracker, tracker) {
            return;
        }
        self.tracker.release(self.bytes);
        tracker.consume(self.bytes);
        self.tracker = Arc::clone(tracker);
    }
}

impl Drop for TrackedBytes {
    fn drop(&mut self) {
        self.tracker.release(self.bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_propagates_to_ancestors() {
        let root = MemTracker::new_root("process", None);
        let query = MemTracker::new_child("query", None, &root);
        let instance = MemTracker::new_child("instance", None, &query);

        instance.try_consume(100).expect("consume");
        assert_eq!(instance.consumption(), 100);
        assert_eq!(query.consumption(), 100);
        assert_eq!(root.consumption(), 100);

        instance.release(100);
        assert_eq!(instance.consumption(), 0);
        assert_eq!(query.consumption(), 0);
        assert_eq!(root.consumption(), 0);
        assert_eq!(root.peak_consumption(), 100);
    }

    #[test]
    fn overshoot_leaves_no_residue() {
        let root = MemTracker::new_root("process", None);
        let query = MemTracker::new_child("query", Some(64), &root);
        let instance = MemTracker::new_child("instance", None, &query);

        instance.try_consume(32).expect("first");
        let err = instance.try_consume(64).expect_err("over limit");
        assert!(err.is_mem_limit_exceeded());
        assert!(err.message.contains("query"));
        assert_eq!(instance.consumption(), 32);
        assert_eq!(query.consumption(), 32);
        assert_eq!(root.consumption(), 32);
    }

    #[test]
    fn unlimited_tracker_never_fails() {
        let root = MemTracker::new_root("process", None);
        for _ in 0..100 {
            root.try_consume(i64::MAX / 256).expect("unlimited");
        }
        root.release(root.consumption());
    }

    #[test]
    fn tracked_bytes_transfer_moves_accounting() {
        let root = MemTracker::new_root("process", None);
        let a = MemTracker::new_child("a", None, &root);
        let b = MemTracker::new_child("b", None, &root);

        let mut guard = TrackedBytes::new(50, Arc::clone(&a));
        assert_eq!(a.consumption(), 50);
        guard.transfer_to(&b);
        assert_eq!(a.consumption(), 0);
        assert_eq!(b.consumption(), 50);
        assert_eq!(root.consumption(), 50);
        drop(guard);
        assert_eq!(root.consumption(), 0);
    }

    #[test]
    fn any_limit_exceeded_sees_ancestors() {
        let root = MemTracker::new_root("process", Some(10));
        let child = MemTracker::new_child("child", None, &root);
        assert!(!child.any_limit_exceeded());
        // Unchecked consume can push an ancestor over its limit.
        child.consume(16);
        assert!(child.any_limit_exceeded());
        child.release(16);
    }
}
