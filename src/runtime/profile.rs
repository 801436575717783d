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
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Instant;

use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CounterUnit {
    Unit,
    Bytes,
    TimeNs,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CounterKind {
    /// Monotonically increasing; merges by summing.
    Monotonic,
    /// High-water mark; merges by max.
    HighWater,
    /// Computed from a callback at snapshot time; merges by replacement.
    Derived,
    /// Periodic samples of a source counter; merges by concatenation.
    TimeSeries,
}

type DerivedFn = Box<dyn Fn() -> i64 + Send + Sync>;

pub type CounterRef = Arc<Counter>;

pub struct Counter {
    name: String,
    unit: CounterUnit,
    kind: CounterKind,
    value: AtomicI64,
    samples: Mutex<Vec<i64>>,
    derived: Mutex<Option<DerivedFn>>,
    sample_source: Mutex<Option<Weak<Counter>>>,
}

impl std::fmt::Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counter")
            .field("name", &self.name)
            .field("unit", &self.unit)
            .field("kind", &self.kind)
            .field("value", &self.value())
            .finish()
    }
}

impl Counter {
    fn new(name: impl Into<String>, unit: CounterUnit, kind: CounterKind) -> Self {
        Self {
            name: name.into(),
            unit,
            kind,
            value: AtomicI64::new(0),
            samples: Mutex::new(Vec::new()),
            derived: Mutex::new(None),
            sample_source: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> CounterUnit {
        self.unit
    }

    pub fn kind(&self) -> CounterKind {
        self.kind
    }

    pub fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Raise the high-water mark; never lowers.
    pub fn update_max(&self, value: i64) {
        let mut prev = self.value.load(Ordering::Relaxed);
        while value > prev {
            match self
                .value
                .compare_exchange(prev, value, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }
    }

    pub fn value(&self) -> i64 {
        if self.kind == CounterKind::Derived {
            let guard = self.derived.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(f) = guard.as_ref() {
                return f();
            }
        }
        self.value.load(Ordering::Relaxed)
    }

    /// Record one sample of the source counter (time-series kind only).
    pub fn take_sample(&self) {
        if self.kind != CounterKind::TimeSeries {
            return;
        }
        let source = {
            let guard = self.sample_source.lock().unwrap_or_else(|e| e.into_inner());
            guard.as_ref().and_then(Weak::upgrade)
        };
        if let Some(source) = source {
            let v = source.value();
            self.samples
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(v);
        }
    }

    fn samples(&self) -> Vec<i64> {
        self.samples
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// A labelled tree of counters and timers attached to every executable unit.
/// Cloning shares the underlying tree; every node
/// guards its own state so fast-path counter updates are a single atomic.
#[derive(Clone)]
pub struct RuntimeProfile {
    inner: Arc<ProfileInner>,
}

struct ProfileInner {
    name: RwLock<String>,
    counters: Mutex<Vec<CounterRef>>,
    info_strings: Mutex<Vec<(String, String)>>,
    children: Mutex<Vec<RuntimeProfile>>,
}

impl std::fmt::Debug for RuntimeProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeProfile")
            .field("name", &self.name())
            .finish()
    }
}

impl RuntimeProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ProfileInner {
                name: RwLock::new(name.into()),
                counters: Mutex::new(Vec::new()),
                info_strings: Mutex::new(Vec::new()),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> String {
        self.inner
            .name
            .read()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    pub fn set_name(&self, name: impl Into<String>) {
        let mut guard = self.inner.name.write().unwrap_or_else(|e| e.into_inner());
        *guard = name.into();
    }

    /// Get or create the named child, preserving insertion order.
    pub fn child(&self, name: impl Into<String>) -> RuntimeProfile {
        let name = name.into();
        let mut children = self.inner.children.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = children.iter().find(|c| c.name() == name) {
            return existing.clone();
        }
        let child = RuntimeProfile::new(name);
        children.push(child.clone());
        child
    }

    pub fn children(&self) -> Vec<RuntimeProfile> {
        self.inner
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn get_child(&self, name: &str) -> Option<RuntimeProfile> {
        self.inner
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    /// Idempotent on the counter name: re-adding returns the existing one.
    pub fn add_counter(&self, name: impl Into<String>, unit: CounterUnit) -> CounterRef {
        self.add_counter_of_kind(name, unit, CounterKind::Monotonic)
    }

    pub fn add_high_water_counter(&self, name: impl Into<String>, unit: CounterUnit) -> CounterRef {
        self.add_counter_of_kind(name, unit, CounterKind::HighWater)
    }

    pub fn add_derived_counter(
        &self,
        name: impl Into<String>,
        unit: CounterUnit,
        f: DerivedFn,
    ) -> CounterRef {
        let counter = self.add_counter_of_kind(name, unit, CounterKind::Derived);
        let mut guard = counter.derived.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(f);
        }
        drop(guard);
        counter
    }

    pub fn add_time_series_counter(
        &self,
        name: impl Into<String>,
        unit: CounterUnit,
        source: &CounterRef,
    ) -> CounterRef {
        let counter = self.add_counter_of_kind(name, unit, CounterKind::TimeSeries);
        let mut guard = counter
            .sample_source
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(Arc::downgrade(source));
        }
        drop(guard);
        counter
    }

    fn add_counter_of_kind(
        &self,
        name: impl Into<String>,
        unit: CounterUnit,
        kind: CounterKind,
    ) -> CounterRef {
        let name = name.into();
        let mut counters = self.inner.counters.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = counters.iter().find(|c| c.name == name) {
            return Arc::clone(existing);
        }
        let counter = Arc::new(Counter::new(name, unit, kind));
        counters.push(Arc::clone(&counter));
        counter
    }

    pub fn get_counter(&self, name: &str) -> Option<CounterRef> {
        self.inner
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|c| c.name == name)
            .cloned()
    }

    pub fn counter_value(&self, name: &str) -> Option<i64> {
        self.get_counter(name).map(|c| c.value())
    }

    pub fn add_timer(&self, name: impl Into<String>) -> CounterRef {
        self.add_counter(name, CounterUnit::TimeNs)
    }

    pub fn scoped_timer(&self, name: impl Into<String>) -> ScopedTimer {
        ScopedTimer::new(self.add_timer(name))
    }

    /// Keyed upsert; later writes override earlier ones.
    pub fn add_info_string(&self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        let mut guard = self
            .inner
            .info_strings
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = guard.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            guard.push((key, value));
        }
    }

    pub fn get_info_string(&self, key: &str) -> Option<String> {
        self.inner
            .info_strings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Drive all time-series samplers in this subtree once.
    pub fn sample_time_series(&self) {
        let counters = self
            .inner
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for c in counters {
            c.take_sample();
        }
        for child in self.children() {
            child.sample_time_series();
        }
    }

    /// Point-in-time serialisable snapshot of the subtree (pre-order).
    pub fn snapshot(&self) -> ProfileSnapshot {
        let counters = self
            .inner
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|c| CounterSnapshot {
                name: c.name.clone(),
                unit: c.unit,
                kind: c.kind,
                value: c.value(),
                samples: c.samples(),
            })
            .collect();
        let info_strings = self
            .inner
            .info_strings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let children = self.children().iter().map(|c| c.snapshot()).collect();
        ProfileSnapshot {
            name: self.name(),
            info_strings,
            counters,
            children,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub name: String,
    pub unit: CounterUnit,
    pub kind: CounterKind,
    pub value: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub samples: Vec<i64>,
}

/// Serialised profile tree; the form that crosses the report RPC and the
/// form the coordinator aggregates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub name: String,
    pub info_strings: Vec<(String, String)>,
    pub counters: Vec<CounterSnapshot>,
    pub children: Vec<ProfileSnapshot>,
}

impl ProfileSnapshot {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            info_strings: Vec::new(),
            counters: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn counter_value(&self, name: &str) -> Option<i64> {
        self.counters
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.value)
    }

    pub fn find_child(&self, name: &str) -> Option<&ProfileSnapshot> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Combine `other` into self, kind-wise: monotonic counters sum,
    /// high-water marks take the max, time-series concatenate, derived
    /// values replace. Info strings upsert; children match by name and
    /// unmatched children append in `other`'s order.
    pub fn merge(&mut self, other: &ProfileSnapshot) {
        for oc in &other.counters {
            match self.counters.iter_mut().find(|c| c.name == oc.name) {
                Some(mine) => match mine.kind {
                    CounterKind::Monotonic => mine.value = mine.value.saturating_add(oc.value),
                    CounterKind::HighWater => mine.value = mine.value.max(oc.value),
                    CounterKind::Derived => mine.value = oc.value,
                    CounterKind::TimeSeries => mine.samples.extend_from_slice(&oc.samples),
                },
                None => self.counters.push(oc.clone()),
            }
        }
        for (k, v) in &other.info_strings {
            match self.info_strings.iter_mut().find(|(mk, _)| mk == k) {
                Some(entry) => entry.1 = v.clone(),
                None => self.info_strings.push((k.clone(), v.clone())),
            }
        }
        for oc in &other.children {
            match self.children.iter_mut().find(|c| c.name == oc.name) {
                Some(mine) => mine.merge(oc),
                None => self.children.push(oc.clone()),
            }
        }
    }

    /// Human-readable indented rendering of the subtree.
    pub fn pretty_print(&self) -> String {
        let mut out = String::new();
        self.pretty_print_into(&mut out, 0);
        out
    }

    fn pretty_print_into(&self, out: &mut String, depth: usize) {
        let pad = "  ".repeat(depth);
        let _ = writeln!(out, "{pad}{}:", self.name);
        for (k, v) in &self.info_strings {
            let _ = writeln!(out, "{pad}   {k}: {v}");
        }
        for c in &self.counters {
            let _ = writeln!(out, "{pad}   - {}: {}", c.name, format_value(c));
        }
        for child in &self.children {
            child.pretty_print_into(out, depth + 1);
        }
    }
}

fn format_value(c: &CounterSnapshot) -> String {
    match c.unit {
        CounterUnit::Unit => format!("{}", c.value),
        CounterUnit::Bytes => format_bytes(c.value),
        CounterUnit::TimeNs => format_time_ns(c.value),
    }
}

fn format_bytes(v: i64) -> String {
    const KIB: f64 = 1024.0;
    let abs = v.unsigned_abs() as f64;
    if abs >= KIB * KIB * KIB {
        format!("{:.2} GB", v as f64 / (KIB * KIB * KIB))
    } else if abs >= KIB * KIB {
        format!("{:.2} MB", v as f64 / (KIB * KIB))
    } else if abs >= KIB {
        format!("{:.2} KB", v as f64 / KIB)
    } else {
        format!("{v} B")
    }
}

fn format_time_ns(v: i64) -> String {
    if v >= 1_000_000_000 {
        format!("{:.3}s", v as f64 / 1e9)
    } else if v >= 1_000_000 {
        format!("{:.3}ms", v as f64 / 1e6)
    } else if v >= 1_000 {
        format!("{:.3}us", v as f64 / 1e3)
    } else {
        format!("{v}ns")
    }
}

pub struct ScopedTimer {
    counter: CounterRef,
    start: Instant,
}

impl ScopedTimer {
    pub fn new(counter: CounterRef) -> Self {
        Self {
            counter,
            start: Instant::now(),
        }
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        let elapsed = i64::try_from(self.start.elapsed().as_nanos()).unwrap_or(i64::MAX);
        self.counter.add(elapsed);
    }
}

/// Fold the latest snapshot of every fragment instance into one query-level
/// tree. Keyed by instance, so applying a duplicate or stale report is a
/// no-op and the merge stays idempotent while monotonic counters still sum
/// across instances.
#[derive(Debug, Default)]
pub struct AggregatedProfile {
    latest: Mutex<HashMap<String, (u64, ProfileSnapshot)>>,
}

impl AggregatedProfile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `snapshot` as instance `source`'s state as of `seq`. Older or
    /// duplicate sequence numbers are ignored.
    pub fn apply(&self, source: impl Into<String>, seq: u64, snapshot: ProfileSnapshot) {
        let mut guard = self.latest.lock().unwrap_or_else(|e| e.into_inner());
        let entry = guard.entry(source.into());
        match entry {
            std::collections::hash_map::Entry::Occupied(mut o) => {
                if seq > o.get().0 {
                    o.insert((seq, snapshot));
                }
            }
            std::collections::hash_map::Entry::Vacant(v) => {
                v.insert((seq, snapshot));
            }
        }
    }

    /// Merge across all instances, most recently reported state of each.
    pub fn render(&self, root_name: &str) -> ProfileSnapshot {
        let guard = self.latest.lock().unwrap_or_else(|e| e.into_inner());
        let mut sources: Vec<_> = guard.iter().collect();
        sources.sort_by(|a, b| a.0.cmp(b.0));
        let mut out = ProfileSnapshot::new(root_name);
        for (_, (_, snapshot)) in sources {
            let mut child = ProfileSnapshot::new(snapshot.name.as_str());
            child.merge(snapshot);
            match out.children.iter_mut().find(|c| c.name == child.name) {
                Some(existing) => existing.merge(&child),
                None => out.children.push(child),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_idempotent_on_name() {
        let profile = RuntimeProfile::new("root");
        let a = profile.add_counter("RowsReturned", CounterUnit::Unit);
        let b = profile.add_counter("RowsReturned", CounterUnit::Unit);
        a.add(5);
        assert_eq!(b.value(), 5);
    }

    #[test]
    fn high_water_never_lowers() {
        let profile = RuntimeProfile::new("root");
        let c = profile.add_high_water_counter("PeakMemoryUsage", CounterUnit::Bytes);
        c.update_max(100);
        c.update_max(50);
        assert_eq!(c.value(), 100);
    }

    #[test]
    fn derived_counter_calls_back() {
        let profile = RuntimeProfile::new("root");
        let base = profile.add_counter("BytesSent", CounterUnit::Bytes);
        base.add(10);
        let derived = {
            let base = Arc::clone(&base);
            profile.add_derived_counter(
                "BytesSentDoubled",
                CounterUnit::Bytes,
                Box::new(move || base.value() * 2),
            )
        };
        assert_eq!(derived.value(), 20);
        base.add(10);
        assert_eq!(derived.value(), 40);
    }

    #[test]
    fn time_series_samples_source() {
        let profile = RuntimeProfile::new("root");
        let src = profile.add_counter("RowsProduced", CounterUnit::Unit);
        let ts = profile.add_time_series_counter("RowsProducedSeries", CounterUnit::Unit, &src);
        src.add(3);
        profile.sample_time_series();
        src.add(4);
        profile.sample_time_series();
        assert_eq!(ts.samples(), vec![3, 7]);
    }

    #[test]
    fn snapshot_merge_by_kind() {
        let p1 = RuntimeProfile::new("frag");
        p1.add_counter("RowsReturned", CounterUnit::Unit).add(5);
        p1.add_high_water_counter("PeakMemoryUsage", CounterUnit::Bytes)
            .update_max(100);

        let p2 = RuntimeProfile::new("frag");
        p2.add_counter("RowsReturned", CounterUnit::Unit).add(7);
        p2.add_high_water_counter("PeakMemoryUsage", CounterUnit::Bytes)
            .update_max(60);

        let mut merged = p1.snapshot();
        merged.merge(&p2.snapshot());
        assert_eq!(merged.counter_value("RowsReturned"), Some(12));
        assert_eq!(merged.counter_value("PeakMemoryUsage"), Some(100));
    }

    #[test]
    fn info_strings_upsert_later_wins() {
        let mut a = ProfileSnapshot::new("x");
        a.info_strings.push(("Table".into(), "t1".into()));
        let mut b = ProfileSnapshot::new("x");
        b.info_strings.push(("Table".into(), "t2".into()));
        a.merge(&b);
        assert_eq!(a.info_strings, vec![("Table".to_string(), "t2".to_string())]);
    }

    #[test]
    fn aggregated_profile_is_idempotent_per_report() {
        let agg = AggregatedProfile::new();
        let p = RuntimeProfile::new("Instance");
        p.add_counter("RowsReturned", CounterUnit::Unit).add(9);
        let snap = p.snapshot();

        agg.apply("inst-1", 1, snap.clone());
        agg.apply("inst-1", 1, snap.clone());
        let rendered = agg.render("Query");
        let inst = rendered.find_child("Instance").expect("child");
        assert_eq!(inst.counter_value("RowsReturned"), Some(9));

        // A second instance sums; a stale report does not regress.
        agg.apply("inst-2", 1, snap.clone());
        let mut old = snap.clone();
        old.counters[0].value = 1;
        agg.apply("inst-1", 0, old);
        let rendered = agg.render("Query");
        let inst = rendered.find_child("Instance").expect("child");
        assert_eq!(inst.counter_value("RowsReturned"), Some(18));
    }

    #[test]
    fn snapshot_serde_round_trip() {
        let p = RuntimeProfile::new("root");
        p.add_counter("BytesSent", CounterUnit::Bytes).add(4096);
        p.add_info_string("Partition", "HASH(a)");
        p.child("child").add_timer("OpenTime").add(1_500_000);
        let snap = p.snapshot();
        let json = serde_json::to_string(&snap).expect("serialize");
        let back: ProfileSnapshot = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(snap, back);
        assert!(back.pretty_print().contains("BytesSent"));
    }
}
