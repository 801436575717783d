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
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error classification for everything fallible in the execution runtime.
///
/// `RecoverableTransient` is the only code a call site may swallow, and only
/// by retrying the same RPC. Everything else latches into the query status.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    Cancelled,
    MemLimitExceeded,
    InternalError,
    TimedOut,
    NotAuthorized,
    RecoverableTransient,
    AdmissionDenied,
    ResourcePreempted,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::MemLimitExceeded => "MEM_LIMIT_EXCEEDED",
            StatusCode::InternalError => "INTERNAL_ERROR",
            StatusCode::TimedOut => "TIMED_OUT",
            StatusCode::NotAuthorized => "NOT_AUTHORIZED",
            StatusCode::RecoverableTransient => "RECOVERABLE_TRANSIENT",
            StatusCode::AdmissionDenied => "ADMISSION_DENIED",
            StatusCode::ResourcePreempted => "RESOURCE_PREEMPTED",
        };
        f.write_str(s)
    }
}

/// A non-OK outcome. OK is the absence of a `Status` (`Result<T>` is `Ok`).
#[derive(Clone, Debug, Eq, PartialEq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
    /// Secondary error lines accumulated while this status propagated.
    pub details: Vec<String>,
}

pub type Result<T> = std::result::Result<T, Status>;

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Cancelled, message)
    }

    pub fn mem_limit_exceeded(message: impl Into<String>) -> Self {
        Self::new(StatusCode::MemLimitExceeded, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InternalError, message)
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self::new(StatusCode::TimedOut, message)
    }

    pub fn not_authorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotAuthorized, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(StatusCode::RecoverableTransient, message)
    }

    pub fn admission_denied(message: impl Into<String>) -> Self {
        Self::new(StatusCode::AdmissionDenied, message)
    }

    pub fn preempted(message: impl Into<String>) -> Self {
        Self::new(StatusCode::ResourcePreempted, message)
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == StatusCode::Cancelled
    }

    pub fn is_mem_limit_exceeded(&self) -> bool {
        self.code == StatusCode::MemLimitExceeded
    }

    /// True iff a caller may retry the failed operation.
    pub fn is_recoverable(&self) -> bool {
        self.code == StatusCode::RecoverableTransient
    }

    /// A transient error that exhausted its retries becomes query-fatal.
    pub fn into_fatal(self) -> Status {
        if self.code == StatusCode::RecoverableTransient {
            Status {
                code: StatusCode::InternalError,
                message: self.message,
                details: self.details,
            }
        } else {
            self
        }
    }

    pub fn with_detail(mut self, line: impl Into<String>) -> Self {
        self.details.push(line.into());
        self
    }
}

/// Bounded accumulator of distinct error lines, surfaced to the client with
/// the latched query status. Capacity follows the `max_errors` query option.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ErrorLog {
    lines: Vec<String>,
    max_lines: usize,
    dropped: usize,
}

impl ErrorLog {
    pub fn new(max_lines: usize) -> Self {
        Self {
            lines: Vec::new(),
            max_lines: max_lines.max(1),
            dropped: 0,
        }
    }

    pub fn add(&mut self, line: impl Into<String>) {
        let line = line.into();
        if self.lines.iter().any(|l| *l == line) {
            return;
        }
        if self.lines.len() >= self.max_lines {
            self.dropped += 1;
            return;
        }
        self.lines.push(line);
    }

    pub fn merge(&mut self, other: &[String]) {
        for line in other {
            self.add(line.clone());
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Lines appended since the caller's last drain mark.
    pub fn delta_since(&self, mark: usize) -> (Vec<String>, usize) {
        let delta = self.lines.get(mark..).unwrap_or(&[]).to_vec();
        (delta, self.lines.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_code_and_message() {
        let s = Status::mem_limit_exceeded("query tracker over limit");
        assert_eq!(
            s.to_string(),
            "MEM_LIMIT_EXCEEDED: query tracker over limit"
        );
    }

    #[test]
    fn transient_promotes_to_internal() {
        let s = Status::transient("connect refused").into_fatal();
        assert_eq!(s.code, StatusCode::InternalError);
        assert_eq!(s.message, "connect refused");
    }

    #[test]
    fn error_log_caps_and_dedups() {
        let mut log = ErrorLog::new(2);
        log.add("a");
        log.add("a");
        log.add("b");
        log.add("c");
        assert_eq!(log.lines(), &["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn error_log_delta_tracks_mark() {
        let mut log = ErrorLog::new(10);
        log.add("a");
        let (delta, mark) = log.delta_since(0);
        assert_eq!(delta, vec!["a".to_string()]);
        log.add("b");
        let (delta, _) = log.delta_since(mark);
        assert_eq!(delta, vec!["b".to_string()]);
    }
}
