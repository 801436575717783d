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
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::common::status::{Status, StatusCode};

fn default_log_level() -> String {
    "info".to_string()
}

/// Process-wide configuration, loaded once by main and threaded through
/// `ExecEnv`. There is no global accessor.
#[derive(Clone, Debug, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression; takes precedence over
    /// `log_level` when set.
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl EngineConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        let cfg: EngineConfig =
            toml::from_str(&s).with_context(|| format!("parse toml: {}", path.display()))?;
        Ok(cfg)
    }

    pub fn load_from_env_or_default() -> Result<Self> {
        match config_path_from_env() {
            Some(path) => Self::load_from_file(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn effective_log_filter(&self) -> String {
        self.log_filter
            .clone()
            .unwrap_or_else(|| self.log_level.clone())
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("KESTREL_CONFIG") {
        if !p.trim().is_empty() {
            return Some(PathBuf::from(p));
        }
    }
    let default = PathBuf::from("kestrel.toml");
    default.exists().then_some(default)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            server: ServerConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_backend_port")]
    pub backend_port: u16,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}
fn default_backend_port() -> u16 {
    21000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            backend_port: default_backend_port(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RuntimeConfig {
    /// Worker threads driving fragment instances and RPC fan-out.
    #[serde(default = "default_exec_threads")]
    pub exec_threads: usize,

    /// Sampling cadence of the periodic counter updater, in milliseconds.
    #[serde(default = "default_counter_sample_interval_ms")]
    pub counter_sample_interval_ms: u64,

    /// Bounded interval at which blocked waits re-check the cancel flag.
    #[serde(default = "default_cancel_check_interval_ms")]
    pub cancel_check_interval_ms: u64,

    /// How long an exchange receiver waits for senders before timing out.
    #[serde(default = "default_exchange_receive_timeout_ms")]
    pub exchange_receive_timeout_ms: u64,

    /// Session idle timeout; an idle session closes its handles.
    #[serde(default = "default_session_idle_timeout_s")]
    pub session_idle_timeout_s: u64,
}

fn default_exec_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
fn default_counter_sample_interval_ms() -> u64 {
    500
}
fn default_cancel_check_interval_ms() -> u64 {
    100
}
fn default_exchange_receive_timeout_ms() -> u64 {
    300_000
}
fn default_session_idle_timeout_s() -> u64 {
    1800
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            exec_threads: default_exec_threads(),
            counter_sample_interval_ms: default_counter_sample_interval_ms(),
            cancel_check_interval_ms: default_cancel_check_interval_ms(),
            exchange_receive_timeout_ms: default_exchange_receive_timeout_ms(),
            session_idle_timeout_s: default_session_idle_timeout_s(),
        }
    }
}

/// Exploration mode for the test-only plan-space walker.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExplorationMode {
    Core,
    Pairwise,
    Exhaustive,
}

/// Per-query options. These ride inside the prepare RPC, so every field is
/// serialisable and validated once at submission.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Rows per batch crossing operator boundaries.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Cap on distinct error-log lines retained per query.
    #[serde(default = "default_max_errors")]
    pub max_errors: usize,

    /// Skip the eager expression-binding pass.
    #[serde(default)]
    pub disable_codegen: bool,

    /// Per-query memory limit in bytes; 0 means unlimited.
    #[serde(default)]
    pub mem_limit: u64,

    #[serde(default = "default_exploration_mode")]
    pub exploration_mode: ExplorationMode,

    /// Byte bound of each exchange receiver queue.
    #[serde(default = "default_exchange_receive_buffer_bytes")]
    pub exchange_receive_buffer_bytes: usize,

    #[serde(default = "default_status_report_interval_ms")]
    pub status_report_interval_ms: u64,

    /// Cancel a query with no fetch activity for this long; 0 disables.
    #[serde(default)]
    pub idle_query_timeout_s: u64,

    /// Per-call client fetch timeout.
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    /// Attempts per transmit before a transient failure turns fatal.
    #[serde(default = "default_transmit_max_attempts")]
    pub transmit_max_attempts: u32,
}

fn default_batch_size() -> usize {
    1024
}
fn default_max_errors() -> usize {
    100
}
fn default_exploration_mode() -> ExplorationMode {
    ExplorationMode::Core
}
fn default_exchange_receive_buffer_bytes() -> usize {
    10 * 1024 * 1024
}
fn default_status_report_interval_ms() -> u64 {
    1000
}
fn default_fetch_timeout_ms() -> u64 {
    300_000
}
fn default_transmit_max_attempts() -> u32 {
    4
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_errors: default_max_errors(),
            disable_codegen: false,
            mem_limit: 0,
            exploration_mode: default_exploration_mode(),
            exchange_receive_buffer_bytes: default_exchange_receive_buffer_bytes(),
            status_report_interval_ms: default_status_report_interval_ms(),
            idle_query_timeout_s: 0,
            fetch_timeout_ms: default_fetch_timeout_ms(),
            transmit_max_attempts: default_transmit_max_attempts(),
        }
    }
}

impl QueryOptions {
    pub fn validate(&self) -> crate::common::status::Result<()> {
        if self.batch_size == 0 {
            return Err(Status::new(
                StatusCode::InternalError,
                "batch_size must be positive",
            ));
        }
        if self.max_errors == 0 {
            return Err(Status::new(
                StatusCode::InternalError,
                "max_errors must be at least 1",
            ));
        }
        if self.transmit_max_attempts == 0 {
            return Err(Status::new(
                StatusCode::InternalError,
                "transmit_max_attempts must be at least 1",
            ));
        }
        Ok(())
    }

    /// `mem_limit` with 0 mapped to "no limit".
    pub fn mem_limit_bytes(&self) -> Option<i64> {
        (self.mem_limit > 0).then_some(self.mem_limit.min(i64::MAX as u64) as i64)
    }
}

/// Map an `anyhow` error from the config seam into a runtime status.
pub fn config_error(err: anyhow::Error) -> Status {
    Status::internal(format!("configuration error: {err:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_validate() {
        let opts = QueryOptions::default();
        assert!(opts.validate().is_ok());
        assert_eq!(opts.batch_size, 1024);
        assert_eq!(opts.max_errors, 100);
        assert_eq!(opts.exchange_receive_buffer_bytes, 10 * 1024 * 1024);
        assert_eq!(opts.status_report_interval_ms, 1000);
        assert!(opts.mem_limit_bytes().is_none());
    }

    #[test]
    fn zero_batch_size_rejected() {
        let opts = QueryOptions {
            batch_size: 0,
            ..QueryOptions::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn engine_config_loads_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("kestrel.toml");
        std::fs::write(
            &path,
            "log_level = \"debug\"\n[server]\nbackend_port = 25000\n",
        )
        .expect("write config");
        let cfg = EngineConfig::load_from_file(&path).expect("load");
        assert_eq!(cfg.server.backend_port, 25000);
        assert_eq!(cfg.effective_log_filter(), "debug");
    }

    #[test]
    fn engine_config_parses_toml() {
        let cfg: EngineConfig = toml::from_str(
            r#"
            log_level = "debug"
            [runtime]
            exec_threads = 2
            exchange_receive_timeout_ms = 1234
            "#,
        )
        .expect("parse");
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.runtime.exec_threads, 2);
        assert_eq!(cfg.runtime.exchange_receive_timeout_ms, 1234);
        assert_eq!(cfg.server.backend_port, 21000);
    }
}
