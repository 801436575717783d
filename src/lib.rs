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

//! Kestrel: the distributed query execution substrate of an MPP SQL
//! analytics engine. A client-facing node plans nothing here: it receives
//! an already-typed plan, schedules its fragments across workers, drives
//! per-fragment executors, streams tuples through the exchange fabric and
//! feeds results back to the client.

pub mod common;
pub mod exec;
pub mod exprs;
pub mod plan;
pub mod runtime;
pub mod service;

pub use common::logging as kestrel_logging;
pub use common::status::{Result, Status, StatusCode};
pub use common::types::{BackendAddress, QueryId, UniqueId};
