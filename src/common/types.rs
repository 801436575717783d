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

/// 128-bit globally unique identifier used for queries and fragment instances.
///
/// Fragment instance ids of a query share the query id's `hi` word; `lo` is
/// offset by the per-query instance ordinal so instance ids sort together and
/// the owning query can be recovered from any instance id.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UniqueId {
    pub hi: i64,
    pub lo: i64,
}

pub type QueryId = UniqueId;
pub type FragmentInstanceId = UniqueId;

impl UniqueId {
    pub fn new(hi: i64, lo: i64) -> Self {
        Self { hi, lo }
    }

    /// Generate a fresh random id. Instance ordinals are added to `lo`, so
    /// the low bits of the base id are zeroed to keep room for them.
    pub fn generate() -> Self {
        let hi = rand::random::<i64>();
        let lo = rand::random::<i64>() & !0xFFFF;
        Self { hi, lo }
    }

    /// Id of instance `ordinal` (0-based) of the query identified by `self`.
    pub fn instance(self, ordinal: i32) -> FragmentInstanceId {
        UniqueId {
            hi: self.hi,
            lo: self.lo.wrapping_add(ordinal as i64 + 1),
        }
    }

    /// Recover the query id from a fragment instance id produced by
    /// [`UniqueId::instance`]. Only valid for ordinals below 2^16.
    pub fn query_of_instance(self) -> QueryId {
        UniqueId {
            hi: self.hi,
            lo: self.lo & !0xFFFF,
        }
    }
}

pub fn format_uuid(hi: i64, lo: i64) -> String {
    format!(
        "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
        ((hi as u64) >> 32) as u32,
        ((hi as u64) >> 16) as u16,
        (hi as u64) as u16,
        ((lo as u64) >> 48) as u16,
        (lo as u64) & 0x0000_FFFF_FFFF_FFFF
    )
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_uuid(self.hi, self.lo))
    }
}

/// Network identity of one backend process.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackendAddress {
    pub host: String,
    pub port: u16,
}

impl BackendAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for BackendAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_uuid_matches_uuid_layout() {
        let id = UniqueId { hi: 0, lo: 1 };
        assert_eq!(id.to_string(), "00000000-0000-0000-0000-000000000001");
    }

    #[test]
    fn instance_ids_recover_query_id() {
        let query_id = UniqueId::generate();
        for ordinal in 0..16 {
            let finst = query_id.instance(ordinal);
            assert_ne!(finst, query_id);
            assert_eq!(finst.query_of_instance(), query_id);
        }
    }

    #[test]
    fn instance_ordinals_are_distinct() {
        let query_id = UniqueId::new(7, 0);
        assert_ne!(query_id.instance(0), query_id.instance(1));
    }
}
