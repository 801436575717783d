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
use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Column value types understood by the execution runtime.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Boolean,
    BigInt,
    Double,
    Varchar,
}

impl ColumnType {
    /// Fixed bytes the slot occupies in the row buffer. Varchar slots hold
    /// an (arena offset, length) pair.
    pub fn slot_bytes(self) -> usize {
        match self {
            ColumnType::Boolean => 1,
            ColumnType::BigInt | ColumnType::Double | ColumnType::Varchar => 8,
        }
    }

    fn slot_align(self) -> usize {
        match self {
            ColumnType::Boolean => 1,
            _ => 8,
        }
    }
}

/// Slot offsets, null-bitmap size and row stride for one tuple schema.
///
/// The layout is fixed by the schema alone: a per-row null bitmap (one bit
/// per column, MSB-first within each byte) followed by the slots in
/// declaration order, each aligned to its natural alignment, with the stride
/// rounded up to 8. A batch serialised under a schema reconstitutes under
/// the same schema with no further negotiation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<ColumnType>", into = "Vec<ColumnType>")]
pub struct TupleDescriptor {
    columns: Vec<ColumnType>,
    slot_offsets: Vec<usize>,
    null_bytes: usize,
    row_stride: usize,
}

impl TupleDescriptor {
    pub fn new(columns: Vec<ColumnType>) -> Self {
        let null_bytes = columns.len().div_ceil(8);
        let mut offset = null_bytes;
        let mut slot_offsets = Vec::with_capacity(columns.len());
        for col in &columns {
            let align = col.slot_align();
            offset = offset.div_ceil(align) * align;
            slot_offsets.push(offset);
            offset += col.slot_bytes();
        }
        let row_stride = offset.div_ceil(8) * 8;
        Self {
            columns,
            slot_offsets,
            null_bytes,
            row_stride,
        }
    }

    pub fn columns(&self) -> &[ColumnType] {
        &self.columns
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn column_type(&self, col: usize) -> Option<ColumnType> {
        self.columns.get(col).copied()
    }

    pub fn slot_offset(&self, col: usize) -> usize {
        self.slot_offsets[col]
    }

    pub fn null_bytes(&self) -> usize {
        self.null_bytes
    }

    pub fn row_stride(&self) -> usize {
        self.row_stride
    }

    /// (byte index, mask) of column `col`'s null bit, MSB-first per byte.
    pub fn null_bit(&self, col: usize) -> (usize, u8) {
        (col / 8, 1u8 << (7 - (col % 8)))
    }
}

impl From<Vec<ColumnType>> for TupleDescriptor {
    fn from(columns: Vec<ColumnType>) -> Self {
        TupleDescriptor::new(columns)
    }
}

impl From<TupleDescriptor> for Vec<ColumnType> {
    fn from(desc: TupleDescriptor) -> Self {
        desc.columns
    }
}

/// One column value. The untyped currency of expression evaluation and row
/// materialisation; batches store the packed form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Datum {
    Null,
    Boolean(bool),
    BigInt(i64),
    Double(f64),
    Varchar(String),
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Datum::Null => None,
            Datum::Boolean(_) => Some(ColumnType::Boolean),
            Datum::BigInt(_) => Some(ColumnType::BigInt),
            Datum::Double(_) => Some(ColumnType::Double),
            Datum::Varchar(_) => Some(ColumnType::Varchar),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Datum::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bigint(&self) -> Option<i64> {
        match self {
            Datum::BigInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Datum::Double(v) => Some(*v),
            Datum::BigInt(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Append a self-delimiting encoding usable as a grouping/partition key.
    pub fn encode_key(&self, buf: &mut Vec<u8>) {
        match self {
            Datum::Null => buf.push(0),
            Datum::Boolean(v) => {
                buf.push(1);
                buf.push(*v as u8);
            }
            Datum::BigInt(v) => {
                buf.push(2);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            Datum::Double(v) => {
                buf.push(3);
                buf.extend_from_slice(&v.to_bits().to_le_bytes());
            }
            Datum::Varchar(v) => {
                buf.push(4);
                buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
                buf.extend_from_slice(v.as_bytes());
            }
        }
    }
}

/// Total order used by sort/top-n/merge operators: NULL sorts first, doubles
/// compare by IEEE total order.
pub fn cmp_datum(a: &Datum, b: &Datum) -> Ordering {
    match (a, b) {
        (Datum::Null, Datum::Null) => Ordering::Equal,
        (Datum::Null, _) => Ordering::Less,
        (_, Datum::Null) => Ordering::Greater,
        (Datum::Boolean(x), Datum::Boolean(y)) => x.cmp(y),
        (Datum::BigInt(x), Datum::BigInt(y)) => x.cmp(y),
        (Datum::Double(x), Datum::Double(y)) => x.total_cmp(y),
        (Datum::BigInt(x), Datum::Double(y)) => (*x as f64).total_cmp(y),
        (Datum::Double(x), Datum::BigInt(y)) => x.total_cmp(&(*y as f64)),
        (Datum::Varchar(x), Datum::Varchar(y)) => x.cmp(y),
        // Mixed incomparable kinds: stable but arbitrary.
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_deterministic() {
        let desc = TupleDescriptor::new(vec![
            ColumnType::Boolean,
            ColumnType::BigInt,
            ColumnType::Varchar,
        ]);
        // 1 null byte, bool at 1, then 8-aligned slots.
        assert_eq!(desc.null_bytes(), 1);
        assert_eq!(desc.slot_offset(0), 1);
        assert_eq!(desc.slot_offset(1), 8);
        assert_eq!(desc.slot_offset(2), 16);
        assert_eq!(desc.row_stride(), 24);
    }

    #[test]
    fn null_bits_are_msb_first() {
        let desc = TupleDescriptor::new(vec![ColumnType::BigInt; 10]);
        assert_eq!(desc.null_bit(0), (0, 0b1000_0000));
        assert_eq!(desc.null_bit(7), (0, 0b0000_0001));
        assert_eq!(desc.null_bit(8), (1, 0b1000_0000));
    }

    #[test]
    fn descriptor_serde_round_trip() {
        let desc = TupleDescriptor::new(vec![ColumnType::Varchar, ColumnType::Double]);
        let json = serde_json::to_string(&desc).expect("serialize");
        let back: TupleDescriptor = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(desc, back);
        assert_eq!(back.row_stride(), desc.row_stride());
    }

    #[test]
    fn datum_order_puts_null_first() {
        assert_eq!(
            cmp_datum(&Datum::Null, &Datum::BigInt(i64::MIN)),
            Ordering::Less
        );
        assert_eq!(
            cmp_datum(&Datum::Varchar("a".into()), &Datum::Varchar("b".into())),
            Ordering::Less
        );
    }
}
