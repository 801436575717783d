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
use crate::common::status::{Result, Status};
use crate::runtime::descriptors::{ColumnType, Datum, TupleDescriptor};

/// Wire header magic ("KESB") and protocol version.
pub const WIRE_MAGIC: u32 = 0x4B45_5342;
pub const WIRE_VERSION_MAJOR: u8 = 1;
pub const WIRE_VERSION_MINOR: u8 = 0;

const WIRE_HEADER_BYTES: usize = 4 + 1 + 1 + 4 + 4 + 4;

/// Default cap on the variable-length arena of one batch.
pub const DEFAULT_ARENA_CAP: usize = 8 * 1024 * 1024;

/// A bounded block of tuples sharing one schema: a flat row buffer with a
/// fixed stride plus a side arena for variable-length payloads. The sole
/// unit of data movement across operator and network boundaries.
#[derive(Clone, Debug, PartialEq)]
pub struct RowBatch {
    desc: TupleDescriptor,
    capacity: usize,
    num_rows: usize,
    row_data: Vec<u8>,
    arena: Vec<u8>,
    arena_cap: usize,
}

impl RowBatch {
    pub fn new(desc: TupleDescriptor, capacity: usize) -> Self {
        Self::with_arena_cap(desc, capacity, DEFAULT_ARENA_CAP)
    }

    pub fn with_arena_cap(desc: TupleDescriptor, capacity: usize, arena_cap: usize) -> Self {
        let capacity = capacity.max(1);
        let row_data = vec![0u8; capacity * desc.row_stride()];
        Self {
            desc,
            capacity,
            num_rows: 0,
            row_data,
            arena: Vec::new(),
            arena_cap: arena_cap.max(1),
        }
    }

    pub fn descriptor(&self) -> &TupleDescriptor {
        &self.desc
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Full when the row cap is reached or the arena outgrew its cap.
    pub fn is_full(&self) -> bool {
        self.num_rows >= self.capacity || self.arena.len() >= self.arena_cap
    }

    /// In-memory footprint used for tracker accounting and queue bounds.
    pub fn byte_size(&self) -> usize {
        self.num_rows * self.desc.row_stride() + self.arena.len()
    }

    /// Claim the next row slot; all columns start NULL. Returns the row
    /// index, or None if the batch is at capacity.
    pub fn allocate_tuple(&mut self) -> Option<usize> {
        if self.num_rows >= self.capacity {
            return None;
        }
        let row = self.num_rows;
        self.num_rows += 1;
        let stride = self.desc.row_stride();
        let base = row * stride;
        self.row_data[base..base + stride].fill(0);
        for b in 0..self.desc.null_bytes() {
            self.row_data[base + b] = 0xFF;
        }
        Some(row)
    }

    pub fn set_column(&mut self, row: usize, col: usize, value: &Datum) -> Result<()> {
        let col_type = self
            .desc
            .column_type(col)
            .ok_or_else(|| Status::internal(format!("column index {col} out of range")))?;
        debug_assert!(row < self.num_rows);
        if value.is_null() {
            self.set_null_bit(row, col, true);
            return Ok(());
        }
        let base = row * self.desc.row_stride() + self.desc.slot_offset(col);
        match (col_type, value) {
            (ColumnType::Boolean, Datum::Boolean(v)) => {
                self.row_data[base] = *v as u8;
            }
            (ColumnType::BigInt, Datum::BigInt(v)) => {
                self.row_data[base..base + 8].copy_from_slice(&v.to_le_bytes());
            }
            (ColumnType::Double, Datum::Double(v)) => {
                self.row_data[base..base + 8].copy_from_slice(&v.to_bits().to_le_bytes());
            }
            (ColumnType::Varchar, Datum::Varchar(v)) => {
                let offset = self.arena.len() as u32;
                self.arena.extend_from_slice(v.as_bytes());
                self.row_data[base..base + 4].copy_from_slice(&offset.to_le_bytes());
                self.row_data[base + 4..base + 8]
                    .copy_from_slice(&(v.len() as u32).to_le_bytes());
            }
            (expected, got) => {
                return Err(Status::internal(format!(
                    "type mismatch writing column {col}: slot={expected:?} value={got:?}"
                )));
            }
        }
        self.set_null_bit(row, col, false);
        Ok(())
    }

    pub fn is_null(&self, row: usize, col: usize) -> bool {
        let (byte, mask) = self.desc.null_bit(col);
        self.row_data[row * self.desc.row_stride() + byte] & mask != 0
    }

    pub fn get(&self, row: usize, col: usize) -> Datum {
        if self.is_null(row, col) {
            return Datum::Null;
        }
        let base = row * self.desc.row_stride() + self.desc.slot_offset(col);
        match self.desc.column_type(col).expect("column in range") {
            ColumnType::Boolean => Datum::Boolean(self.row_data[base] != 0),
            ColumnType::BigInt => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&self.row_data[base..base + 8]);
                Datum::BigInt(i64::from_le_bytes(buf))
            }
            ColumnType::Double => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&self.row_data[base..base + 8]);
                Datum::Double(f64::from_bits(u64::from_le_bytes(buf)))
            }
            ColumnType::Varchar => {
                let mut off = [0u8; 4];
                let mut len = [0u8; 4];
                off.copy_from_slice(&self.row_data[base..base + 4]);
                len.copy_from_slice(&self.row_data[base + 4..base + 8]);
                let off = u32::from_le_bytes(off) as usize;
                let len = u32::from_le_bytes(len) as usize;
                let bytes = &self.arena[off..off + len];
                Datum::Varchar(String::from_utf8_lossy(bytes).into_owned())
            }
        }
    }

    /// Materialise one row.
    pub fn row(&self, row: usize) -> Vec<Datum> {
        (0..self.desc.num_columns())
            .map(|col| self.get(row, col))
            .collect()
    }

    /// Append one fully materialised row; the caller checks `is_full` first.
    pub fn add_row(&mut self, values: &[Datum]) -> Result<()> {
        let row = self
            .allocate_tuple()
            .ok_or_else(|| Status::internal("row batch at capacity"))?;
        for (col, value) in values.iter().enumerate() {
            self.set_column(row, col, value)?;
        }
        Ok(())
    }

    fn set_null_bit(&mut self, row: usize, col: usize, null: bool) {
        let (byte, mask) = self.desc.null_bit(col);
        let idx = row * self.desc.row_stride() + byte;
        if null {
            self.row_data[idx] |= mask;
        } else {
            self.row_data[idx] &= !mask;
        }
    }

    /// Length-prefixed wire form: header (magic, version, row count, row
    /// bytes, arena bytes), then the row buffer, then the arena. No trailer.
    pub fn to_wire(&self) -> Vec<u8> {
        let row_bytes = self.num_rows * self.desc.row_stride();
        let mut out = Vec::with_capacity(WIRE_HEADER_BYTES + row_bytes + self.arena.len());
        out.extend_from_slice(&WIRE_MAGIC.to_le_bytes());
        out.push(WIRE_VERSION_MAJOR);
        out.push(WIRE_VERSION_MINOR);
        out.extend_from_slice(&(self.num_rows as u32).to_le_bytes());
        out.extend_from_slice(&(row_bytes as u32).to_le_bytes());
        out.extend_from_slice(&(self.arena.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.row_data[..row_bytes]);
        out.extend_from_slice(&self.arena);
        out
    }

    /// Exact inverse of [`RowBatch::to_wire`] under the schema exchanged at
    /// prepare time.
    pub fn from_wire(desc: TupleDescriptor, bytes: &[u8]) -> Result<Self> {
        if bytes.len() < WIRE_HEADER_BYTES {
            return Err(Status::internal("row batch wire frame truncated"));
        }
        let magic = u32::from_le_bytes(bytes[0..4].try_into().expect("sized"));
        if magic != WIRE_MAGIC {
            return Err(Status::internal(format!(
                "bad row batch magic: {magic:#010x}"
            )));
        }
        let major = bytes[4];
        if major != WIRE_VERSION_MAJOR {
            return Err(Status::internal(format!(
                "unsupported row batch version {major}.{}",
                bytes[5]
            )));
        }
        let num_rows = u32::from_le_bytes(bytes[6..10].try_into().expect("sized")) as usize;
        let row_bytes = u32::from_le_bytes(bytes[10..14].try_into().expect("sized")) as usize;
        let arena_bytes = u32::from_le_bytes(bytes[14..18].try_into().expect("sized")) as usize;
        if row_bytes != num_rows * desc.row_stride() {
            return Err(Status::internal(format!(
                "row buffer length {} does not match {} rows of stride {}",
                row_bytes,
                num_rows,
                desc.row_stride()
            )));
        }
        if bytes.len() != WIRE_HEADER_BYTES + row_bytes + arena_bytes {
            return Err(Status::internal("row batch wire frame length mismatch"));
        }
        let row_data = bytes[WIRE_HEADER_BYTES..WIRE_HEADER_BYTES + row_bytes].to_vec();
        let arena = bytes[WIRE_HEADER_BYTES + row_bytes..].to_vec();
        Ok(Self {
            desc,
            capacity: num_rows.max(1),
            num_rows,
            row_data,
            arena,
            arena_cap: DEFAULT_ARENA_CAP,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_desc() -> TupleDescriptor {
        TupleDescriptor::new(vec![
            ColumnType::BigInt,
            ColumnType::Varchar,
            ColumnType::Double,
            ColumnType::Boolean,
        ])
    }

    #[test]
    fn set_and_get_round_trip() {
        let mut batch = RowBatch::new(sample_desc(), 4);
        batch
            .add_row(&[
                Datum::BigInt(-7),
                Datum::Varchar("hello".into()),
                Datum::Double(2.5),
                Datum::Boolean(true),
            ])
            .expect("add");
        batch
            .add_row(&[
                Datum::Null,
                Datum::Null,
                Datum::Double(f64::NEG_INFINITY),
                Datum::Boolean(false),
            ])
            .expect("add");

        assert_eq!(batch.get(0, 0), Datum::BigInt(-7));
        assert_eq!(batch.get(0, 1), Datum::Varchar("hello".into()));
        assert_eq!(batch.get(1, 0), Datum::Null);
        assert!(batch.is_null(1, 1));
        assert_eq!(batch.get(1, 2), Datum::Double(f64::NEG_INFINITY));
    }

    #[test]
    fn wire_round_trip_is_byte_exact() {
        let mut batch = RowBatch::new(sample_desc(), 8);
        for i in 0..5i64 {
            batch
                .add_row(&[
                    Datum::BigInt(i * 1000),
                    Datum::Varchar(format!("row-{i}")),
                    if i % 2 == 0 {
                        Datum::Double(i as f64 / 3.0)
                    } else {
                        Datum::Null
                    },
                    Datum::Boolean(i % 2 == 1),
                ])
                .expect("add");
        }

        let wire = batch.to_wire();
        let decoded = RowBatch::from_wire(sample_desc(), &wire).expect("decode");
        assert_eq!(decoded.num_rows(), 5);
        assert_eq!(decoded.to_wire(), wire);
        for row in 0..5 {
            assert_eq!(decoded.row(row), batch.row(row));
        }
    }

    #[test]
    fn empty_batch_round_trips() {
        let batch = RowBatch::new(sample_desc(), 4);
        let wire = batch.to_wire();
        let decoded = RowBatch::from_wire(sample_desc(), &wire).expect("decode");
        assert_eq!(decoded.num_rows(), 0);
        assert_eq!(decoded.to_wire(), wire);
    }

    #[test]
    fn corrupt_frames_are_rejected() {
        let mut batch = RowBatch::new(sample_desc(), 2);
        batch
            .add_row(&[
                Datum::BigInt(1),
                Datum::Varchar("x".into()),
                Datum::Double(0.0),
                Datum::Boolean(false),
            ])
            .expect("add");
        let mut wire = batch.to_wire();
        wire[0] ^= 0xFF;
        assert!(RowBatch::from_wire(sample_desc(), &wire).is_err());

        let wire = batch.to_wire();
        assert!(RowBatch::from_wire(sample_desc(), &wire[..wire.len() - 1]).is_err());
    }

    #[test]
    fn arena_cap_drives_is_full() {
        let desc = TupleDescriptor::new(vec![ColumnType::Varchar]);
        let mut batch = RowBatch::with_arena_cap(desc, 1024, 16);
        batch
            .add_row(&[Datum::Varchar("0123456789abcdef-more".into())])
            .expect("add");
        assert!(batch.is_full());
        assert!(batch.num_rows() < batch.capacity());
    }

    #[test]
    fn integer_arithmetic_wraps_in_storage() {
        // Wrapping semantics live in expression eval; the batch stores any i64.
        let desc = TupleDescriptor::new(vec![ColumnType::BigInt]);
        let mut batch = RowBatch::new(desc, 1);
        batch.add_row(&[Datum::BigInt(i64::MAX)]).expect("add");
        assert_eq!(batch.get(0, 0), Datum::BigInt(i64::MAX));
    }
}
