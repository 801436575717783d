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

//! Scalar expression trees evaluated against row batches, plus the
//! aggregate/analytic function descriptors the operator nodes execute.
//! Expressions ride inside serialised plans, so everything here is serde.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::common::status::{Result, Status};
use crate::runtime::descriptors::{cmp_datum, ColumnType, Datum, TupleDescriptor};
use crate::runtime::row_batch::RowBatch;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Reference to an output column of the input tuple.
    SlotRef(usize),
    Literal(Datum),
    Cmp {
        op: CmpOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Arith {
        op: ArithOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    IsNull {
        negated: bool,
        input: Box<Expr>,
    },
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn slot(col: usize) -> Expr {
        Expr::SlotRef(col)
    }

    pub fn lit(value: Datum) -> Expr {
        Expr::Literal(value)
    }

    pub fn cmp(op: CmpOp, left: Expr, right: Expr) -> Expr {
        Expr::Cmp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Eager binding pass run at fragment prepare: validates slot indices
    /// against the schema. Skipped when codegen is disabled, in which case
    /// the same checks surface lazily during evaluation.
    pub fn bind(&self, desc: &TupleDescriptor) -> Result<()> {
        match self {
            Expr::SlotRef(col) => {
                if *col >= desc.num_columns() {
                    return Err(Status::internal(format!(
                        "slot {} out of range for {}-column tuple",
                        col,
                        desc.num_columns()
                    )));
                }
                Ok(())
            }
            Expr::Literal(_) => Ok(()),
            Expr::Cmp { left, right, .. } | Expr::Arith { left, right, .. } => {
                left.bind(desc)?;
                right.bind(desc)
            }
            Expr::IsNull { input, .. } | Expr::Not(input) => input.bind(desc),
            Expr::And(a, b) | Expr::Or(a, b) => {
                a.bind(desc)?;
                b.bind(desc)
            }
        }
    }

    pub fn eval(&self, batch: &RowBatch, row: usize) -> Result<Datum> {
        match self {
            Expr::SlotRef(col) => {
                if *col >= batch.descriptor().num_columns() {
                    return Err(Status::internal(format!("slot {col} out of range")));
                }
                Ok(batch.get(row, *col))
            }
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Cmp { op, left, right } => {
                let l = left.eval(batch, row)?;
                let r = right.eval(batch, row)?;
                if l.is_null() || r.is_null() {
                    return Ok(Datum::Null);
                }
                let ord = cmp_datum(&l, &r);
                let v = match op {
                    CmpOp::Eq => ord == Ordering::Equal,
                    CmpOp::Ne => ord != Ordering::Equal,
                    CmpOp::Lt => ord == Ordering::Less,
                    CmpOp::Le => ord != Ordering::Greater,
                    CmpOp::Gt => ord == Ordering::Greater,
                    CmpOp::Ge => ord != Ordering::Less,
                };
                Ok(Datum::Boolean(v))
            }
            Expr::Arith { op, left, right } => {
                let l = left.eval(batch, row)?;
                let r = right.eval(batch, row)?;
                eval_arith(*op, &l, &r)
            }
            Expr::IsNull { negated, input } => {
                let v = input.eval(batch, row)?;
                Ok(Datum::Boolean(v.is_null() != *negated))
            }
            Expr::Not(input) => match input.eval(batch, row)? {
                Datum::Null => Ok(Datum::Null),
                Datum::Boolean(v) => Ok(Datum::Boolean(!v)),
                other => Err(Status::internal(format!("NOT over non-boolean {other:?}"))),
            },
            Expr::And(a, b) => {
                let l = a.eval(batch, row)?;
                let r = b.eval(batch, row)?;
                match (l.as_bool(), r.as_bool()) {
                    (Some(false), _) | (_, Some(false)) => Ok(Datum::Boolean(false)),
                    (Some(true), Some(true)) => Ok(Datum::Boolean(true)),
                    _ => Ok(Datum::Null),
                }
            }
            Expr::Or(a, b) => {
                let l = a.eval(batch, row)?;
                let r = b.eval(batch, row)?;
                match (l.as_bool(), r.as_bool()) {
                    (Some(true), _) | (_, Some(true)) => Ok(Datum::Boolean(true)),
                    (Some(false), Some(false)) => Ok(Datum::Boolean(false)),
                    _ => Ok(Datum::Null),
                }
            }
        }
    }
}

/// Integer arithmetic wraps silently; doubles follow IEEE-754; a zero
/// divisor yields NULL. Mixed int/double promotes to double.
fn eval_arith(op: ArithOp, l: &Datum, r: &Datum) -> Result<Datum> {
    if l.is_null() || r.is_null() {
        return Ok(Datum::Null);
    }
    match (l, r) {
        (Datum::BigInt(a), Datum::BigInt(b)) => {
            let v = match op {
                ArithOp::Add => a.wrapping_add(*b),
                ArithOp::Sub => a.wrapping_sub(*b),
                ArithOp::Mul => a.wrapping_mul(*b),
                ArithOp::Div => {
                    if *b == 0 {
                        return Ok(Datum::Null);
                    }
                    a.wrapping_div(*b)
                }
                ArithOp::Mod => {
                    if *b == 0 {
                        return Ok(Datum::Null);
                    }
                    a.wrapping_rem(*b)
                }
            };
            Ok(Datum::BigInt(v))
        }
        _ => {
            let (Some(a), Some(b)) = (l.as_double(), r.as_double()) else {
                return Err(Status::internal(format!(
                    "arithmetic over non-numeric operands {l:?}, {r:?}"
                )));
            };
            let v = match op {
                ArithOp::Add => a + b,
                ArithOp::Sub => a - b,
                ArithOp::Mul => a * b,
                ArithOp::Div => a / b,
                ArithOp::Mod => a % b,
            };
            Ok(Datum::Double(v))
        }
    }
}

/// Evaluate conjunctive predicates; NULL counts as false.
pub fn eval_conjuncts(conjuncts: &[Expr], batch: &RowBatch, row: usize) -> Result<bool> {
    for conjunct in conjuncts {
        match conjunct.eval(batch, row)? {
            Datum::Boolean(true) => continue,
            Datum::Boolean(false) | Datum::Null => return Ok(false),
            other => {
                return Err(Status::internal(format!(
                    "predicate evaluated to non-boolean {other:?}"
                )));
            }
        }
    }
    Ok(true)
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8], mut hash: u64) -> u64 {
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Deterministic hash of the per-row values of `exprs`, used for hash
/// partitioning. Every sender must agree on this function, so it is fixed
/// (FNV-1a over the self-delimiting key encoding) rather than hasher-random.
pub fn hash_row(exprs: &[Expr], batch: &RowBatch, row: usize) -> Result<u64> {
    let mut buf = Vec::new();
    for expr in exprs {
        expr.eval(batch, row)?.encode_key(&mut buf);
    }
    Ok(fnv1a(&buf, FNV_OFFSET))
}

/// Key bytes for hash aggregation grouping.
pub fn encode_group_key(exprs: &[Expr], batch: &RowBatch, row: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    for expr in exprs {
        expr.eval(batch, row)?.encode_key(&mut buf);
    }
    Ok(buf)
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum AggFunc {
    CountStar,
    Count,
    Sum,
    Min,
    Max,
}

/// One aggregate to evaluate, e.g. `sum(b)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggExpr {
    pub func: AggFunc,
    pub input: Option<Expr>,
}

impl AggExpr {
    pub fn count_star() -> Self {
        Self {
            func: AggFunc::CountStar,
            input: None,
        }
    }

    pub fn sum(input: Expr) -> Self {
        Self {
            func: AggFunc::Sum,
            input: Some(input),
        }
    }

    pub fn output_type(&self, input_type: Option<ColumnType>) -> ColumnType {
        match self.func {
            AggFunc::CountStar | AggFunc::Count => ColumnType::BigInt,
            AggFunc::Sum => match input_type {
                Some(ColumnType::Double) => ColumnType::Double,
                _ => ColumnType::BigInt,
            },
            AggFunc::Min | AggFunc::Max => input_type.unwrap_or(ColumnType::BigInt),
        }
    }

    pub fn init_state(&self) -> Datum {
        match self.func {
            AggFunc::CountStar | AggFunc::Count => Datum::BigInt(0),
            _ => Datum::Null,
        }
    }

    /// Fold one input row into the accumulator (first aggregation phase).
    pub fn update(&self, state: &mut Datum, batch: &RowBatch, row: usize) -> Result<()> {
        let input = match &self.input {
            Some(expr) => Some(expr.eval(batch, row)?),
            None => None,
        };
        match self.func {
            AggFunc::CountStar => {
                *state = Datum::BigInt(state.as_bigint().unwrap_or(0).wrapping_add(1));
            }
            AggFunc::Count => {
                if input.as_ref().is_some_and(|v| !v.is_null()) {
                    *state = Datum::BigInt(state.as_bigint().unwrap_or(0).wrapping_add(1));
                }
            }
            AggFunc::Sum => {
                if let Some(v) = input {
                    accumulate_sum(state, &v)?;
                }
            }
            AggFunc::Min => {
                if let Some(v) = input {
                    if !v.is_null()
                        && (state.is_null() || cmp_datum(&v, state) == Ordering::Less)
                    {
                        *state = v;
                    }
                }
            }
            AggFunc::Max => {
                if let Some(v) = input {
                    if !v.is_null()
                        && (state.is_null() || cmp_datum(&v, state) == Ordering::Greater)
                    {
                        *state = v;
                    }
                }
            }
        }
        Ok(())
    }

    /// Fold a partial aggregate produced by an upstream instance
    /// (merge/finalize phase). Counts merge by summation.
    pub fn merge(&self, state: &mut Datum, partial: &Datum) -> Result<()> {
        match self.func {
            AggFunc::CountStar | AggFunc::Count => {
                let v = partial.as_bigint().unwrap_or(0);
                *state = Datum::BigInt(state.as_bigint().unwrap_or(0).wrapping_add(v));
            }
            AggFunc::Sum => {
                if !partial.is_null() {
                    accumulate_sum(state, partial)?;
                }
            }
            AggFunc::Min => {
                if !partial.is_null()
                    && (state.is_null() || cmp_datum(partial, state) == Ordering::Less)
                {
                    *state = partial.clone();
                }
            }
            AggFunc::Max => {
                if !partial.is_null()
                    && (state.is_null() || cmp_datum(partial, state) == Ordering::Greater)
                {
                    *state = partial.clone();
                }
            }
        }
        Ok(())
    }
}

fn accumulate_sum(state: &mut Datum, v: &Datum) -> Result<()> {
    if v.is_null() {
        return Ok(());
    }
    *state = match (&*state, v) {
        (Datum::Null, Datum::BigInt(b)) => Datum::BigInt(*b),
        (Datum::Null, Datum::Double(b)) => Datum::Double(*b),
        (Datum::BigInt(a), Datum::BigInt(b)) => Datum::BigInt(a.wrapping_add(*b)),
        (Datum::Double(a), Datum::Double(b)) => Datum::Double(a + b),
        (Datum::BigInt(a), Datum::Double(b)) => Datum::Double(*a as f64 + b),
        (Datum::Double(a), Datum::BigInt(b)) => Datum::Double(a + *b as f64),
        (s, v) => {
            return Err(Status::internal(format!(
                "sum over incompatible values {s:?}, {v:?}"
            )));
        }
    };
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AnalyticFunc {
    RowNumber,
    RunningCount,
    RunningSum(Expr),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_row_batch(values: &[Datum]) -> RowBatch {
        let cols = values
            .iter()
            .map(|v| v.column_type().unwrap_or(ColumnType::BigInt))
            .collect();
        let mut batch = RowBatch::new(TupleDescriptor::new(cols), 1);
        batch.add_row(values).expect("add");
        batch
    }

    #[test]
    fn integer_arithmetic_wraps() {
        let batch = one_row_batch(&[Datum::BigInt(i64::MAX), Datum::BigInt(1)]);
        let expr = Expr::Arith {
            op: ArithOp::Add,
            left: Box::new(Expr::slot(0)),
            right: Box::new(Expr::slot(1)),
        };
        assert_eq!(expr.eval(&batch, 0).expect("eval"), Datum::BigInt(i64::MIN));
    }

    #[test]
    fn divide_by_zero_is_null() {
        let batch = one_row_batch(&[Datum::BigInt(10), Datum::BigInt(0)]);
        let expr = Expr::Arith {
            op: ArithOp::Div,
            left: Box::new(Expr::slot(0)),
            right: Box::new(Expr::slot(1)),
        };
        assert_eq!(expr.eval(&batch, 0).expect("eval"), Datum::Null);
    }

    #[test]
    fn null_comparison_filters_row() {
        let batch = one_row_batch(&[Datum::Null]);
        let conjuncts = vec![Expr::cmp(CmpOp::Eq, Expr::slot(0), Expr::lit(Datum::BigInt(1)))];
        assert!(!eval_conjuncts(&conjuncts, &batch, 0).expect("eval"));
    }

    #[test]
    fn bind_rejects_out_of_range_slot() {
        let desc = TupleDescriptor::new(vec![ColumnType::BigInt]);
        assert!(Expr::slot(0).bind(&desc).is_ok());
        assert!(Expr::slot(3).bind(&desc).is_err());
    }

    #[test]
    fn hash_row_is_deterministic() {
        let batch = one_row_batch(&[Datum::BigInt(42), Datum::Varchar("k".into())]);
        let exprs = vec![Expr::slot(0), Expr::slot(1)];
        let h1 = hash_row(&exprs, &batch, 0).expect("hash");
        let h2 = hash_row(&exprs, &batch, 0).expect("hash");
        assert_eq!(h1, h2);

        let other = one_row_batch(&[Datum::BigInt(43), Datum::Varchar("k".into())]);
        assert_ne!(h1, hash_row(&exprs, &other, 0).expect("hash"));
    }

    #[test]
    fn count_update_and_merge_agree() {
        let agg = AggExpr::count_star();
        let batch = one_row_batch(&[Datum::BigInt(0)]);
        let mut a = agg.init_state();
        let mut b = agg.init_state();
        for _ in 0..3 {
            agg.update(&mut a, &batch, 0).expect("update");
        }
        for _ in 0..2 {
            agg.update(&mut b, &batch, 0).expect("update");
        }
        let mut merged = agg.init_state();
        agg.merge(&mut merged, &a).expect("merge");
        agg.merge(&mut merged, &b).expect("merge");
        assert_eq!(merged, Datum::BigInt(5));
    }

    #[test]
    fn min_max_ignore_nulls() {
        let agg = AggExpr {
            func: AggFunc::Min,
            input: Some(Expr::slot(0)),
        };
        let mut state = agg.init_state();
        let b1 = one_row_batch(&[Datum::BigInt(9)]);
        agg.update(&mut state, &b1, 0).expect("update");
        let null_batch = {
            let mut b = RowBatch::new(TupleDescriptor::new(vec![ColumnType::BigInt]), 1);
            b.add_row(&[Datum::Null]).expect("add");
            b
        };
        agg.update(&mut state, &null_batch, 0).expect("update");
        assert_eq!(state, Datum::BigInt(9));
    }

    #[test]
    fn expr_serde_round_trip() {
        let expr = Expr::And(
            Box::new(Expr::cmp(CmpOp::Gt, Expr::slot(1), Expr::lit(Datum::BigInt(5)))),
            Box::new(Expr::IsNull {
                negated: true,
                input: Box::new(Expr::slot(0)),
            }),
        );
        let json = serde_json::to_string(&expr).expect("serialize");
        let back: Expr = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(expr, back);
    }
}
