//! # Operators
//!
//! Push-style dataflow kernels. A compiled rule body is an `OpChain`: the
//! delta driver enters at the head, each operator either drops the current
//! binding frame, rewrites it, or hands it to the next operator, and the
//! final insert operator projects a head tuple and emits a derivation for
//! the router to route. Evaluation errors abort the local derivation and
//! are logged; the engine continues.

use crate::ast::{AggKind, OpKind};
use crate::error::EvalError;
use crate::expr::{arith, EvalContext, Expr};
use crate::table::{Polarity, Tables};
use crate::tuple::Tuple;
use crate::value::{DataType, Datum};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

/// A derived tuple on its way back to the router.
pub struct Derivation {
    pub table: String,
    pub tuple: Tuple,
    pub polarity: Polarity,
}

/// Entry point of a chain: qualifiers local to the driver tuple, and the
/// driver attributes that seed the binding frame.
pub struct DriverStep {
    pub quals: Vec<Expr>,
    pub bind: Vec<usize>,
}

/// How a scan treats its target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Nested-loop join: push one frame downstream per matching row.
    Loop,
    /// Negation: push the unchanged frame iff no row matches. When
    /// `exclude_driver` is set the chain's own driver tuple does not count
    /// as a match (used by chains driven by a negated atom's own delta).
    Absent { exclude_driver: bool },
}

pub struct ScanOp {
    pub table: String,
    pub mode: ScanMode,
    /// Join-local qualifiers over (candidate, frame).
    pub quals: Vec<Expr>,
    /// Candidate attributes appended to the frame on a match.
    pub bind: Vec<usize>,
}

/// Short-circuiting qualifier list over the frame alone.
pub struct FilterOp {
    pub quals: Vec<Expr>,
}

/// Projects the head tuple from the frame and emits it.
pub struct InsertOp {
    pub table: String,
    pub cols: Vec<Expr>,
}

/// One aggregate column of a rule head.
pub struct AggSpec {
    pub kind: AggKind,
    /// Aggregated input over the frame; `None` for count.
    pub input: Option<Expr>,
    pub out_ty: DataType,
}

/// Grouped aggregation. State is shared by every chain of the rule so that
/// all delta drivers feed the same accumulators.
pub struct AggOp {
    pub group: Vec<Expr>,
    pub aggs: Vec<AggSpec>,
    pub state: Rc<RefCell<AggState>>,
}

pub enum Op {
    Scan(ScanOp),
    Filter(FilterOp),
    Agg(AggOp),
    Insert(InsertOp),
}

/// A compiled rule body keyed by its delta table. Immutable after planning.
pub struct OpChain {
    /// Rule head name plus driver ordinal, for log records.
    pub rule_name: String,
    pub delta_table: String,
    /// Event gate: fire only on the named polarity, consuming it.
    pub gate: Option<Polarity>,
    /// Invert the propagated polarity (delete rules, negated-atom drivers).
    pub invert: bool,
    pub driver: DriverStep,
    pub ops: Vec<Op>,
}

impl OpChain {
    /// True when a delta of `polarity` on the delta table should enter this
    /// chain.
    pub fn accepts(&self, polarity: Polarity) -> bool {
        self.gate.map_or(true, |g| g == polarity)
    }

    /// Run the chain with `driver` as the newly-visible delta tuple.
    pub fn fire(
        &self,
        driver: &Tuple,
        polarity: Polarity,
        tables: &Tables,
        out: &mut Vec<Derivation>,
    ) {
        // An event gate consumes the polarity; otherwise it propagates.
        let base: i64 = match (self.gate, polarity) {
            (Some(_), _) | (None, Polarity::Insert) => 1,
            (None, Polarity::Delete) => -1,
        };
        let diff = if self.invert { -base } else { base };

        let mut frame = Vec::with_capacity(self.driver.bind.len());
        {
            let vals = driver.values();
            let cx = EvalContext::new(&vals[..], &[]);
            if self.eval_quals(&self.driver.quals, &cx) != Some(true) {
                return;
            }
            for &attno in &self.driver.bind {
                frame.push(vals[attno].clone());
            }
        }
        self.run(0, &mut frame, diff, driver, tables, out);
    }

    fn run(
        &self,
        idx: usize,
        frame: &mut Vec<Datum>,
        diff: i64,
        driver: &Tuple,
        tables: &Tables,
        out: &mut Vec<Derivation>,
    ) {
        let Some(op) = self.ops.get(idx) else {
            return;
        };
        match op {
            Op::Scan(scan) => self.run_scan(scan, idx, frame, diff, driver, tables, out),
            Op::Filter(filter) => {
                let cx = EvalContext::new(&[], frame);
                if self.eval_quals(&filter.quals, &cx) == Some(true) {
                    self.run(idx + 1, frame, diff, driver, tables, out);
                }
            }
            Op::Agg(agg) => self.run_agg(agg, idx, frame, diff, driver, tables, out),
            Op::Insert(insert) => {
                let cx = EvalContext::new(&[], frame);
                let mut vals = Vec::with_capacity(insert.cols.len());
                for col in &insert.cols {
                    match col.eval(&cx) {
                        Ok(d) => vals.push(d),
                        Err(e) => {
                            self.drop_derivation(&e);
                            return;
                        }
                    }
                }
                let Some(table) = tables.get(&insert.table) else {
                    tracing::error!(rule = %self.rule_name, table = %insert.table,
                        "projection into unknown table");
                    return;
                };
                let tuple = table.pool().loan_values(vals);
                let polarity = if diff > 0 { Polarity::Insert } else { Polarity::Delete };
                out.push(Derivation { table: insert.table.clone(), tuple, polarity });
            }
        }
    }

    fn run_scan(
        &self,
        scan: &ScanOp,
        idx: usize,
        frame: &mut Vec<Datum>,
        diff: i64,
        driver: &Tuple,
        tables: &Tables,
        out: &mut Vec<Derivation>,
    ) {
        let Some(table) = tables.get(&scan.table) else {
            tracing::error!(rule = %self.rule_name, table = %scan.table, "scan of unknown table");
            return;
        };

        match scan.mode {
            ScanMode::Absent { exclude_driver } => {
                for cand in table.scan() {
                    if exclude_driver && cand.same_buffer(driver) {
                        continue;
                    }
                    let vals = cand.values();
                    let cx = EvalContext::new(&vals[..], frame);
                    if self.eval_quals(&scan.quals, &cx) == Some(true) {
                        return;
                    }
                }
                self.run(idx + 1, frame, diff, driver, tables, out);
            }
            ScanMode::Loop => {
                for cand in table.scan() {
                    let bound = {
                        let vals = cand.values();
                        let cx = EvalContext::new(&vals[..], frame);
                        if self.eval_quals(&scan.quals, &cx) == Some(true) {
                            Some(scan.bind.iter().map(|&a| vals[a].clone()).collect::<Vec<_>>())
                        } else {
                            None
                        }
                    };
                    if let Some(new_vals) = bound {
                        let base = frame.len();
                        frame.extend(new_vals);
                        self.run(idx + 1, frame, diff, driver, tables, out);
                        frame.truncate(base);
                    }
                }
            }
        }
    }

    fn run_agg(
        &self,
        agg: &AggOp,
        idx: usize,
        frame: &mut Vec<Datum>,
        diff: i64,
        driver: &Tuple,
        tables: &Tables,
        out: &mut Vec<Derivation>,
    ) {
        let cx = EvalContext::new(&[], frame);
        let mut key = Vec::with_capacity(agg.group.len());
        for g in &agg.group {
            match g.eval(&cx) {
                Ok(d) => key.push(d),
                Err(e) => {
                    self.drop_derivation(&e);
                    return;
                }
            }
        }
        let mut inputs = Vec::with_capacity(agg.aggs.len());
        for spec in &agg.aggs {
            match &spec.input {
                Some(expr) => match expr.eval(&cx) {
                    Ok(d) => inputs.push(Some(d)),
                    Err(e) => {
                        self.drop_derivation(&e);
                        return;
                    }
                },
                None => inputs.push(None),
            }
        }

        let delta = match agg.state.borrow_mut().update(&key, &inputs, diff, &agg.aggs) {
            Ok(delta) => delta,
            Err(e) => {
                self.drop_derivation(&e);
                return;
            }
        };

        // Observers see the retraction of the prior group tuple before the
        // insertion of the updated one.
        if let Some(old) = delta.retract {
            let mut emitted: Vec<Datum> = key.iter().cloned().chain(old).collect();
            self.run(idx + 1, &mut emitted, -1, driver, tables, out);
        }
        if let Some(new) = delta.insert {
            let mut emitted: Vec<Datum> = key.into_iter().chain(new).collect();
            self.run(idx + 1, &mut emitted, 1, driver, tables, out);
        }
    }

    /// All qualifiers true? `None` means an evaluation error was logged.
    fn eval_quals(&self, quals: &[Expr], cx: &EvalContext<'_>) -> Option<bool> {
        for q in quals {
            match q.eval(cx) {
                Ok(Datum::Bool(true)) => {}
                Ok(Datum::Bool(false)) => return Some(false),
                Ok(_) => {
                    self.drop_derivation(&EvalError::Type("qualifier"));
                    return None;
                }
                Err(e) => {
                    self.drop_derivation(&e);
                    return None;
                }
            }
        }
        Some(true)
    }

    fn drop_derivation(&self, e: &EvalError) {
        tracing::error!(rule = %self.rule_name, error = %e, "derivation dropped");
    }
}

// === Aggregation state ===

/// Accumulator for one aggregate column of one group.
enum Accum {
    Count,
    Sum(Option<Datum>),
    Avg { sum: f64 },
    /// Ordered multiset of inputs; serves both min and max.
    Extrema(BTreeMap<Datum, u32>),
}

struct Group {
    /// Signed number of input derivations currently in the group.
    n: i64,
    accums: Vec<Accum>,
}

impl Group {
    fn new(aggs: &[AggSpec]) -> Group {
        let accums = aggs
            .iter()
            .map(|spec| match spec.kind {
                AggKind::Count => Accum::Count,
                AggKind::Sum => Accum::Sum(None),
                AggKind::Avg => Accum::Avg { sum: 0.0 },
                AggKind::Min | AggKind::Max => Accum::Extrema(BTreeMap::new()),
            })
            .collect();
        Group { n: 0, accums }
    }

    fn apply(&mut self, inputs: &[Option<Datum>], sign: i64) -> Result<(), EvalError> {
        self.n += sign;
        for (accum, input) in self.accums.iter_mut().zip(inputs) {
            match accum {
                Accum::Count => {}
                Accum::Sum(cur) => {
                    let v = input.as_ref().ok_or(EvalError::Type("sum input"))?;
                    let op = if sign > 0 { OpKind::Add } else { OpKind::Sub };
                    *cur = Some(match cur.take() {
                        Some(total) => arith(op, &total, v)?,
                        None if sign > 0 => v.clone(),
                        None => return Err(EvalError::Type("sum retraction before insert")),
                    });
                }
                Accum::Avg { sum } => {
                    let v = input.as_ref().ok_or(EvalError::Type("avg input"))?;
                    *sum += numeric_as_f64(v)? * sign as f64;
                }
                Accum::Extrema(values) => {
                    let v = input.as_ref().ok_or(EvalError::Type("extrema input"))?;
                    if sign > 0 {
                        *values.entry(v.clone()).or_insert(0) += 1;
                    } else if let Some(count) = values.get_mut(v) {
                        *count -= 1;
                        if *count == 0 {
                            values.remove(v);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn output(&self, aggs: &[AggSpec]) -> Result<Vec<Datum>, EvalError> {
        let mut out = Vec::with_capacity(aggs.len());
        for (accum, spec) in self.accums.iter().zip(aggs) {
            let value = match (accum, spec.kind) {
                (Accum::Count, _) => int_of(self.n, spec.out_ty)?,
                (Accum::Sum(cur), _) => {
                    cur.clone().ok_or(EvalError::Type("sum of empty group"))?
                }
                (Accum::Avg { sum }, _) => Datum::Float64(sum / self.n as f64),
                (Accum::Extrema(values), AggKind::Min) => values
                    .keys()
                    .next()
                    .cloned()
                    .ok_or(EvalError::Type("min of empty group"))?,
                (Accum::Extrema(values), _) => values
                    .keys()
                    .next_back()
                    .cloned()
                    .ok_or(EvalError::Type("max of empty group"))?,
            };
            out.push(value);
        }
        Ok(out)
    }
}

fn numeric_as_f64(d: &Datum) -> Result<f64, EvalError> {
    match d {
        Datum::Int16(v) => Ok(f64::from(*v)),
        Datum::Int32(v) => Ok(f64::from(*v)),
        Datum::Int64(v) => Ok(*v as f64),
        Datum::Float64(v) => Ok(*v),
        _ => Err(EvalError::Type("numeric aggregate input")),
    }
}

fn int_of(n: i64, ty: DataType) -> Result<Datum, EvalError> {
    match ty {
        DataType::Int16 => i16::try_from(n)
            .map(Datum::Int16)
            .map_err(|_| EvalError::Overflow("count")),
        DataType::Int32 => i32::try_from(n)
            .map(Datum::Int32)
            .map_err(|_| EvalError::Overflow("count")),
        DataType::Int64 => Ok(Datum::Int64(n)),
        _ => Err(EvalError::Type("count output")),
    }
}

/// Output change produced by one aggregation input.
pub struct AggDelta {
    pub retract: Option<Vec<Datum>>,
    pub insert: Option<Vec<Datum>>,
}

/// Grouped accumulators: group-key tuple to aggregate state.
#[derive(Default)]
pub struct AggState {
    groups: HashMap<Vec<Datum>, Group>,
}

impl AggState {
    pub fn new() -> AggState {
        AggState { groups: HashMap::new() }
    }

    /// Apply one input with multiplicity `diff` and report the aggregate
    /// output change, if any.
    pub fn update(
        &mut self,
        key: &[Datum],
        inputs: &[Option<Datum>],
        diff: i64,
        aggs: &[AggSpec],
    ) -> Result<AggDelta, EvalError> {
        let old = match self.groups.get(key) {
            Some(g) => Some(g.output(aggs)?),
            None => None,
        };

        if diff > 0 {
            let group = self.groups.entry(key.to_vec()).or_insert_with(|| Group::new(aggs));
            group.apply(inputs, 1)?;
        } else if let Some(group) = self.groups.get_mut(key) {
            group.apply(inputs, -1)?;
            if group.n <= 0 {
                self.groups.remove(key);
            }
        } else {
            tracing::warn!("aggregate retraction for an unknown group");
            return Ok(AggDelta { retract: None, insert: None });
        }

        let new = match self.groups.get(key) {
            Some(g) => Some(g.output(aggs)?),
            None => None,
        };

        if old == new {
            return Ok(AggDelta { retract: None, insert: None });
        }
        Ok(AggDelta { retract: old, insert: new })
    }
}
