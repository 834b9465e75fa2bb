//! # Operator Chain Assembly
//!
//! Compiles each analyzed rule into its operator chains, one per body join
//! clause: when a fresh tuple lands in that clause's table, it enters the
//! chain as the delta driver and the remaining clauses are scanned over
//! their full current contents. Qualifiers are pushed to the earliest chain
//! position at which all their variables are bound.
//!
//! Chain flavors:
//! - a positive driver propagates the delta polarity to the head;
//! - a negated driver inverts it (a tuple appearing retracts what its
//!   absence derived, a tuple vanishing re-derives it) and carries a guard
//!   that no other row of the negated table still matches;
//! - an event driver (`#insert` / `#delete`) gates the chain to one
//!   polarity and consumes it;
//! - a `delete` rule inverts the head polarity once more.
//!
//! Aggregate state is created once per rule and shared by its chains.

use crate::analyze::{fold_const, is_literal, RuleInfo};
use crate::ast::*;
use crate::catalog::TableDef;
use crate::error::ProgramError;
use crate::expr::Expr;
use crate::operator::*;
use crate::table::Polarity;
use crate::value::DataType;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Compile every rule into its chains.
pub fn plan_rules(rules: &[RuleInfo]) -> Result<Vec<OpChain>, ProgramError> {
    let mut chains = Vec::new();
    for rule in rules {
        chains.extend(plan_rule(rule)?);
    }
    Ok(chains)
}

/// Compile one rule into one chain per eligible delta driver.
pub fn plan_rule(info: &RuleInfo) -> Result<Vec<OpChain>, ProgramError> {
    let rule = &info.ast;
    let has_event = rule.joins.iter().any(|j| j.hash_variant != AstHashVariant::None);
    let agg_state = if rule.has_aggregates() {
        Some(Rc::new(RefCell::new(AggState::new())))
    } else {
        None
    };

    let mut chains = Vec::new();
    for (i, join) in rule.joins.iter().enumerate() {
        // With event atoms present, only they drive the rule.
        if has_event && join.hash_variant == AstHashVariant::None {
            continue;
        }
        chains.push(build_chain(info, i, agg_state.clone())?);
    }
    Ok(chains)
}

/// The variable frame of a chain under construction.
#[derive(Default)]
struct Frame {
    slots: Vec<(String, DataType)>,
    index: HashMap<String, usize>,
}

impl Frame {
    fn get(&self, name: &str) -> Option<(usize, DataType)> {
        self.index.get(name).map(|&i| (i, self.slots[i].1))
    }

    fn bind(&mut self, name: &str, ty: DataType) -> usize {
        let slot = self.slots.len();
        self.slots.push((name.to_string(), ty));
        self.index.insert(name.to_string(), slot);
        slot
    }

    fn binds_all(&self, expr: &AstExpr) -> bool {
        expr.variables().iter().all(|v| self.index.contains_key(v))
    }
}

fn eq(lhs: Expr, rhs: Expr) -> Expr {
    Expr::Op { kind: OpKind::Eq, lhs: Box::new(lhs), rhs: Box::new(rhs), ty: DataType::Bool }
}

fn column_ty(def: &TableDef, attno: usize) -> Result<DataType, ProgramError> {
    def.schema.column_type(attno).ok_or_else(|| {
        ProgramError::TypeMismatch(format!("column {attno} out of range in {}", def.name))
    })
}

/// Bind one atom's arguments against the frame: join-local qualifiers over
/// the candidate (inner) tuple, plus the candidate attributes to append to
/// the frame. With `allow_bind` false every variable must already be bound.
fn atom_step(
    target: &AstTableRef,
    def: &TableDef,
    frame: &mut Frame,
    allow_bind: bool,
) -> Result<(Vec<Expr>, Vec<usize>), ProgramError> {
    let mut quals = Vec::new();
    let mut bind = Vec::new();
    let mut seen_in_atom: HashMap<&str, usize> = HashMap::new();

    for (attno, arg) in target.cols.iter().enumerate() {
        let ty = column_ty(def, attno)?;
        match arg {
            AstExpr::Placeholder => {}
            AstExpr::Var(v) => {
                if let Some(&first) = seen_in_atom.get(v.as_str()) {
                    quals.push(eq(Expr::inner_var(attno, ty), Expr::inner_var(first, ty)));
                } else if let Some((slot, slot_ty)) = frame.get(v) {
                    quals.push(eq(Expr::inner_var(attno, ty), Expr::outer_var(slot, slot_ty)));
                    seen_in_atom.insert(v, attno);
                } else if allow_bind {
                    bind.push(attno);
                    frame.bind(v, ty);
                    seen_in_atom.insert(v, attno);
                } else {
                    return Err(ProgramError::UnsafeRule(format!(
                        "variable {v} reaches a scan of {} unbound",
                        def.name
                    )));
                }
            }
            other => {
                let d = fold_const(other, ty)?;
                quals.push(eq(Expr::inner_var(attno, ty), Expr::Const(d)));
            }
        }
    }
    Ok((quals, bind))
}

/// Lower a head column or qualifier expression over the frame. Mirrors the
/// analyzer's typing: integer literals adopt the wanted or sibling type.
fn lower_scalar(
    expr: &AstExpr,
    info: &RuleInfo,
    frame: &Frame,
    want: Option<DataType>,
) -> Result<Expr, ProgramError> {
    match expr {
        AstExpr::Const(_) | AstExpr::Neg(_) if is_literal(expr) => {
            let ty = match want {
                Some(w) => w,
                None => crate::analyze::type_of(expr, &info.var_types, None, &info.name)?,
            };
            Ok(Expr::Const(fold_const(expr, ty)?))
        }
        AstExpr::Var(v) => {
            let (slot, ty) = frame.get(v).ok_or_else(|| {
                ProgramError::UnsafeRule(format!("unbound variable {v} in rule {}", info.name))
            })?;
            Ok(Expr::outer_var(slot, ty))
        }
        AstExpr::Neg(inner) => {
            let arg = lower_scalar(inner, info, frame, want)?;
            let ty = arg.ty();
            Ok(Expr::Neg { arg: Box::new(arg), ty })
        }
        AstExpr::Op { kind, lhs, rhs } => {
            let (l, r) = if is_literal(lhs) && !is_literal(rhs) {
                let r = lower_scalar(rhs, info, frame, None)?;
                (lower_scalar(lhs, info, frame, Some(r.ty()))?, r)
            } else {
                let l = lower_scalar(lhs, info, frame, None)?;
                let want_rhs = Some(l.ty());
                (l, lower_scalar(rhs, info, frame, want_rhs)?)
            };
            let ty = if kind.is_comparison() { DataType::Bool } else { l.ty() };
            Ok(Expr::Op { kind: *kind, lhs: Box::new(l), rhs: Box::new(r), ty })
        }
        other => Err(ProgramError::TypeMismatch(format!(
            "cannot lower {other:?} in rule {}",
            info.name
        ))),
    }
}

fn build_chain(
    info: &RuleInfo,
    driver_idx: usize,
    agg_state: Option<Rc<RefCell<AggState>>>,
) -> Result<OpChain, ProgramError> {
    let rule = &info.ast;
    let driver_join = &rule.joins[driver_idx];
    let driver_def = &info.join_defs[driver_idx];

    let mut frame = Frame::default();
    let (driver_quals, driver_bind) =
        atom_step(&driver_join.target, driver_def, &mut frame, true)?;

    let mut ops: Vec<Op> = Vec::new();
    let mut pending_quals: Vec<&AstExpr> = rule.quals.iter().collect();
    let mut deferred_negated: Vec<usize> = Vec::new();

    // A chain driven by a negated atom must confirm that no other row of
    // that table matches the bound pattern before touching the head.
    if driver_join.negated {
        let (quals, _) = atom_step(&driver_join.target, driver_def, &mut frame, false)?;
        ops.push(Op::Scan(ScanOp {
            table: driver_def.name.clone(),
            mode: ScanMode::Absent { exclude_driver: true },
            quals,
            bind: Vec::new(),
        }));
    }

    place_ready_quals(&mut ops, &mut pending_quals, info, &frame)?;

    for (i, join) in rule.joins.iter().enumerate() {
        if i == driver_idx {
            continue;
        }
        let def = &info.join_defs[i];
        if join.negated {
            if frame.binds_all_atom(&join.target) {
                push_absent(&mut ops, join, def, &mut frame)?;
            } else {
                deferred_negated.push(i);
            }
            continue;
        }

        let (quals, bind) = atom_step(&join.target, def, &mut frame, true)?;
        ops.push(Op::Scan(ScanOp {
            table: def.name.clone(),
            mode: ScanMode::Loop,
            quals,
            bind,
        }));

        place_ready_quals(&mut ops, &mut pending_quals, info, &frame)?;
        let mut still_deferred = Vec::new();
        for &n in &deferred_negated {
            let njoin = &rule.joins[n];
            if frame.binds_all_atom(&njoin.target) {
                push_absent(&mut ops, njoin, &info.join_defs[n], &mut frame)?;
            } else {
                still_deferred.push(n);
            }
        }
        deferred_negated = still_deferred;
    }

    if !deferred_negated.is_empty() || !pending_quals.is_empty() {
        return Err(ProgramError::UnsafeRule(format!(
            "rule {} leaves qualifiers or negated atoms unbound",
            info.name
        )));
    }

    // Head: either a grouped aggregation feeding the insert, or a direct
    // projection of the frame.
    if let Some(state) = agg_state {
        let (agg_op, insert_cols) = build_agg(info, &frame, state)?;
        ops.push(Op::Agg(agg_op));
        ops.push(Op::Insert(InsertOp { table: info.head_def.name.clone(), cols: insert_cols }));
    } else {
        let mut cols = Vec::with_capacity(rule.head.cols.len());
        for (i, col) in rule.head.cols.iter().enumerate() {
            let want = column_ty(&info.head_def, i)?;
            cols.push(lower_scalar(col, info, &frame, Some(want))?);
        }
        ops.push(Op::Insert(InsertOp { table: info.head_def.name.clone(), cols }));
    }

    let gate = match driver_join.hash_variant {
        AstHashVariant::None => None,
        AstHashVariant::Insert => Some(Polarity::Insert),
        AstHashVariant::Delete => Some(Polarity::Delete),
    };

    Ok(OpChain {
        rule_name: format!("{}:{}", info.name, driver_idx),
        delta_table: driver_def.name.clone(),
        gate,
        invert: rule.is_delete != driver_join.negated,
        driver: DriverStep { quals: driver_quals, bind: driver_bind },
        ops,
    })
}

impl Frame {
    fn binds_all_atom(&self, target: &AstTableRef) -> bool {
        target.variables().iter().all(|v| self.index.contains_key(v))
    }
}

fn push_absent(
    ops: &mut Vec<Op>,
    join: &AstJoinClause,
    def: &crate::catalog::TableDefRef,
    frame: &mut Frame,
) -> Result<(), ProgramError> {
    let (quals, _) = atom_step(&join.target, def, frame, false)?;
    ops.push(Op::Scan(ScanOp {
        table: def.name.clone(),
        mode: ScanMode::Absent { exclude_driver: false },
        quals,
        bind: Vec::new(),
    }));
    Ok(())
}

/// Move every qualifier whose variables are now bound into a filter here.
fn place_ready_quals(
    ops: &mut Vec<Op>,
    pending: &mut Vec<&AstExpr>,
    info: &RuleInfo,
    frame: &Frame,
) -> Result<(), ProgramError> {
    let mut ready = Vec::new();
    let mut rest = Vec::new();
    for qual in pending.drain(..) {
        if frame.binds_all(qual) {
            ready.push(lower_scalar(qual, info, frame, Some(DataType::Bool))?);
        } else {
            rest.push(qual);
        }
    }
    *pending = rest;
    if !ready.is_empty() {
        ops.push(Op::Filter(FilterOp { quals: ready }));
    }
    Ok(())
}

/// Build the aggregation operator and the insert columns over its output
/// frame, which is the group columns followed by the aggregate values.
fn build_agg(
    info: &RuleInfo,
    frame: &Frame,
    state: Rc<RefCell<AggState>>,
) -> Result<(AggOp, Vec<Expr>), ProgramError> {
    let rule = &info.ast;
    let mut group = Vec::new();
    let mut aggs = Vec::new();
    // head column -> slot in the aggregation output frame
    let mut out_slots = Vec::with_capacity(rule.head.cols.len());
    let mut out_tys = Vec::with_capacity(rule.head.cols.len());

    for (i, col) in rule.head.cols.iter().enumerate() {
        let want = column_ty(&info.head_def, i)?;
        if let AstExpr::Agg { .. } = col {
            out_slots.push(None);
            out_tys.push(want);
        } else {
            out_slots.push(Some(group.len()));
            out_tys.push(want);
            group.push(lower_scalar(col, info, frame, Some(want))?);
        }
    }

    let group_len = group.len();
    let mut agg_index = 0usize;
    let mut cols = Vec::with_capacity(rule.head.cols.len());
    for (i, col) in rule.head.cols.iter().enumerate() {
        match (col, out_slots[i]) {
            (AstExpr::Agg { kind, var }, None) => {
                let input = match kind {
                    AggKind::Count => None,
                    _ => Some(lower_scalar(&AstExpr::Var(var.clone()), info, frame, None)?),
                };
                aggs.push(AggSpec { kind: *kind, input, out_ty: out_tys[i] });
                cols.push(Expr::outer_var(group_len + agg_index, out_tys[i]));
                agg_index += 1;
            }
            (_, Some(slot)) => {
                cols.push(Expr::outer_var(slot, out_tys[i]));
            }
            _ => {
                return Err(ProgramError::InvalidAggregate(format!(
                    "inconsistent aggregate layout in rule {}",
                    info.name
                )))
            }
        }
    }

    Ok((AggOp { group, aggs, state }, cols))
}
