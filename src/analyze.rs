//! # Parse Analysis
//!
//! Validates a parsed program against the catalog and produces the typed
//! form the planner compiles: resolved table definitions, folded fact
//! values, per-rule variable types, and the dependency edges used for the
//! stratification check. Rejection is atomic; an analyzed program touches
//! no engine state until the router commits it.

use crate::ast::*;
use crate::catalog::{Catalog, StorageKind, TableDef, TableDefRef};
use crate::error::ProgramError;
use crate::tuple::Schema;
use crate::value::{DataType, Datum};
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

/// One dependency edge: `head` is derived from `body`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepEdge {
    pub head: String,
    pub body: String,
    pub negated: bool,
}

/// A validated base fact.
#[derive(Debug, Clone)]
pub struct FactSpec {
    pub table: String,
    pub values: Vec<Datum>,
}

/// A validated rule plus everything the planner needs.
#[derive(Debug, Clone)]
pub struct RuleInfo {
    pub name: String,
    pub ast: AstRule,
    pub head_def: TableDefRef,
    pub join_defs: Vec<TableDefRef>,
    pub var_types: HashMap<String, DataType>,
}

/// Output of analysis, ready to commit.
#[derive(Debug)]
pub struct AnalyzedProgram {
    pub defines: Vec<TableDefRef>,
    pub facts: Vec<FactSpec>,
    pub rules: Vec<RuleInfo>,
    pub edges: Vec<DepEdge>,
}

/// Analyze `ast` against the already-installed catalog and rule dependency
/// edges.
pub fn analyze(
    ast: &AstProgram,
    catalog: &Catalog,
    existing_edges: &[DepEdge],
) -> Result<AnalyzedProgram, ProgramError> {
    let mut defines = Vec::new();
    let mut new_defs: HashMap<String, TableDefRef> = HashMap::new();

    for d in &ast.defines {
        let def = lower_define(d)?;
        if catalog.contains(&def.name) || new_defs.contains_key(&def.name) {
            return Err(ProgramError::DuplicateTable(def.name.clone()));
        }
        new_defs.insert(def.name.clone(), Rc::clone(&def));
        defines.push(def);
    }

    let resolve = |name: &str| -> Result<TableDefRef, ProgramError> {
        catalog
            .get(name)
            .cloned()
            .or_else(|| new_defs.get(name).cloned())
            .ok_or_else(|| ProgramError::UnknownTable(name.to_string()))
    };

    let mut facts = Vec::new();
    for fact in &ast.facts {
        facts.push(lower_fact(fact, &resolve)?);
    }

    let mut rules = Vec::new();
    let mut edges = Vec::new();
    for (i, rule) in ast.rules.iter().enumerate() {
        let info = check_rule(rule, i, &resolve)?;
        for join in &info.ast.joins {
            edges.push(DepEdge {
                head: info.head_def.name.clone(),
                body: join.target.name.clone(),
                negated: join.negated,
            });
        }
        rules.push(info);
    }

    check_stratified(existing_edges, &edges)?;

    Ok(AnalyzedProgram { defines, facts, rules, edges })
}

/// Fold a constant expression to a datum of the wanted type.
pub(crate) fn fold_const(expr: &AstExpr, want: DataType) -> Result<Datum, ProgramError> {
    match expr {
        AstExpr::Const(c) => lower_literal(c, want),
        // Negate literals before narrowing so that type minimums fold.
        AstExpr::Neg(inner) => match inner.as_ref() {
            AstExpr::Const(AstConst::Int(v)) => lower_literal(&AstConst::Int(-v), want),
            AstExpr::Const(AstConst::Float(v)) => lower_literal(&AstConst::Float(-v), want),
            other => Err(ProgramError::TypeMismatch(format!(
                "cannot negate {other:?} in a constant position"
            ))),
        },
        other => Err(ProgramError::TypeMismatch(format!(
            "expected a constant, found {other:?}"
        ))),
    }
}

fn lower_literal(c: &AstConst, want: DataType) -> Result<Datum, ProgramError> {
    let mismatch = |got: &str| {
        Err(ProgramError::TypeMismatch(format!("{got} literal for a {want} column")))
    };
    match c {
        AstConst::Bool(v) => {
            if want == DataType::Bool {
                Ok(Datum::Bool(*v))
            } else {
                mismatch("bool")
            }
        }
        AstConst::Char(v) => {
            if want == DataType::Char {
                Ok(Datum::Char(*v))
            } else {
                mismatch("char")
            }
        }
        AstConst::Int(v) => match want {
            DataType::Int16 => i16::try_from(*v).map(Datum::Int16).map_err(|_| {
                ProgramError::TypeMismatch(format!("{v} does not fit an int2 column"))
            }),
            DataType::Int32 => i32::try_from(*v).map(Datum::Int32).map_err(|_| {
                ProgramError::TypeMismatch(format!("{v} does not fit an int4 column"))
            }),
            DataType::Int64 => Ok(Datum::Int64(*v)),
            DataType::Float64 => Ok(Datum::Float64(*v as f64)),
            _ => mismatch("integer"),
        },
        AstConst::Float(v) => {
            if want == DataType::Float64 {
                Ok(Datum::Float64(*v))
            } else {
                mismatch("float")
            }
        }
        AstConst::String(v) => {
            if want == DataType::String {
                Ok(Datum::string(v))
            } else {
                mismatch("string")
            }
        }
    }
}

fn lower_define(d: &AstDefine) -> Result<TableDefRef, ProgramError> {
    let mut types = Vec::with_capacity(d.schema.len());
    let mut loc_col = None;
    for (i, elt) in d.schema.iter().enumerate() {
        let ty = DataType::parse(&elt.type_name)
            .ok_or_else(|| ProgramError::UnknownType(elt.type_name.clone()))?;
        if elt.is_loc_spec {
            if loc_col.is_some() {
                return Err(ProgramError::InvalidLocSpec(format!(
                    "table {} marks more than one location column",
                    d.name
                )));
            }
            if ty != DataType::String {
                return Err(ProgramError::InvalidLocSpec(format!(
                    "location column of {} must be a string address",
                    d.name
                )));
            }
            loc_col = Some(i);
        }
        types.push(ty);
    }

    if let Some(keys) = &d.keys {
        for &k in keys {
            if k >= types.len() {
                return Err(ProgramError::TypeMismatch(format!(
                    "key column {k} out of range for table {}",
                    d.name
                )));
            }
        }
    }

    let storage = match d.storage {
        AstStorageKind::Memory => StorageKind::Memory,
        AstStorageKind::Durable => StorageKind::Durable,
    };
    let schema = Rc::new(Schema::new(types, d.keys.clone(), loc_col));
    Ok(TableDef::new(d.name.clone(), schema, storage))
}

fn lower_fact(
    fact: &AstFact,
    resolve: &impl Fn(&str) -> Result<TableDefRef, ProgramError>,
) -> Result<FactSpec, ProgramError> {
    let def = resolve(&fact.head.name)?;
    if fact.head.arity() != def.arity() {
        return Err(ProgramError::ArityMismatch {
            table: def.name.clone(),
            expected: def.arity(),
            got: fact.head.arity(),
        });
    }
    let mut values = Vec::with_capacity(def.arity());
    for (i, col) in fact.head.cols.iter().enumerate() {
        let want = def.schema.column_type(i).ok_or_else(|| {
            ProgramError::TypeMismatch(format!("column {i} out of range in {}", def.name))
        })?;
        values.push(fold_const(col, want)?);
    }
    Ok(FactSpec { table: def.name.clone(), values })
}

/// Body atom arguments are variables, constants, or placeholders.
fn check_atom_arg(expr: &AstExpr, table: &str) -> Result<(), ProgramError> {
    match expr {
        AstExpr::Var(_) | AstExpr::Placeholder | AstExpr::Const(_) => Ok(()),
        AstExpr::Neg(inner) if inner.is_const() => Ok(()),
        AstExpr::Agg { .. } => Err(ProgramError::InvalidAggregate(format!(
            "aggregate in a body atom of {table}"
        ))),
        other => Err(ProgramError::TypeMismatch(format!(
            "body atom of {table} takes variables and constants, found {other:?}"
        ))),
    }
}

fn check_loc_marker(
    marker: Option<usize>,
    def: &TableDef,
    context: &str,
) -> Result<(), ProgramError> {
    if let Some(p) = marker {
        if def.schema.loc_column() != Some(p) {
            return Err(ProgramError::InvalidLocSpec(format!(
                "@ marker on column {p} of {context}, but the location column of {} is {:?}",
                def.name,
                def.schema.loc_column()
            )));
        }
    }
    Ok(())
}

fn check_rule(
    rule: &AstRule,
    index: usize,
    resolve: &impl Fn(&str) -> Result<TableDefRef, ProgramError>,
) -> Result<RuleInfo, ProgramError> {
    let head_def = resolve(&rule.head.name)?;
    let name = format!("{}#{}", head_def.name, index);

    if rule.head.arity() != head_def.arity() {
        return Err(ProgramError::ArityMismatch {
            table: head_def.name.clone(),
            expected: head_def.arity(),
            got: rule.head.arity(),
        });
    }
    check_loc_marker(rule.head_loc_marker, &head_def, "the rule head")?;

    if rule.joins.is_empty() {
        return Err(ProgramError::UnsafeRule(format!("rule {name} has an empty body")));
    }
    if !rule.joins.iter().any(|j| !j.negated) {
        return Err(ProgramError::UnsafeRule(format!(
            "rule {name} has no positive body atom"
        )));
    }

    // Resolve body atoms and type every variable at its binding positions.
    let mut join_defs = Vec::with_capacity(rule.joins.len());
    let mut var_types: HashMap<String, DataType> = HashMap::new();
    for join in &rule.joins {
        let def = resolve(&join.target.name)?;
        if join.target.arity() != def.arity() {
            return Err(ProgramError::ArityMismatch {
                table: def.name.clone(),
                expected: def.arity(),
                got: join.target.arity(),
            });
        }
        check_loc_marker(join.loc_marker, &def, "a body atom")?;
        if join.negated && join.hash_variant != AstHashVariant::None {
            return Err(ProgramError::UnsafeRule(format!(
                "rule {name}: a negated atom cannot carry an event marker"
            )));
        }
        for (i, arg) in join.target.cols.iter().enumerate() {
            check_atom_arg(arg, &def.name)?;
            if let AstExpr::Var(v) = arg {
                let ty = def.schema.column_type(i).ok_or_else(|| {
                    ProgramError::TypeMismatch(format!("column {i} out of range in {}", def.name))
                })?;
                match var_types.get(v) {
                    None => {
                        var_types.insert(v.clone(), ty);
                    }
                    Some(&prev) if prev == ty => {}
                    Some(&prev) => {
                        return Err(ProgramError::TypeMismatch(format!(
                            "variable {v} is bound as both {prev} and {ty} in rule {name}"
                        )));
                    }
                }
            }
        }
        join_defs.push(def);
    }

    // Range restriction: everything must be bound by a positive atom.
    let positive_vars = rule.positive_variables();
    for join in rule.joins.iter().filter(|j| j.negated) {
        for v in join.target.variables() {
            if !positive_vars.contains(&v) {
                return Err(ProgramError::UnsafeRule(format!(
                    "variable {v} of a negated atom in rule {name} is not bound by a positive atom"
                )));
            }
        }
    }
    for qual in &rule.quals {
        for v in qual.variables() {
            if !positive_vars.contains(&v) {
                return Err(ProgramError::UnsafeRule(format!(
                    "qualifier variable {v} in rule {name} is not bound by a positive atom"
                )));
            }
        }
        let ty = type_of(qual, &var_types, Some(DataType::Bool), &name)?;
        if ty != DataType::Bool {
            return Err(ProgramError::TypeMismatch(format!(
                "qualifier in rule {name} is {ty}, not bool"
            )));
        }
    }

    // Head columns: aggregates or expressions over bound variables.
    for (i, col) in rule.head.cols.iter().enumerate() {
        let want = head_def.schema.column_type(i).ok_or_else(|| {
            ProgramError::TypeMismatch(format!("column {i} out of range in {}", head_def.name))
        })?;
        match col {
            AstExpr::Agg { kind, var } => {
                let input_ty = *var_types.get(var).ok_or_else(|| {
                    ProgramError::InvalidAggregate(format!(
                        "aggregate over unbound variable {var} in rule {name}"
                    ))
                })?;
                if !positive_vars.contains(var) {
                    return Err(ProgramError::UnsafeRule(format!(
                        "aggregate variable {var} in rule {name} is not bound by a positive atom"
                    )));
                }
                check_aggregate(*kind, input_ty, want, &name)?;
            }
            AstExpr::Placeholder => {
                return Err(ProgramError::UnsafeRule(format!(
                    "placeholder in the head of rule {name}"
                )));
            }
            other => {
                for v in other.variables() {
                    if !positive_vars.contains(&v) {
                        return Err(ProgramError::UnsafeRule(format!(
                            "head variable {v} in rule {name} is not bound by a positive atom"
                        )));
                    }
                }
                let ty = type_of(other, &var_types, Some(want), &name)?;
                if ty != want {
                    return Err(ProgramError::TypeMismatch(format!(
                        "head column {i} of rule {name} is {ty}, but {} declares {want}",
                        head_def.name
                    )));
                }
            }
        }
    }

    Ok(RuleInfo { name, ast: rule.clone(), head_def, join_defs, var_types })
}

fn check_aggregate(
    kind: AggKind,
    input_ty: DataType,
    out_ty: DataType,
    rule: &str,
) -> Result<(), ProgramError> {
    let ok = match kind {
        AggKind::Count => out_ty.is_integer(),
        AggKind::Sum => input_ty.is_numeric() && out_ty == input_ty,
        AggKind::Min | AggKind::Max => out_ty == input_ty,
        AggKind::Avg => input_ty.is_numeric() && out_ty == DataType::Float64,
    };
    if ok {
        Ok(())
    } else {
        Err(ProgramError::InvalidAggregate(format!(
            "{}<{input_ty}> cannot produce a {out_ty} column in rule {rule}",
            kind.as_str()
        )))
    }
}

pub(crate) fn is_literal(expr: &AstExpr) -> bool {
    match expr {
        AstExpr::Const(_) => true,
        AstExpr::Neg(inner) => is_literal(inner),
        _ => false,
    }
}

/// Plan-time type inference. `want` pushes an expected type down to integer
/// literals, which otherwise default to int4.
pub(crate) fn type_of(
    expr: &AstExpr,
    var_types: &HashMap<String, DataType>,
    want: Option<DataType>,
    rule: &str,
) -> Result<DataType, ProgramError> {
    match expr {
        AstExpr::Const(c) => {
            let ty = match c {
                AstConst::Bool(_) => DataType::Bool,
                AstConst::Char(_) => DataType::Char,
                AstConst::Float(_) => DataType::Float64,
                AstConst::String(_) => DataType::String,
                AstConst::Int(_) => match want {
                    Some(w) if w.is_integer() || w == DataType::Float64 => w,
                    _ => DataType::Int32,
                },
            };
            if let Some(w) = want {
                if w != ty {
                    return Err(ProgramError::TypeMismatch(format!(
                        "{ty} constant where {w} is needed in rule {rule}"
                    )));
                }
            }
            Ok(ty)
        }
        AstExpr::Var(v) => {
            let ty = *var_types.get(v).ok_or_else(|| {
                ProgramError::UnsafeRule(format!("unbound variable {v} in rule {rule}"))
            })?;
            if let Some(w) = want {
                if w != ty {
                    return Err(ProgramError::TypeMismatch(format!(
                        "variable {v} is {ty} where {w} is needed in rule {rule}"
                    )));
                }
            }
            Ok(ty)
        }
        AstExpr::Neg(inner) => {
            let ty = type_of(inner, var_types, want, rule)?;
            if !ty.is_numeric() {
                return Err(ProgramError::TypeMismatch(format!(
                    "unary minus over a {ty} in rule {rule}"
                )));
            }
            Ok(ty)
        }
        AstExpr::Op { kind, lhs, rhs } => {
            // Type the variable-bearing side first so bare literals adopt
            // its type.
            let (lt, rt) = if is_literal(lhs) && !is_literal(rhs) {
                let rt = type_of(rhs, var_types, None, rule)?;
                (type_of(lhs, var_types, Some(rt), rule)?, rt)
            } else {
                let lt = type_of(lhs, var_types, None, rule)?;
                (lt, type_of(rhs, var_types, Some(lt), rule)?)
            };
            if lt != rt {
                return Err(ProgramError::TypeMismatch(format!(
                    "operands of {kind} are {lt} and {rt} in rule {rule}"
                )));
            }
            if kind.is_comparison() {
                Ok(DataType::Bool)
            } else {
                if !lt.is_numeric() {
                    return Err(ProgramError::TypeMismatch(format!(
                        "arithmetic {kind} over a {lt} in rule {rule}"
                    )));
                }
                if let Some(w) = want {
                    if w != lt {
                        return Err(ProgramError::TypeMismatch(format!(
                            "{kind} yields {lt} where {w} is needed in rule {rule}"
                        )));
                    }
                }
                Ok(lt)
            }
        }
        AstExpr::Placeholder => Err(ProgramError::TypeMismatch(format!(
            "placeholder outside a table reference in rule {rule}"
        ))),
        AstExpr::Agg { .. } => Err(ProgramError::InvalidAggregate(format!(
            "aggregate outside a rule head in rule {rule}"
        ))),
    }
}

/// Reject programs where a negation participates in a dependency cycle.
fn check_stratified(existing: &[DepEdge], new: &[DepEdge]) -> Result<(), ProgramError> {
    let all: Vec<&DepEdge> = existing.iter().chain(new).collect();
    let mut deps: HashMap<&str, Vec<&str>> = HashMap::new();
    for e in &all {
        deps.entry(e.head.as_str()).or_default().push(e.body.as_str());
    }

    for e in all.iter().filter(|e| e.negated) {
        // A cycle through this negative edge exists iff its body can reach
        // its head along dependency edges.
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(e.body.as_str());
        while let Some(node) = queue.pop_front() {
            if node == e.head {
                return Err(ProgramError::Unstratifiable(format!(
                    "{} is derived through its own negation of {}",
                    e.head, e.body
                )));
            }
            if seen.insert(node) {
                if let Some(nexts) = deps.get(node) {
                    queue.extend(nexts.iter().copied());
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_program;

    fn analyze_src(src: &str) -> Result<AnalyzedProgram, ProgramError> {
        let ast = parse_program(src).expect("parses");
        analyze(&ast, &Catalog::new(), &[])
    }

    #[test]
    fn test_analyze_closure_program() {
        let out = analyze_src(
            "define link(int, int); define path(int, int);\n\
             path(X, Y) :- link(X, Y);\n\
             path(X, Z) :- link(X, Y), path(Y, Z);\n\
             link(1, 2);",
        )
        .expect("valid program");
        assert_eq!(out.defines.len(), 2);
        assert_eq!(out.rules.len(), 2);
        assert_eq!(out.facts.len(), 1);
        assert_eq!(out.facts[0].values, vec![Datum::Int32(1), Datum::Int32(2)]);
        assert_eq!(out.rules[1].var_types["Y"], DataType::Int32);
    }

    #[test]
    fn test_unknown_table_rejected() {
        let err = analyze_src("path(X, Y) :- link(X, Y);").expect_err("unknown tables");
        assert!(matches!(err, ProgramError::UnknownTable(_)));
    }

    #[test]
    fn test_arity_mismatch_rejected() {
        let err = analyze_src("define link(int, int); link(1);").expect_err("arity");
        assert!(matches!(err, ProgramError::ArityMismatch { expected: 2, got: 1, .. }));
    }

    #[test]
    fn test_fact_type_mismatch_rejected() {
        let err = analyze_src("define named(string); named(42);").expect_err("type");
        assert!(matches!(err, ProgramError::TypeMismatch(_)));
    }

    #[test]
    fn test_duplicate_define_rejected() {
        let err =
            analyze_src("define t(int); define t(int);").expect_err("duplicate");
        assert!(matches!(err, ProgramError::DuplicateTable(_)));
    }

    #[test]
    fn test_unsafe_head_variable_rejected() {
        let err = analyze_src("define r(int); define t(int); t(Y) :- r(X);")
            .expect_err("unbound head var");
        assert!(matches!(err, ProgramError::UnsafeRule(_)));
    }

    #[test]
    fn test_unsafe_negated_variable_rejected() {
        let err = analyze_src(
            "define r(int); define s(int); define t(int); t(X) :- r(X), not s(Y);",
        )
        .expect_err("unbound negated var");
        assert!(matches!(err, ProgramError::UnsafeRule(_)));
    }

    #[test]
    fn test_variable_type_conflict_rejected() {
        let err = analyze_src(
            "define a(int); define b(string); define t(int); t(X) :- a(X), b(X);",
        )
        .expect_err("conflicting types");
        assert!(matches!(err, ProgramError::TypeMismatch(_)));
    }

    #[test]
    fn test_negation_cycle_rejected() {
        let err = analyze_src(
            "define a(int); define b(int);\n\
             a(X) :- b(X);\n\
             b(X) :- a(X), not b(X);",
        )
        .expect_err("negation cycle");
        assert!(matches!(err, ProgramError::Unstratifiable(_)));
    }

    #[test]
    fn test_stratified_negation_accepted() {
        analyze_src(
            "define r(int); define s(int); define t(int);\n\
             t(X) :- r(X), not s(X);",
        )
        .expect("stratified program");
    }

    #[test]
    fn test_aggregate_typing() {
        analyze_src("define price(string, int); define total(int); total(sum<P>) :- price(_, P);")
            .expect("sum over int into int");

        let err = analyze_src(
            "define price(string, int); define total(string); total(sum<P>) :- price(_, P);",
        )
        .expect_err("sum into string");
        assert!(matches!(err, ProgramError::InvalidAggregate(_)));
    }

    #[test]
    fn test_avg_requires_double_output() {
        analyze_src("define m(int); define a(double); a(avg<V>) :- m(V);")
            .expect("avg into double");
        let err = analyze_src("define m(int); define a(int); a(avg<V>) :- m(V);")
            .expect_err("avg into int");
        assert!(matches!(err, ProgramError::InvalidAggregate(_)));
    }

    #[test]
    fn test_qualifier_must_be_bool() {
        let err = analyze_src("define r(int); define t(int); t(X) :- r(X), X + 1;")
            .expect_err("non-bool qualifier");
        assert!(matches!(err, ProgramError::TypeMismatch(_)));
    }

    #[test]
    fn test_loc_marker_must_match_schema() {
        analyze_src("define msg(@string, int); define src(string, int); msg(@A, V) :- src(A, V);")
            .expect("marker on the loc column");
        let err = analyze_src(
            "define msg(@string, int); define src(string, int); msg(A, @V) :- src(A, V);",
        )
        .expect_err("marker on the wrong column");
        assert!(matches!(err, ProgramError::InvalidLocSpec(_)));
    }

    #[test]
    fn test_event_marker_on_negated_atom_rejected() {
        let err = analyze_src(
            "define r(int); define t(int); t(X) :- r(X), not r#insert(X);",
        )
        .expect_err("negated event atom");
        assert!(matches!(err, ProgramError::UnsafeRule(_)));
    }
}
