//! # Abstract Syntax Tree
//!
//! AST types for rule programs. A program is a list of `define` statements,
//! ground facts, and rules; a rule body is a list of join clauses (positive,
//! negated, or event-marked) plus qualifier expressions. The parser builds
//! these; the analyzer validates them against the catalog.

use std::collections::HashSet;
use std::fmt;

/// A parsed program, with statements divided by kind.
#[derive(Debug, Clone, Default)]
pub struct AstProgram {
    pub defines: Vec<AstDefine>,
    pub facts: Vec<AstFact>,
    pub rules: Vec<AstRule>,
}

/// Storage selector on a `define`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AstStorageKind {
    Memory,
    Durable,
}

/// One column in a `define`: a type name, optionally marked `@` as the
/// location specifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AstSchemaElt {
    pub type_name: String,
    pub is_loc_spec: bool,
}

/// `define [durable] name(type, ...) [keys(i, ...)];`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AstDefine {
    pub name: String,
    pub storage: AstStorageKind,
    pub schema: Vec<AstSchemaElt>,
    /// Key column positions; `None` means every column is a key.
    pub keys: Option<Vec<usize>>,
}

/// A ground atom asserted as a base fact.
#[derive(Debug, Clone, PartialEq)]
pub struct AstFact {
    pub head: AstTableRef,
}

/// Event marker on a body join clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AstHashVariant {
    None,
    Insert,
    Delete,
}

/// A reference to a table with column expressions bound to its columns.
#[derive(Debug, Clone, PartialEq)]
pub struct AstTableRef {
    pub name: String,
    pub cols: Vec<AstExpr>,
}

impl AstTableRef {
    pub fn arity(&self) -> usize {
        self.cols.len()
    }

    /// All variables referenced by the column expressions.
    pub fn variables(&self) -> HashSet<String> {
        let mut vars = HashSet::new();
        for col in &self.cols {
            col.collect_variables(&mut vars);
        }
        vars
    }
}

/// One join clause in a rule body.
#[derive(Debug, Clone, PartialEq)]
pub struct AstJoinClause {
    pub target: AstTableRef,
    pub negated: bool,
    pub hash_variant: AstHashVariant,
    /// Position of a `@`-marked column argument, if any.
    pub loc_marker: Option<usize>,
}

/// `head :- body;`, optionally `delete head :- body;`.
#[derive(Debug, Clone, PartialEq)]
pub struct AstRule {
    pub head: AstTableRef,
    pub head_loc_marker: Option<usize>,
    pub joins: Vec<AstJoinClause>,
    pub quals: Vec<AstExpr>,
    pub is_delete: bool,
}

impl AstRule {
    /// Variables bound by positive, non-negated join clauses.
    pub fn positive_variables(&self) -> HashSet<String> {
        let mut vars = HashSet::new();
        for join in &self.joins {
            if !join.negated {
                vars.extend(join.target.variables());
            }
        }
        vars
    }

    pub fn has_aggregates(&self) -> bool {
        self.head.cols.iter().any(|c| matches!(c, AstExpr::Agg { .. }))
    }
}

/// Binary and unary operator kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
    Neq,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Add => "+",
            OpKind::Sub => "-",
            OpKind::Mul => "*",
            OpKind::Div => "/",
            OpKind::Mod => "%",
            OpKind::Lt => "<",
            OpKind::Lte => "<=",
            OpKind::Gt => ">",
            OpKind::Gte => ">=",
            OpKind::Eq => "==",
            OpKind::Neq => "<>",
        }
    }

    /// True for operators that yield a bool.
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            OpKind::Lt | OpKind::Lte | OpKind::Gt | OpKind::Gte | OpKind::Eq | OpKind::Neq
        )
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate functions allowed in rule heads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggKind {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

impl AggKind {
    pub fn parse(s: &str) -> Option<AggKind> {
        match s {
            "count" => Some(AggKind::Count),
            "sum" => Some(AggKind::Sum),
            "min" => Some(AggKind::Min),
            "max" => Some(AggKind::Max),
            "avg" => Some(AggKind::Avg),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AggKind::Count => "count",
            AggKind::Sum => "sum",
            AggKind::Min => "min",
            AggKind::Max => "max",
            AggKind::Avg => "avg",
        }
    }
}

/// Literal constants as written in the source.
#[derive(Debug, Clone, PartialEq)]
pub enum AstConst {
    Bool(bool),
    Char(char),
    Int(i64),
    Float(f64),
    String(String),
}

/// Expression tree for column bindings and qualifiers.
#[derive(Debug, Clone, PartialEq)]
pub enum AstExpr {
    Const(AstConst),
    Var(String),
    /// `_` in a table reference; matches anything, binds nothing.
    Placeholder,
    Op {
        kind: OpKind,
        lhs: Box<AstExpr>,
        rhs: Box<AstExpr>,
    },
    Neg(Box<AstExpr>),
    /// Aggregate column in a rule head: `sum<V>`.
    Agg { kind: AggKind, var: String },
}

impl AstExpr {
    pub fn is_variable(&self) -> bool {
        matches!(self, AstExpr::Var(_))
    }

    pub fn is_const(&self) -> bool {
        matches!(self, AstExpr::Const(_))
    }

    pub fn as_variable(&self) -> Option<&str> {
        match self {
            AstExpr::Var(name) => Some(name),
            _ => None,
        }
    }

    /// All variables referenced by this expression.
    pub fn variables(&self) -> HashSet<String> {
        let mut vars = HashSet::new();
        self.collect_variables(&mut vars);
        vars
    }

    pub(crate) fn collect_variables(&self, vars: &mut HashSet<String>) {
        match self {
            AstExpr::Var(name) => {
                vars.insert(name.clone());
            }
            AstExpr::Op { lhs, rhs, .. } => {
                lhs.collect_variables(vars);
                rhs.collect_variables(vars);
            }
            AstExpr::Neg(inner) => inner.collect_variables(vars),
            AstExpr::Agg { var, .. } => {
                vars.insert(var.clone());
            }
            AstExpr::Const(_) | AstExpr::Placeholder => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(name: &str) -> AstExpr {
        AstExpr::Var(name.to_string())
    }

    #[test]
    fn test_agg_kind_parse() {
        assert_eq!(AggKind::parse("count"), Some(AggKind::Count));
        assert_eq!(AggKind::parse("sum"), Some(AggKind::Sum));
        assert_eq!(AggKind::parse("median"), None);
    }

    #[test]
    fn test_expr_variables() {
        let e = AstExpr::Op {
            kind: OpKind::Add,
            lhs: Box::new(var("x")),
            rhs: Box::new(AstExpr::Op {
                kind: OpKind::Mul,
                lhs: Box::new(var("y")),
                rhs: Box::new(AstExpr::Const(AstConst::Int(2))),
            }),
        };
        let vars = e.variables();
        assert!(vars.contains("x"));
        assert!(vars.contains("y"));
        assert_eq!(vars.len(), 2);
    }

    #[test]
    fn test_positive_variables_exclude_negated() {
        let rule = AstRule {
            head: AstTableRef { name: "t".into(), cols: vec![var("x")] },
            head_loc_marker: None,
            joins: vec![
                AstJoinClause {
                    target: AstTableRef { name: "r".into(), cols: vec![var("x")] },
                    negated: false,
                    hash_variant: AstHashVariant::None,
                    loc_marker: None,
                },
                AstJoinClause {
                    target: AstTableRef { name: "s".into(), cols: vec![var("y")] },
                    negated: true,
                    hash_variant: AstHashVariant::None,
                    loc_marker: None,
                },
            ],
            quals: vec![],
            is_delete: false,
        };
        let vars = rule.positive_variables();
        assert!(vars.contains("x"));
        assert!(!vars.contains("y"));
    }
}
