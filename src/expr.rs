//! # Expression Evaluator
//!
//! Runtime expressions evaluate over a context holding the `(inner, outer)`
//! tuple pair of an operator chain: `inner` is the tuple currently driving
//! or being scanned, `outer` is the frame of variables bound so far. Types
//! are resolved at plan time and stored on each node; the evaluator performs
//! no coercion. Division or modulus by zero and integer overflow abort the
//! derivation being computed.

use crate::ast::OpKind;
use crate::error::EvalError;
use crate::value::{DataType, Datum};

/// Evaluation context: the inner/outer pair of the current chain position.
#[derive(Clone, Copy)]
pub struct EvalContext<'a> {
    pub inner: &'a [Datum],
    pub outer: &'a [Datum],
}

impl<'a> EvalContext<'a> {
    pub fn new(inner: &'a [Datum], outer: &'a [Datum]) -> EvalContext<'a> {
        EvalContext { inner, outer }
    }
}

/// A typed expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Embedded constant.
    Const(Datum),
    /// Read attribute `attno` from the inner or outer tuple.
    Var { attno: usize, is_outer: bool, ty: DataType },
    /// Unary minus.
    Neg { arg: Box<Expr>, ty: DataType },
    Op { kind: OpKind, lhs: Box<Expr>, rhs: Box<Expr>, ty: DataType },
}

impl Expr {
    /// Plan-time type of this node.
    pub fn ty(&self) -> DataType {
        match self {
            Expr::Const(d) => d.data_type(),
            Expr::Var { ty, .. } | Expr::Neg { ty, .. } | Expr::Op { ty, .. } => *ty,
        }
    }

    pub fn outer_var(attno: usize, ty: DataType) -> Expr {
        Expr::Var { attno, is_outer: true, ty }
    }

    pub fn inner_var(attno: usize, ty: DataType) -> Expr {
        Expr::Var { attno, is_outer: false, ty }
    }

    pub fn eval(&self, cx: &EvalContext<'_>) -> Result<Datum, EvalError> {
        match self {
            Expr::Const(d) => Ok(d.clone()),
            Expr::Var { attno, is_outer, .. } => {
                let tuple = if *is_outer { cx.outer } else { cx.inner };
                tuple.get(*attno).cloned().ok_or(EvalError::Type("attribute reference"))
            }
            Expr::Neg { arg, .. } => match arg.eval(cx)? {
                Datum::Int16(v) => {
                    v.checked_neg().map(Datum::Int16).ok_or(EvalError::Overflow("-"))
                }
                Datum::Int32(v) => {
                    v.checked_neg().map(Datum::Int32).ok_or(EvalError::Overflow("-"))
                }
                Datum::Int64(v) => {
                    v.checked_neg().map(Datum::Int64).ok_or(EvalError::Overflow("-"))
                }
                Datum::Float64(v) => Ok(Datum::Float64(-v)),
                _ => Err(EvalError::Type("unary minus")),
            },
            Expr::Op { kind, lhs, rhs, .. } => {
                let l = lhs.eval(cx)?;
                let r = rhs.eval(cx)?;
                if kind.is_comparison() {
                    compare(*kind, &l, &r)
                } else {
                    arith(*kind, &l, &r)
                }
            }
        }
    }
}

/// Arithmetic over two same-typed numeric datums. Also used by the
/// aggregation operator for its running sums.
pub fn arith(kind: OpKind, l: &Datum, r: &Datum) -> Result<Datum, EvalError> {
    match (l, r) {
        (Datum::Int16(a), Datum::Int16(b)) => int_arith(kind, i64::from(*a), i64::from(*b))
            .and_then(|v| {
                i16::try_from(v).map(Datum::Int16).map_err(|_| EvalError::Overflow(kind.as_str()))
            }),
        (Datum::Int32(a), Datum::Int32(b)) => int_arith(kind, i64::from(*a), i64::from(*b))
            .and_then(|v| {
                i32::try_from(v).map(Datum::Int32).map_err(|_| EvalError::Overflow(kind.as_str()))
            }),
        (Datum::Int64(a), Datum::Int64(b)) => int_arith(kind, *a, *b).map(Datum::Int64),
        (Datum::Float64(a), Datum::Float64(b)) => {
            let v = match kind {
                OpKind::Add => a + b,
                OpKind::Sub => a - b,
                OpKind::Mul => a * b,
                OpKind::Div => a / b,
                OpKind::Mod => a % b,
                _ => return Err(EvalError::Type("float arithmetic")),
            };
            Ok(Datum::Float64(v))
        }
        _ => Err(EvalError::Type("arithmetic")),
    }
}

fn int_arith(kind: OpKind, a: i64, b: i64) -> Result<i64, EvalError> {
    match kind {
        OpKind::Add => a.checked_add(b).ok_or(EvalError::Overflow("+")),
        OpKind::Sub => a.checked_sub(b).ok_or(EvalError::Overflow("-")),
        OpKind::Mul => a.checked_mul(b).ok_or(EvalError::Overflow("*")),
        OpKind::Div => {
            if b == 0 {
                Err(EvalError::DivisionByZero)
            } else {
                a.checked_div(b).ok_or(EvalError::Overflow("/"))
            }
        }
        OpKind::Mod => {
            if b == 0 {
                Err(EvalError::ModulusByZero)
            } else {
                a.checked_rem(b).ok_or(EvalError::Overflow("%"))
            }
        }
        _ => Err(EvalError::Type("integer arithmetic")),
    }
}

fn compare(kind: OpKind, l: &Datum, r: &Datum) -> Result<Datum, EvalError> {
    if l.data_type() != r.data_type() {
        return Err(EvalError::Type("comparison"));
    }
    let result = match kind {
        OpKind::Eq => l == r,
        OpKind::Neq => l != r,
        OpKind::Lt => l < r,
        OpKind::Lte => l <= r,
        OpKind::Gt => l > r,
        OpKind::Gte => l >= r,
        _ => return Err(EvalError::Type("comparison")),
    };
    Ok(Datum::Bool(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty() -> EvalContext<'static> {
        EvalContext { inner: &[], outer: &[] }
    }

    fn int(v: i32) -> Expr {
        Expr::Const(Datum::Int32(v))
    }

    fn op(kind: OpKind, lhs: Expr, rhs: Expr, ty: DataType) -> Expr {
        Expr::Op { kind, lhs: Box::new(lhs), rhs: Box::new(rhs), ty }
    }

    #[test]
    fn test_constant_eval() {
        let e = int(42);
        assert_eq!(e.eval(&empty()), Ok(Datum::Int32(42)));
    }

    #[test]
    fn test_variable_reads_inner_and_outer() {
        let inner = [Datum::Int32(1)];
        let outer = [Datum::Int32(2)];
        let cx = EvalContext::new(&inner, &outer);
        assert_eq!(Expr::inner_var(0, DataType::Int32).eval(&cx), Ok(Datum::Int32(1)));
        assert_eq!(Expr::outer_var(0, DataType::Int32).eval(&cx), Ok(Datum::Int32(2)));
    }

    #[test]
    fn test_arithmetic() {
        let e = op(OpKind::Add, int(2), op(OpKind::Mul, int(3), int(4), DataType::Int32), DataType::Int32);
        assert_eq!(e.eval(&empty()), Ok(Datum::Int32(14)));
    }

    #[test]
    fn test_division_by_zero() {
        let e = op(OpKind::Div, int(1), int(0), DataType::Int32);
        assert_eq!(e.eval(&empty()), Err(EvalError::DivisionByZero));
        let e = op(OpKind::Mod, int(1), int(0), DataType::Int32);
        assert_eq!(e.eval(&empty()), Err(EvalError::ModulusByZero));
    }

    #[test]
    fn test_integer_overflow() {
        let e = op(OpKind::Add, int(i32::MAX), int(1), DataType::Int32);
        assert_eq!(e.eval(&empty()), Err(EvalError::Overflow("+")));
    }

    #[test]
    fn test_unary_minus() {
        let e = Expr::Neg { arg: Box::new(int(5)), ty: DataType::Int32 };
        assert_eq!(e.eval(&empty()), Ok(Datum::Int32(-5)));
    }

    #[test]
    fn test_comparisons() {
        let cases = [
            (OpKind::Lt, true),
            (OpKind::Lte, true),
            (OpKind::Gt, false),
            (OpKind::Gte, false),
            (OpKind::Eq, false),
            (OpKind::Neq, true),
        ];
        for (kind, want) in cases {
            let e = op(kind, int(1), int(2), DataType::Bool);
            assert_eq!(e.eval(&empty()), Ok(Datum::Bool(want)), "{kind}");
        }
    }

    #[test]
    fn test_string_equality() {
        let e = op(
            OpKind::Eq,
            Expr::Const(Datum::string("a")),
            Expr::Const(Datum::string("a")),
            DataType::Bool,
        );
        assert_eq!(e.eval(&empty()), Ok(Datum::Bool(true)));
    }

    #[test]
    fn test_float_division_is_ieee() {
        let e = op(
            OpKind::Div,
            Expr::Const(Datum::Float64(1.0)),
            Expr::Const(Datum::Float64(0.0)),
            DataType::Float64,
        );
        assert_eq!(e.eval(&empty()), Ok(Datum::Float64(f64::INFINITY)));
    }
}
