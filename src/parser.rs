//! # Program Parser
//!
//! Lexes and parses rule-program source into the AST. Statements are
//! terminated by `;`:
//!
//! ```text
//! define link(int, int);
//! define durable audit(string, int) keys(0);
//! path(X, Y) :- link(X, Y);
//! path(X, Z) :- link(X, Y), path(Y, Z);
//! lonely(X) :- node(X), not link(X, _);
//! total(sum<P>) :- price(_, P);
//! delete alert(X) :- clear#insert(X);
//! ```
//!
//! `//` starts a line comment. A `@` before a type (in a `define`) or a
//! column argument marks the location specifier.

use crate::ast::*;
use crate::error::ProgramError;

/// Parse a whole program.
pub fn parse_program(source: &str) -> Result<AstProgram, ProgramError> {
    let tokens = lex(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let mut program = AstProgram::default();

    while !parser.at_end() {
        parser.statement(&mut program)?;
    }
    Ok(program)
}

// === Lexer ===

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    CharLit(char),
    LParen,
    RParen,
    Comma,
    Semi,
    ColonDash,
    At,
    Hash,
    Underscore,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Lt,
    Lte,
    Gt,
    Gte,
    EqEq,
    Neq,
}

impl Tok {
    fn describe(&self) -> String {
        match self {
            Tok::Ident(s) => format!("identifier '{s}'"),
            Tok::Int(v) => format!("integer {v}"),
            Tok::Float(v) => format!("number {v}"),
            Tok::Str(_) => "string literal".to_string(),
            Tok::CharLit(_) => "char literal".to_string(),
            other => format!("'{}'", token_text(other)),
        }
    }
}

fn token_text(t: &Tok) -> &'static str {
    match t {
        Tok::LParen => "(",
        Tok::RParen => ")",
        Tok::Comma => ",",
        Tok::Semi => ";",
        Tok::ColonDash => ":-",
        Tok::At => "@",
        Tok::Hash => "#",
        Tok::Underscore => "_",
        Tok::Plus => "+",
        Tok::Minus => "-",
        Tok::Star => "*",
        Tok::Slash => "/",
        Tok::Percent => "%",
        Tok::Lt => "<",
        Tok::Lte => "<=",
        Tok::Gt => ">",
        Tok::Gte => ">=",
        Tok::EqEq => "==",
        Tok::Neq => "<>",
        _ => "?",
    }
}

struct Spanned {
    tok: Tok,
    line: usize,
}

fn lex_error(line: usize, msg: impl Into<String>) -> ProgramError {
    ProgramError::Parse(format!("line {line}: {}", msg.into()))
}

fn lex(source: &str) -> Result<Vec<Spanned>, ProgramError> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    let mut line = 1;

    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                line += 1;
                chars.next();
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            '/' => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    for c in chars.by_ref() {
                        if c == '\n' {
                            line += 1;
                            break;
                        }
                    }
                } else {
                    tokens.push(Spanned { tok: Tok::Slash, line });
                }
            }
            '(' | ')' | ',' | ';' | '@' | '#' | '+' | '-' | '*' | '%' => {
                chars.next();
                let tok = match c {
                    '(' => Tok::LParen,
                    ')' => Tok::RParen,
                    ',' => Tok::Comma,
                    ';' => Tok::Semi,
                    '@' => Tok::At,
                    '#' => Tok::Hash,
                    '+' => Tok::Plus,
                    '-' => Tok::Minus,
                    '*' => Tok::Star,
                    _ => Tok::Percent,
                };
                tokens.push(Spanned { tok, line });
            }
            ':' => {
                chars.next();
                if chars.peek() == Some(&'-') {
                    chars.next();
                    tokens.push(Spanned { tok: Tok::ColonDash, line });
                } else {
                    return Err(lex_error(line, "expected '-' after ':'"));
                }
            }
            '<' => {
                chars.next();
                let tok = match chars.peek() {
                    Some('=') => {
                        chars.next();
                        Tok::Lte
                    }
                    Some('>') => {
                        chars.next();
                        Tok::Neq
                    }
                    _ => Tok::Lt,
                };
                tokens.push(Spanned { tok, line });
            }
            '>' => {
                chars.next();
                let tok = if chars.peek() == Some(&'=') {
                    chars.next();
                    Tok::Gte
                } else {
                    Tok::Gt
                };
                tokens.push(Spanned { tok, line });
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                }
                tokens.push(Spanned { tok: Tok::EqEq, line });
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Spanned { tok: Tok::Neq, line });
                } else {
                    return Err(lex_error(line, "expected '=' after '!'"));
                }
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some('\\') => s.push('\\'),
                            Some('"') => s.push('"'),
                            Some(other) => {
                                return Err(lex_error(line, format!("bad escape '\\{other}'")))
                            }
                            None => return Err(lex_error(line, "unterminated string")),
                        },
                        Some('\n') | None => return Err(lex_error(line, "unterminated string")),
                        Some(other) => s.push(other),
                    }
                }
                tokens.push(Spanned { tok: Tok::Str(s), line });
            }
            '\'' => {
                chars.next();
                let c = chars.next().ok_or_else(|| lex_error(line, "unterminated char"))?;
                let c = if c == '\\' {
                    match chars.next() {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('\\') => '\\',
                        Some('\'') => '\'',
                        _ => return Err(lex_error(line, "bad char escape")),
                    }
                } else {
                    c
                };
                if chars.next() != Some('\'') {
                    return Err(lex_error(line, "unterminated char"));
                }
                tokens.push(Spanned { tok: Tok::CharLit(c), line });
            }
            c if c.is_ascii_digit() => {
                let mut text = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        text.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let tok = if text.contains('.') {
                    Tok::Float(
                        text.parse()
                            .map_err(|_| lex_error(line, format!("bad number '{text}'")))?,
                    )
                } else {
                    Tok::Int(
                        text.parse()
                            .map_err(|_| lex_error(line, format!("bad integer '{text}'")))?,
                    )
                };
                tokens.push(Spanned { tok, line });
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut text = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_alphanumeric() || d == '_' {
                        text.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let tok = if text == "_" { Tok::Underscore } else { Tok::Ident(text) };
                tokens.push(Spanned { tok, line });
            }
            other => return Err(lex_error(line, format!("unexpected character '{other}'"))),
        }
    }

    Ok(tokens)
}

// === Parser ===

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos.min(self.tokens.len().saturating_sub(1)))
            .map_or(0, |s| s.line)
    }

    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|s| &s.tok)
    }

    fn peek_at(&self, n: usize) -> Option<&Tok> {
        self.tokens.get(self.pos + n).map(|s| &s.tok)
    }

    fn next(&mut self) -> Result<Tok, ProgramError> {
        let spanned = self
            .tokens
            .get(self.pos)
            .ok_or_else(|| ProgramError::Parse("unexpected end of input".to_string()))?;
        self.pos += 1;
        Ok(spanned.tok.clone())
    }

    fn error(&self, msg: impl Into<String>) -> ProgramError {
        lex_error(self.line(), msg)
    }

    fn expect(&mut self, want: &Tok) -> Result<(), ProgramError> {
        let line = self.line();
        let got = self.next()?;
        if got == *want {
            Ok(())
        } else {
            Err(lex_error(line, format!("expected {}, found {}", want.describe(), got.describe())))
        }
    }

    fn eat(&mut self, want: &Tok) -> bool {
        if self.peek() == Some(want) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn ident(&mut self) -> Result<String, ProgramError> {
        let line = self.line();
        match self.next()? {
            Tok::Ident(s) => Ok(s),
            other => Err(lex_error(line, format!("expected identifier, found {}", other.describe()))),
        }
    }

    fn statement(&mut self, program: &mut AstProgram) -> Result<(), ProgramError> {
        if self.peek() == Some(&Tok::Ident("define".to_string())) {
            let define = self.define()?;
            program.defines.push(define);
        } else {
            self.clause(program)?;
        }
        Ok(())
    }

    fn define(&mut self) -> Result<AstDefine, ProgramError> {
        self.expect(&Tok::Ident("define".to_string()))?;
        let mut storage = AstStorageKind::Memory;
        let mut name = self.ident()?;
        if name == "durable" {
            storage = AstStorageKind::Durable;
            name = self.ident()?;
        }

        self.expect(&Tok::LParen)?;
        let mut schema = Vec::new();
        loop {
            let is_loc_spec = self.eat(&Tok::At);
            let type_name = self.ident()?;
            schema.push(AstSchemaElt { type_name, is_loc_spec });
            if !self.eat(&Tok::Comma) {
                break;
            }
        }
        self.expect(&Tok::RParen)?;

        let keys = if self.peek() == Some(&Tok::Ident("keys".to_string())) {
            self.pos += 1;
            self.expect(&Tok::LParen)?;
            let mut cols = Vec::new();
            loop {
                let line = self.line();
                match self.next()? {
                    Tok::Int(v) if v >= 0 => cols.push(v as usize),
                    other => {
                        return Err(lex_error(
                            line,
                            format!("expected column index, found {}", other.describe()),
                        ))
                    }
                }
                if !self.eat(&Tok::Comma) {
                    break;
                }
            }
            self.expect(&Tok::RParen)?;
            Some(cols)
        } else {
            None
        };

        self.expect(&Tok::Semi)?;
        Ok(AstDefine { name, storage, schema, keys })
    }

    /// A fact or a rule: `head;` or `[delete] head :- body;`.
    fn clause(&mut self, program: &mut AstProgram) -> Result<(), ProgramError> {
        let is_delete = self.eat(&Tok::Ident("delete".to_string()));
        let (head, head_loc_marker) = self.table_ref(true)?;

        if self.eat(&Tok::Semi) {
            if is_delete {
                return Err(self.error("a bare fact cannot be a delete rule"));
            }
            program.facts.push(AstFact { head });
            return Ok(());
        }

        self.expect(&Tok::ColonDash)?;
        let mut joins = Vec::new();
        let mut quals = Vec::new();
        loop {
            self.body_conjunct(&mut joins, &mut quals)?;
            if !self.eat(&Tok::Comma) {
                break;
            }
        }
        self.expect(&Tok::Semi)?;

        program.rules.push(AstRule { head, head_loc_marker, joins, quals, is_delete });
        Ok(())
    }

    fn body_conjunct(
        &mut self,
        joins: &mut Vec<AstJoinClause>,
        quals: &mut Vec<AstExpr>,
    ) -> Result<(), ProgramError> {
        let negated = self.peek() == Some(&Tok::Ident("not".to_string()));
        if negated {
            self.pos += 1;
        }

        // An identifier followed by `(` or `#` is an atom; anything else is
        // a qualifier expression.
        let is_atom = matches!(self.peek(), Some(Tok::Ident(_)))
            && matches!(self.peek_at(1), Some(Tok::LParen | Tok::Hash));
        if negated && !is_atom {
            return Err(self.error("'not' must be followed by an atom"));
        }

        if is_atom {
            let name = self.ident()?;
            let hash_variant = if self.eat(&Tok::Hash) {
                match self.ident()?.as_str() {
                    "insert" => AstHashVariant::Insert,
                    "delete" => AstHashVariant::Delete,
                    other => {
                        return Err(self.error(format!("unknown event marker '#{other}'")))
                    }
                }
            } else {
                AstHashVariant::None
            };
            let (target, loc_marker) = self.table_ref_named(name, false)?;
            joins.push(AstJoinClause { target, negated, hash_variant, loc_marker });
        } else {
            quals.push(self.expr()?);
        }
        Ok(())
    }

    fn table_ref(&mut self, allow_agg: bool) -> Result<(AstTableRef, Option<usize>), ProgramError> {
        let name = self.ident()?;
        self.table_ref_named(name, allow_agg)
    }

    fn table_ref_named(
        &mut self,
        name: String,
        allow_agg: bool,
    ) -> Result<(AstTableRef, Option<usize>), ProgramError> {
        self.expect(&Tok::LParen)?;
        let mut cols = Vec::new();
        let mut loc_marker = None;
        loop {
            if self.eat(&Tok::At) {
                if loc_marker.is_some() {
                    return Err(self.error("more than one location marker in one atom"));
                }
                loc_marker = Some(cols.len());
            }
            cols.push(self.column(allow_agg)?);
            if !self.eat(&Tok::Comma) {
                break;
            }
        }
        self.expect(&Tok::RParen)?;
        Ok((AstTableRef { name, cols }, loc_marker))
    }

    /// One column argument; aggregates (`sum<V>`) only where allowed.
    fn column(&mut self, allow_agg: bool) -> Result<AstExpr, ProgramError> {
        if allow_agg {
            let agg_kind = match (self.peek(), self.peek_at(1), self.peek_at(2), self.peek_at(3)) {
                (Some(Tok::Ident(name)), Some(Tok::Lt), Some(Tok::Ident(_)), Some(Tok::Gt)) => {
                    AggKind::parse(name)
                }
                _ => None,
            };
            if let Some(kind) = agg_kind {
                self.pos += 2;
                let var = self.ident()?;
                self.expect(&Tok::Gt)?;
                return Ok(AstExpr::Agg { kind, var });
            }
        }
        self.expr()
    }

    fn expr(&mut self) -> Result<AstExpr, ProgramError> {
        let lhs = self.additive()?;
        let kind = match self.peek() {
            Some(Tok::Lt) => OpKind::Lt,
            Some(Tok::Lte) => OpKind::Lte,
            Some(Tok::Gt) => OpKind::Gt,
            Some(Tok::Gte) => OpKind::Gte,
            Some(Tok::EqEq) => OpKind::Eq,
            Some(Tok::Neq) => OpKind::Neq,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.additive()?;
        Ok(AstExpr::Op { kind, lhs: Box::new(lhs), rhs: Box::new(rhs) })
    }

    fn additive(&mut self) -> Result<AstExpr, ProgramError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let kind = match self.peek() {
                Some(Tok::Plus) => OpKind::Add,
                Some(Tok::Minus) => OpKind::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.multiplicative()?;
            lhs = AstExpr::Op { kind, lhs: Box::new(lhs), rhs: Box::new(rhs) };
        }
    }

    fn multiplicative(&mut self) -> Result<AstExpr, ProgramError> {
        let mut lhs = self.unary()?;
        loop {
            let kind = match self.peek() {
                Some(Tok::Star) => OpKind::Mul,
                Some(Tok::Slash) => OpKind::Div,
                Some(Tok::Percent) => OpKind::Mod,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = AstExpr::Op { kind, lhs: Box::new(lhs), rhs: Box::new(rhs) };
        }
    }

    fn unary(&mut self) -> Result<AstExpr, ProgramError> {
        if self.eat(&Tok::Minus) {
            return Ok(AstExpr::Neg(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<AstExpr, ProgramError> {
        let line = self.line();
        let expr = match self.next()? {
            Tok::Int(v) => AstExpr::Const(AstConst::Int(v)),
            Tok::Float(v) => AstExpr::Const(AstConst::Float(v)),
            Tok::Str(s) => AstExpr::Const(AstConst::String(s)),
            Tok::CharLit(c) => AstExpr::Const(AstConst::Char(c)),
            Tok::Underscore => AstExpr::Placeholder,
            Tok::Ident(name) => {
                if name == "true" {
                    AstExpr::Const(AstConst::Bool(true))
                } else if name == "false" {
                    AstExpr::Const(AstConst::Bool(false))
                } else {
                    AstExpr::Var(name)
                }
            }
            Tok::LParen => {
                let inner = self.expr()?;
                self.expect(&Tok::RParen)?;
                return Ok(inner);
            }
            other => {
                return Err(lex_error(
                    line,
                    format!("expected expression, found {}", other.describe()),
                ))
            }
        };
        Ok(expr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_define() {
        let program = parse_program("define link(int, int);").expect("parses");
        assert_eq!(program.defines.len(), 1);
        let d = &program.defines[0];
        assert_eq!(d.name, "link");
        assert_eq!(d.schema.len(), 2);
        assert_eq!(d.storage, AstStorageKind::Memory);
        assert!(d.keys.is_none());
    }

    #[test]
    fn test_parse_define_durable_with_keys() {
        let program =
            parse_program("define durable audit(string, int8) keys(0);").expect("parses");
        let d = &program.defines[0];
        assert_eq!(d.name, "audit");
        assert_eq!(d.storage, AstStorageKind::Durable);
        assert_eq!(d.keys, Some(vec![0]));
    }

    #[test]
    fn test_parse_define_with_loc_spec() {
        let program = parse_program("define msg(@string, int);").expect("parses");
        let d = &program.defines[0];
        assert!(d.schema[0].is_loc_spec);
        assert!(!d.schema[1].is_loc_spec);
    }

    #[test]
    fn test_parse_fact() {
        let program = parse_program("link(1, 2);").expect("parses");
        assert_eq!(program.facts.len(), 1);
        let f = &program.facts[0];
        assert_eq!(f.head.name, "link");
        assert_eq!(f.head.cols[0], AstExpr::Const(AstConst::Int(1)));
    }

    #[test]
    fn test_parse_rule() {
        let program = parse_program("path(X, Z) :- link(X, Y), path(Y, Z);").expect("parses");
        assert_eq!(program.rules.len(), 1);
        let r = &program.rules[0];
        assert_eq!(r.head.name, "path");
        assert_eq!(r.joins.len(), 2);
        assert!(!r.is_delete);
        assert!(r.quals.is_empty());
    }

    #[test]
    fn test_parse_negation_and_qualifier() {
        let program =
            parse_program("t(X) :- r(X), not s(X), X < 10;").expect("parses");
        let r = &program.rules[0];
        assert_eq!(r.joins.len(), 2);
        assert!(r.joins[1].negated);
        assert_eq!(r.quals.len(), 1);
        match &r.quals[0] {
            AstExpr::Op { kind, .. } => assert_eq!(*kind, OpKind::Lt),
            other => panic!("expected comparison, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_delete_rule_and_event() {
        let program = parse_program("delete alert(X) :- clear#insert(X);").expect("parses");
        let r = &program.rules[0];
        assert!(r.is_delete);
        assert_eq!(r.joins[0].hash_variant, AstHashVariant::Insert);
    }

    #[test]
    fn test_parse_aggregate_head() {
        let program = parse_program("total(sum<P>) :- price(_, P);").expect("parses");
        let r = &program.rules[0];
        match &r.head.cols[0] {
            AstExpr::Agg { kind, var } => {
                assert_eq!(*kind, AggKind::Sum);
                assert_eq!(var, "P");
            }
            other => panic!("expected aggregate, got {other:?}"),
        }
        assert_eq!(r.joins[0].target.cols[0], AstExpr::Placeholder);
    }

    #[test]
    fn test_parse_arithmetic_head() {
        let program = parse_program("next(X + 1) :- counter(X);").expect("parses");
        let r = &program.rules[0];
        assert!(matches!(&r.head.cols[0], AstExpr::Op { kind: OpKind::Add, .. }));
    }

    #[test]
    fn test_parse_comments_and_whitespace() {
        let src = "// graph edges\ndefine link(int, int); // two columns\nlink(1, 2);\n";
        let program = parse_program(src).expect("parses");
        assert_eq!(program.defines.len(), 1);
        assert_eq!(program.facts.len(), 1);
    }

    #[test]
    fn test_parse_string_and_negative_literals() {
        let program = parse_program("price(\"apple\", -3);").expect("parses");
        let f = &program.facts[0];
        assert_eq!(f.head.cols[0], AstExpr::Const(AstConst::String("apple".into())));
        assert!(matches!(&f.head.cols[1], AstExpr::Neg(_)));
    }

    #[test]
    fn test_parse_error_reports_line() {
        let err = parse_program("define link(int int);").expect_err("missing comma");
        let msg = err.to_string();
        assert!(msg.contains("line 1"), "got: {msg}");
    }

    #[test]
    fn test_missing_semicolon() {
        assert!(parse_program("define link(int, int)").is_err());
    }
}
