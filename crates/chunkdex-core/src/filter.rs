//! Attribute filter expressions.
//!
//! Grammar (`and` binds tighter than `or`):
//!
//! ```text
//! expr    := and_expr (("or" | "||") and_expr)*
//! and_expr:= term (("and" | "&&") term)*
//! term    := "(" expr ")" | operand op operand | literal op identifier op literal
//! operand := identifier | integer | float | 'string' | "string"
//! op      := "=" | "==" | "!=" | "<" | "<=" | ">" | ">="
//! ```
//!
//! Each comparison must put exactly one attribute against one literal, on
//! either side. `1 <= chunkIdx <= 4` reads as two comparisons joined by
//! `and`. Expressions are resolved against a [`Schema`] when parsed, so
//! unknown attributes and type mismatches are rejected before any row is
//! evaluated.
//!
//! Connectives are kept flat (`a or b or c` is one node with three
//! children), so tree depth follows parenthesis nesting only. Nesting and
//! the number of comparisons are both capped.

use std::cmp::Ordering;
use std::fmt;

use crate::error::{ChunkdexError, Result};
use crate::types::{AttrType, AttrValue, Metadata, Schema};

/// Deepest parenthesis nesting a filter may use.
pub const MAX_FILTER_DEPTH: usize = 32;

/// Most comparisons a single filter may contain.
pub const MAX_FILTER_TERMS: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    /// Operator to use when the operands are swapped (`3 < x` is `x > 3`).
    fn mirrored(self) -> Self {
        match self {
            CmpOp::Lt => CmpOp::Gt,
            CmpOp::Le => CmpOp::Ge,
            CmpOp::Gt => CmpOp::Lt,
            CmpOp::Ge => CmpOp::Le,
            other => other,
        }
    }

    fn holds(self, ord: Ordering) -> bool {
        match self {
            CmpOp::Eq => ord == Ordering::Equal,
            CmpOp::Ne => ord != Ordering::Equal,
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::Le => ord != Ordering::Greater,
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::Ge => ord != Ordering::Less,
        }
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        };
        f.write_str(s)
    }
}

/// Typed expression tree.
#[derive(Clone, Debug, PartialEq)]
enum Expr {
    Cmp {
        field: String,
        op: CmpOp,
        value: AttrValue,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

impl Expr {
    fn eval(&self, row: &Metadata) -> bool {
        match self {
            Expr::Cmp { field, op, value } => row
                .get(field)
                .and_then(|stored| compare(stored, value))
                .map(|ord| op.holds(ord))
                .unwrap_or(false),
            Expr::And(terms) => terms.iter().all(|t| t.eval(row)),
            Expr::Or(terms) => terms.iter().any(|t| t.eval(row)),
        }
    }

    /// A single child stands for itself; more are joined by `combine`.
    fn join(mut terms: Vec<Expr>, combine: fn(Vec<Expr>) -> Expr) -> Expr {
        if terms.len() == 1 {
            terms.swap_remove(0)
        } else {
            combine(terms)
        }
    }
}

/// Order a stored value against a literal. Integers compare exactly with
/// integers; any other numeric pairing compares as `f64`.
fn compare(stored: &AttrValue, literal: &AttrValue) -> Option<Ordering> {
    match (stored, literal) {
        (AttrValue::Str(a), AttrValue::Str(b)) => Some(a.cmp(b)),
        (AttrValue::Int(a), AttrValue::Int(b)) => Some(a.cmp(b)),
        (a, b) => a.as_f64()?.partial_cmp(&b.as_f64()?),
    }
}

/// A parsed, schema-checked filter. An empty expression matches every row.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Filter {
    expr: Option<Expr>,
}

impl Filter {
    /// Filter that matches every row.
    pub fn all() -> Self {
        Self { expr: None }
    }

    /// Parse `input` and resolve it against `schema`.
    pub fn parse(input: &str, schema: &Schema) -> Result<Self> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Ok(Self::all());
        }

        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
            terms: 0,
            schema,
        };
        let expr = parser.parse_or()?;
        if let Some(tok) = parser.peek() {
            return Err(ChunkdexError::InvalidFilter(format!(
                "Unexpected {} after end of expression",
                tok
            )));
        }
        Ok(Self { expr: Some(expr) })
    }

    pub fn matches(&self, row: &Metadata) -> bool {
        self.expr.as_ref().map_or(true, |e| e.eval(row))
    }
}

// =============================================================================
// Lexer
// =============================================================================

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Literal(AttrValue),
    Op(CmpOp),
    And,
    Or,
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(name) => write!(f, "identifier '{}'", name),
            Token::Literal(AttrValue::Str(s)) => write!(f, "string '{}'", s),
            Token::Literal(AttrValue::Int(i)) => write!(f, "number {}", i),
            Token::Literal(AttrValue::Float(x)) => write!(f, "number {}", x),
            Token::Op(op) => write!(f, "operator '{}'", op),
            Token::And => f.write_str("'and'"),
            Token::Or => f.write_str("'or'"),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' => {
                i += if chars.get(i + 1) == Some(&'=') { 2 } else { 1 };
                tokens.push(Token::Op(CmpOp::Eq));
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CmpOp::Ne));
                i += 2;
            }
            '<' | '>' => {
                let eq = chars.get(i + 1) == Some(&'=');
                let op = match (c, eq) {
                    ('<', true) => CmpOp::Le,
                    ('<', false) => CmpOp::Lt,
                    ('>', true) => CmpOp::Ge,
                    _ => CmpOp::Gt,
                };
                tokens.push(Token::Op(op));
                i += if eq { 2 } else { 1 };
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == quote)
                    .map(|p| start + p)
                    .ok_or_else(|| {
                        ChunkdexError::InvalidFilter(format!(
                            "Unterminated string starting at offset {}",
                            i
                        ))
                    })?;
                let s: String = chars[start..end].iter().collect();
                tokens.push(Token::Literal(AttrValue::Str(s)));
                i = end + 1;
            }
            c if c.is_ascii_digit()
                || c == '.'
                || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit() || *n == '.')) =>
            {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_ascii_digit()
                        || chars[i] == '.'
                        || chars[i] == 'e'
                        || chars[i] == 'E'
                        || ((chars[i] == '-' || chars[i] == '+')
                            && matches!(chars[i - 1], 'e' | 'E')))
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(Token::Literal(parse_number(&text)?));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let token = match word.to_ascii_lowercase().as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    _ => Token::Ident(word),
                };
                tokens.push(token);
            }
            other => {
                return Err(ChunkdexError::InvalidFilter(format!(
                    "Unexpected character '{}' at offset {}",
                    other, i
                )));
            }
        }
    }

    Ok(tokens)
}

fn parse_number(text: &str) -> Result<AttrValue> {
    if let Ok(i) = text.parse::<i64>() {
        return Ok(AttrValue::Int(i));
    }
    match text.parse::<f64>() {
        Ok(f) if f.is_finite() => Ok(AttrValue::Float(f)),
        _ => Err(ChunkdexError::InvalidFilter(format!(
            "Invalid number '{}'",
            text
        ))),
    }
}

// =============================================================================
// Parser
// =============================================================================

struct Parser<'s> {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    terms: usize,
    schema: &'s Schema,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token> {
        let tok = self.tokens.get(self.pos).cloned().ok_or_else(|| {
            ChunkdexError::InvalidFilter("Unexpected end of expression".to_string())
        })?;
        self.pos += 1;
        Ok(tok)
    }

    fn next_op(&mut self) -> Result<CmpOp> {
        match self.next()? {
            Token::Op(op) => Ok(op),
            other => Err(ChunkdexError::InvalidFilter(format!(
                "Expected comparison operator, found {}",
                other
            ))),
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut terms = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            terms.push(self.parse_and()?);
        }
        Ok(Expr::join(terms, Expr::Or))
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut terms = vec![self.parse_term()?];
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            terms.push(self.parse_term()?);
        }
        Ok(Expr::join(terms, Expr::And))
    }

    fn parse_term(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::LParen) {
            if self.depth >= MAX_FILTER_DEPTH {
                return Err(ChunkdexError::InvalidFilter(format!(
                    "Parentheses nested deeper than {} levels",
                    MAX_FILTER_DEPTH
                )));
            }
            self.pos += 1;
            self.depth += 1;
            let inner = self.parse_or()?;
            self.depth -= 1;
            return match self.next()? {
                Token::RParen => Ok(inner),
                other => Err(ChunkdexError::InvalidFilter(format!(
                    "Expected ')', found {}",
                    other
                ))),
            };
        }

        let lhs = self.next()?;
        let op = self.next_op()?;
        let rhs = self.next()?;

        match (lhs, rhs) {
            (Token::Ident(field), Token::Literal(value)) => self.resolve(field, op, value),
            (Token::Literal(low), Token::Ident(field)) => {
                let lower = self.resolve(field.clone(), op.mirrored(), low)?;
                if !matches!(self.peek(), Some(Token::Op(_))) {
                    return Ok(lower);
                }
                let upper_op = self.next_op()?;
                let high = match self.next()? {
                    Token::Literal(value) => value,
                    other => {
                        return Err(ChunkdexError::InvalidFilter(format!(
                            "Expected literal to close range on '{}', found {}",
                            field, other
                        )));
                    }
                };
                let upper = self.resolve(field, upper_op, high)?;
                Ok(Expr::And(vec![lower, upper]))
            }
            (Token::Ident(a), Token::Ident(b)) => Err(ChunkdexError::InvalidFilter(format!(
                "Cannot compare attribute '{}' with attribute '{}'",
                a, b
            ))),
            (a, b) => Err(ChunkdexError::InvalidFilter(format!(
                "Comparison needs one attribute and one literal, found {} and {}",
                a, b
            ))),
        }
    }

    fn resolve(&mut self, field: String, op: CmpOp, value: AttrValue) -> Result<Expr> {
        self.terms += 1;
        if self.terms > MAX_FILTER_TERMS {
            return Err(ChunkdexError::InvalidFilter(format!(
                "Filter has more than {} comparisons",
                MAX_FILTER_TERMS
            )));
        }

        let spec = self.schema.field(&field).ok_or_else(|| {
            ChunkdexError::InvalidFilter(format!("Unknown attribute '{}'", field))
        })?;

        let compatible = match spec.ty {
            AttrType::String => matches!(value, AttrValue::Str(_)),
            AttrType::Int | AttrType::Float => !matches!(value, AttrValue::Str(_)),
        };
        if !compatible {
            return Err(ChunkdexError::InvalidFilter(format!(
                "Attribute '{}' is {} and cannot be compared with {}",
                field,
                spec.ty,
                value.attr_type()
            )));
        }

        Ok(Expr::Cmp { field, op, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldSpec;

    fn schema() -> Schema {
        Schema::new(vec![
            FieldSpec::required("chunkIdx", AttrType::Int),
            FieldSpec::required("start_time", AttrType::Float),
            FieldSpec::required("end_time", AttrType::Float),
            FieldSpec::optional("streamId", AttrType::String),
        ])
        .unwrap()
    }

    fn row(idx: i64, start: f64, end: f64) -> Metadata {
        let mut m = Metadata::new();
        m.insert("chunkIdx".into(), AttrValue::Int(idx));
        m.insert("start_time".into(), AttrValue::Float(start));
        m.insert("end_time".into(), AttrValue::Float(end));
        m
    }

    #[test]
    fn test_range_with_literal_on_left() {
        let f = Filter::parse("0 <= start_time and end_time <= 70", &schema()).unwrap();
        assert!(f.matches(&row(1, 0.0, 60.0)));
        assert!(f.matches(&row(1, 10.0, 70.0)));
        assert!(!f.matches(&row(2, 60.0, 120.0)));
        assert!(!f.matches(&row(0, -5.0, 10.0)));
    }

    #[test]
    fn test_integer_comparison() {
        let f = Filter::parse("chunkIdx > 1", &schema()).unwrap();
        assert!(!f.matches(&row(1, 0.0, 1.0)));
        assert!(f.matches(&row(2, 0.0, 1.0)));
    }

    #[test]
    fn test_int_attribute_with_float_literal() {
        let f = Filter::parse("chunkIdx >= 1.5", &schema()).unwrap();
        assert!(!f.matches(&row(1, 0.0, 1.0)));
        assert!(f.matches(&row(2, 0.0, 1.0)));
    }

    #[test]
    fn test_and_binds_tighter_than_or() {
        let f = Filter::parse("chunkIdx == 1 or chunkIdx == 2 and start_time > 100", &schema())
            .unwrap();
        assert!(f.matches(&row(1, 0.0, 1.0)));
        assert!(!f.matches(&row(2, 0.0, 1.0)));

        let grouped =
            Filter::parse("(chunkIdx == 1 or chunkIdx == 2) and start_time > 100", &schema())
                .unwrap();
        assert!(!grouped.matches(&row(1, 0.0, 1.0)));
    }

    #[test]
    fn test_symbolic_connectives_and_single_equals() {
        let f = Filter::parse("chunkIdx = 3 || chunkIdx != 3 && start_time < 0", &schema())
            .unwrap();
        assert!(f.matches(&row(3, 5.0, 6.0)));
        assert!(f.matches(&row(4, -1.0, 6.0)));
        assert!(!f.matches(&row(4, 1.0, 6.0)));
    }

    #[test]
    fn test_string_equality() {
        let f = Filter::parse("streamId == 'cam-1'", &schema()).unwrap();
        let mut m = row(1, 0.0, 1.0);
        assert!(!f.matches(&m), "missing optional attribute never matches");
        m.insert("streamId".into(), AttrValue::Str("cam-1".into()));
        assert!(f.matches(&m));
    }

    #[test]
    fn test_unknown_attribute_rejected() {
        let err = Filter::parse("bogus > 1", &schema()).unwrap_err();
        assert!(matches!(err, ChunkdexError::InvalidFilter(_)));
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn test_type_mismatch_rejected() {
        assert!(Filter::parse("streamId > 3", &schema()).is_err());
        assert!(Filter::parse("chunkIdx == 'one'", &schema()).is_err());
    }

    #[test]
    fn test_malformed_expressions_rejected() {
        let s = schema();
        for bad in [
            "chunkIdx >",
            "chunkIdx 1",
            "(chunkIdx > 1",
            "chunkIdx > 1)",
            "chunkIdx > 1 and",
            "1 < 2",
            "chunkIdx < start_time",
            "streamId == 'open",
            "chunkIdx # 1",
        ] {
            assert!(
                matches!(Filter::parse(bad, &s), Err(ChunkdexError::InvalidFilter(_))),
                "expected rejection for {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_empty_filter_matches_all() {
        let f = Filter::parse("   ", &schema()).unwrap();
        assert!(f.matches(&row(9, 9.0, 9.0)));
    }

    #[test]
    fn test_negative_and_exponent_literals() {
        let f = Filter::parse("start_time > -1.5e1", &schema()).unwrap();
        assert!(f.matches(&row(1, -10.0, 0.0)));
        assert!(!f.matches(&row(1, -20.0, 0.0)));
    }

    #[test]
    fn test_chained_range() {
        let f = Filter::parse("1 <= chunkIdx <= 2", &schema()).unwrap();
        assert!(!f.matches(&row(0, 0.0, 1.0)));
        assert!(f.matches(&row(1, 0.0, 1.0)));
        assert!(f.matches(&row(2, 0.0, 1.0)));
        assert!(!f.matches(&row(3, 0.0, 1.0)));

        let f = Filter::parse("0 < start_time < 60 and chunkIdx != 4", &schema()).unwrap();
        assert!(f.matches(&row(1, 30.0, 90.0)));
        assert!(!f.matches(&row(1, 60.0, 90.0)));
        assert!(!f.matches(&row(4, 30.0, 90.0)));
    }

    #[test]
    fn test_chained_range_malformed() {
        let s = schema();
        for bad in [
            "1 <= chunkIdx <=",
            "1 <= chunkIdx <= start_time",
            "1 <= chunkIdx <= 'two'",
            "chunkIdx >= 1 <= 2",
        ] {
            assert!(
                matches!(Filter::parse(bad, &s), Err(ChunkdexError::InvalidFilter(_))),
                "expected rejection for {:?}",
                bad
            );
        }
    }

    fn disjunction(terms: usize) -> String {
        (0..terms)
            .map(|i| format!("chunkIdx == {}", i))
            .collect::<Vec<_>>()
            .join(" or ")
    }

    #[test]
    fn test_long_disjunction() {
        let f = Filter::parse(&disjunction(MAX_FILTER_TERMS), &schema()).unwrap();
        assert!(f.matches(&row(0, 0.0, 1.0)));
        assert!(f.matches(&row(MAX_FILTER_TERMS as i64 - 1, 0.0, 1.0)));
        assert!(!f.matches(&row(MAX_FILTER_TERMS as i64, 0.0, 1.0)));
    }

    #[test]
    fn test_too_many_terms_rejected() {
        let err = Filter::parse(&disjunction(20_000), &schema()).unwrap_err();
        assert!(matches!(err, ChunkdexError::InvalidFilter(_)));
        assert!(err.to_string().contains("comparisons"));
    }

    #[test]
    fn test_nesting_limit() {
        let nested = |levels: usize| {
            format!(
                "{}chunkIdx == 1{}",
                "(".repeat(levels),
                ")".repeat(levels)
            )
        };

        let f = Filter::parse(&nested(MAX_FILTER_DEPTH), &schema()).unwrap();
        assert!(f.matches(&row(1, 0.0, 1.0)));

        for levels in [MAX_FILTER_DEPTH + 1, 100_000] {
            let err = Filter::parse(&nested(levels), &schema()).unwrap_err();
            assert!(matches!(err, ChunkdexError::InvalidFilter(_)));
            assert!(err.to_string().contains("nested"));
        }
    }

    #[test]
    fn test_keywords_case_insensitive() {
        let f = Filter::parse("chunkIdx == 1 OR chunkIdx == 2", &schema()).unwrap();
        assert!(f.matches(&row(2, 0.0, 0.0)));
    }
}
