//! Compiles predicate and order-by strings into evaluators.
//!
//! Free identifiers become positional parameters: `compile` collects them in
//! first-use order, and [`Expression::evaluate`] looks each one up in the
//! record once per call before running the closure tree.

use super::lexer::{Lexer, Spanned, Token};
use super::value::QValue;
use crate::error::{Result, SpyError};
use regex::RegexBuilder;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Flat record an expression is evaluated against.
pub trait Lookup {
    /// Value of `key`, or [`QValue::Undefined`].
    fn lookup(&self, key: &str) -> QValue;
}

impl Lookup for HashMap<String, QValue> {
    fn lookup(&self, key: &str) -> QValue {
        self.get(key).cloned().unwrap_or_default()
    }
}

impl Lookup for BTreeMap<String, QValue> {
    fn lookup(&self, key: &str) -> QValue {
        self.get(key).cloned().unwrap_or_default()
    }
}

type Eval = Box<dyn Fn(&[QValue]) -> QValue + Send + Sync>;

/// A compiled predicate.
pub struct Expression {
    source: String,
    keys: Vec<String>,
    eval: Eval,
}

impl Expression {
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Free identifiers, in first-use order.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn evaluate(&self, record: &dyn Lookup) -> QValue {
        let args: Vec<QValue> = self.keys.iter().map(|key| record.lookup(key)).collect();
        (self.eval)(&args)
    }

    /// Evaluates and coerces to a boolean.
    pub fn test(&self, record: &dyn Lookup) -> bool {
        self.evaluate(record).truthy()
    }
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expression")
            .field("source", &self.source)
            .field("keys", &self.keys)
            .finish()
    }
}

/// Compiles a predicate such as `tag('people') && nextCount > 2`.
///
/// `===` and `!==` compare loosely, like `==` and `!=`.
pub fn compile(expression: &str) -> Result<Expression> {
    let tokens = Lexer::new(expression).tokenize()?;
    let mut parser = Parser {
        source: expression,
        tokens,
        position: 0,
        keys: Vec::new(),
        depth: 0,
    };

    if parser.peek() == &Token::Eof {
        return Err(SpyError::expression(expression, 0, "empty expression"));
    }
    let eval = parser.ternary()?;
    parser.expect(Token::Eof, "end of expression")?;

    Ok(Expression {
        source: expression.to_string(),
        keys: parser.keys,
        eval,
    })
}

/// Sort key and direction parsed from `"<key>[ asc|desc]"`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderBy {
    pub key: String,
    pub descending: bool,
}

impl OrderBy {
    pub fn extract(&self, record: &dyn Lookup) -> QValue {
        record.lookup(&self.key)
    }

    /// Three-way comparison of two records. Values that cannot be compared
    /// are treated as equal.
    pub fn compare(&self, a: &dyn Lookup, b: &dyn Lookup) -> Ordering {
        self.compare_values(&self.extract(a), &self.extract(b))
    }

    pub fn compare_values(&self, a: &QValue, b: &QValue) -> Ordering {
        let ordering = a.compare(b).unwrap_or(Ordering::Equal);
        if self.descending {
            ordering.reverse()
        } else {
            ordering
        }
    }
}

/// Parses an order-by clause. The direction defaults to ascending.
pub fn compile_order_by(spec: &str) -> Result<OrderBy> {
    let mut words = spec.split_whitespace();
    let Some(key) = words.next() else {
        return Err(SpyError::expression(spec, 0, "empty order-by"));
    };
    if !key.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(SpyError::expression(spec, 0, format!("invalid order-by key `{key}`")));
    }

    let descending = match words.next().map(str::to_ascii_lowercase).as_deref() {
        None | Some("asc") => false,
        Some("desc") => true,
        Some(other) => {
            let position = spec.find(other).unwrap_or(0);
            return Err(SpyError::expression(
                spec,
                position,
                format!("invalid order-by direction `{other}`"),
            ));
        }
    };
    if let Some(extra) = words.next() {
        let position = spec.rfind(extra).unwrap_or(0);
        return Err(SpyError::expression(spec, position, "unexpected trailing input"));
    }

    Ok(OrderBy {
        key: key.to_string(),
        descending,
    })
}

#[derive(Clone, Copy)]
enum Binary {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl Binary {
    fn from_token(token: &Token) -> Option<(Self, u8)> {
        let op = match token {
            Token::Or => (Binary::Or, 1),
            Token::And => (Binary::And, 2),
            Token::Eq => (Binary::Eq, 3),
            Token::Ne => (Binary::Ne, 3),
            Token::Lt => (Binary::Lt, 4),
            Token::Le => (Binary::Le, 4),
            Token::Gt => (Binary::Gt, 4),
            Token::Ge => (Binary::Ge, 4),
            Token::Plus => (Binary::Add, 5),
            Token::Minus => (Binary::Sub, 5),
            Token::Star => (Binary::Mul, 6),
            Token::Slash => (Binary::Div, 6),
            Token::Percent => (Binary::Rem, 6),
            _ => return None,
        };
        Some(op)
    }

    fn combine(self, left: Eval, right: Eval) -> Eval {
        match self {
            Binary::Or => Box::new(move |args| {
                let value = left(args);
                if value.truthy() {
                    value
                } else {
                    right(args)
                }
            }),
            Binary::And => Box::new(move |args| {
                let value = left(args);
                if value.truthy() {
                    right(args)
                } else {
                    value
                }
            }),
            Binary::Add => Box::new(move |args| {
                let (a, b) = (left(args), right(args));
                match (&a, &b) {
                    (QValue::Str(_), _) | (_, QValue::Str(_)) => QValue::Str(format!("{a}{b}")),
                    _ => QValue::Number(a.to_number() + b.to_number()),
                }
            }),
            op => Box::new(move |args| op.apply(&left(args), &right(args))),
        }
    }

    fn apply(self, a: &QValue, b: &QValue) -> QValue {
        let relation = |accept: fn(Ordering) -> bool| QValue::Bool(a.compare(b).is_some_and(accept));
        match self {
            Binary::Eq => QValue::Bool(a.loose_eq(b)),
            Binary::Ne => QValue::Bool(!a.loose_eq(b)),
            Binary::Lt => relation(Ordering::is_lt),
            Binary::Le => relation(Ordering::is_le),
            Binary::Gt => relation(Ordering::is_gt),
            Binary::Ge => relation(Ordering::is_ge),
            Binary::Sub => QValue::Number(a.to_number() - b.to_number()),
            Binary::Mul => QValue::Number(a.to_number() * b.to_number()),
            Binary::Div => QValue::Number(a.to_number() / b.to_number()),
            Binary::Rem => QValue::Number(a.to_number() % b.to_number()),
            Binary::Or | Binary::And | Binary::Add => QValue::Undefined,
        }
    }
}

/// Deepest expression tree `compile` accepts. Groups, unary operators,
/// ternaries, calls and chained binary operators each add a level.
pub const MAX_NESTING: usize = 256;

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Spanned>,
    position: usize,
    keys: Vec<String>,
    depth: usize,
}

impl Parser<'_> {
    fn peek(&self) -> &Token {
        self.tokens
            .get(self.position)
            .map_or(&Token::Eof, |spanned| &spanned.token)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.position)
            .map_or(self.source.len(), |spanned| spanned.position)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        self.position += 1;
        token
    }

    fn error(&self, message: impl Into<String>) -> SpyError {
        SpyError::expression(self.source, self.offset(), message)
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<()> {
        if self.peek() == &expected {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!("expected {what}, found {:?}", self.peek())))
        }
    }

    /// Enters one level of the expression tree. Errors abort the whole
    /// parse, so levels are only released on success.
    fn nest(&mut self) -> Result<()> {
        if self.depth >= MAX_NESTING {
            return Err(self.error("expression nested too deeply"));
        }
        self.depth += 1;
        Ok(())
    }

    fn ternary(&mut self) -> Result<Eval> {
        self.nest()?;
        let condition = self.binary(1)?;
        if self.peek() != &Token::Question {
            self.depth -= 1;
            return Ok(condition);
        }
        self.advance();
        let then = self.ternary()?;
        self.expect(Token::Colon, "`:`")?;
        let otherwise = self.ternary()?;
        self.depth -= 1;
        Ok(Box::new(move |args| {
            if condition(args).truthy() {
                then(args)
            } else {
                otherwise(args)
            }
        }))
    }

    fn binary(&mut self, min_precedence: u8) -> Result<Eval> {
        let mut left = self.unary()?;
        let mut chained = 0;
        while let Some((op, precedence)) = Binary::from_token(self.peek()) {
            if precedence < min_precedence {
                break;
            }
            self.nest()?;
            chained += 1;
            self.advance();
            let right = self.binary(precedence + 1)?;
            left = op.combine(left, right);
        }
        self.depth -= chained;
        Ok(left)
    }

    fn unary(&mut self) -> Result<Eval> {
        let eval: Eval = match self.peek() {
            Token::Not => {
                self.advance();
                self.nest()?;
                let operand = self.unary()?;
                Box::new(move |args| QValue::Bool(!operand(args).truthy()))
            }
            Token::Minus => {
                self.advance();
                self.nest()?;
                let operand = self.unary()?;
                Box::new(move |args| QValue::Number(-operand(args).to_number()))
            }
            Token::Plus => {
                self.advance();
                self.nest()?;
                let operand = self.unary()?;
                Box::new(move |args| QValue::Number(operand(args).to_number()))
            }
            _ => return self.call(),
        };
        self.depth -= 1;
        Ok(eval)
    }

    fn call(&mut self) -> Result<Eval> {
        let mut callee = self.primary()?;
        let mut chained = 0;
        while self.peek() == &Token::LParen {
            self.nest()?;
            chained += 1;
            self.advance();
            let mut arguments = Vec::new();
            if self.peek() != &Token::RParen {
                loop {
                    arguments.push(self.ternary()?);
                    if self.peek() != &Token::Comma {
                        break;
                    }
                    self.advance();
                }
            }
            self.expect(Token::RParen, "`)`")?;

            let function = callee;
            callee = Box::new(move |args| match function(args) {
                QValue::Function(f) => {
                    let values: Vec<QValue> = arguments.iter().map(|a| a(args)).collect();
                    f(&values)
                }
                _ => QValue::Undefined,
            });
        }
        self.depth -= chained;
        Ok(callee)
    }

    fn primary(&mut self) -> Result<Eval> {
        let offset = self.offset();
        match self.advance() {
            Token::Number(n) => Ok(constant(QValue::Number(n))),
            Token::Str(s) => Ok(constant(QValue::Str(s))),
            Token::Regex { pattern, flags } => {
                let regex = build_regex(&pattern, &flags)
                    .map_err(|message| SpyError::expression(self.source, offset, message))?;
                Ok(constant(QValue::Regex(Arc::new(regex))))
            }
            Token::Ident(name) => Ok(match name.as_str() {
                "true" => constant(QValue::Bool(true)),
                "false" => constant(QValue::Bool(false)),
                "null" => constant(QValue::Null),
                "undefined" => constant(QValue::Undefined),
                _ => {
                    let index = self.bind(name);
                    Box::new(move |args| args.get(index).cloned().unwrap_or_default())
                }
            }),
            Token::LParen => {
                let inner = self.ternary()?;
                self.expect(Token::RParen, "`)`")?;
                Ok(inner)
            }
            Token::Eof => Err(SpyError::expression(self.source, offset, "unexpected end of expression")),
            other => Err(SpyError::expression(
                self.source,
                offset,
                format!("unexpected token {other:?}"),
            )),
        }
    }

    fn bind(&mut self, name: String) -> usize {
        match self.keys.iter().position(|key| *key == name) {
            Some(index) => index,
            None => {
                self.keys.push(name);
                self.keys.len() - 1
            }
        }
    }
}

fn constant(value: QValue) -> Eval {
    Box::new(move |_| value.clone())
}

fn build_regex(pattern: &str, flags: &str) -> std::result::Result<regex::Regex, String> {
    let mut builder = RegexBuilder::new(pattern);
    for flag in flags.chars() {
        match flag {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'x' => builder.ignore_whitespace(true),
            'g' | 'u' | 'y' => &mut builder,
            other => return Err(format!("unsupported regex flag `{other}`")),
        };
    }
    builder.build().map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(fields: &[(&str, QValue)]) -> HashMap<String, QValue> {
        fields
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn test_free_identifiers_become_keys() {
        let expression = compile("nextCount > 2 && complete || nextCount == 0").unwrap();
        assert_eq!(expression.keys(), ["nextCount", "complete"]);

        let busy = record(&[("nextCount", 3.0.into()), ("complete", true.into())]);
        let idle = record(&[("nextCount", 0.0.into())]);
        let open = record(&[("nextCount", 3.0.into()), ("complete", false.into())]);
        assert!(expression.test(&busy));
        assert!(expression.test(&idle));
        assert!(!expression.test(&open));
    }

    #[test]
    fn test_loose_equality_across_types() {
        let expression = compile("observableId === '42'").unwrap();
        assert!(expression.test(&record(&[("observableId", 42.0.into())])));
        assert!(!expression.test(&record(&[("observableId", 43.0.into())])));
    }

    #[test]
    fn test_arithmetic_ternary_and_precedence() {
        let expression = compile("1 + 2 * 3 == 7 ? 'yes' : 'no'").unwrap();
        assert_eq!(expression.evaluate(&HashMap::<String, QValue>::new()).as_str(), Some("yes"));

        let expression = compile("!(depth > 1) && -depth < 0").unwrap();
        assert!(expression.test(&record(&[("depth", 1.0.into())])));
    }

    #[test]
    fn test_calls_functions_in_the_record() {
        let expression = compile("tag(/^peo/i) && !tag('x')").unwrap();
        let tag = QValue::function(|args: &[QValue]| match args.first() {
            Some(QValue::Regex(regex)) => QValue::Bool(regex.is_match("People")),
            Some(QValue::Str(s)) => QValue::Bool(s == "People"),
            _ => QValue::Bool(true),
        });
        assert!(expression.test(&record(&[("tag", tag)])));
        assert!(!expression.test(&HashMap::<String, QValue>::new()));
    }

    #[test]
    fn test_malformed_expressions_fail() {
        for bad in ["", "a &&", "(a", "a b", "tag(/[/)", "a = 1", "x ? 1"] {
            let error = compile(bad).unwrap_err();
            assert!(error.is_expression(), "{bad}: {error}");
        }
    }

    #[test]
    fn test_deep_nesting_is_an_error() {
        let deep = [
            format!("{}1{}", "(".repeat(200_000), ")".repeat(200_000)),
            "(".repeat(200_000),
            format!("{}depth", "!".repeat(100_000)),
            vec!["1"; 10_000].join(" + "),
            format!("{}1{}", "1 ? ".repeat(10_000), " : 0".repeat(10_000)),
            format!("tag{}", "()".repeat(10_000)),
        ];
        for source in &deep {
            let error = compile(source).unwrap_err();
            assert!(error.is_expression());
            assert!(error.to_string().contains("nested too deeply"), "{}", &source[..20]);
        }
    }

    #[test]
    fn test_nesting_within_limit_compiles() {
        let grouped = format!("{}depth > 1{}", "(".repeat(100), ")".repeat(100));
        let expression = compile(&grouped).unwrap();
        assert!(expression.test(&record(&[("depth", 2.0.into())])));

        let sum = vec!["1"; 100].join(" + ");
        let expression = compile(&format!("{sum} == 100")).unwrap();
        assert!(expression.test(&HashMap::<String, QValue>::new()));
    }

    #[test]
    fn test_order_by() {
        let order = compile_order_by("age").unwrap();
        assert!(!order.descending);
        let order = compile_order_by("nextCount DESC").unwrap();
        assert_eq!(order.key, "nextCount");
        assert!(order.descending);

        let low = record(&[("nextCount", 1.0.into())]);
        let high = record(&[("nextCount", 5.0.into())]);
        assert_eq!(order.compare(&low, &high), Ordering::Greater);
        assert_eq!(order.compare(&high, &high), Ordering::Equal);

        assert!(compile_order_by("age sideways").is_err());
        assert!(compile_order_by("").is_err());
        assert!(compile_order_by("age1").is_err());
    }
}
