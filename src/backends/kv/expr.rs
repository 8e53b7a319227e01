//! Purpose: Filter, condition and update-expression language for key-value items.
//! Exports: `Condition`, `Assignments`, `literal`, `render_template`, `check_template`.
//! Role: The writer renders `{column}` placeholders per row; the item store parses
//! and evaluates the result against stored items.
//! Invariants: Parsing never performs I/O; every syntax error is `BadRequest`.
//! Invariants: A comparison that touches a missing attribute is false.
use std::cmp::Ordering;
use std::fmt::Write as _;

use super::store::Item;
use crate::core::dtype::Value;
use crate::core::error::{Error, ErrorKind};
use crate::core::frame::Frame;

const NANOS_PER_SEC: i64 = 1_000_000_000;

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    // Magnitudes wider than i64 so a folded minus can reach i64::MIN.
    Int(i128),
    Float(f64),
    Str(String),
    Time(i128),
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Semi,
}

fn syntax(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::BadRequest).with_message(message)
}

fn tokenize(input: &str) -> Result<Vec<Token>, Error> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0;
    while pos < chars.len() {
        let ch = chars[pos];
        if ch.is_whitespace() {
            pos += 1;
            continue;
        }
        if ch.is_ascii_digit() {
            let (token, next) = number(&chars, pos)?;
            tokens.push(token);
            pos = next;
            continue;
        }
        if ch.is_ascii_alphabetic() || ch == '_' {
            let start = pos;
            while pos < chars.len() && (chars[pos].is_ascii_alphanumeric() || chars[pos] == '_') {
                pos += 1;
            }
            tokens.push(Token::Ident(chars[start..pos].iter().collect()));
            continue;
        }
        if ch == '\'' || ch == '"' {
            let mut value = String::new();
            pos += 1;
            loop {
                let Some(&next) = chars.get(pos) else {
                    return Err(syntax(format!("unterminated string in '{input}'")));
                };
                pos += 1;
                match next {
                    '\\' => {
                        let Some(&escaped) = chars.get(pos) else {
                            return Err(syntax(format!("dangling escape in '{input}'")));
                        };
                        value.push(escaped);
                        pos += 1;
                    }
                    quote if quote == ch => break,
                    other => value.push(other),
                }
            }
            tokens.push(Token::Str(value));
            continue;
        }
        let two: String = chars[pos..(pos + 2).min(chars.len())].iter().collect();
        let (token, width) = match two.as_str() {
            "==" => (Token::Eq, 2),
            "!=" => (Token::Ne, 2),
            "<=" => (Token::Le, 2),
            ">=" => (Token::Ge, 2),
            _ => match ch {
                '<' => (Token::Lt, 1),
                '>' => (Token::Gt, 1),
                '=' => (Token::Assign, 1),
                '+' => (Token::Plus, 1),
                '-' => (Token::Minus, 1),
                '*' => (Token::Star, 1),
                '/' => (Token::Slash, 1),
                '(' => (Token::LParen, 1),
                ')' => (Token::RParen, 1),
                ';' => (Token::Semi, 1),
                other => return Err(syntax(format!("unexpected character '{other}' in '{input}'"))),
            },
        };
        tokens.push(token);
        pos += width;
    }
    Ok(tokens)
}

fn number(chars: &[char], start: usize) -> Result<(Token, usize), Error> {
    let digits = |mut pos: usize| {
        while pos < chars.len() && chars[pos].is_ascii_digit() {
            pos += 1;
        }
        pos
    };
    let mut pos = digits(start);
    let mut is_float = false;

    if chars.get(pos) == Some(&':') && chars.get(pos + 1).is_some_and(char::is_ascii_digit) {
        let secs: String = chars[start..pos].iter().collect();
        let nanos_start = pos + 1;
        let end = digits(nanos_start);
        let nanos: String = chars[nanos_start..end].iter().collect();
        let secs: i128 = secs.parse().map_err(|_| syntax(format!("bad time literal '{secs}'")))?;
        let nanos: i128 = nanos
            .parse()
            .map_err(|_| syntax(format!("bad time literal nanos '{nanos}'")))?;
        let total = secs
            .checked_mul(i128::from(NANOS_PER_SEC))
            .and_then(|value| value.checked_add(nanos))
            .ok_or_else(|| syntax("time literal out of range"))?;
        return Ok((Token::Time(total), end));
    }

    if chars.get(pos) == Some(&'.') {
        is_float = true;
        pos = digits(pos + 1);
    }
    if matches!(chars.get(pos), Some('e') | Some('E')) {
        let mut exp = pos + 1;
        if matches!(chars.get(exp), Some('+') | Some('-')) {
            exp += 1;
        }
        if chars.get(exp).is_some_and(char::is_ascii_digit) {
            is_float = true;
            pos = digits(exp);
        }
    }
    let text: String = chars[start..pos].iter().collect();
    let token = if is_float {
        Token::Float(text.parse().map_err(|_| syntax(format!("bad number '{text}'")))?)
    } else {
        Token::Int(text.parse().map_err(|_| syntax(format!("bad number '{text}'")))?)
    };
    Ok((token, pos))
}

fn narrow(value: i128) -> Result<i64, Error> {
    i64::try_from(value).map_err(|_| syntax(format!("number {value} out of range")))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BinaryOp {
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
}

#[derive(Clone, Debug, PartialEq)]
enum Expr {
    Literal(Value),
    Attribute(String),
    Exists(String),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

#[derive(Clone, Debug, PartialEq)]
enum Assignment {
    Set(String, Expr),
    Delete(String),
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Result<Self, Error> {
        Ok(Self {
            source,
            tokens: tokenize(source)?,
            pos: 0,
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(ident)) if ident.eq_ignore_ascii_case(word))
    }

    fn expect(&mut self, token: Token) -> Result<(), Error> {
        match self.bump() {
            Some(found) if found == token => Ok(()),
            found => Err(self.unexpected(found)),
        }
    }

    fn unexpected(&self, found: Option<Token>) -> Error {
        match found {
            Some(token) => syntax(format!("unexpected {token:?} in '{}'", self.source)),
            None => syntax(format!("unexpected end of '{}'", self.source)),
        }
    }

    fn name(&mut self) -> Result<String, Error> {
        match self.bump() {
            Some(Token::Ident(name)) => Ok(name),
            found => Err(self.unexpected(found)),
        }
    }

    fn or(&mut self) -> Result<Expr, Error> {
        let mut left = self.and()?;
        while self.keyword("or") {
            self.pos += 1;
            let right = self.and()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, Error> {
        let mut left = self.not()?;
        while self.keyword("and") {
            self.pos += 1;
            let right = self.not()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not(&mut self) -> Result<Expr, Error> {
        if self.keyword("not") {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.not()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, Error> {
        let left = self.sum()?;
        let op = match self.peek() {
            Some(Token::Eq) | Some(Token::Assign) => BinaryOp::Eq,
            Some(Token::Ne) => BinaryOp::Ne,
            Some(Token::Lt) => BinaryOp::Lt,
            Some(Token::Le) => BinaryOp::Le,
            Some(Token::Gt) => BinaryOp::Gt,
            Some(Token::Ge) => BinaryOp::Ge,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.sum()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn sum(&mut self) -> Result<Expr, Error> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.term()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn term(&mut self) -> Result<Expr, Error> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn unary(&mut self) -> Result<Expr, Error> {
        if self.peek() == Some(&Token::Minus) {
            self.pos += 1;
            match self.peek() {
                Some(Token::Int(value)) => {
                    let value = narrow(-*value)?;
                    self.pos += 1;
                    return Ok(Expr::Literal(Value::Int(value)));
                }
                Some(Token::Time(value)) => {
                    let value = narrow(-*value)?;
                    self.pos += 1;
                    return Ok(Expr::Literal(Value::Time(value)));
                }
                _ => return Ok(Expr::Neg(Box::new(self.unary()?))),
            }
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<Expr, Error> {
        match self.bump() {
            Some(Token::Int(value)) => Ok(Expr::Literal(Value::Int(narrow(value)?))),
            Some(Token::Float(value)) => Ok(Expr::Literal(Value::Float(value))),
            Some(Token::Str(value)) => Ok(Expr::Literal(Value::String(value))),
            Some(Token::Time(value)) => Ok(Expr::Literal(Value::Time(narrow(value)?))),
            Some(Token::LParen) => {
                let inner = self.or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(ident)) => match ident.to_ascii_lowercase().as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "exists" if self.peek() == Some(&Token::LParen) => {
                    self.pos += 1;
                    let name = self.name()?;
                    self.expect(Token::RParen)?;
                    Ok(Expr::Exists(name))
                }
                _ => Ok(Expr::Attribute(ident)),
            },
            found => Err(self.unexpected(found)),
        }
    }

    fn assignment(&mut self) -> Result<Assignment, Error> {
        if self.keyword("delete") && self.tokens.get(self.pos + 1) == Some(&Token::LParen) {
            self.pos += 2;
            let name = self.name()?;
            self.expect(Token::RParen)?;
            return Ok(Assignment::Delete(name));
        }
        let name = self.name()?;
        self.expect(Token::Assign)?;
        Ok(Assignment::Set(name, self.or()?))
    }
}

impl Expr {
    fn eval(&self, item: &Item) -> Option<Value> {
        match self {
            Expr::Literal(value) => Some(value.clone()),
            Expr::Attribute(name) => item.get(name).cloned(),
            Expr::Exists(name) => Some(Value::Bool(item.contains_key(name))),
            Expr::Not(inner) => Some(Value::Bool(!truthy(inner.eval(item)))),
            Expr::Neg(inner) => match inner.eval(item)? {
                Value::Int(value) => value.checked_neg().map(Value::Int),
                Value::Float(value) => Some(Value::Float(-value)),
                Value::Time(value) => value.checked_neg().map(Value::Time),
                _ => None,
            },
            Expr::Binary(BinaryOp::And, left, right) => {
                Some(Value::Bool(truthy(left.eval(item)) && truthy(right.eval(item))))
            }
            Expr::Binary(BinaryOp::Or, left, right) => {
                Some(Value::Bool(truthy(left.eval(item)) || truthy(right.eval(item))))
            }
            Expr::Binary(op, left, right) => {
                let left = left.eval(item);
                let right = right.eval(item);
                match op {
                    BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
                        arithmetic(*op, left?, right?)
                    }
                    _ => {
                        let (Some(left), Some(right)) = (left, right) else {
                            return Some(Value::Bool(false));
                        };
                        Some(Value::Bool(compare(*op, &left, &right)))
                    }
                }
            }
        }
    }
}

fn truthy(value: Option<Value>) -> bool {
    matches!(value, Some(Value::Bool(true)))
}

fn arithmetic(op: BinaryOp, left: Value, right: Value) -> Option<Value> {
    match (left, right) {
        (Value::Int(left), Value::Int(right)) => match op {
            BinaryOp::Add => left.checked_add(right).map(Value::Int),
            BinaryOp::Sub => left.checked_sub(right).map(Value::Int),
            BinaryOp::Mul => left.checked_mul(right).map(Value::Int),
            BinaryOp::Div => left.checked_div(right).map(Value::Int),
            _ => None,
        },
        (Value::String(left), Value::String(right)) if op == BinaryOp::Add => {
            Some(Value::String(left + &right))
        }
        (Value::Time(left), Value::Int(right)) => match op {
            BinaryOp::Add => left.checked_add(right).map(Value::Time),
            BinaryOp::Sub => left.checked_sub(right).map(Value::Time),
            _ => None,
        },
        (left, right) => {
            let (left, right) = (left.as_f64()?, right.as_f64()?);
            let value = match op {
                BinaryOp::Add => left + right,
                BinaryOp::Sub => left - right,
                BinaryOp::Mul => left * right,
                BinaryOp::Div => left / right,
                _ => return None,
            };
            Some(Value::Float(value))
        }
    }
}

fn compare(op: BinaryOp, left: &Value, right: &Value) -> bool {
    let ordering = match (left, right) {
        (Value::Int(left), Value::Int(right)) => Some(left.cmp(right)),
        (Value::String(left), Value::String(right)) => Some(left.cmp(right)),
        (Value::Bool(left), Value::Bool(right)) => Some(left.cmp(right)),
        (Value::Time(left), Value::Time(right)) => Some(left.cmp(right)),
        (left, right) => match (left.as_f64(), right.as_f64()) {
            (Some(left), Some(right)) => left.partial_cmp(&right),
            _ => None,
        },
    };
    let Some(ordering) = ordering else {
        return op == BinaryOp::Ne;
    };
    match op {
        BinaryOp::Eq => ordering == Ordering::Equal,
        BinaryOp::Ne => ordering != Ordering::Equal,
        BinaryOp::Lt => ordering == Ordering::Less,
        BinaryOp::Le => ordering != Ordering::Greater,
        BinaryOp::Gt => ordering == Ordering::Greater,
        BinaryOp::Ge => ordering != Ordering::Less,
        _ => false,
    }
}

/// A parsed filter or condition.
#[derive(Clone, Debug, PartialEq)]
pub struct Condition(Expr);

impl Condition {
    pub fn parse(source: &str) -> Result<Condition, Error> {
        let mut parser = Parser::new(source)?;
        let expr = parser.or()?;
        if !parser.at_end() {
            let found = parser.bump();
            return Err(parser.unexpected(found));
        }
        Ok(Condition(expr))
    }

    pub fn matches(&self, item: &Item) -> bool {
        truthy(self.0.eval(item))
    }
}

/// A parsed update expression: `a=1; b=a+2; delete(c)`.
#[derive(Clone, Debug, PartialEq)]
pub struct Assignments(Vec<Assignment>);

impl Assignments {
    pub fn parse(source: &str) -> Result<Assignments, Error> {
        let mut parser = Parser::new(source)?;
        let mut assignments = Vec::new();
        while !parser.at_end() {
            if parser.peek() == Some(&Token::Semi) {
                parser.pos += 1;
                continue;
            }
            assignments.push(parser.assignment()?);
            match parser.bump() {
                None | Some(Token::Semi) => {}
                found => return Err(parser.unexpected(found)),
            }
        }
        if assignments.is_empty() {
            return Err(syntax("empty update expression"));
        }
        Ok(Assignments(assignments))
    }

    /// Applies in order; later assignments see earlier results.
    pub fn apply(&self, item: &mut Item) -> Result<(), Error> {
        for assignment in &self.0 {
            match assignment {
                Assignment::Delete(name) => {
                    item.remove(name);
                }
                Assignment::Set(name, expr) => {
                    let value = expr.eval(item).ok_or_else(|| {
                        syntax(format!("cannot evaluate value for attribute '{name}'"))
                    })?;
                    item.insert(name.clone(), value);
                }
            }
        }
        Ok(())
    }
}

/// Typed literal for `value` in expression syntax.
pub fn literal(value: &Value) -> Result<String, Error> {
    Ok(match value {
        Value::Bool(value) => value.to_string(),
        Value::Int(value) => value.to_string(),
        Value::Float(value) if value.is_finite() => format!("{value:?}"),
        Value::Float(value) => {
            return Err(syntax(format!("{value} cannot be used in an expression")));
        }
        Value::String(value) => {
            let mut quoted = String::with_capacity(value.len() + 2);
            quoted.push('\'');
            for ch in value.chars() {
                if ch == '\'' || ch == '\\' {
                    quoted.push('\\');
                }
                quoted.push(ch);
            }
            quoted.push('\'');
            quoted
        }
        Value::Time(nanos) => {
            let sign = if *nanos < 0 { "-" } else { "" };
            let magnitude = nanos.unsigned_abs();
            let per_sec = NANOS_PER_SEC as u64;
            format!("{sign}{}:{}", magnitude / per_sec, magnitude % per_sec)
        }
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TemplateKind {
    Assignments,
    Condition,
}

/// Checks placeholder syntax and that the template parses once filled in.
pub fn check_template(template: &str, kind: TemplateKind) -> Result<(), Error> {
    let filled = substitute(template, |_| Ok("0".to_string()))?;
    match kind {
        TemplateKind::Assignments => Assignments::parse(&filled).map(|_| ()),
        TemplateKind::Condition => Condition::parse(&filled).map(|_| ()),
    }
}

/// Replaces `{name}` with the literal of column or index `name` at `row`.
pub fn render_template(template: &str, frame: &Frame, row: usize) -> Result<String, Error> {
    substitute(template, |name| {
        let column = frame.find(name).ok_or_else(|| {
            syntax(format!("expression references unknown column '{name}'"))
        })?;
        if frame.is_null(row, name) {
            return Err(syntax(format!(
                "expression references null value of column '{name}' at row {row}"
            )));
        }
        literal(&column.at(row)?)
    })
}

fn substitute<F>(template: &str, mut value_of: F) -> Result<String, Error>
where
    F: FnMut(&str) -> Result<String, Error>,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find(['{', '}']) {
        if rest[open..].starts_with('}') {
            return Err(syntax(format!("unbalanced '}}' in '{template}'")));
        }
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            return Err(syntax(format!("unbalanced '{{' in '{template}'")));
        };
        let name = after[..close].trim();
        if name.is_empty() || name.contains('{') {
            return Err(syntax(format!("bad placeholder in '{template}'")));
        }
        let _ = write!(out, "{}", value_of(name)?);
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::{Assignments, Condition, TemplateKind, check_template, literal, render_template};
    use crate::backends::kv::store::Item;
    use crate::core::column::Column;
    use crate::core::dtype::Value;
    use crate::core::error::ErrorKind;
    use crate::core::frame::Frame;

    fn item(pairs: &[(&str, Value)]) -> Item {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn conditions_compare_numbers_strings_and_missing_attributes() {
        let row = item(&[
            ("age", Value::Int(3)),
            ("weight", Value::Float(2.5)),
            ("name", Value::from("rocky")),
        ]);
        let cases = [
            ("age > 2 and name == 'rocky'", true),
            ("age == 3.0", true),
            ("weight * 2 == 5", true),
            ("not (age < 3)", true),
            ("missing == 1", false),
            ("missing > 1 or exists(name)", true),
            ("exists(missing)", false),
            ("name != 'bob' AND age >= 3", true),
        ];
        for (source, expected) in cases {
            let condition = Condition::parse(source).expect(source);
            assert_eq!(condition.matches(&row), expected, "{source}");
        }
    }

    #[test]
    fn assignments_evaluate_in_order() {
        let mut row = item(&[("n1", Value::Int(2)), ("n2", Value::Int(5)), ("old", Value::Bool(true))]);
        let update = Assignments::parse("n3=n1+n2; n4 = n3 * 2.0; s='a' + 'b'; delete(old);")
            .expect("parse");
        update.apply(&mut row).expect("apply");
        assert_eq!(row.get("n3"), Some(&Value::Int(7)));
        assert_eq!(row.get("n4"), Some(&Value::Float(14.0)));
        assert_eq!(row.get("s"), Some(&Value::from("ab")));
        assert!(!row.contains_key("old"));

        let err = Assignments::parse("x=missing+1")
            .expect("parse")
            .apply(&mut row)
            .expect_err("missing operand");
        assert_eq!(err.kind(), ErrorKind::BadRequest);
    }

    #[test]
    fn syntax_errors_are_bad_requests() {
        for source in ["a ==", "a = = 1", "(a > 1", "a > 'x", "a # 2"] {
            let err = Condition::parse(source).expect_err(source);
            assert_eq!(err.kind(), ErrorKind::BadRequest, "{source}");
        }
        assert!(Assignments::parse(";;").is_err());
        assert!(Assignments::parse("a 1").is_err());
    }

    #[test]
    fn literals_parse_back_to_the_same_value() {
        let values = [
            Value::Int(-4),
            Value::Float(2.0),
            Value::Float(1e-7),
            Value::from("it's"),
            Value::Bool(false),
            Value::Time(1_500_000_000),
            Value::Time(-1_500_000_000),
            Value::Int(i64::MIN),
            Value::Int(i64::MAX),
            Value::Time(i64::MIN),
            Value::Time(i64::MAX),
        ];
        for value in values {
            let source = format!("x={}", literal(&value).expect("literal"));
            let mut row = Item::new();
            Assignments::parse(&source)
                .expect(&source)
                .apply(&mut row)
                .expect("apply");
            assert_eq!(row.get("x"), Some(&value), "{source}");
        }
        assert!(literal(&Value::Float(f64::NAN)).is_err());
    }

    #[test]
    fn templates_render_typed_values_per_row() {
        let frame = Frame::new(
            vec![
                Column::dense("name", vec!["a", "b"]),
                Column::dense("n", vec![1i64, 2]),
            ],
            vec![Column::dense("idx", vec![10i64, 11])],
        )
        .expect("frame");
        let rendered = render_template("v={n}; who={name}; k={idx}", &frame, 1).expect("render");
        assert_eq!(rendered, "v=2; who='b'; k=11");

        let err = render_template("v={nope}", &frame, 0).expect_err("unknown");
        assert_eq!(err.kind(), ErrorKind::BadRequest);
    }

    #[test]
    fn template_check_rejects_bad_braces_before_io() {
        assert!(check_template("a={n}", TemplateKind::Assignments).is_ok());
        assert!(check_template("{n} > 1", TemplateKind::Condition).is_ok());
        for template in ["a={n", "a=n}", "a={}", "a={n} +"] {
            let err = check_template(template, TemplateKind::Assignments).expect_err(template);
            assert_eq!(err.kind(), ErrorKind::BadRequest, "{template}");
        }
    }
}
