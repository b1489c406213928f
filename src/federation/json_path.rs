// SPDX-License-Identifier: Apache-2.0

//! JSON path filter for JSON ranges.
//!
//! Supports the subset needed to narrow a document before flattening:
//! `$`, `.name`, `['name']`, `[n]` (negative counts from the end), `[*]`,
//! `.*` and filter predicates `[?(@.field op literal)]` / `[?(@.field)]`.

use std::cmp::Ordering;

use serde_json::Value as Json;
use thiserror::Error;

use crate::engine::types::Value;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message} at offset {offset}")]
pub struct JsonPathError {
    pub message: String,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Child(String),
    Index(i64),
    Wildcard,
    Filter(Predicate),
}

#[derive(Debug, Clone, PartialEq)]
struct Predicate {
    field: Vec<String>,
    test: Option<(FilterOp, Json)>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FilterOp {
    Eq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
}

/// A parsed JSON path expression
#[derive(Debug, Clone, PartialEq)]
pub struct JsonPath {
    segments: Vec<Segment>,
}

impl JsonPath {
    pub fn parse(expression: &str) -> Result<Self, JsonPathError> {
        Parser::new(expression).parse()
    }

    /// Returns every node the path selects, in document order.
    pub fn select<'a>(&self, root: &'a Json) -> Vec<&'a Json> {
        let mut current = vec![root];
        for segment in &self.segments {
            let mut next = Vec::new();
            for node in current {
                match segment {
                    Segment::Child(name) => {
                        if let Some(child) = node.get(name.as_str()) {
                            next.push(child);
                        }
                    }
                    Segment::Index(index) => {
                        if let Json::Array(items) = node {
                            let resolved = if *index < 0 {
                                items.len() as i64 + index
                            } else {
                                *index
                            };
                            if let Some(item) =
                                usize::try_from(resolved).ok().and_then(|i| items.get(i))
                            {
                                next.push(item);
                            }
                        }
                    }
                    Segment::Wildcard => next.extend(children(node)),
                    Segment::Filter(predicate) => {
                        next.extend(children(node).filter(|child| predicate.matches(child)))
                    }
                }
            }
            current = next;
        }
        current
    }
}

fn children(node: &Json) -> Box<dyn Iterator<Item = &Json> + '_> {
    match node {
        Json::Array(items) => Box::new(items.iter()),
        Json::Object(map) => Box::new(map.values()),
        _ => Box::new(std::iter::empty()),
    }
}

impl Predicate {
    fn matches(&self, node: &Json) -> bool {
        let mut current = node;
        for part in &self.field {
            match current.get(part.as_str()) {
                Some(next) => current = next,
                None => return false,
            }
        }

        let Some((op, literal)) = &self.test else {
            return !current.is_null();
        };

        let actual = Value::from_json(current.clone());
        let expected = Value::from_json(literal.clone());
        match op {
            FilterOp::Eq => actual.compare(&expected) == Some(Ordering::Equal),
            FilterOp::NotEq => matches!(
                actual.compare(&expected),
                Some(Ordering::Less | Ordering::Greater)
            ),
            FilterOp::Lt => actual.compare(&expected) == Some(Ordering::Less),
            FilterOp::Lte => matches!(
                actual.compare(&expected),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOp::Gt => actual.compare(&expected) == Some(Ordering::Greater),
            FilterOp::Gte => matches!(
                actual.compare(&expected),
                Some(Ordering::Greater | Ordering::Equal)
            ),
        }
    }
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input: input.trim(),
            pos: 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> JsonPathError {
        JsonPathError {
            message: message.into(),
            offset: self.pos,
        }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.pos += expected.len_utf8();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: char) -> Result<(), JsonPathError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{expected}'")))
        }
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn parse(mut self) -> Result<JsonPath, JsonPathError> {
        if !self.eat('$') {
            return Err(self.error("path must start with '$'"));
        }

        let mut segments = Vec::new();
        while let Some(ch) = self.peek() {
            match ch {
                '.' => {
                    self.bump();
                    if self.peek() == Some('.') {
                        return Err(self.error("recursive descent is not supported"));
                    }
                    if self.eat('*') {
                        segments.push(Segment::Wildcard);
                    } else {
                        segments.push(Segment::Child(self.name()?));
                    }
                }
                '[' => {
                    self.bump();
                    self.skip_ws();
                    segments.push(self.bracket()?);
                    self.skip_ws();
                    self.expect(']')?;
                }
                other => return Err(self.error(format!("unexpected '{other}'"))),
            }
        }

        Ok(JsonPath { segments })
    }

    fn name(&mut self) -> Result<String, JsonPathError> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '-')
        {
            self.bump();
        }
        if start == self.pos {
            return Err(self.error("expected a property name"));
        }
        Ok(self.input[start..self.pos].to_string())
    }

    fn bracket(&mut self) -> Result<Segment, JsonPathError> {
        match self.peek() {
            Some('*') => {
                self.bump();
                Ok(Segment::Wildcard)
            }
            Some('\'') | Some('"') => Ok(Segment::Child(self.quoted()?)),
            Some('?') => {
                self.bump();
                self.expect('(')?;
                self.skip_ws();
                let predicate = self.predicate()?;
                self.skip_ws();
                self.expect(')')?;
                Ok(Segment::Filter(predicate))
            }
            Some(c) if c == '-' || c.is_ascii_digit() => {
                let start = self.pos;
                self.bump();
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.bump();
                }
                self.input[start..self.pos]
                    .parse()
                    .map(Segment::Index)
                    .map_err(|_| self.error("invalid array index"))
            }
            _ => Err(self.error("expected '*', a quoted name, an index or a filter")),
        }
    }

    fn quoted(&mut self) -> Result<String, JsonPathError> {
        let Some(quote) = self.bump() else {
            return Err(self.error("expected a quoted string"));
        };
        let mut out = String::new();
        loop {
            match self.bump() {
                Some('\\') => match self.bump() {
                    Some(escaped) => out.push(escaped),
                    None => return Err(self.error("unterminated string")),
                },
                Some(c) if c == quote => return Ok(out),
                Some(c) => out.push(c),
                None => return Err(self.error("unterminated string")),
            }
        }
    }

    fn predicate(&mut self) -> Result<Predicate, JsonPathError> {
        self.expect('@')?;
        let mut field = Vec::new();
        while self.eat('.') {
            field.push(self.name()?);
        }
        if field.is_empty() {
            return Err(self.error("filter must test a field of '@'"));
        }

        self.skip_ws();
        let op = match self.peek() {
            Some(')') => return Ok(Predicate { field, test: None }),
            _ => self.operator()?,
        };
        self.skip_ws();
        let literal = self.literal()?;
        Ok(Predicate {
            field,
            test: Some((op, literal)),
        })
    }

    fn operator(&mut self) -> Result<FilterOp, JsonPathError> {
        let rest = &self.input[self.pos..];
        let (op, len) = if rest.starts_with("==") {
            (FilterOp::Eq, 2)
        } else if rest.starts_with("!=") {
            (FilterOp::NotEq, 2)
        } else if rest.starts_with("<=") {
            (FilterOp::Lte, 2)
        } else if rest.starts_with(">=") {
            (FilterOp::Gte, 2)
        } else if rest.starts_with('<') {
            (FilterOp::Lt, 1)
        } else if rest.starts_with('>') {
            (FilterOp::Gt, 1)
        } else {
            return Err(self.error("expected a comparison operator"));
        };
        self.pos += len;
        Ok(op)
    }

    fn literal(&mut self) -> Result<Json, JsonPathError> {
        match self.peek() {
            Some('\'') | Some('"') => Ok(Json::String(self.quoted()?)),
            _ => {
                let start = self.pos;
                while self
                    .peek()
                    .is_some_and(|c| !c.is_whitespace() && c != ')')
                {
                    self.bump();
                }
                let raw = &self.input[start..self.pos];
                serde_json::from_str::<Json>(raw)
                    .ok()
                    .filter(|v| !v.is_object() && !v.is_array())
                    .ok_or_else(|| JsonPathError {
                        message: format!("invalid literal '{raw}'"),
                        offset: start,
                    })
            }
        }
    }
}
