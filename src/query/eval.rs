// SPDX-License-Identifier: Apache-2.0

//! Condition evaluator
//!
//! Interprets the condition tree directly against merged result rows. Used
//! for join predicates, JSON range filtering, residual WHERE conditions,
//! in-memory sorting and projection.

use std::cell::RefCell;
use std::collections::HashMap;

use regex::Regex;

use crate::engine::error::{ExecutionError, ExecutionResult};
use crate::engine::types::{Parameters, ResultRow, ResultSet, Value};

use super::ast::{AggregateFunc, ArithmeticOp, CompareOp, Expr, ExprKind, Identifier};

/// Evaluates expressions against rows with a fixed set of bound parameters
#[derive(Debug, Clone, Copy)]
pub struct ConditionEvaluator<'p> {
    parameters: &'p Parameters,
}

impl<'p> ConditionEvaluator<'p> {
    pub fn new(parameters: &'p Parameters) -> Self {
        Self { parameters }
    }

    /// Evaluates a condition against one row.
    ///
    /// Comparisons involving null are false, as in SQL.
    pub fn evaluate(&self, condition: &Expr, row: &ResultRow) -> ExecutionResult<bool> {
        match &condition.kind {
            ExprKind::And(left, right) => {
                Ok(self.evaluate(left, row)? && self.evaluate(right, row)?)
            }
            ExprKind::Or(left, right) => {
                Ok(self.evaluate(left, row)? || self.evaluate(right, row)?)
            }
            ExprKind::Not(inner) => Ok(!self.evaluate(inner, row)?),
            ExprKind::Compare { op, left, right } => {
                let lhs = self.scalar(left, row)?;
                let rhs = self.scalar(right, row)?;
                compare(*op, &lhs, &rhs)
            }
            ExprKind::In {
                expr,
                list,
                negated,
            } => {
                let needle = self.scalar(expr, row)?;
                if needle.is_null() {
                    return Ok(false);
                }
                let mut found = false;
                for item in list {
                    match self.scalar(item, row)? {
                        Value::Array(values) => {
                            found = values.iter().any(|v| needle.loosely_equals(v));
                        }
                        value => found = needle.loosely_equals(&value),
                    }
                    if found {
                        break;
                    }
                }
                Ok(found != *negated)
            }
            ExprKind::IsNull { expr, negated } => {
                Ok(self.scalar(expr, row)?.is_null() != *negated)
            }
            _ => Ok(self.scalar(condition, row)?.truthy()),
        }
    }

    /// Evaluates a non-aggregate expression to a scalar.
    pub fn scalar(&self, expr: &Expr, row: &ResultRow) -> ExecutionResult<Value> {
        match &expr.kind {
            ExprKind::Identifier(ident) => resolve(ident, row),
            ExprKind::AliasRef(alias) => row.get(alias).cloned().ok_or_else(|| {
                ExecutionError::evaluation(format!("unknown alias '{alias}'"))
            }),
            ExprKind::Literal(value) => Ok(value.clone()),
            ExprKind::Parameter(name) => self.parameters.get(name).cloned().ok_or_else(|| {
                ExecutionError::evaluation(format!("parameter ':{name}' is not bound"))
            }),
            ExprKind::Compare { .. }
            | ExprKind::And(..)
            | ExprKind::Or(..)
            | ExprKind::Not(_)
            | ExprKind::In { .. }
            | ExprKind::IsNull { .. } => Ok(Value::Bool(self.evaluate(expr, row)?)),
            ExprKind::Arithmetic { op, left, right } => {
                arithmetic(*op, self.scalar(left, row)?, self.scalar(right, row)?)
            }
            ExprKind::Function { name, args } => {
                let values = args
                    .iter()
                    .map(|arg| self.scalar(arg, row))
                    .collect::<ExecutionResult<Vec<_>>>()?;
                function(name, values)
            }
            ExprKind::Aggregate { func, .. } => Err(ExecutionError::evaluation(format!(
                "aggregate '{}' cannot be evaluated against a single row",
                func.name()
            ))),
        }
    }

    /// Evaluates an expression that may contain aggregates over a whole set.
    ///
    /// Aggregate calls are computed over `rows` (after their own WHERE
    /// clause); anything outside an aggregate is taken from the first row.
    pub fn aggregate(&self, expr: &Expr, rows: &[ResultRow]) -> ExecutionResult<Value> {
        let folded = self.fold_aggregates(expr, rows)?;
        match rows.first() {
            Some(first) => self.scalar(&folded, first),
            None => {
                let mut empty = ResultRow::new();
                for ident in folded.identifiers() {
                    empty.insert(ident.qualified(), Value::Null);
                }
                self.scalar(&folded, &empty)
            }
        }
    }

    fn fold_aggregates(&self, expr: &Expr, rows: &[ResultRow]) -> ExecutionResult<Expr> {
        if let ExprKind::Aggregate { func, arg, filter } = &expr.kind {
            let value = self.compute_aggregate(*func, arg.as_deref(), filter.as_deref(), rows)?;
            return Ok(Expr {
                id: expr.id,
                kind: ExprKind::Literal(value),
            });
        }

        let mut folded = expr.clone();
        match &mut folded.kind {
            ExprKind::Compare { left, right, .. }
            | ExprKind::Arithmetic { left, right, .. }
            | ExprKind::And(left, right)
            | ExprKind::Or(left, right) => {
                **left = self.fold_aggregates(left, rows)?;
                **right = self.fold_aggregates(right, rows)?;
            }
            ExprKind::Not(inner) => **inner = self.fold_aggregates(inner, rows)?,
            ExprKind::IsNull { expr: inner, .. } => **inner = self.fold_aggregates(inner, rows)?,
            ExprKind::In { expr: inner, list, .. } => {
                **inner = self.fold_aggregates(inner, rows)?;
                for item in list.iter_mut() {
                    *item = self.fold_aggregates(item, rows)?;
                }
            }
            ExprKind::Function { args, .. } => {
                for arg in args.iter_mut() {
                    *arg = self.fold_aggregates(arg, rows)?;
                }
            }
            _ => {}
        }
        Ok(folded)
    }

    fn compute_aggregate(
        &self,
        func: AggregateFunc,
        arg: Option<&Expr>,
        filter: Option<&Expr>,
        rows: &[ResultRow],
    ) -> ExecutionResult<Value> {
        let mut selected: Vec<&ResultRow> = Vec::with_capacity(rows.len());
        for row in rows {
            let keep = match filter {
                Some(filter) => self.evaluate(filter, row)?,
                None => true,
            };
            if keep {
                selected.push(row);
            }
        }

        let Some(arg) = arg else {
            return Ok(match func {
                AggregateFunc::Any => Value::Bool(!selected.is_empty()),
                _ => Value::Int(selected.len() as i64),
            });
        };

        let mut values = Vec::with_capacity(selected.len());
        for row in selected {
            let value = self.scalar(arg, row)?;
            if !value.is_null() {
                values.push(value);
            }
        }

        match func {
            AggregateFunc::Count => Ok(Value::Int(values.len() as i64)),
            AggregateFunc::Any => Ok(Value::Bool(values.iter().any(Value::truthy))),
            AggregateFunc::Min => Ok(values
                .into_iter()
                .min_by(|a, b| a.sort_cmp(b))
                .unwrap_or(Value::Null)),
            AggregateFunc::Max => Ok(values
                .into_iter()
                .max_by(|a, b| a.sort_cmp(b))
                .unwrap_or(Value::Null)),
            AggregateFunc::Sum => sum(&values),
            AggregateFunc::Avg => {
                if values.is_empty() {
                    return Ok(Value::Null);
                }
                let total = numeric_values(&values, "avg")?.iter().sum::<f64>();
                Ok(Value::Float(total / values.len() as f64))
            }
        }
    }

    /// Keeps the rows for which `condition` holds. `None` keeps every row.
    pub fn filter(&self, rows: ResultSet, condition: Option<&Expr>) -> ExecutionResult<ResultSet> {
        let Some(condition) = condition else {
            return Ok(rows);
        };
        let mut kept = Vec::with_capacity(rows.len());
        for row in rows {
            if self.evaluate(condition, &row)? {
                kept.push(row);
            }
        }
        Ok(kept)
    }
}

/// Looks up an identifier in a row, descending into JSON values for
/// property chains such as `o.customer.name`.
fn resolve(ident: &Identifier, row: &ResultRow) -> ExecutionResult<Value> {
    if let Some(value) = row.get(&ident.qualified()) {
        return Ok(value.clone());
    }

    if ident.path.len() > 1 {
        let head = format!("{}.{}", ident.range, ident.path[0]);
        if let Some(value) = row.get(&head) {
            let mut current = match value {
                Value::Json(json) => json,
                Value::Null => return Ok(Value::Null),
                _ => {
                    return Err(ExecutionError::evaluation(format!(
                        "'{head}' has no property '{}'",
                        ident.path[1]
                    )))
                }
            };
            for segment in &ident.path[1..] {
                match current.get(segment.as_str()) {
                    Some(next) => current = next,
                    None => return Ok(Value::Null),
                }
            }
            return Ok(Value::from_json(current.clone()));
        }
    }

    Err(ExecutionError::evaluation(format!(
        "unknown identifier '{}'",
        ident.qualified()
    )))
}

fn compare(op: CompareOp, lhs: &Value, rhs: &Value) -> ExecutionResult<bool> {
    use std::cmp::Ordering;

    if op == CompareOp::Like {
        return match (lhs, rhs) {
            (Value::Null, _) | (_, Value::Null) => Ok(false),
            (value, Value::Text(pattern)) => Ok(like_regex(pattern)?.is_match(&value.to_string())),
            (_, other) => Err(ExecutionError::evaluation(format!(
                "LIKE pattern must be text, got {other}"
            ))),
        };
    }

    let Some(ordering) = lhs.compare(rhs) else {
        return Ok(false);
    };
    Ok(match op {
        CompareOp::Eq => ordering == Ordering::Equal,
        CompareOp::NotEq => ordering != Ordering::Equal,
        CompareOp::Lt => ordering == Ordering::Less,
        CompareOp::Lte => ordering != Ordering::Greater,
        CompareOp::Gt => ordering == Ordering::Greater,
        CompareOp::Gte | CompareOp::Like => ordering != Ordering::Less,
    })
}

const LIKE_CACHE_LIMIT: usize = 256;

thread_local! {
    /// Compiled LIKE patterns, so a pattern is compiled once rather than per row
    static LIKE_PATTERNS: RefCell<HashMap<String, Regex>> = RefCell::new(HashMap::new());
}

fn like_regex(pattern: &str) -> ExecutionResult<Regex> {
    if let Some(hit) = LIKE_PATTERNS.with(|cache| cache.borrow().get(pattern).cloned()) {
        return Ok(hit);
    }
    let compiled = compile_like(pattern)?;
    LIKE_PATTERNS.with(|cache| {
        let mut cache = cache.borrow_mut();
        if cache.len() >= LIKE_CACHE_LIMIT {
            cache.clear();
        }
        cache.insert(pattern.to_string(), compiled.clone());
    });
    Ok(compiled)
}

/// Translates a SQL LIKE pattern (`%`, `_`) into an anchored regex.
fn compile_like(pattern: &str) -> ExecutionResult<Regex> {
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push_str("(?s)^");
    let mut literal = [0u8; 4];
    for ch in pattern.chars() {
        match ch {
            '%' => source.push_str(".*"),
            '_' => source.push('.'),
            other => source.push_str(&regex::escape(other.encode_utf8(&mut literal))),
        }
    }
    source.push('$');
    Regex::new(&source)
        .map_err(|e| ExecutionError::evaluation(format!("invalid LIKE pattern '{pattern}': {e}")))
}

fn arithmetic(op: ArithmeticOp, lhs: Value, rhs: Value) -> ExecutionResult<Value> {
    if lhs.is_null() || rhs.is_null() {
        return Ok(Value::Null);
    }

    if let (Value::Int(a), Value::Int(b)) = (&lhs, &rhs) {
        let (a, b) = (*a, *b);
        let result = match op {
            ArithmeticOp::Add => a.checked_add(b),
            ArithmeticOp::Sub => a.checked_sub(b),
            ArithmeticOp::Mul => a.checked_mul(b),
            ArithmeticOp::Div if b == 0 => {
                return Err(ExecutionError::evaluation("division by zero"))
            }
            ArithmeticOp::Div if a % b == 0 => Some(a / b),
            ArithmeticOp::Div => return Ok(Value::Float(a as f64 / b as f64)),
        };
        return result
            .map(Value::Int)
            .ok_or_else(|| ExecutionError::evaluation(format!("integer overflow in {a} {} {b}", op.as_sql())));
    }

    let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) else {
        return Err(ExecutionError::evaluation(format!(
            "cannot apply '{}' to {lhs} and {rhs}",
            op.as_sql()
        )));
    };
    Ok(Value::Float(match op {
        ArithmeticOp::Add => a + b,
        ArithmeticOp::Sub => a - b,
        ArithmeticOp::Mul => a * b,
        ArithmeticOp::Div => {
            if b == 0.0 {
                return Err(ExecutionError::evaluation("division by zero"));
            }
            a / b
        }
    }))
}

fn function(name: &str, args: Vec<Value>) -> ExecutionResult<Value> {
    let lowered = name.to_ascii_lowercase();
    let arity = |n: usize| -> ExecutionResult<()> {
        if args.len() == n {
            Ok(())
        } else {
            Err(ExecutionError::evaluation(format!(
                "{lowered}() expects {n} argument(s), got {}",
                args.len()
            )))
        }
    };

    match lowered.as_str() {
        "lower" | "upper" => {
            arity(1)?;
            Ok(match &args[0] {
                Value::Null => Value::Null,
                value if lowered == "lower" => Value::Text(value.to_string().to_lowercase()),
                value => Value::Text(value.to_string().to_uppercase()),
            })
        }
        "length" => {
            arity(1)?;
            Ok(match &args[0] {
                Value::Null => Value::Null,
                Value::Array(items) => Value::Int(items.len() as i64),
                Value::Bytes(bytes) => Value::Int(bytes.len() as i64),
                value => Value::Int(value.to_string().chars().count() as i64),
            })
        }
        "abs" => {
            arity(1)?;
            match &args[0] {
                Value::Null => Ok(Value::Null),
                Value::Int(i) => i
                    .checked_abs()
                    .map(Value::Int)
                    .ok_or_else(|| ExecutionError::evaluation("integer overflow in abs()")),
                value => value.as_f64().map(|f| Value::Float(f.abs())).ok_or_else(|| {
                    ExecutionError::evaluation(format!("abs() expects a number, got {value}"))
                }),
            }
        }
        "coalesce" => Ok(args.into_iter().find(|v| !v.is_null()).unwrap_or(Value::Null)),
        _ => Err(ExecutionError::evaluation(format!(
            "unsupported function '{name}'"
        ))),
    }
}

fn numeric_values(values: &[Value], func: &str) -> ExecutionResult<Vec<f64>> {
    values
        .iter()
        .map(|v| {
            v.as_f64().ok_or_else(|| {
                ExecutionError::evaluation(format!("{func}() expects numbers, got {v}"))
            })
        })
        .collect()
}

fn sum(values: &[Value]) -> ExecutionResult<Value> {
    if values.is_empty() {
        return Ok(Value::Null);
    }
    if values.iter().all(|v| matches!(v, Value::Int(_))) {
        let mut total: i64 = 0;
        for value in values {
            if let Value::Int(i) = value {
                total = total
                    .checked_add(*i)
                    .ok_or_else(|| ExecutionError::evaluation("integer overflow in sum()"))?;
            }
        }
        return Ok(Value::Int(total));
    }
    Ok(Value::Float(numeric_values(values, "sum")?.iter().sum()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> ResultRow {
        ResultRow::new()
            .with("u.id", 7)
            .with("u.name", "Ada")
            .with("u.score", "12.5")
            .with("u.deleted_at", Value::Null)
            .with(
                "u.profile",
                Value::Json(serde_json::json!({"city": "Paris", "tags": ["a"]})),
            )
    }

    fn params() -> Parameters {
        Parameters::from([
            ("min".to_string(), Value::Int(5)),
            ("ids".to_string(), Value::Array(vec![Value::Int(1), Value::Int(7)])),
        ])
    }

    #[test]
    fn compares_numbers_and_numeric_text() {
        let params = params();
        let eval = ConditionEvaluator::new(&params);
        let cond = Expr::compare(CompareOp::Gt, Expr::ident("u", "id"), Expr::param("min"))
            .and(Expr::compare(CompareOp::Lt, Expr::ident("u", "score"), Expr::lit(13)));
        assert!(eval.evaluate(&cond, &row()).unwrap());
    }

    #[test]
    fn short_circuits_left_to_right() {
        let params = params();
        let eval = ConditionEvaluator::new(&params);
        let missing = Expr::eq(Expr::ident("u", "nope"), Expr::lit(1));

        let or = Expr::eq(Expr::ident("u", "id"), Expr::lit(7)).or(missing.clone());
        assert!(eval.evaluate(&or, &row()).unwrap());

        let and = Expr::eq(Expr::ident("u", "id"), Expr::lit(8)).and(missing.clone());
        assert!(!eval.evaluate(&and, &row()).unwrap());

        let err = eval.evaluate(&missing, &row()).unwrap_err();
        assert!(err.to_string().contains("unknown identifier 'u.nope'"));
    }

    #[test]
    fn null_comparisons_are_false() {
        let params = params();
        let eval = ConditionEvaluator::new(&params);
        let eq = Expr::eq(Expr::ident("u", "deleted_at"), Expr::null());
        assert!(!eval.evaluate(&eq, &row()).unwrap());
        let is_null = Expr::is_null(Expr::ident("u", "deleted_at"), false);
        assert!(eval.evaluate(&is_null, &row()).unwrap());
    }

    #[test]
    fn in_expands_array_parameters() {
        let params = params();
        let eval = ConditionEvaluator::new(&params);
        let cond = Expr::in_list(Expr::ident("u", "id"), vec![Expr::param("ids")]);
        assert!(eval.evaluate(&cond, &row()).unwrap());

        let negated = Expr::new(ExprKind::In {
            expr: Box::new(Expr::ident("u", "id")),
            list: vec![Expr::lit(1), Expr::lit(2)],
            negated: true,
        });
        assert!(eval.evaluate(&negated, &row()).unwrap());
    }

    #[test]
    fn like_matches_wildcards() {
        let params = params();
        let eval = ConditionEvaluator::new(&params);
        let like = |p: &str| Expr::compare(CompareOp::Like, Expr::ident("u", "name"), Expr::lit(p));
        assert!(eval.evaluate(&like("A%"), &row()).unwrap());
        assert!(eval.evaluate(&like("_da"), &row()).unwrap());
        assert!(!eval.evaluate(&like("a%"), &row()).unwrap());
        assert!(!eval.evaluate(&like("A.a"), &row()).unwrap());
    }

    #[test]
    fn like_pattern_is_compiled_once_across_rows() {
        let params = params();
        let eval = ConditionEvaluator::new(&params);
        let pattern = "%d_cache%";
        let like = Expr::compare(CompareOp::Like, Expr::ident("u", "name"), Expr::lit(pattern));
        let rows: ResultSet = ["Ada", "odd-cache-hit", "Alan"]
            .into_iter()
            .map(|name| ResultRow::new().with("u.name", name))
            .collect();

        let kept = eval.filter(rows, Some(&like)).unwrap();
        assert_eq!(kept.len(), 1);
        let cached = LIKE_PATTERNS.with(|cache| {
            cache.borrow().get(pattern).map(|re| re.as_str().to_string())
        });
        assert_eq!(cached.as_deref(), Some("(?s)^.*d.cache.*$"));
    }

    #[test]
    fn scalar_functions_and_arithmetic() {
        let params = params();
        let eval = ConditionEvaluator::new(&params);
        let r = row();

        let upper = Expr::function("upper", vec![Expr::ident("u", "name")]);
        assert_eq!(eval.scalar(&upper, &r).unwrap(), Value::Text("ADA".into()));

        let coalesce = Expr::function(
            "coalesce",
            vec![Expr::ident("u", "deleted_at"), Expr::lit("never")],
        );
        assert_eq!(eval.scalar(&coalesce, &r).unwrap(), Value::Text("never".into()));

        let sum = Expr::arithmetic(ArithmeticOp::Mul, Expr::ident("u", "id"), Expr::lit(3));
        assert_eq!(eval.scalar(&sum, &r).unwrap(), Value::Int(21));

        let div = Expr::arithmetic(ArithmeticOp::Div, Expr::ident("u", "id"), Expr::lit(0));
        assert!(eval.scalar(&div, &r).is_err());
    }

    #[test]
    fn property_chains_descend_into_json() {
        let params = params();
        let eval = ConditionEvaluator::new(&params);
        let city = Expr::path("u", &["profile", "city"]);
        assert_eq!(eval.scalar(&city, &row()).unwrap(), Value::Text("Paris".into()));
        let missing = Expr::path("u", &["profile", "zip"]);
        assert_eq!(eval.scalar(&missing, &row()).unwrap(), Value::Null);
    }

    #[test]
    fn unbound_parameter_and_row_aggregate_fail() {
        let params = params();
        let eval = ConditionEvaluator::new(&params);
        assert!(eval.scalar(&Expr::param("nope"), &row()).is_err());
        let agg = Expr::aggregate(AggregateFunc::Count, None, None);
        assert!(matches!(
            eval.scalar(&agg, &row()),
            Err(ExecutionError::EvaluationError { .. })
        ));
    }

    #[test]
    fn aggregates_respect_their_where_clause() {
        let params = params();
        let eval = ConditionEvaluator::new(&params);
        let rows = vec![
            ResultRow::new().with("o.total", 10).with("o.status", "paid"),
            ResultRow::new().with("o.total", 5).with("o.status", "open"),
            ResultRow::new().with("o.total", Value::Null).with("o.status", "paid"),
            ResultRow::new().with("o.total", 20).with("o.status", "paid"),
        ];
        let paid = Expr::eq(Expr::ident("o", "status"), Expr::lit("paid"));

        let sum = Expr::aggregate(AggregateFunc::Sum, Some(Expr::ident("o", "total")), Some(paid.clone()));
        assert_eq!(eval.aggregate(&sum, &rows).unwrap(), Value::Int(30));

        let count_all = Expr::aggregate(AggregateFunc::Count, None, None);
        assert_eq!(eval.aggregate(&count_all, &rows).unwrap(), Value::Int(4));

        let count_paid = Expr::aggregate(AggregateFunc::Count, Some(Expr::ident("o", "total")), Some(paid));
        assert_eq!(eval.aggregate(&count_paid, &rows).unwrap(), Value::Int(2));

        let avg = Expr::aggregate(AggregateFunc::Avg, Some(Expr::ident("o", "total")), None);
        let plus_one = Expr::arithmetic(ArithmeticOp::Add, avg, Expr::lit(1));
        let mean = eval.aggregate(&plus_one, &rows).unwrap().as_f64().unwrap();
        assert!((mean - (35.0 / 3.0 + 1.0)).abs() < 1e-9);

        let max = Expr::aggregate(AggregateFunc::Max, Some(Expr::ident("o", "total")), None);
        assert_eq!(eval.aggregate(&max, &[]).unwrap(), Value::Null);
    }
}
