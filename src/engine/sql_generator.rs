//! SQL Generator
//!
//! Renders per-range fetch requests as parameterized SELECT statements.
//! Literals and bound parameters are never inlined: every value becomes a
//! positional placeholder and travels next to the SQL text.

use serde::{Deserialize, Serialize};

use crate::engine::error::SqlGenerationError;
use crate::engine::traits::SqlGenerator;
use crate::engine::types::{Parameters, Value};
use crate::query::ast::{Expr, ExprKind, SortDirection, SortItem};

/// SQL dialect for different database drivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    Postgres,
    MySql,
    Sqlite,
    #[default]
    DuckDb,
}

impl SqlDialect {
    /// Quote an identifier according to the dialect
    pub fn quote_ident(&self, name: &str) -> String {
        match self {
            SqlDialect::Postgres | SqlDialect::Sqlite | SqlDialect::DuckDb => {
                format!("\"{}\"", name.replace('"', "\"\""))
            }
            SqlDialect::MySql => {
                format!("`{}`", name.replace('`', "``"))
            }
        }
    }

    /// Quote a possibly schema-qualified table name (`schema.table`)
    pub fn qualified_table(&self, table_name: &str) -> String {
        table_name
            .split('.')
            .map(|part| self.quote_ident(part))
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Positional placeholder for the `index`-th bound value (1-based)
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            SqlDialect::Postgres => format!("${index}"),
            SqlDialect::MySql | SqlDialect::Sqlite | SqlDialect::DuckDb => "?".to_string(),
        }
    }
}

/// Everything needed to fetch one range from a relational backend
#[derive(Debug, Clone)]
pub struct RangeRequest<'a> {
    pub table: String,
    pub alias: &'a str,
    /// Columns to project; empty selects every column of the range
    pub columns: Vec<String>,
    /// Range-local conjuncts, combined with AND
    pub conditions: Vec<&'a Expr>,
    pub order_by: Vec<&'a SortItem>,
    pub distinct: bool,
}

/// SQL text plus the values bound to its placeholders, in order
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedSql {
    pub text: String,
    pub params: Vec<Value>,
}

/// Reference generator emitting portable SELECT statements
#[derive(Debug, Clone, Copy, Default)]
pub struct AnsiSqlGenerator {
    dialect: SqlDialect,
}

impl AnsiSqlGenerator {
    pub fn new(dialect: SqlDialect) -> Self {
        Self { dialect }
    }
}

impl SqlGenerator for AnsiSqlGenerator {
    fn to_sql(
        &self,
        request: &RangeRequest<'_>,
        parameters: &Parameters,
    ) -> Result<GeneratedSql, SqlGenerationError> {
        let mut writer = SqlWriter {
            dialect: self.dialect,
            parameters,
            params: Vec::new(),
        };
        let alias = self.dialect.quote_ident(request.alias);

        let columns = if request.columns.is_empty() {
            format!("{alias}.*")
        } else {
            request
                .columns
                .iter()
                .map(|c| format!("{alias}.{}", self.dialect.quote_ident(c)))
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut sql = format!(
            "SELECT {}{} FROM {} AS {}",
            if request.distinct { "DISTINCT " } else { "" },
            columns,
            self.dialect.qualified_table(&request.table),
            alias
        );

        if !request.conditions.is_empty() {
            let parts = request
                .conditions
                .iter()
                .map(|c| writer.expr(c))
                .collect::<Result<Vec<_>, _>>()?;
            sql.push_str(" WHERE ");
            sql.push_str(&parts.join(" AND "));
        }

        if !request.order_by.is_empty() {
            let parts = request
                .order_by
                .iter()
                .map(|item| {
                    let direction = match item.direction {
                        SortDirection::Asc => "ASC",
                        SortDirection::Desc => "DESC",
                    };
                    writer.expr(&item.expr).map(|e| format!("{e} {direction}"))
                })
                .collect::<Result<Vec<_>, _>>()?;
            sql.push_str(" ORDER BY ");
            sql.push_str(&parts.join(", "));
        }

        Ok(GeneratedSql {
            text: sql,
            params: writer.params,
        })
    }
}

struct SqlWriter<'p> {
    dialect: SqlDialect,
    parameters: &'p Parameters,
    params: Vec<Value>,
}

impl SqlWriter<'_> {
    fn bind(&mut self, value: Value) -> String {
        self.params.push(value);
        self.dialect.placeholder(self.params.len())
    }

    fn parameter(&self, name: &str) -> Result<&Value, SqlGenerationError> {
        self.parameters
            .get(name)
            .ok_or_else(|| SqlGenerationError::new(format!("parameter ':{name}' is not bound")))
    }

    fn expr(&mut self, expr: &Expr) -> Result<String, SqlGenerationError> {
        Ok(match &expr.kind {
            ExprKind::Identifier(ident) if ident.is_base() => format!(
                "{}.{}",
                self.dialect.quote_ident(&ident.range),
                self.dialect.quote_ident(&ident.path[0])
            ),
            ExprKind::Identifier(ident) => {
                return Err(SqlGenerationError::new(format!(
                    "property chain '{}' cannot be rendered as SQL",
                    ident.qualified()
                )))
            }
            ExprKind::Literal(Value::Null) => "NULL".to_string(),
            ExprKind::Literal(value) => self.bind(value.clone()),
            ExprKind::Parameter(name) => {
                let value = self.parameter(name)?.clone();
                match value {
                    Value::Array(_) => {
                        return Err(SqlGenerationError::new(format!(
                            "list parameter ':{name}' is only allowed inside IN"
                        )))
                    }
                    Value::Null => "NULL".to_string(),
                    value => self.bind(value),
                }
            }
            ExprKind::Compare { op, left, right } => {
                let l = self.expr(left)?;
                let r = self.expr(right)?;
                format!("({l} {} {r})", op.as_sql())
            }
            ExprKind::Arithmetic { op, left, right } => {
                let l = self.expr(left)?;
                let r = self.expr(right)?;
                format!("({l} {} {r})", op.as_sql())
            }
            ExprKind::And(left, right) => {
                let l = self.expr(left)?;
                let r = self.expr(right)?;
                format!("({l} AND {r})")
            }
            ExprKind::Or(left, right) => {
                let l = self.expr(left)?;
                let r = self.expr(right)?;
                format!("({l} OR {r})")
            }
            ExprKind::Not(inner) => format!("(NOT {})", self.expr(inner)?),
            ExprKind::IsNull { expr, negated } => format!(
                "({} IS {}NULL)",
                self.expr(expr)?,
                if *negated { "NOT " } else { "" }
            ),
            ExprKind::In {
                expr,
                list,
                negated,
            } => {
                let needle = self.expr(expr)?;
                let mut items = Vec::with_capacity(list.len());
                for item in list {
                    match &item.kind {
                        ExprKind::Parameter(name) => {
                            let value = self.parameter(name)?.clone();
                            match value {
                                Value::Array(values) => {
                                    for value in values {
                                        items.push(self.bind(value));
                                    }
                                }
                                value => items.push(self.bind(value)),
                            }
                        }
                        _ => items.push(self.expr(item)?),
                    }
                }
                match (items.is_empty(), negated) {
                    (true, false) => "(1 = 0)".to_string(),
                    (true, true) => "(1 = 1)".to_string(),
                    (false, negated) => format!(
                        "({needle} {}IN ({}))",
                        if *negated { "NOT " } else { "" },
                        items.join(", ")
                    ),
                }
            }
            ExprKind::Function { name, args } => {
                let function = match name.to_ascii_lowercase().as_str() {
                    "lower" => "LOWER",
                    "upper" => "UPPER",
                    "length" => "LENGTH",
                    "coalesce" => "COALESCE",
                    "abs" => "ABS",
                    _ => {
                        return Err(SqlGenerationError::new(format!(
                            "unsupported function '{name}'"
                        )))
                    }
                };
                let rendered = args
                    .iter()
                    .map(|a| self.expr(a))
                    .collect::<Result<Vec<_>, _>>()?;
                format!("{function}({})", rendered.join(", "))
            }
            ExprKind::Aggregate { func, .. } => {
                return Err(SqlGenerationError::new(format!(
                    "aggregate '{}' cannot be pushed into a range fetch",
                    func.name()
                )))
            }
            ExprKind::AliasRef(alias) => {
                return Err(SqlGenerationError::new(format!(
                    "alias '{alias}' cannot be pushed into a range fetch"
                )))
            }
        })
    }
}
