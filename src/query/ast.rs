// SPDX-License-Identifier: Apache-2.0

//! Query plan AST
//!
//! The validated representation of one query as handed over by the parser
//! and validator: ranges, the condition tree, projected values, sorting,
//! window and directives. Every expression node carries a [`NodeId`] so
//! traversals can recognise a node reached through more than one path.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::engine::types::Value;

use super::reference::Reference;

/// Directive marking existing `IN (...)` lists as already final.
pub const IN_VALUES_ARE_FINAL: &str = "InValuesAreFinal";

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one AST node. Clones of a node keep its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    pub fn next() -> Self {
        Self(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A column reference `range.column` or a property chain `range.a.b`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identifier {
    pub range: String,
    pub path: Vec<String>,
}

impl Identifier {
    pub fn new(range: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            range: range.into(),
            path: vec![column.into()],
        }
    }

    /// A base identifier is a direct column of its range (no property chain).
    pub fn is_base(&self) -> bool {
        self.path.len() == 1
    }

    pub fn column(&self) -> String {
        self.path.join(".")
    }

    /// Row key under which this identifier's value is stored.
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.range, self.column())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
    Like,
}

impl CompareOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "<>",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Like => "LIKE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl ArithmeticOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            ArithmeticOp::Add => "+",
            ArithmeticOp::Sub => "-",
            ArithmeticOp::Mul => "*",
            ArithmeticOp::Div => "/",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunc {
    Count,
    Sum,
    Min,
    Max,
    Avg,
    Any,
}

impl AggregateFunc {
    pub fn name(&self) -> &'static str {
        match self {
            AggregateFunc::Count => "count",
            AggregateFunc::Sum => "sum",
            AggregateFunc::Min => "min",
            AggregateFunc::Max => "max",
            AggregateFunc::Avg => "avg",
            AggregateFunc::Any => "any",
        }
    }
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Identifier(Identifier),
    /// Reference to a SELECT item by its alias (ORDER BY only)
    AliasRef(String),
    Literal(Value),
    Parameter(String),
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Arithmetic {
        op: ArithmeticOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    In {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    Function {
        name: String,
        args: Vec<Expr>,
    },
    Aggregate {
        func: AggregateFunc,
        arg: Option<Box<Expr>>,
        filter: Option<Box<Expr>>,
    },
}

/// One node of the condition / value tree
#[derive(Debug, Clone)]
pub struct Expr {
    pub id: NodeId,
    pub kind: ExprKind,
}

impl Expr {
    pub fn new(kind: ExprKind) -> Self {
        Self {
            id: NodeId::next(),
            kind,
        }
    }

    pub fn ident(range: impl Into<String>, column: impl Into<String>) -> Self {
        Self::new(ExprKind::Identifier(Identifier::new(range, column)))
    }

    /// Property chain identifier such as `o.customer.name`.
    pub fn path(range: impl Into<String>, path: &[&str]) -> Self {
        Self::new(ExprKind::Identifier(Identifier {
            range: range.into(),
            path: path.iter().map(|s| s.to_string()).collect(),
        }))
    }

    pub fn alias_ref(alias: impl Into<String>) -> Self {
        Self::new(ExprKind::AliasRef(alias.into()))
    }

    pub fn lit(value: impl Into<Value>) -> Self {
        Self::new(ExprKind::Literal(value.into()))
    }

    pub fn null() -> Self {
        Self::new(ExprKind::Literal(Value::Null))
    }

    pub fn param(name: impl Into<String>) -> Self {
        Self::new(ExprKind::Parameter(name.into()))
    }

    pub fn compare(op: CompareOp, left: Expr, right: Expr) -> Self {
        Self::new(ExprKind::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    pub fn eq(left: Expr, right: Expr) -> Self {
        Self::compare(CompareOp::Eq, left, right)
    }

    pub fn arithmetic(op: ArithmeticOp, left: Expr, right: Expr) -> Self {
        Self::new(ExprKind::Arithmetic {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    pub fn and(self, other: Expr) -> Self {
        Self::new(ExprKind::And(Box::new(self), Box::new(other)))
    }

    pub fn or(self, other: Expr) -> Self {
        Self::new(ExprKind::Or(Box::new(self), Box::new(other)))
    }

    pub fn not(expr: Expr) -> Self {
        Self::new(ExprKind::Not(Box::new(expr)))
    }

    pub fn in_list(expr: Expr, list: Vec<Expr>) -> Self {
        Self::new(ExprKind::In {
            expr: Box::new(expr),
            list,
            negated: false,
        })
    }

    pub fn is_null(expr: Expr, negated: bool) -> Self {
        Self::new(ExprKind::IsNull {
            expr: Box::new(expr),
            negated,
        })
    }

    pub fn function(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Self::new(ExprKind::Function {
            name: name.into(),
            args,
        })
    }

    pub fn aggregate(func: AggregateFunc, arg: Option<Expr>, filter: Option<Expr>) -> Self {
        Self::new(ExprKind::Aggregate {
            func,
            arg: arg.map(Box::new),
            filter: filter.map(Box::new),
        })
    }

    /// `1 = 0`, used to make a query return nothing without an empty `IN`.
    pub fn always_false() -> Self {
        Self::eq(Self::lit(1), Self::lit(0))
    }

    pub fn as_identifier(&self) -> Option<&Identifier> {
        match &self.kind {
            ExprKind::Identifier(ident) => Some(ident),
            _ => None,
        }
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self.kind, ExprKind::Aggregate { .. })
    }

    /// Direct children in evaluation order.
    pub fn children(&self) -> Vec<&Expr> {
        match &self.kind {
            ExprKind::Identifier(_)
            | ExprKind::AliasRef(_)
            | ExprKind::Literal(_)
            | ExprKind::Parameter(_) => Vec::new(),
            ExprKind::Compare { left, right, .. }
            | ExprKind::Arithmetic { left, right, .. }
            | ExprKind::And(left, right)
            | ExprKind::Or(left, right) => vec![left, right],
            ExprKind::Not(inner) => vec![inner],
            ExprKind::In { expr, list, .. } => {
                let mut out: Vec<&Expr> = vec![expr];
                out.extend(list.iter());
                out
            }
            ExprKind::IsNull { expr, .. } => vec![expr],
            ExprKind::Function { args, .. } => args.iter().collect(),
            ExprKind::Aggregate { arg, filter, .. } => {
                arg.iter().chain(filter.iter()).map(|b| b.as_ref()).collect()
            }
        }
    }

    /// Collects every identifier in this subtree, including those nested in
    /// aggregate filters.
    pub fn identifiers(&self) -> Vec<&Identifier> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if let ExprKind::Identifier(ident) = &node.kind {
                out.push(ident);
            }
            stack.extend(node.children().into_iter().rev());
        }
        out
    }

    /// Flattens a tree of `AND` nodes into its conjuncts.
    pub fn conjuncts(&self) -> Vec<&Expr> {
        match &self.kind {
            ExprKind::And(left, right) => {
                let mut out = left.conjuncts();
                out.extend(right.conjuncts());
                out
            }
            _ => vec![self],
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ExprKind::Identifier(ident) => write!(f, "{}", ident.qualified()),
            ExprKind::AliasRef(alias) => write!(f, "{alias}"),
            ExprKind::Literal(Value::Text(s)) => write!(f, "'{s}'"),
            ExprKind::Literal(v) => write!(f, "{v}"),
            ExprKind::Parameter(name) => write!(f, ":{name}"),
            ExprKind::Compare { op, left, right } => {
                write!(f, "{left} {} {right}", op.as_sql())
            }
            ExprKind::Arithmetic { op, left, right } => {
                write!(f, "({left} {} {right})", op.as_sql())
            }
            ExprKind::And(left, right) => write!(f, "({left} AND {right})"),
            ExprKind::Or(left, right) => write!(f, "({left} OR {right})"),
            ExprKind::Not(inner) => write!(f, "NOT {inner}"),
            ExprKind::In {
                expr,
                list,
                negated,
            } => {
                let items: Vec<String> = list.iter().map(|e| e.to_string()).collect();
                let not = if *negated { " NOT" } else { "" };
                write!(f, "{expr}{not} IN ({})", items.join(", "))
            }
            ExprKind::IsNull { expr, negated } => {
                let not = if *negated { " NOT" } else { "" };
                write!(f, "{expr} IS{not} NULL")
            }
            ExprKind::Function { name, args } => {
                let items: Vec<String> = args.iter().map(|e| e.to_string()).collect();
                write!(f, "{name}({})", items.join(", "))
            }
            ExprKind::Aggregate { func, arg, filter } => {
                match arg {
                    Some(arg) => write!(f, "{}({arg}", func.name())?,
                    None => write!(f, "{}(*", func.name())?,
                }
                if let Some(filter) = filter {
                    write!(f, " WHERE {filter}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Where a range's rows come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeSource {
    /// A relational entity, resolved to a table through entity metadata
    Entity { entity: String },
    /// A flat JSON document, optionally narrowed by a JSON path expression
    Json {
        path: String,
        filter: Option<String>,
    },
}

/// How a range attaches to the ranges before it
#[derive(Debug, Clone)]
pub struct JoinProperty {
    /// The `via` condition
    pub condition: Expr,
    /// Required ranges are inner-joined, optional ranges left-joined
    pub required: bool,
}

/// A named binding to one data source
#[derive(Debug, Clone)]
pub struct Range {
    pub name: String,
    pub source: RangeSource,
    pub join: Option<JoinProperty>,
    pub references: Vec<Reference>,
}

impl Range {
    pub fn entity(name: impl Into<String>, entity: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: RangeSource::Entity {
                entity: entity.into(),
            },
            join: None,
            references: Vec::new(),
        }
    }

    pub fn json(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: RangeSource::Json {
                path: path.into(),
                filter: None,
            },
            join: None,
            references: Vec::new(),
        }
    }

    /// Sets the JSON path filter of a JSON range. No effect on entity ranges.
    pub fn with_filter(mut self, expression: impl Into<String>) -> Self {
        if let RangeSource::Json { filter, .. } = &mut self.source {
            *filter = Some(expression.into());
        }
        self
    }

    pub fn via(mut self, condition: Expr, required: bool) -> Self {
        self.join = Some(JoinProperty {
            condition,
            required,
        });
        self
    }

    pub fn is_json(&self) -> bool {
        matches!(self.source, RangeSource::Json { .. })
    }

    /// Distinct referenced columns in first-seen order.
    pub fn referenced_columns(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for reference in &self.references {
            if !out.contains(&reference.column.as_str()) {
                out.push(&reference.column);
            }
        }
        out
    }
}

/// One projected value with its optional alias
#[derive(Debug, Clone)]
pub struct SelectItem {
    pub expr: Expr,
    pub alias: Option<String>,
}

impl SelectItem {
    pub fn new(expr: Expr) -> Self {
        Self { expr, alias: None }
    }

    pub fn aliased(expr: Expr, alias: impl Into<String>) -> Self {
        Self {
            expr,
            alias: Some(alias.into()),
        }
    }

    /// Column name of this item in the output rows.
    pub fn output_name(&self) -> String {
        match &self.alias {
            Some(alias) => alias.clone(),
            None => self.expr.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
pub struct SortItem {
    pub expr: Expr,
    pub direction: SortDirection,
}

impl SortItem {
    pub fn asc(expr: Expr) -> Self {
        Self {
            expr,
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(expr: Expr) -> Self {
        Self {
            expr,
            direction: SortDirection::Desc,
        }
    }
}

/// Sort items and where they are applied
#[derive(Debug, Clone, Default)]
pub struct SortSpec {
    pub items: Vec<SortItem>,
    /// Ordering is decided by application code after fetching, so native
    /// windowing would cut the wrong page.
    pub in_application: bool,
}

/// Parsed and validated query
#[derive(Debug, Clone, Default)]
pub struct QueryPlan {
    pub ranges: Vec<Range>,
    pub conditions: Option<Expr>,
    pub values: Vec<SelectItem>,
    pub sort: Option<SortSpec>,
    /// Page index
    pub window: Option<u64>,
    /// Page size
    pub window_size: Option<u64>,
    pub unique: bool,
    pub directives: HashMap<String, Value>,
}

impl QueryPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_range(mut self, range: Range) -> Self {
        self.ranges.push(range);
        self
    }

    pub fn with_condition(mut self, condition: Expr) -> Self {
        self.and_condition(condition);
        self
    }

    pub fn with_value(mut self, item: SelectItem) -> Self {
        self.values.push(item);
        self
    }

    pub fn with_sort(mut self, item: SortItem) -> Self {
        self.sort.get_or_insert_with(SortSpec::default).items.push(item);
        self
    }

    pub fn with_window(mut self, window: u64, window_size: u64) -> Self {
        self.window = Some(window);
        self.window_size = Some(window_size);
        self
    }

    pub fn with_unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    pub fn with_directive(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.directives.insert(name.into(), value.into());
        self
    }

    pub fn has_directive(&self, name: &str) -> bool {
        self.directives.get(name).is_some_and(Value::truthy)
    }

    /// Conjoins `condition` with the existing WHERE tree.
    pub fn and_condition(&mut self, condition: Expr) {
        self.conditions = Some(match self.conditions.take() {
            Some(existing) => existing.and(condition),
            None => condition,
        });
    }

    /// The primary range: the first range without a join property.
    pub fn base_range(&self) -> Option<&Range> {
        self.ranges.iter().find(|r| r.join.is_none())
    }

    /// Resolves an ORDER BY alias to the aliased SELECT expression.
    pub fn select_by_alias(&self, alias: &str) -> Option<&SelectItem> {
        self.values
            .iter()
            .find(|item| item.alias.as_deref() == Some(alias))
    }

    pub fn has_aggregates(&self) -> bool {
        self.values.iter().any(|item| contains_aggregate(&item.expr))
    }
}

pub(crate) fn contains_aggregate(expr: &Expr) -> bool {
    expr.is_aggregate() || expr.children().into_iter().any(contains_aggregate)
}
