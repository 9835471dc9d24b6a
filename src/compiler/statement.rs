//! SELECT statement AST and its two renderings.
//!
//! Values never reach the SQL text unescaped: `render_inline` quotes text
//! literals with `'` doubled, `render_parameterized` replaces every value with
//! a `$n` placeholder and returns the bound values in order. Clause order is
//! the same in both.

use crate::knowledge::JoinType;
use crate::model::SortDirection;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref NUMERIC: Regex = Regex::new(r"^-?\d+(\.\d+)?$").unwrap();
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SqlValue {
    Text(String),
    /// Decimal literal, kept as written
    Number(String),
}

impl SqlValue {
    /// Numeric-looking literals become numbers, everything else text
    pub fn from_literal(raw: &str) -> Self {
        let trimmed = raw.trim();
        if NUMERIC.is_match(trimmed) {
            SqlValue::Number(trimmed.to_string())
        } else {
            SqlValue::Text(raw.to_string())
        }
    }

    pub fn text(raw: impl Into<String>) -> Self {
        SqlValue::Text(raw.into())
    }

    fn inline(&self) -> String {
        match self {
            SqlValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
            SqlValue::Number(n) => n.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Gt,
    Lt,
}

impl CompareOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Gt => ">",
            CompareOp::Lt => "<",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare {
        field: String,
        op: CompareOp,
        value: SqlValue,
    },
    Like {
        field: String,
        pattern: SqlValue,
        /// Rendered as `ESCAPE '<c>'` when set
        escape: Option<char>,
    },
    In {
        field: String,
        values: Vec<SqlValue>,
    },
    IsNull {
        field: String,
    },
    Between {
        field: String,
        start: SqlValue,
        end: SqlValue,
    },
    Not(Box<Predicate>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectItem {
    pub expr: String,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinClause {
    pub join_type: JoinType,
    pub table: String,
    pub on: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub expr: String,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub select: Vec<SelectItem>,
    pub from: String,
    pub joins: Vec<JoinClause>,
    pub predicates: Vec<Predicate>,
    pub group_by: Vec<String>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<i64>,
}

/// Decides how a value appears in the SQL text
trait Binder {
    fn bind(&mut self, value: &SqlValue) -> String;
}

struct InlineBinder;

impl Binder for InlineBinder {
    fn bind(&mut self, value: &SqlValue) -> String {
        value.inline()
    }
}

#[derive(Default)]
struct PlaceholderBinder {
    params: Vec<SqlValue>,
}

impl Binder for PlaceholderBinder {
    fn bind(&mut self, value: &SqlValue) -> String {
        self.params.push(value.clone());
        format!("${}", self.params.len())
    }
}

impl Predicate {
    fn render(&self, binder: &mut dyn Binder) -> String {
        match self {
            Predicate::Compare { field, op, value } => {
                format!("{} {} {}", field, op.as_sql(), binder.bind(value))
            }
            Predicate::Like {
                field,
                pattern,
                escape,
            } => {
                let like = format!("{} LIKE {}", field, binder.bind(pattern));
                match escape {
                    Some(c) => format!("{} ESCAPE {}", like, SqlValue::text(c.to_string()).inline()),
                    None => like,
                }
            }
            Predicate::In { field, values } => {
                let bound: Vec<String> = values.iter().map(|v| binder.bind(v)).collect();
                format!("{} IN ({})", field, bound.join(", "))
            }
            Predicate::IsNull { field } => format!("{} IS NULL", field),
            Predicate::Between { field, start, end } => {
                let start = binder.bind(start);
                let end = binder.bind(end);
                format!("{} BETWEEN {} AND {}", field, start, end)
            }
            Predicate::Not(inner) => format!("NOT ({})", inner.render(binder)),
        }
    }
}

impl SelectStatement {
    pub fn render_inline(&self) -> String {
        self.render(&mut InlineBinder)
    }

    pub fn render_parameterized(&self) -> (String, Vec<SqlValue>) {
        let mut binder = PlaceholderBinder::default();
        let sql = self.render(&mut binder);
        (sql, binder.params)
    }

    fn render(&self, binder: &mut dyn Binder) -> String {
        let mut parts = Vec::new();

        let items: Vec<String> = self
            .select
            .iter()
            .map(|item| format!("{} AS {}", item.expr, item.alias))
            .collect();
        parts.push(format!("SELECT {}", items.join(", ")));
        parts.push(format!("FROM {}", self.from));

        for join in &self.joins {
            parts.push(format!("{} {} ON {}", join.join_type.as_sql(), join.table, join.on));
        }

        if !self.predicates.is_empty() {
            let rendered: Vec<String> = self.predicates.iter().map(|p| p.render(binder)).collect();
            parts.push(format!("WHERE {}", rendered.join(" AND ")));
        }

        if !self.group_by.is_empty() {
            parts.push(format!("GROUP BY {}", self.group_by.join(", ")));
        }

        if let Some(order) = &self.order_by {
            parts.push(format!("ORDER BY {} {}", order.expr, order.direction.as_sql()));
        }

        if let Some(limit) = self.limit.filter(|l| *l > 0) {
            parts.push(format!("LIMIT {}", limit));
        }

        parts.join(" ")
    }
}
