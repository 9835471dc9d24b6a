//! Query Compiler - conflict-free entities to SQL
//!
//! Clause assembly:
//! - SELECT: dimension fields, then aggregated metric fields, each aliased
//! - FROM the base table, JOINs inferred from the tables fields reference
//! - WHERE: one predicate per filter (list order), then the date range
//! - GROUP BY dimension fields, ORDER BY, LIMIT
//!
//! Table names, join conditions and the date column come from the knowledge
//! base schema.

pub mod statement;

pub use statement::{CompareOp, JoinClause, OrderBy, Predicate, SelectItem, SelectStatement, SqlValue};

use crate::error::{NlqError, Result};
use crate::knowledge::definition::table_of;
use crate::knowledge::DomainKnowledgeBase;
use crate::model::{Aggregation, Filter, FilterOperator, QueryEntities};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

lazy_static! {
    static ref PLAIN_FIELD: Regex =
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").unwrap();
}

const LIKE_ESCAPE: char = '!';

const RESERVED_WORDS: &[&str] = &[
    "all", "and", "as", "asc", "between", "by", "case", "desc", "distinct", "else", "end",
    "from", "group", "having", "in", "is", "join", "left", "like", "limit", "not", "null", "on",
    "or", "order", "right", "select", "table", "then", "union", "when", "where",
];

/// SQL with placeholders and the values bound to them, in order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

pub struct QueryCompiler {
    kb: Arc<DomainKnowledgeBase>,
}

impl QueryCompiler {
    pub fn new(kb: Arc<DomainKnowledgeBase>) -> Self {
        Self { kb }
    }

    pub fn compile(&self, entities: &QueryEntities) -> Result<String> {
        let sql = self.build(entities)?.render_inline();
        info!("✅ Generated SQL: {}", sql);
        Ok(sql)
    }

    pub fn compile_parameterized(&self, entities: &QueryEntities) -> Result<CompiledQuery> {
        let (sql, params) = self.build(entities)?.render_parameterized();
        debug!("Generated parameterized SQL with {} params", params.len());
        Ok(CompiledQuery { sql, params })
    }

    pub fn build(&self, entities: &QueryEntities) -> Result<SelectStatement> {
        if entities.metrics.is_empty() {
            return Err(NlqError::Compilation(
                "Cannot compile a query without metrics".to_string(),
            ));
        }
        if !entities.conflicts.is_empty() {
            return Err(NlqError::Compilation(format!(
                "Cannot compile while {} conflicts are unresolved",
                entities.conflicts.len()
            )));
        }

        let schema = self.kb.schema();
        let mut aliases = AliasSet::default();

        let mut select = Vec::new();
        let mut group_by = Vec::new();
        let mut dimension_aliases = Vec::new();
        for (idx, dimension) in entities.dimensions.iter().enumerate() {
            let field = dimension.database_field.as_deref().ok_or_else(|| {
                NlqError::Compilation(format!("Dimension '{}' has no database field", dimension.name))
            })?;
            let alias = aliases.claim(&dimension.name, "dimension", idx + 1);
            select.push(SelectItem {
                expr: field.to_string(),
                alias: alias.clone(),
            });
            group_by.push(field.to_string());
            dimension_aliases.push(alias);
        }

        let mut metric_aliases = Vec::new();
        for (idx, metric) in entities.metrics.iter().enumerate() {
            let field = metric.database_field.as_deref().ok_or_else(|| {
                NlqError::Compilation(format!("Metric '{}' has no database field", metric.name))
            })?;
            let aggregation = metric.aggregation.unwrap_or(Aggregation::Sum);
            let alias = aliases.claim(&metric.name, "metric", idx + 1);
            select.push(SelectItem {
                expr: aggregation.apply(field),
                alias: alias.clone(),
            });
            metric_aliases.push(alias);
        }

        let mut predicates = Vec::new();
        for filter in &entities.filters {
            predicates.push(filter_predicate(filter)?);
        }
        if let Some(range) = &entities.time_range {
            if let (Some(start), Some(end)) = (&range.start, &range.end) {
                predicates.push(Predicate::Between {
                    field: schema.date_column.clone(),
                    start: SqlValue::text(start.clone()),
                    end: SqlValue::text(end.clone()),
                });
            }
        }

        let referenced = entities
            .metrics
            .iter()
            .filter_map(|m| m.database_field.as_deref())
            .chain(entities.dimensions.iter().filter_map(|d| d.database_field.as_deref()))
            .chain(entities.filters.iter().filter_map(|f| f.database_field.as_deref()))
            .chain(
                entities
                    .time_range
                    .as_ref()
                    .filter(|r| r.start.is_some() && r.end.is_some())
                    .map(|_| schema.date_column.as_str()),
            );
        let joins = self.infer_joins(referenced)?;

        let order_by = entities.sort_by.as_ref().map(|sort| {
            let expr = entities
                .metrics
                .iter()
                .position(|m| m.name.eq_ignore_ascii_case(&sort.field))
                .map(|idx| metric_aliases[idx].clone())
                .or_else(|| {
                    entities
                        .dimensions
                        .iter()
                        .position(|d| d.name.eq_ignore_ascii_case(&sort.field))
                        .map(|idx| dimension_aliases[idx].clone())
                })
                .or_else(|| {
                    sort.database_field
                        .as_deref()
                        .or(Some(sort.field.as_str()))
                        .filter(|f| PLAIN_FIELD.is_match(f))
                        .map(str::to_string)
                })
                .unwrap_or_else(|| metric_aliases[0].clone());
            OrderBy {
                expr,
                direction: sort.direction,
            }
        });

        Ok(SelectStatement {
            select,
            from: schema.base_table.clone(),
            joins,
            predicates,
            group_by,
            order_by,
            limit: entities.limit.filter(|l| *l > 0),
        })
    }

    /// One join per distinct non-base table, in first-seen order, with
    /// prerequisite joins placed before the tables that need them.
    fn infer_joins<'a>(&self, fields: impl Iterator<Item = &'a str>) -> Result<Vec<JoinClause>> {
        let schema = self.kb.schema();
        let mut joined: HashSet<String> = HashSet::new();
        let mut joins = Vec::new();

        for field in fields {
            let Some(table) = table_of(field) else {
                continue;
            };
            let mut chain: Vec<String> = Vec::new();
            let mut current = table.to_string();
            loop {
                if current.eq_ignore_ascii_case(&schema.base_table)
                    || joined.contains(&current.to_lowercase())
                {
                    break;
                }
                if chain.iter().any(|t| t.eq_ignore_ascii_case(&current)) {
                    return Err(NlqError::Compilation(format!(
                        "Join rules for '{}' form a cycle",
                        table
                    )));
                }
                let rule = schema.join_for(&current).ok_or_else(|| {
                    NlqError::Compilation(format!("No join rule for table '{}'", current))
                })?;
                chain.push(current.clone());
                current = rule.from_table.clone();
            }

            for table in chain.into_iter().rev() {
                if let Some(rule) = schema.join_for(&table) {
                    joined.insert(table.to_lowercase());
                    joins.push(JoinClause {
                        join_type: rule.join_type,
                        table: rule.table.clone(),
                        on: rule.on.clone(),
                    });
                }
            }
        }
        Ok(joins)
    }
}

fn filter_predicate(filter: &Filter) -> Result<Predicate> {
    let field = filter.database_field.clone().ok_or_else(|| {
        NlqError::Compilation(format!("Filter on '{}' has no database field", filter.dimension))
    })?;
    let is_null = filter.value.trim().eq_ignore_ascii_case("null");

    let predicate = match filter.operator {
        FilterOperator::Equals | FilterOperator::GreaterThan | FilterOperator::LessThan
            if is_null =>
        {
            Predicate::IsNull { field }
        }
        FilterOperator::Equals => Predicate::Compare {
            field,
            op: CompareOp::Eq,
            value: SqlValue::from_literal(&filter.value),
        },
        FilterOperator::GreaterThan => Predicate::Compare {
            field,
            op: CompareOp::Gt,
            value: SqlValue::from_literal(&filter.value),
        },
        FilterOperator::LessThan => Predicate::Compare {
            field,
            op: CompareOp::Lt,
            value: SqlValue::from_literal(&filter.value),
        },
        FilterOperator::Contains => Predicate::Like {
            field,
            pattern: SqlValue::text(format!("%{}%", escape_like(&filter.value))),
            escape: Some(LIKE_ESCAPE),
        },
        FilterOperator::In => {
            let values: Vec<SqlValue> = filter.values().into_iter().map(SqlValue::from_literal).collect();
            if values.is_empty() {
                return Err(NlqError::Compilation(format!(
                    "Filter on '{}' has no values for IN",
                    filter.dimension
                )));
            }
            Predicate::In { field, values }
        }
    };

    Ok(if filter.is_negated {
        Predicate::Not(Box::new(predicate))
    } else {
        predicate
    })
}

/// Wildcards in the user's text match literally
fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if c == LIKE_ESCAPE || c == '%' || c == '_' {
            escaped.push(LIKE_ESCAPE);
        }
        escaped.push(c);
    }
    escaped
}

/// Hands out unique SQL-safe aliases
#[derive(Default)]
struct AliasSet {
    used: HashSet<String>,
}

impl AliasSet {
    fn claim(&mut self, name: &str, kind: &str, position: usize) -> String {
        let mut alias = sanitize_alias(name);
        if alias.is_empty()
            || alias.starts_with(|c: char| c.is_ascii_digit())
            || RESERVED_WORDS.contains(&alias.to_lowercase().as_str())
        {
            alias = format!("{}_{}", kind, position);
        }

        let base = alias.clone();
        let mut suffix = 2;
        while !self.used.insert(alias.to_lowercase()) {
            alias = format!("{}_{}", base, suffix);
            suffix += 1;
        }
        alias
    }
}

/// Spaces to underscores, then drop anything outside `[A-Za-z0-9_]`
pub fn sanitize_alias(name: &str) -> String {
    name.trim()
        .replace(' ', "_")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}
