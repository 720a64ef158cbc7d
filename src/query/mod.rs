//! # Query Builder
//!
//! Builds an ordered sequence of per-column conditions plus ordering,
//! paging and locking flags, renders them to parameterised SQL through the
//! dialect adapter, and evaluates them in memory against candidate rows.
//!
//! The same builder drives both cache tiers: the planner turns it into
//! index lookups where possible, the renderer turns whatever remains into
//! SQL for the database executor.

pub mod planner;

pub use planner::{plan, Plan, QueryFragment, QuerySet, RangeBound};

use crate::error::{CacheError, Result};
use crate::executor::Dialect;
use crate::value::{Record, RecordType, Value};

/// One predicate over a column
#[derive(Debug, Clone)]
pub enum Condition {
    /// `col = value`
    Eq(String, Value),
    /// `col <> value`
    Neq(String, Value),
    /// `col IN (values…)`
    In(String, Vec<Value>),
    /// `col > value`
    Gt(String, Value),
    /// `col >= value`
    Gte(String, Value),
    /// `col < value`
    Lt(String, Value),
    /// `col <= value`
    Lte(String, Value),
    /// `col IS NULL`
    IsNull(String),
    /// Raw SQL appended verbatim; forces direct database execution
    Raw(String),
}

impl Condition {
    /// Column the condition constrains, if any
    pub fn column(&self) -> Option<&str> {
        match self {
            Condition::Eq(c, _)
            | Condition::Neq(c, _)
            | Condition::In(c, _)
            | Condition::Gt(c, _)
            | Condition::Gte(c, _)
            | Condition::Lt(c, _)
            | Condition::Lte(c, _)
            | Condition::IsNull(c) => Some(c),
            Condition::Raw(_) => None,
        }
    }

    /// Evaluate the condition against a row. Raw conditions cannot be
    /// evaluated in memory and never reach this path; they match nothing.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Condition::Eq(column, value) => record
                .get(column)
                .map(|v| v.eq_value(value))
                .unwrap_or(false),
            Condition::Neq(column, value) => record
                .get(column)
                .map(|v| v.neq_value(value))
                .unwrap_or(false),
            Condition::In(column, values) => record
                .get(column)
                .map(|v| values.iter().any(|candidate| v.eq_value(candidate)))
                .unwrap_or(false),
            Condition::Gt(column, value) => record
                .get(column)
                .map(|v| v.gt_value(value))
                .unwrap_or(false),
            Condition::Gte(column, value) => record
                .get(column)
                .map(|v| v.gte_value(value))
                .unwrap_or(false),
            Condition::Lt(column, value) => record
                .get(column)
                .map(|v| v.lt_value(value))
                .unwrap_or(false),
            Condition::Lte(column, value) => record
                .get(column)
                .map(|v| v.lte_value(value))
                .unwrap_or(false),
            Condition::IsNull(column) => record.get(column).map(|v| v.is_nil()).unwrap_or(false),
            Condition::Raw(_) => false,
        }
    }
}

/// One ORDER BY tuple
#[derive(Debug, Clone)]
pub struct OrderBy {
    /// Column to order by
    pub column: String,
    /// Descending when true
    pub desc: bool,
}

/// Query builder over one table
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    table: String,
    conditions: Vec<Condition>,
    order_by: Vec<OrderBy>,
    limit: Option<u64>,
    offset: Option<u64>,
    for_update: bool,
}

impl QueryBuilder {
    /// Start a query against a table
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            conditions: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            for_update: false,
        }
    }

    /// Table the query targets
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Declared conditions in order
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// ORDER BY tuples
    pub fn order_by(&self) -> &[OrderBy] {
        &self.order_by
    }

    /// LIMIT, when set
    pub fn limit_value(&self) -> Option<u64> {
        self.limit
    }

    /// OFFSET, when set
    pub fn offset_value(&self) -> Option<u64> {
        self.offset
    }

    /// Whether the query locks rows
    pub fn is_for_update(&self) -> bool {
        self.for_update
    }

    /// `col = value`
    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.conditions
            .push(Condition::Eq(column.to_string(), value.into()));
        self
    }

    /// `col <> value`
    pub fn neq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.conditions
            .push(Condition::Neq(column.to_string(), value.into()));
        self
    }

    /// `col IN (values…)`. Values are deduplicated by their canonical
    /// string before the planner expands them into fragments.
    pub fn is_in<T: Into<Value>>(mut self, column: &str, values: Vec<T>) -> Self {
        let mut seen = std::collections::HashSet::new();
        let mut deduped = Vec::new();
        for value in values {
            let value = value.into();
            if seen.insert(value.canonical_string()) {
                deduped.push(value);
            }
        }
        self.conditions
            .push(Condition::In(column.to_string(), deduped));
        self
    }

    /// `col > value`
    pub fn gt(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.conditions
            .push(Condition::Gt(column.to_string(), value.into()));
        self
    }

    /// `col >= value`
    pub fn gte(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.conditions
            .push(Condition::Gte(column.to_string(), value.into()));
        self
    }

    /// `col < value`
    pub fn lt(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.conditions
            .push(Condition::Lt(column.to_string(), value.into()));
        self
    }

    /// `col <= value`
    pub fn lte(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.conditions
            .push(Condition::Lte(column.to_string(), value.into()));
        self
    }

    /// `col IS NULL`
    pub fn is_null(mut self, column: &str) -> Self {
        self.conditions.push(Condition::IsNull(column.to_string()));
        self
    }

    /// Raw SQL predicate, appended verbatim. Disables cache planning.
    pub fn raw(mut self, sql: &str) -> Self {
        self.conditions.push(Condition::Raw(sql.to_string()));
        self
    }

    /// Ascending ORDER BY tuple
    pub fn order_asc(mut self, column: &str) -> Self {
        self.order_by.push(OrderBy {
            column: column.to_string(),
            desc: false,
        });
        self
    }

    /// Descending ORDER BY tuple
    pub fn order_desc(mut self, column: &str) -> Self {
        self.order_by.push(OrderBy {
            column: column.to_string(),
            desc: true,
        });
        self
    }

    /// LIMIT
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// OFFSET
    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Lock matched rows (`SELECT … FOR UPDATE`)
    pub fn for_update(mut self) -> Self {
        self.for_update = true;
        self
    }

    /// Copy of the query without LIMIT/OFFSET, used by count operations
    pub fn without_paging(&self) -> Self {
        let mut copy = self.clone();
        copy.limit = None;
        copy.offset = None;
        copy
    }

    /// Whether every non-raw condition can be evaluated in memory
    pub fn has_raw(&self) -> bool {
        self.conditions
            .iter()
            .any(|c| matches!(c, Condition::Raw(_)))
    }

    /// Apply the full condition list to a row
    pub fn matches(&self, record: &Record) -> bool {
        self.conditions.iter().all(|c| c.matches(record))
    }

    /// Apply LIMIT/OFFSET in place
    pub fn page<T>(&self, rows: &mut Vec<T>) {
        if let Some(offset) = self.offset {
            let offset = offset as usize;
            if offset >= rows.len() {
                rows.clear();
            } else {
                rows.drain(..offset);
            }
        }
        if let Some(limit) = self.limit {
            rows.truncate(limit as usize);
        }
    }

    /// Stable-sort records by the ORDER BY tuples and page the result.
    /// Results merged from stash, server and database are re-sorted as a
    /// whole, never per source.
    pub fn sort_and_page_records<R: std::borrow::Borrow<Record>>(&self, rows: &mut Vec<R>) {
        if !self.order_by.is_empty() {
            rows.sort_by(|a, b| {
                let (a, b) = (a.borrow(), b.borrow());
                for order in &self.order_by {
                    let av = a.get(&order.column);
                    let bv = b.get(&order.column);
                    let ord = match (av, bv) {
                        (Some(av), Some(bv)) => av.total_cmp(bv),
                        (None, None) => std::cmp::Ordering::Equal,
                        (None, Some(_)) => std::cmp::Ordering::Less,
                        (Some(_), None) => std::cmp::Ordering::Greater,
                    };
                    let ord = if order.desc { ord.reverse() } else { ord };
                    if ord != std::cmp::Ordering::Equal {
                        return ord;
                    }
                }
                std::cmp::Ordering::Equal
            });
        }
        self.page(rows);
    }

    /// Render `SELECT <all columns> FROM table WHERE …` with the builder's
    /// ordering, paging and locking flags
    pub fn to_select_sql(&self, ty: &RecordType, dialect: Dialect) -> Result<(String, Vec<Value>)> {
        let columns: Vec<String> = ty
            .columns()
            .iter()
            .map(|c| dialect.quote(&c.name))
            .collect();
        let mut sql = format!(
            "SELECT {} FROM {}",
            columns.join(", "),
            dialect.quote(&self.table)
        );
        let mut args = Vec::new();
        let where_clause = render_where(&self.conditions, dialect, &mut args)?;
        if !where_clause.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&where_clause);
        }
        if !self.order_by.is_empty() {
            let parts: Vec<String> = self
                .order_by
                .iter()
                .map(|o| {
                    format!(
                        "{}{}",
                        dialect.quote(&o.column),
                        if o.desc { " DESC" } else { "" }
                    )
                })
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&parts.join(", "));
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        if let Some(offset) = self.offset {
            sql.push_str(&format!(" OFFSET {}", offset));
        }
        if self.for_update {
            sql.push_str(dialect.for_update_suffix());
        }
        Ok((sql, args))
    }

    /// Render `DELETE FROM table WHERE …`
    pub fn to_delete_sql(&self, dialect: Dialect) -> Result<(String, Vec<Value>)> {
        let mut sql = format!("DELETE FROM {}", dialect.quote(&self.table));
        let mut args = Vec::new();
        let where_clause = render_where(&self.conditions, dialect, &mut args)?;
        if !where_clause.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&where_clause);
        }
        Ok((sql, args))
    }

    /// Render `UPDATE table SET a = ?, … WHERE …`
    pub fn to_update_sql(
        &self,
        assignments: &[(String, Value)],
        dialect: Dialect,
    ) -> Result<(String, Vec<Value>)> {
        if assignments.is_empty() {
            return Err(CacheError::InvalidQuery(
                "update requires at least one assignment".to_string(),
            ));
        }
        let mut args: Vec<Value> = Vec::with_capacity(assignments.len() + 4);
        let mut sets = Vec::with_capacity(assignments.len());
        for (column, value) in assignments {
            args.push(value.clone());
            sets.push(format!(
                "{} = {}",
                dialect.quote(column),
                dialect.placeholder(args.len())
            ));
        }
        let mut sql = format!(
            "UPDATE {} SET {}",
            dialect.quote(&self.table),
            sets.join(", ")
        );
        let where_clause = render_where(&self.conditions, dialect, &mut args)?;
        if !where_clause.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&where_clause);
        }
        Ok((sql, args))
    }
}

/// Render `INSERT INTO table (columns…) VALUES (…)`
pub fn insert_sql(
    table: &str,
    columns: &[(String, Value)],
    dialect: Dialect,
) -> Result<(String, Vec<Value>)> {
    if columns.is_empty() {
        return Err(CacheError::InvalidQuery(
            "insert requires at least one column".to_string(),
        ));
    }
    let names: Vec<String> = columns.iter().map(|(c, _)| dialect.quote(c)).collect();
    let mut args = Vec::with_capacity(columns.len());
    let mut placeholders = Vec::with_capacity(columns.len());
    for (_, value) in columns {
        args.push(value.clone());
        placeholders.push(dialect.placeholder(args.len()));
    }
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        dialect.quote(table),
        names.join(", "),
        placeholders.join(", ")
    );
    Ok((sql, args))
}

/// Render a conjunction of conditions, pushing parameters onto `args`
pub(crate) fn render_where(
    conditions: &[Condition],
    dialect: Dialect,
    args: &mut Vec<Value>,
) -> Result<String> {
    let mut parts = Vec::with_capacity(conditions.len());
    for condition in conditions {
        match condition {
            Condition::Eq(column, value) => {
                args.push(value.clone());
                parts.push(format!(
                    "{} = {}",
                    dialect.quote(column),
                    dialect.placeholder(args.len())
                ));
            }
            Condition::Neq(column, value) => {
                args.push(value.clone());
                parts.push(format!(
                    "{} <> {}",
                    dialect.quote(column),
                    dialect.placeholder(args.len())
                ));
            }
            Condition::In(column, values) => {
                if values.is_empty() {
                    return Err(CacheError::InvalidQuery(format!(
                        "IN condition on {} has no values",
                        column
                    )));
                }
                let mut placeholders = Vec::with_capacity(values.len());
                for value in values {
                    args.push(value.clone());
                    placeholders.push(dialect.placeholder(args.len()));
                }
                parts.push(format!(
                    "{} IN ({})",
                    dialect.quote(column),
                    placeholders.join(", ")
                ));
            }
            Condition::Gt(column, value) => {
                args.push(value.clone());
                parts.push(format!(
                    "{} > {}",
                    dialect.quote(column),
                    dialect.placeholder(args.len())
                ));
            }
            Condition::Gte(column, value) => {
                args.push(value.clone());
                parts.push(format!(
                    "{} >= {}",
                    dialect.quote(column),
                    dialect.placeholder(args.len())
                ));
            }
            Condition::Lt(column, value) => {
                args.push(value.clone());
                parts.push(format!(
                    "{} < {}",
                    dialect.quote(column),
                    dialect.placeholder(args.len())
                ));
            }
            Condition::Lte(column, value) => {
                args.push(value.clone());
                parts.push(format!(
                    "{} <= {}",
                    dialect.quote(column),
                    dialect.placeholder(args.len())
                ));
            }
            Condition::IsNull(column) => {
                parts.push(format!("{} IS NULL", dialect.quote(column)));
            }
            Condition::Raw(sql) => {
                parts.push(format!("({})", sql));
            }
        }
    }
    Ok(parts.join(" AND "))
}
