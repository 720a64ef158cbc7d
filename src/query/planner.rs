//! # Query Planner
//!
//! Turns a [`QueryBuilder`] into an executable plan against a table's
//! registered indexes:
//!
//! - **Point plan**: an index whose full column tuple is covered by the
//!   conjunction of `Eq`/`In` predicates. `In` predicates expand into one
//!   fragment per value combination; each fragment hashes to a distinct
//!   cache key. Remaining predicates become in-memory filters.
//! - **Range plan**: no covering index, but some index has a prefix of
//!   `Eq`-bound columns followed by range bounds. Used by the in-process
//!   tier's B+Tree scans.
//! - **Full scan / direct**: nothing matches. The in-process tier walks the
//!   whole tree; the networked tier sends the query straight to the
//!   database.
//!
//! Indexes are scanned longest-first so the most selective covering tuple
//! wins. Condition values are type-aligned to the column types before any
//! comparison takes place.

use crate::error::{CacheError, Result};
use crate::executor::Dialect;
use crate::index::{CacheKey, Index};
use crate::query::{render_where, Condition, QueryBuilder};
use crate::value::{ColumnType, Record, RecordType, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// One executable fragment: a single index-key lookup
#[derive(Debug, Clone)]
pub struct QueryFragment {
    /// Index the fragment resolves through
    pub index: Arc<Index>,
    /// Bindings covering the index tuple, in index-column order
    pub bindings: Vec<(String, Value)>,
    /// Cache key the fragment hashes to
    pub cache_key: CacheKey,
}

impl QueryFragment {
    /// Whether a row carries exactly this fragment's binding values
    pub fn matches(&self, record: &Record) -> bool {
        self.bindings.iter().all(|(column, value)| {
            record
                .get(column)
                .map(|v| v.eq_value(value))
                .unwrap_or(false)
        })
    }
}

/// Inclusive or exclusive range bound on one column
#[derive(Debug, Clone)]
pub struct RangeBound {
    /// Bound value
    pub value: Value,
    /// Whether the bound itself is included
    pub inclusive: bool,
}

/// Executable plan for one query
#[derive(Debug, Clone)]
pub enum Plan {
    /// Index fully covered by equality predicates; one fragment per
    /// `In`-combination
    Point {
        /// Fragments in expansion order
        fragments: Vec<QueryFragment>,
        /// Residual predicates applied in memory
        filters: Vec<Condition>,
    },
    /// Prefix-bound range scan
    Range {
        /// Index supplying the scan order
        index: Arc<Index>,
        /// Leading `Eq`-bound columns in index order
        prefix: Vec<(String, Value)>,
        /// Lower bound on the first unbound column
        lower: Option<RangeBound>,
        /// Upper bound on the first unbound column
        upper: Option<RangeBound>,
        /// Residual predicates applied in memory
        filters: Vec<Condition>,
    },
    /// No usable index; scan everything and filter in memory
    FullScan {
        /// Residual predicates applied in memory
        filters: Vec<Condition>,
    },
    /// Uncacheable query (raw SQL present); execute directly
    Direct,
}

/// Build a plan for a query against a table's indexes
pub fn plan(builder: &QueryBuilder, indexes: &[Arc<Index>], ty: &RecordType) -> Result<Plan> {
    if builder.has_raw() {
        return Ok(Plan::Direct);
    }

    let conditions = align_conditions(builder.conditions(), ty)?;

    // Equality bindings available for index coverage.
    let mut eq: HashMap<&str, &Value> = HashMap::new();
    let mut ins: HashMap<&str, &Vec<Value>> = HashMap::new();
    for condition in &conditions {
        match condition {
            Condition::Eq(column, value) => {
                eq.insert(column.as_str(), value);
            }
            Condition::In(column, values) => {
                ins.insert(column.as_str(), values);
            }
            _ => {}
        }
    }

    let mut candidates: Vec<&Arc<Index>> = indexes.iter().collect();
    candidates.sort_by(|a, b| b.columns().len().cmp(&a.columns().len()));

    // Point plan: longest index whose whole tuple is Eq/In-covered.
    for index in &candidates {
        let covered = index
            .columns()
            .iter()
            .all(|c| eq.contains_key(c.as_str()) || ins.contains_key(c.as_str()));
        if !covered {
            continue;
        }
        let fragments = expand_fragments(index, &eq, &ins)?;
        let filters = residual_filters(&conditions, index.columns());
        return Ok(Plan::Point { fragments, filters });
    }

    // Range plan: the widest Eq-bound prefix, with bounds on the column
    // right after the prefix when present.
    let mut best: Option<(usize, bool, &Arc<Index>)> = None;
    for &index in &candidates {
        let mut prefix_len = 0;
        for column in index.columns() {
            if eq.contains_key(column.as_str()) {
                prefix_len += 1;
            } else {
                break;
            }
        }
        let next_column = index.columns().get(prefix_len);
        let has_bounds = next_column
            .map(|column| {
                conditions.iter().any(|c| match c {
                    Condition::Gt(col, _)
                    | Condition::Gte(col, _)
                    | Condition::Lt(col, _)
                    | Condition::Lte(col, _) => col == column,
                    _ => false,
                })
            })
            .unwrap_or(false);
        if prefix_len == 0 && !has_bounds {
            continue;
        }
        let better = match best {
            None => true,
            Some((len, bounds, _)) => {
                prefix_len > len || (prefix_len == len && has_bounds && !bounds)
            }
        };
        if better {
            best = Some((prefix_len, has_bounds, index));
        }
    }

    if let Some((prefix_len, _, index)) = best {
        let prefix: Vec<(String, Value)> = index.columns()[..prefix_len]
            .iter()
            .map(|c| (c.clone(), (*eq[c.as_str()]).clone()))
            .collect();
        let mut lower = None;
        let mut upper = None;
        if let Some(bound_column) = index.columns().get(prefix_len) {
            for condition in &conditions {
                match condition {
                    Condition::Gt(col, value) if col == bound_column => {
                        lower = Some(RangeBound {
                            value: value.clone(),
                            inclusive: false,
                        });
                    }
                    Condition::Gte(col, value) if col == bound_column => {
                        lower = Some(RangeBound {
                            value: value.clone(),
                            inclusive: true,
                        });
                    }
                    Condition::Lt(col, value) if col == bound_column => {
                        upper = Some(RangeBound {
                            value: value.clone(),
                            inclusive: false,
                        });
                    }
                    Condition::Lte(col, value) if col == bound_column => {
                        upper = Some(RangeBound {
                            value: value.clone(),
                            inclusive: true,
                        });
                    }
                    _ => {}
                }
            }
        }
        // Every condition is re-applied in memory: prefix and bounds only
        // narrow the scan.
        return Ok(Plan::Range {
            index: Arc::clone(index),
            prefix,
            lower,
            upper,
            filters: conditions,
        });
    }

    Ok(Plan::FullScan {
        filters: conditions,
    })
}

/// Cartesian expansion of `In` values over the index tuple
fn expand_fragments(
    index: &Arc<Index>,
    eq: &HashMap<&str, &Value>,
    ins: &HashMap<&str, &Vec<Value>>,
) -> Result<Vec<QueryFragment>> {
    let mut combinations: Vec<Vec<(String, Value)>> = vec![Vec::new()];
    for column in index.columns() {
        if let Some(value) = eq.get(column.as_str()) {
            for combo in &mut combinations {
                combo.push((column.clone(), (*value).clone()));
            }
        } else {
            let values = ins[column.as_str()];
            if values.is_empty() {
                return Err(CacheError::InvalidQuery(format!(
                    "IN condition on {} has no values",
                    column
                )));
            }
            let mut expanded = Vec::with_capacity(combinations.len() * values.len());
            for combo in &combinations {
                for value in values.iter() {
                    let mut next = combo.clone();
                    next.push((column.clone(), value.clone()));
                    expanded.push(next);
                }
            }
            combinations = expanded;
        }
    }
    combinations
        .into_iter()
        .map(|bindings| {
            let cache_key = index.cache_key_from_bindings(&bindings)?;
            Ok(QueryFragment {
                index: Arc::clone(index),
                bindings,
                cache_key,
            })
        })
        .collect()
}

/// Conditions not consumed by the covering index
fn residual_filters(conditions: &[Condition], covered: &[String]) -> Vec<Condition> {
    conditions
        .iter()
        .filter(|condition| match condition {
            Condition::Eq(column, _) | Condition::In(column, _) => {
                !covered.iter().any(|c| c == column)
            }
            _ => true,
        })
        .cloned()
        .collect()
}

/// Align every condition value to its column's declared type
fn align_conditions(conditions: &[Condition], ty: &RecordType) -> Result<Vec<Condition>> {
    conditions
        .iter()
        .map(|condition| {
            let aligned = match condition {
                Condition::Eq(c, v) => Condition::Eq(c.clone(), align_value(v, c, ty)?),
                Condition::Neq(c, v) => Condition::Neq(c.clone(), align_value(v, c, ty)?),
                Condition::In(c, vs) => Condition::In(
                    c.clone(),
                    vs.iter()
                        .map(|v| align_value(v, c, ty))
                        .collect::<Result<Vec<_>>>()?,
                ),
                Condition::Gt(c, v) => Condition::Gt(c.clone(), align_value(v, c, ty)?),
                Condition::Gte(c, v) => Condition::Gte(c.clone(), align_value(v, c, ty)?),
                Condition::Lt(c, v) => Condition::Lt(c.clone(), align_value(v, c, ty)?),
                Condition::Lte(c, v) => Condition::Lte(c.clone(), align_value(v, c, ty)?),
                Condition::IsNull(c) => {
                    if !ty.has_column(c) {
                        return Err(CacheError::UnknownColumn {
                            column: c.clone(),
                            table: ty.table().to_string(),
                        });
                    }
                    Condition::IsNull(c.clone())
                }
                Condition::Raw(sql) => Condition::Raw(sql.clone()),
            };
            Ok(aligned)
        })
        .collect()
}

/// Convert a condition value to the column's tag when the conversion is
/// exact; reject lossy or senseless conversions
pub(crate) fn align_value(value: &Value, column: &str, ty: &RecordType) -> Result<Value> {
    let column_ty = ty
        .column_type(column)
        .ok_or_else(|| CacheError::UnknownColumn {
            column: column.to_string(),
            table: ty.table().to_string(),
        })?;
    if column_ty.accepts(value) {
        return Ok(value.clone());
    }
    let mismatch = || CacheError::InvalidQuery(format!(
        "condition value {:?} does not fit column {} of table {}",
        value,
        column,
        ty.table()
    ));
    // Integer widening/narrowing through i128, exact only.
    let integer = match value {
        Value::Int8(Some(v)) => Some(*v as i128),
        Value::Int16(Some(v)) => Some(*v as i128),
        Value::Int32(Some(v)) => Some(*v as i128),
        Value::Int64(Some(v)) => Some(*v as i128),
        Value::Uint8(Some(v)) => Some(*v as i128),
        Value::Uint16(Some(v)) => Some(*v as i128),
        Value::Uint32(Some(v)) => Some(*v as i128),
        Value::Uint64(Some(v)) => Some(*v as i128),
        _ => None,
    };
    if let Some(n) = integer {
        let aligned = match column_ty {
            ColumnType::Int8 => i8::try_from(n).ok().map(Value::from),
            ColumnType::Int16 => i16::try_from(n).ok().map(Value::from),
            ColumnType::Int32 => i32::try_from(n).ok().map(Value::from),
            ColumnType::Int64 => i64::try_from(n).ok().map(Value::from),
            ColumnType::Uint8 => u8::try_from(n).ok().map(Value::from),
            ColumnType::Uint16 => u16::try_from(n).ok().map(Value::from),
            ColumnType::Uint32 => u32::try_from(n).ok().map(Value::from),
            ColumnType::Uint64 => u64::try_from(n).ok().map(Value::from),
            _ => None,
        };
        return aligned.ok_or_else(mismatch);
    }
    if let Value::Float32(Some(v)) = value {
        if matches!(column_ty, ColumnType::Float64) {
            return Ok(Value::from(f64::from(*v)));
        }
    }
    Err(mismatch())
}

/// The fragments of one planned query, tracking which of them missed every
/// cache level and must be answered by the database.
#[derive(Debug)]
pub struct QuerySet {
    fragments: Vec<QueryFragment>,
    cache_miss: Vec<usize>,
}

impl QuerySet {
    /// Wrap a point plan's fragments
    pub fn new(fragments: Vec<QueryFragment>) -> Self {
        Self {
            fragments,
            cache_miss: Vec::new(),
        }
    }

    /// Fragments in expansion order
    pub fn fragments(&self) -> &[QueryFragment] {
        &self.fragments
    }

    /// Visit each fragment in order
    pub fn each<F: FnMut(usize, &QueryFragment)>(&self, mut f: F) {
        for (i, fragment) in self.fragments.iter().enumerate() {
            f(i, fragment);
        }
    }

    /// Record that a fragment missed every cache level
    pub fn mark_miss(&mut self, fragment_index: usize) {
        if !self.cache_miss.contains(&fragment_index) {
            self.cache_miss.push(fragment_index);
        }
    }

    /// Fragments that missed, in mark order
    pub fn misses(&self) -> impl Iterator<Item = &QueryFragment> {
        self.cache_miss.iter().map(|i| &self.fragments[*i])
    }

    /// Indexes of missed fragments, in mark order
    pub fn miss_indexes(&self) -> &[usize] {
        &self.cache_miss
    }

    /// Whether any fragment missed
    pub fn has_misses(&self) -> bool {
        !self.cache_miss.is_empty()
    }

    /// Aggregate the missed fragments into one SELECT.
    ///
    /// Fragments that differ in a single column collapse into `col IN (…)`
    /// with placeholders in exact fragment order; heterogeneous fragments
    /// render as a disjunction of per-fragment conjunctions.
    pub fn cache_miss_queries_to_sql(
        &self,
        ty: &RecordType,
        dialect: Dialect,
    ) -> Result<(String, Vec<Value>)> {
        let misses: Vec<&QueryFragment> = self.misses().collect();
        if misses.is_empty() {
            return Err(CacheError::InvalidQuery(
                "no cache-miss fragments to render".to_string(),
            ));
        }
        let columns = misses[0].index.columns();
        let table = misses[0].index.table();

        let select_columns: Vec<String> = ty
            .columns()
            .iter()
            .map(|c| dialect.quote(&c.name))
            .collect();
        let mut sql = format!(
            "SELECT {} FROM {}",
            select_columns.join(", "),
            dialect.quote(table)
        );
        let mut args = Vec::new();

        // Which tuple columns vary across the missed fragments?
        let varying: Vec<&String> = columns
            .iter()
            .filter(|column| {
                let first = misses[0]
                    .bindings
                    .iter()
                    .find(|(c, _)| c == *column)
                    .map(|(_, v)| v.canonical_string());
                misses.iter().any(|fragment| {
                    fragment
                        .bindings
                        .iter()
                        .find(|(c, _)| c == *column)
                        .map(|(_, v)| v.canonical_string())
                        != first
                })
            })
            .collect();

        if varying.len() <= 1 {
            // Shared columns as equalities, the varying column (if any) as
            // IN; a single missed fragment renders as a plain conjunction.
            let mut conditions = Vec::new();
            for column in columns {
                if varying.iter().any(|c| *c == column) {
                    let values: Vec<Value> = misses
                        .iter()
                        .map(|fragment| {
                            fragment
                                .bindings
                                .iter()
                                .find(|(c, _)| c == column)
                                .map(|(_, v)| v.clone())
                                .expect("fragment covers index tuple")
                        })
                        .collect();
                    conditions.push(Condition::In(column.clone(), values));
                } else {
                    let value = misses[0]
                        .bindings
                        .iter()
                        .find(|(c, _)| c == column)
                        .map(|(_, v)| v.clone())
                        .expect("fragment covers index tuple");
                    conditions.push(Condition::Eq(column.clone(), value));
                }
            }
            let where_clause = render_where(&conditions, dialect, &mut args)?;
            sql.push_str(" WHERE ");
            sql.push_str(&where_clause);
        } else {
            // Disjunction of per-fragment conjunctions.
            let mut groups = Vec::with_capacity(misses.len());
            for fragment in &misses {
                let conditions: Vec<Condition> = fragment
                    .bindings
                    .iter()
                    .map(|(c, v)| Condition::Eq(c.clone(), v.clone()))
                    .collect();
                let clause = render_where(&conditions, dialect, &mut args)?;
                groups.push(format!("({})", clause));
            }
            sql.push_str(" WHERE ");
            sql.push_str(&groups.join(" OR "));
        }
        Ok((sql, args))
    }

    /// Indexes of missed fragments matching a database row, used to
    /// reassociate result rows with the fragment that requested them
    pub fn miss_for_record(&self, record: &Record) -> Option<usize> {
        self.cache_miss
            .iter()
            .copied()
            .find(|i| self.fragments[*i].matches(record))
    }
}
