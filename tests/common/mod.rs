//! Shared test fixtures: an in-memory SQL executor that understands the
//! statements the crate renders, with per-table query counters so tests can
//! assert how often the database was actually consulted.
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tiercache::error::{CacheError, Result};
use tiercache::executor::{introspection_record_type, ExecResult, SqlExecutor};
use tiercache::value::{Record, RecordType, Value};
use tiercache::IndexKind;

/// Index description handed to the executor for introspection answers
pub type IndexSpec = (String, IndexKind, Vec<String>);

/// Route crate logs to the test harness; safe to call from every test
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct MockTable {
    ty: Arc<RecordType>,
    rows: Vec<Record>,
    indexes: Vec<IndexSpec>,
    auto_increment: Option<String>,
    next_id: u64,
}

#[derive(Default)]
struct Inner {
    tables: HashMap<String, MockTable>,
    select_counts: HashMap<String, usize>,
    commits: usize,
    rollbacks: usize,
}

/// Scripted SQL executor over in-memory tables
#[derive(Default)]
pub struct MockExecutor {
    inner: Mutex<Inner>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table with its indexes; `auto_increment` names the column
    /// the executor assigns on INSERT when absent
    pub fn add_table(
        &self,
        ty: Arc<RecordType>,
        indexes: Vec<IndexSpec>,
        auto_increment: Option<&str>,
    ) {
        let table = ty.table().to_string();
        self.inner.lock().tables.insert(
            table,
            MockTable {
                ty,
                rows: Vec::new(),
                indexes,
                auto_increment: auto_increment.map(str::to_string),
                next_id: 1,
            },
        );
    }

    /// Seed a row directly, keeping the auto-increment counter ahead of it
    pub fn seed_row(&self, record: Record) {
        let mut inner = self.inner.lock();
        let table = inner
            .tables
            .get_mut(record.table())
            .expect("table registered");
        if let Some(auto) = table.auto_increment.clone() {
            if let Some(id) = record.uint64(&auto) {
                table.next_id = table.next_id.max(id + 1);
            }
        }
        table.rows.push(record);
    }

    /// How many SELECTs ran against a table's data (introspection excluded)
    pub fn select_count(&self, table: &str) -> usize {
        self.inner
            .lock()
            .select_counts
            .get(table)
            .copied()
            .unwrap_or(0)
    }

    pub fn commit_count(&self) -> usize {
        self.inner.lock().commits
    }

    pub fn rollback_count(&self) -> usize {
        self.inner.lock().rollbacks
    }

    /// Current rows of a table, for direct assertions
    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.inner.lock().tables[table].rows.clone()
    }

    fn introspect(&self, sql: &str, ty: &Arc<RecordType>) -> Result<Vec<Record>> {
        let marker = "table_name = '";
        let start = sql.find(marker).expect("introspection names a table") + marker.len();
        let end = sql[start..].find('\'').unwrap() + start;
        let table = &sql[start..end];
        let inner = self.inner.lock();
        let spec = inner
            .tables
            .get(table)
            .ok_or_else(|| CacheError::Sql(format!("unknown table {}", table)))?;
        let mut out = Vec::new();
        for (name, kind, columns) in &spec.indexes {
            for (seq, column) in columns.iter().enumerate() {
                let mut row = Record::new(Arc::clone(ty));
                row.set("index_name", name.as_str())?;
                row.set(
                    "kind",
                    match kind {
                        IndexKind::Primary => "primary",
                        IndexKind::Unique => "unique",
                        IndexKind::Key => "key",
                    },
                )?;
                row.set("column_name", column.as_str())?;
                row.set("seq", seq as u64)?;
                out.push(row);
            }
        }
        Ok(out)
    }
}

/// One parsed predicate
enum Pred {
    Cmp(String, String, Value),
    In(String, Vec<Value>),
    IsNull(String),
}

impl Pred {
    fn matches(&self, record: &Record) -> bool {
        match self {
            Pred::Cmp(column, op, value) => {
                let field = match record.get(column) {
                    Some(field) => field,
                    None => return false,
                };
                match op.as_str() {
                    "=" => field.eq_value(value),
                    "<>" => field.neq_value(value),
                    ">" => field.gt_value(value),
                    ">=" => field.gte_value(value),
                    "<" => field.lt_value(value),
                    "<=" => field.lte_value(value),
                    other => panic!("unsupported operator {}", other),
                }
            }
            Pred::In(column, values) => record
                .get(column)
                .map(|field| values.iter().any(|v| field.eq_value(v)))
                .unwrap_or(false),
            Pred::IsNull(column) => record.get(column).map(Value::is_nil).unwrap_or(false),
        }
    }
}

fn unquote(ident: &str) -> String {
    ident.trim().trim_matches('`').to_string()
}

/// Parse one conjunction, consuming placeholders from `args`
fn parse_conjunction(clause: &str, args: &[Value], cursor: &mut usize) -> Vec<Pred> {
    clause
        .split(" AND ")
        .map(|part| {
            let part = part.trim();
            if let Some(idx) = part.find(" IN (") {
                let column = unquote(&part[..idx]);
                let count = part[idx..].matches('?').count();
                let values = args[*cursor..*cursor + count].to_vec();
                *cursor += count;
                return Pred::In(column, values);
            }
            if let Some(column) = part.strip_suffix(" IS NULL") {
                return Pred::IsNull(unquote(column));
            }
            for op in ["<>", ">=", "<=", "=", ">", "<"] {
                let token = format!(" {} ?", op);
                if let Some(column) = part.strip_suffix(&token) {
                    let value = args[*cursor].clone();
                    *cursor += 1;
                    return Pred::Cmp(unquote(column), op.to_string(), value);
                }
            }
            panic!("unsupported predicate: {}", part);
        })
        .collect()
}

/// Parse a WHERE body that is either one conjunction or a disjunction of
/// parenthesised conjunctions
fn parse_where(clause: &str, args: &[Value], cursor: &mut usize) -> Vec<Vec<Pred>> {
    let clause = clause.trim();
    if clause.starts_with('(') && clause.contains(") OR (") {
        clause
            .split(") OR (")
            .map(|group| {
                let group = group.trim_start_matches('(').trim_end_matches(')');
                parse_conjunction(group, args, cursor)
            })
            .collect()
    } else if clause.is_empty() {
        Vec::new()
    } else {
        vec![parse_conjunction(clause, args, cursor)]
    }
}

fn matches_groups(groups: &[Vec<Pred>], record: &Record) -> bool {
    if groups.is_empty() {
        return true;
    }
    groups
        .iter()
        .any(|group| group.iter().all(|pred| pred.matches(record)))
}

/// Split `sql` at the first occurrence of any marker, returning the head
/// and the remainder starting at the marker
fn split_at_any<'a>(sql: &'a str, markers: &[&str]) -> (&'a str, &'a str) {
    let mut cut = sql.len();
    for marker in markers {
        if let Some(idx) = sql.find(marker) {
            cut = cut.min(idx);
        }
    }
    (&sql[..cut], &sql[cut..])
}

#[async_trait]
impl SqlExecutor for MockExecutor {
    async fn query(&self, sql: &str, args: &[Value], ty: &Arc<RecordType>) -> Result<Vec<Record>> {
        if sql.contains("information_schema") || sql.contains("pg_index") {
            assert_eq!(ty.table(), introspection_record_type().table());
            return self.introspect(sql, ty);
        }

        let sql = sql.trim_end_matches(" FOR UPDATE");
        let from = sql.find("FROM `").expect("SELECT carries FROM") + "FROM `".len();
        let table_end = sql[from..].find('`').unwrap() + from;
        let table = sql[from..table_end].to_string();

        let tail = &sql[table_end + 1..];
        let (where_body, rest) = if let Some(idx) = tail.find(" WHERE ") {
            let body = &tail[idx + " WHERE ".len()..];
            split_at_any(body, &[" ORDER BY ", " LIMIT ", " OFFSET "])
        } else {
            ("", split_at_any(tail, &[" ORDER BY ", " LIMIT ", " OFFSET "]).1)
        };

        let mut cursor = 0usize;
        let groups = parse_where(where_body, args, &mut cursor);

        let mut inner = self.inner.lock();
        *inner.select_counts.entry(table.clone()).or_insert(0) += 1;
        let stored = inner
            .tables
            .get(&table)
            .ok_or_else(|| CacheError::Sql(format!("unknown table {}", table)))?;
        let mut rows: Vec<Record> = stored
            .rows
            .iter()
            .filter(|row| matches_groups(&groups, row))
            .cloned()
            .collect();

        if let Some(idx) = rest.find(" ORDER BY ") {
            let order_body =
                split_at_any(&rest[idx + " ORDER BY ".len()..], &[" LIMIT ", " OFFSET "]).0;
            let orders: Vec<(String, bool)> = order_body
                .split(", ")
                .map(|part| match part.strip_suffix(" DESC") {
                    Some(column) => (unquote(column), true),
                    None => (unquote(part), false),
                })
                .collect();
            rows.sort_by(|a, b| {
                for (column, desc) in &orders {
                    let ord = match (a.get(column), b.get(column)) {
                        (Some(av), Some(bv)) => av.total_cmp(bv),
                        _ => std::cmp::Ordering::Equal,
                    };
                    let ord = if *desc { ord.reverse() } else { ord };
                    if ord != std::cmp::Ordering::Equal {
                        return ord;
                    }
                }
                std::cmp::Ordering::Equal
            });
        }
        if let Some(idx) = rest.find(" OFFSET ") {
            let n: usize = rest[idx + " OFFSET ".len()..]
                .split_whitespace()
                .next()
                .unwrap()
                .parse()
                .unwrap();
            rows = rows.into_iter().skip(n).collect();
        }
        if let Some(idx) = rest.find(" LIMIT ") {
            let n: usize = rest[idx + " LIMIT ".len()..]
                .split_whitespace()
                .next()
                .unwrap()
                .parse()
                .unwrap();
            rows.truncate(n);
        }
        Ok(rows)
    }

    async fn exec(&self, sql: &str, args: &[Value]) -> Result<ExecResult> {
        let mut inner = self.inner.lock();

        if let Some(rest) = sql.strip_prefix("INSERT INTO `") {
            let table_end = rest.find('`').unwrap();
            let table = rest[..table_end].to_string();
            let cols_start = rest.find('(').unwrap() + 1;
            let cols_end = rest.find(')').unwrap();
            let columns: Vec<String> = rest[cols_start..cols_end]
                .split(", ")
                .map(unquote)
                .collect();

            let stored = inner
                .tables
                .get_mut(&table)
                .ok_or_else(|| CacheError::Sql(format!("unknown table {}", table)))?;
            let mut record = Record::new(Arc::clone(&stored.ty));
            for (column, value) in columns.iter().zip(args.iter()) {
                record.set(column, value.clone())?;
            }
            let mut last_insert_id = 0;
            if let Some(auto) = stored.auto_increment.clone() {
                match record.uint64(&auto) {
                    Some(id) => stored.next_id = stored.next_id.max(id + 1),
                    None => {
                        last_insert_id = stored.next_id;
                        stored.next_id += 1;
                        record.set(&auto, last_insert_id)?;
                    }
                }
            }
            stored.rows.push(record);
            return Ok(ExecResult {
                last_insert_id,
                rows_affected: 1,
            });
        }

        if let Some(rest) = sql.strip_prefix("UPDATE `") {
            let table_end = rest.find('`').unwrap();
            let table = rest[..table_end].to_string();
            let set_start = rest.find(" SET ").unwrap() + " SET ".len();
            let (set_body, where_part) = match rest.find(" WHERE ") {
                Some(idx) => (&rest[set_start..idx], &rest[idx + " WHERE ".len()..]),
                None => (&rest[set_start..], ""),
            };
            let assignments: Vec<String> = set_body
                .split(", ")
                .map(|part| unquote(part.strip_suffix(" = ?").expect("SET uses placeholders")))
                .collect();
            let mut cursor = assignments.len();
            let groups = parse_where(where_part, args, &mut cursor);

            let stored = inner
                .tables
                .get_mut(&table)
                .ok_or_else(|| CacheError::Sql(format!("unknown table {}", table)))?;
            let mut affected = 0;
            for row in stored.rows.iter_mut() {
                if matches_groups(&groups, row) {
                    for (column, value) in assignments.iter().zip(args.iter()) {
                        row.set(column, value.clone())?;
                    }
                    affected += 1;
                }
            }
            return Ok(ExecResult {
                last_insert_id: 0,
                rows_affected: affected,
            });
        }

        if let Some(rest) = sql.strip_prefix("DELETE FROM `") {
            let table_end = rest.find('`').unwrap();
            let table = rest[..table_end].to_string();
            let where_part = match rest.find(" WHERE ") {
                Some(idx) => &rest[idx + " WHERE ".len()..],
                None => "",
            };
            let mut cursor = 0usize;
            let groups = parse_where(where_part, args, &mut cursor);

            let stored = inner
                .tables
                .get_mut(&table)
                .ok_or_else(|| CacheError::Sql(format!("unknown table {}", table)))?;
            let before = stored.rows.len();
            stored.rows.retain(|row| !matches_groups(&groups, row));
            return Ok(ExecResult {
                last_insert_id: 0,
                rows_affected: (before - stored.rows.len()) as u64,
            });
        }

        Err(CacheError::Sql(format!("unsupported statement: {}", sql)))
    }

    async fn commit(&self) -> Result<()> {
        self.inner.lock().commits += 1;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.inner.lock().rollbacks += 1;
        Ok(())
    }
}
