//! Dedup-aware writes: introspect the target table, resolve key columns,
//! then insert, update or skip inside a single-record transaction.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::db::{quote_ident, Record};
use crate::error::PersistError;
use crate::session::SessionRecorder;

static NULL: Value = Value::Null;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub columns: BTreeSet<String>,
    /// Primary-key columns in key order.
    pub primary_key: Vec<String>,
}

/// Table schemas, loaded on first use and kept for the life of the run.
#[derive(Debug, Default)]
pub struct SchemaCache {
    tables: RwLock<HashMap<String, Arc<TableSchema>>>,
}

impl SchemaCache {
    pub fn get_or_load(&self, conn: &Connection, table: &str) -> rusqlite::Result<Arc<TableSchema>> {
        if let Some(schema) = self
            .tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
        {
            return Ok(Arc::clone(schema));
        }
        let schema = Arc::new(introspect(conn, table)?);
        debug!(table, columns = schema.columns.len(), "Loaded table schema");
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        Ok(Arc::clone(tables.entry(table.to_string()).or_insert(schema)))
    }

    pub fn len(&self) -> usize {
        self.tables.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

fn introspect(conn: &Connection, table: &str) -> rusqlite::Result<TableSchema> {
    let mut stmt = conn.prepare("SELECT name, pk FROM pragma_table_info(?1)")?;
    let rows = stmt
        .query_map([table], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut pk: Vec<(i64, String)> = rows
        .iter()
        .filter(|(_, pk)| *pk > 0)
        .map(|(name, pk)| (*pk, name.clone()))
        .collect();
    pk.sort();

    Ok(TableSchema {
        columns: rows.into_iter().map(|(name, _)| name).collect(),
        primary_key: pk.into_iter().map(|(_, name)| name).collect(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Insert,
    Update,
    Skip,
    Error,
}

#[derive(Debug)]
pub enum Outcome {
    Inserted,
    Updated,
    Skipped,
    Failed(PersistError),
}

impl Outcome {
    pub fn kind(&self) -> OpKind {
        match self {
            Outcome::Inserted => OpKind::Insert,
            Outcome::Updated => OpKind::Update,
            Outcome::Skipped => OpKind::Skip,
            Outcome::Failed(_) => OpKind::Error,
        }
    }
}

#[derive(Debug)]
pub struct UpsertReport {
    pub outcome: Outcome,
    /// Record columns the table does not have.
    pub dropped_columns: Vec<String>,
}

impl UpsertReport {
    fn failed(error: PersistError, dropped_columns: Vec<String>) -> Self {
        Self {
            outcome: Outcome::Failed(error),
            dropped_columns,
        }
    }
}

/// One worker's handle on the relational store.
pub struct Persistence {
    conn: Connection,
    schemas: Arc<SchemaCache>,
    entity_column: String,
    update_existing: bool,
    session: Option<Arc<SessionRecorder>>,
}

impl Persistence {
    pub fn new(conn: Connection, schemas: Arc<SchemaCache>, entity_column: &str, update_existing: bool) -> Self {
        Self {
            conn,
            schemas,
            entity_column: entity_column.to_string(),
            update_existing,
            session: None,
        }
    }

    /// Count every outcome into `session`'s per-table stats.
    pub fn with_session(mut self, session: Arc<SessionRecorder>) -> Self {
        self.session = Some(session);
        self
    }

    #[cfg(test)]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Insert `record` into `table`, or update/skip the row matching its key.
    ///
    /// Keys are `key_columns` when given, else the table's primary key, else
    /// the entity ID column. Never panics and never leaves a partial write.
    pub fn upsert(&mut self, table: &str, record: &Record, key_columns: Option<&[String]>) -> UpsertReport {
        let report = self.try_upsert(table, record, key_columns);
        if let Some(session) = &self.session {
            session.count(table, report.outcome.kind());
        }
        report
    }

    fn try_upsert(&mut self, table: &str, record: &Record, key_columns: Option<&[String]>) -> UpsertReport {
        let schema = match self.schemas.get_or_load(&self.conn, table) {
            Ok(schema) => schema,
            Err(source) => {
                let error = PersistError::Introspection {
                    table: table.to_string(),
                    source,
                };
                return UpsertReport::failed(error, Vec::new());
            }
        };

        let mut dropped = Vec::new();
        let mut row: Vec<(&str, &Value)> = Vec::with_capacity(record.len());
        for (column, value) in record {
            if schema.columns.contains(column) {
                row.push((column.as_str(), value));
            } else {
                warn!(table, column = %column, "Dropping column absent from table schema");
                dropped.push(column.clone());
            }
        }
        if row.is_empty() {
            return UpsertReport::failed(PersistError::NoValidColumns(table.to_string()), dropped);
        }

        let keys = self.resolve_keys(table, &schema, key_columns);
        if keys.is_empty() {
            return UpsertReport::failed(PersistError::NoKeyColumns(table.to_string()), dropped);
        }

        match self.write(table, &row, &keys) {
            Ok(outcome) => UpsertReport {
                outcome,
                dropped_columns: dropped,
            },
            Err(e) => {
                warn!(table, error = %e, "Record write rolled back");
                UpsertReport::failed(PersistError::Transaction(e), dropped)
            }
        }
    }

    fn resolve_keys(&self, table: &str, schema: &TableSchema, explicit: Option<&[String]>) -> Vec<String> {
        let candidates = match explicit {
            Some(columns) if !columns.is_empty() => columns.to_vec(),
            _ if !schema.primary_key.is_empty() => schema.primary_key.clone(),
            _ => vec![self.entity_column.clone()],
        };
        candidates
            .into_iter()
            .filter(|column| {
                let known = schema.columns.contains(column);
                if !known {
                    warn!(table, column = %column, "Dropping key column absent from table schema");
                }
                known
            })
            .collect()
    }

    fn write(&mut self, table: &str, row: &[(&str, &Value)], keys: &[String]) -> rusqlite::Result<Outcome> {
        // a key absent from the record matches NULL
        let key_values: Vec<&Value> = keys
            .iter()
            .map(|k| {
                row.iter()
                    .find(|(c, _)| *c == k.as_str())
                    .map(|(_, v)| *v)
                    .unwrap_or(&NULL)
            })
            .collect();
        let key_clause = keys
            .iter()
            .enumerate()
            .map(|(i, k)| format!("{} IS ?{}", quote_ident(k), i + 1))
            .collect::<Vec<_>>()
            .join(" AND ");

        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists = tx
            .query_row(
                &format!("SELECT 1 FROM {} WHERE {} LIMIT 1", quote_ident(table), key_clause),
                params_from_iter(key_values.iter()),
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        let outcome = if !exists {
            let columns: Vec<String> = row.iter().map(|(c, _)| quote_ident(c)).collect();
            let placeholders: Vec<String> = (1..=row.len()).map(|i| format!("?{}", i)).collect();
            tx.execute(
                &format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    quote_ident(table),
                    columns.join(", "),
                    placeholders.join(", ")
                ),
                params_from_iter(row.iter().map(|(_, v)| *v)),
            )?;
            Outcome::Inserted
        } else if !self.update_existing {
            Outcome::Skipped
        } else {
            let updates: Vec<(&str, &Value)> = row
                .iter()
                .filter(|(c, _)| !keys.iter().any(|k| k == c))
                .copied()
                .collect();
            if updates.is_empty() {
                Outcome::Skipped
            } else {
                let assignments: Vec<String> = updates
                    .iter()
                    .enumerate()
                    .map(|(i, (c, _))| format!("{} = ?{}", quote_ident(c), i + 1))
                    .collect();
                let offset = updates.len();
                let where_clause = keys
                    .iter()
                    .enumerate()
                    .map(|(i, k)| format!("{} IS ?{}", quote_ident(k), offset + i + 1))
                    .collect::<Vec<_>>()
                    .join(" AND ");
                tx.execute(
                    &format!(
                        "UPDATE {} SET {} WHERE {}",
                        quote_ident(table),
                        assignments.join(", "),
                        where_clause
                    ),
                    params_from_iter(updates.iter().map(|(_, v)| *v).chain(key_values.iter().copied())),
                )?;
                Outcome::Updated
            }
        };

        tx.commit()?;
        Ok(outcome)
    }
}

// ── Tests ──
