//! Relational store seam.
//!
//! The screener only needs one operation from a store: run a parameterized
//! query and hand back rows. [`SqliteStore`] is the bundled implementation
//! used by the CLI and the end-to-end tests.

use crate::catalog::{FieldCatalog, Table, JOIN_KEY};
use rusqlite::functions::FunctionFlags;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use sea_query::Value;
use serde_json::json;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

/// One result row, column name to JSON scalar, in projection order.
pub type Row = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store connection lock poisoned")]
    Poisoned,
}

pub trait Store: Send + Sync {
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, StoreError>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        register_functions(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Creates the reference schema under the catalog's physical table names.
    pub fn init_schema(&self, catalog: &FieldCatalog) -> Result<(), StoreError> {
        self.execute_batch(&schema_sql(catalog))
    }

    pub fn execute_batch(&self, sql: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute_batch(sql)?;
        Ok(())
    }
}

impl Store for SqliteStore {
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let mut statement = conn.prepare(sql)?;
        let column_names = statement
            .column_names()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();

        // `$n` placeholders are numbered in order of first appearance, which
        // is also parameter order, so positional binding lines up.
        let values = params.iter().map(sql_value).collect::<Vec<_>>();
        let mut rows = statement.query(params_from_iter(values.iter()))?;

        let mut result = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = Row::new();
            for (index, name) in column_names.iter().enumerate() {
                let value = row.get::<usize, SqlValue>(index)?;
                record.insert(name.clone(), json_value(value));
            }
            result.push(record);
        }
        Ok(result)
    }
}

/// SQLite builds without the math extension lack `POWER`, which the CAGR
/// window aggregate needs.
fn register_functions(conn: &Connection) -> Result<(), StoreError> {
    conn.create_scalar_function(
        "power",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let base = ctx.get::<Option<f64>>(0)?;
            let exponent = ctx.get::<Option<f64>>(1)?;
            Ok(match (base, exponent) {
                (Some(base), Some(exponent)) => Some(base.powf(exponent)).filter(|v| v.is_finite()),
                _ => None,
            })
        },
    )?;
    Ok(())
}

fn sql_value(value: &Value) -> SqlValue {
    let converted = match value {
        Value::Bool(v) => v.map(|b| SqlValue::Integer(i64::from(b))),
        Value::TinyInt(v) => v.map(|n| SqlValue::Integer(n.into())),
        Value::SmallInt(v) => v.map(|n| SqlValue::Integer(n.into())),
        Value::Int(v) => v.map(|n| SqlValue::Integer(n.into())),
        Value::BigInt(v) => v.map(SqlValue::Integer),
        Value::TinyUnsigned(v) => v.map(|n| SqlValue::Integer(n.into())),
        Value::SmallUnsigned(v) => v.map(|n| SqlValue::Integer(n.into())),
        Value::Unsigned(v) => v.map(|n| SqlValue::Integer(n.into())),
        Value::BigUnsigned(v) => v.map(|n| SqlValue::Integer(i64::try_from(n).unwrap_or(i64::MAX))),
        Value::Float(v) => v.map(|n| SqlValue::Real(n.into())),
        Value::Double(v) => v.map(SqlValue::Real),
        Value::String(v) => v.as_ref().map(|s| SqlValue::Text(s.to_string())),
        Value::Char(v) => v.map(|c| SqlValue::Text(c.to_string())),
        Value::Bytes(v) => v.as_ref().map(|b| SqlValue::Blob(b.to_vec())),
    };
    converted.unwrap_or(SqlValue::Null)
}

fn json_value(value: SqlValue) -> serde_json::Value {
    match value {
        SqlValue::Null | SqlValue::Blob(_) => serde_json::Value::Null,
        SqlValue::Integer(n) => json!(n),
        SqlValue::Real(n) => json!(n),
        SqlValue::Text(s) => json!(s),
    }
}

fn schema_sql(catalog: &FieldCatalog) -> String {
    let mut periodic: Vec<&str> = catalog
        .fields()
        .filter(|def| def.is_periodic())
        .map(|def| def.column)
        .collect();
    periodic.sort_unstable();
    periodic.dedup();
    let periodic = periodic
        .iter()
        .map(|column| format!("    {} REAL", column))
        .collect::<Vec<_>>()
        .join(",\n");

    format!(
        r#"
CREATE TABLE IF NOT EXISTS {companies} (
    {key} TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    sector TEXT,
    industry TEXT,
    exchange TEXT,
    market_cap REAL
);

CREATE TABLE IF NOT EXISTS {quarterly} (
    {key} TEXT NOT NULL,
    fiscal_period TEXT NOT NULL,
{periodic},
    PRIMARY KEY ({key}, fiscal_period)
);

CREATE TABLE IF NOT EXISTS {annual} (
    {key} TEXT NOT NULL,
    fiscal_year INTEGER NOT NULL,
{periodic},
    PRIMARY KEY ({key}, fiscal_year)
);

CREATE TABLE IF NOT EXISTS {ownership} (
    {key} TEXT PRIMARY KEY,
    promoter_holding REAL
);

CREATE TABLE IF NOT EXISTS {cashflow} (
    {key} TEXT NOT NULL,
    period_end TEXT NOT NULL,
    free_cash_flow REAL,
    PRIMARY KEY ({key}, period_end)
);
"#,
        key = JOIN_KEY,
        companies = catalog.table_name(Table::Companies),
        quarterly = catalog.table_name(Table::FundamentalsQuarterly),
        annual = catalog.table_name(Table::FundamentalsAnnual),
        ownership = catalog.table_name(Table::Ownership),
        cashflow = catalog.table_name(Table::CashflowStatements),
    )
}
