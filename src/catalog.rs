//! Field catalog: maps logical DSL field names to physical columns.
//!
//! The catalog is built once at startup and shared read-only. Only the
//! physical table names are configurable; the set of fields is fixed.

use crate::config::TableMappingConfig;
use sea_query::{Alias, Iden, IntoTableRef, TableRef};
use std::collections::HashMap;

/// Logical tables the screener reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Companies,
    FundamentalsQuarterly,
    FundamentalsAnnual,
    Ownership,
    CashflowStatements,
}

impl Table {
    pub const ALL: [Table; 5] = [
        Table::Companies,
        Table::FundamentalsQuarterly,
        Table::FundamentalsAnnual,
        Table::Ownership,
        Table::CashflowStatements,
    ];

    /// Key used in the `tables` section of the configuration, and the
    /// default physical name.
    pub fn key(&self) -> &'static str {
        match self {
            Table::Companies => "companies",
            Table::FundamentalsQuarterly => "fundamentals_quarterly",
            Table::FundamentalsAnnual => "fundamentals_annual",
            Table::Ownership => "ownership",
            Table::CashflowStatements => "cashflow_statements",
        }
    }
}

/// Alias of a table inside the base query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TableAlias {
    Companies,
    Fundamentals,
    Ownership,
}

impl TableAlias {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableAlias::Companies => "c",
            TableAlias::Fundamentals => "f",
            TableAlias::Ownership => "o",
        }
    }

    pub fn table(&self) -> Table {
        match self {
            TableAlias::Companies => Table::Companies,
            TableAlias::Fundamentals => Table::FundamentalsQuarterly,
            TableAlias::Ownership => Table::Ownership,
        }
    }
}

impl Iden for TableAlias {
    fn unquoted(&self, s: &mut dyn std::fmt::Write) {
        write!(s, "{}", self.as_str()).unwrap();
    }
}

/// Column identifier wrapper
#[derive(Debug, Clone)]
pub struct ColumnName(pub String);

impl Iden for ColumnName {
    fn unquoted(&self, s: &mut dyn std::fmt::Write) {
        write!(s, "{}", self.0).unwrap();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Numeric,
    Text,
}

/// One catalog entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: &'static str,
    pub alias: TableAlias,
    pub column: &'static str,
    pub kind: FieldKind,
}

impl FieldDef {
    /// Periodic fields live in the quarterly and annual fact tables and may
    /// carry a window or a trend.
    pub fn is_periodic(&self) -> bool {
        self.alias == TableAlias::Fundamentals
    }

    /// Column reference inside the base query, e.g. `f.pe_ratio`.
    pub fn column_ref(&self) -> String {
        format!("{}.{}", self.alias.as_str(), self.column)
    }
}

const FIELDS: &[(&str, TableAlias, &str, FieldKind)] = &[
    ("market_cap", TableAlias::Companies, "market_cap", FieldKind::Numeric),
    ("sector", TableAlias::Companies, "sector", FieldKind::Text),
    ("industry", TableAlias::Companies, "industry", FieldKind::Text),
    ("exchange", TableAlias::Companies, "exchange", FieldKind::Text),
    ("revenue", TableAlias::Fundamentals, "revenue", FieldKind::Numeric),
    ("net_income", TableAlias::Fundamentals, "net_income", FieldKind::Numeric),
    ("net_profit", TableAlias::Fundamentals, "net_profit", FieldKind::Numeric),
    ("ebitda", TableAlias::Fundamentals, "ebitda", FieldKind::Numeric),
    ("eps", TableAlias::Fundamentals, "eps", FieldKind::Numeric),
    ("eps_growth", TableAlias::Fundamentals, "eps_growth", FieldKind::Numeric),
    ("pe_ratio", TableAlias::Fundamentals, "pe_ratio", FieldKind::Numeric),
    ("pb_ratio", TableAlias::Fundamentals, "pb_ratio", FieldKind::Numeric),
    ("price_to_book", TableAlias::Fundamentals, "pb_ratio", FieldKind::Numeric),
    ("roe", TableAlias::Fundamentals, "roe", FieldKind::Numeric),
    ("roa", TableAlias::Fundamentals, "roa", FieldKind::Numeric),
    ("operating_margin", TableAlias::Fundamentals, "operating_margin", FieldKind::Numeric),
    ("total_debt", TableAlias::Fundamentals, "total_debt", FieldKind::Numeric),
    ("debt", TableAlias::Fundamentals, "total_debt", FieldKind::Numeric),
    ("debt_to_equity", TableAlias::Fundamentals, "debt_to_equity", FieldKind::Numeric),
    ("free_cash_flow", TableAlias::Fundamentals, "free_cash_flow", FieldKind::Numeric),
    ("revenue_growth", TableAlias::Fundamentals, "revenue_growth", FieldKind::Numeric),
    ("revenue_growth_yoy", TableAlias::Fundamentals, "revenue_growth_yoy", FieldKind::Numeric),
    ("earnings_growth_yoy", TableAlias::Fundamentals, "earnings_growth_yoy", FieldKind::Numeric),
    ("promoter_holding", TableAlias::Ownership, "promoter_holding", FieldKind::Numeric),
];

/// Columns of the security master always present in the projection.
pub const BASE_PROJECTION: &[&str] = &["ticker", "name", "sector", "exchange", "market_cap"];

/// Canonical join key shared by every table.
pub const JOIN_KEY: &str = "ticker";

#[derive(Debug, Clone)]
pub struct FieldCatalog {
    fields: HashMap<&'static str, FieldDef>,
    tables: HashMap<Table, String>,
}

impl FieldCatalog {
    pub fn new() -> Self {
        Self::with_tables(&TableMappingConfig::default())
    }

    /// Builds the catalog with physical table names taken from `mapping`.
    /// The mapping is expected to be validated already (see
    /// [`TableMappingConfig::validate`]).
    pub fn with_tables(mapping: &TableMappingConfig) -> Self {
        let fields = FIELDS
            .iter()
            .map(|&(name, alias, column, kind)| {
                (name, FieldDef { name, alias, column, kind })
            })
            .collect();

        let tables = Table::ALL
            .iter()
            .map(|table| (*table, mapping.get_table_name(table.key())))
            .collect();

        Self { fields, tables }
    }

    pub fn get(&self, field: &str) -> Option<&FieldDef> {
        self.fields.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Physical table name
    pub fn table_name(&self, table: Table) -> &str {
        self.tables
            .get(&table)
            .map(String::as_str)
            .unwrap_or_else(|| table.key())
    }

    /// Physical table as a sea-query reference, splitting a schema prefix.
    pub fn table_ref(&self, table: Table) -> TableRef {
        let name = self.table_name(table);
        match name.split_once('.') {
            Some((schema, table)) => (Alias::new(schema), Alias::new(table)).into_table_ref(),
            None => Alias::new(name).into_table_ref(),
        }
    }

    /// Iterates entries in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = &FieldDef> {
        FIELDS.iter().filter_map(|(name, ..)| self.fields.get(name))
    }
}

impl Default for FieldCatalog {
    fn default() -> Self {
        Self::new()
    }
}
