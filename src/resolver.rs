//! Derived metric resolver.
//!
//! Runs after the base query. For every candidate and every derived
//! condition it fetches the metric's inputs from the fact tables, computes
//! the metric and compares it with the condition. Candidates must pass every
//! derived condition; evaluation stops at the first failure.

use crate::ast::{Literal, NullPolicy, WindowSpec, WindowUnit};
use crate::catalog::{ColumnName, FieldCatalog, Table, JOIN_KEY};
use crate::config::ScreenerConfig;
use crate::metrics::{input_column, is_series_input, BaseMetrics, DerivedMetric, DerivedMetricRegistry, MetricError};
use crate::sql_compiler::{value_to_json, CompiledCondition};
use crate::store::{Row, Store, StoreError};
use chrono::{Datelike, NaiveDate};
use rayon::prelude::*;
use sea_query::{Expr, Order, PostgresQueryBuilder, Query};
use serde_json::json;
use std::cmp::Reverse;
use thiserror::Error;

const FREE_CASH_FLOW: &str = "free_cash_flow";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("unknown derived metric '{0}'")]
    UnknownMetric(String),
    #[error("candidate row has no ticker column")]
    MissingTicker,
    #[error("cannot start resolver pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// Period a fact row belongs to. Annual rows are keyed by fiscal year,
/// quarterly rows by their period-end date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum PeriodKey {
    Year(i32),
    Date(NaiveDate),
}

impl PeriodKey {
    fn parse(value: &serde_json::Value, unit: WindowUnit) -> Option<Self> {
        match unit {
            WindowUnit::Years => match value {
                serde_json::Value::Number(n) => n.as_i64().and_then(|y| i32::try_from(y).ok()).map(PeriodKey::Year),
                serde_json::Value::String(s) => match s.parse::<i32>() {
                    Ok(year) => Some(PeriodKey::Year(year)),
                    Err(_) => parse_date(s).map(|d| PeriodKey::Year(d.year())),
                },
                _ => None,
            },
            WindowUnit::Quarters => value.as_str().and_then(parse_date).map(PeriodKey::Date),
        }
    }

    fn to_json(self) -> serde_json::Value {
        match self {
            PeriodKey::Year(year) => json!(year),
            PeriodKey::Date(date) => json!(date.format("%Y-%m-%d").to_string()),
        }
    }
}

/// Accepts `YYYY-MM-DD`, optionally followed by a time part.
fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.get(..10)?, "%Y-%m-%d").ok()
}

pub struct DerivedMetricResolver<'a> {
    store: &'a dyn Store,
    catalog: &'a FieldCatalog,
    registry: &'static DerivedMetricRegistry,
    history_length: u32,
    workers: usize,
}

impl<'a> DerivedMetricResolver<'a> {
    pub fn new(store: &'a dyn Store, catalog: &'a FieldCatalog, config: &ScreenerConfig) -> Self {
        Self {
            store,
            catalog,
            registry: DerivedMetricRegistry::global(),
            history_length: config.history_length,
            workers: config.resolver_workers,
        }
    }

    /// Keeps the candidates that satisfy every condition, in input order.
    pub fn resolve(
        &self,
        candidates: Vec<Row>,
        conditions: &[CompiledCondition],
    ) -> Result<Vec<Row>, ResolveError> {
        if conditions.is_empty() {
            return Ok(candidates);
        }

        let verdicts: Vec<bool> = if self.workers > 1 && candidates.len() > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.workers)
                .build()?;
            pool.install(|| {
                candidates
                    .par_iter()
                    .map(|candidate| self.passes(candidate, conditions))
                    .collect::<Result<Vec<_>, _>>()
            })?
        } else {
            candidates
                .iter()
                .map(|candidate| self.passes(candidate, conditions))
                .collect::<Result<Vec<_>, _>>()?
        };

        Ok(candidates
            .into_iter()
            .zip(verdicts)
            .filter_map(|(candidate, keep)| keep.then_some(candidate))
            .collect())
    }

    fn passes(&self, candidate: &Row, conditions: &[CompiledCondition]) -> Result<bool, ResolveError> {
        let ticker = candidate
            .get(JOIN_KEY)
            .and_then(|value| value.as_str())
            .ok_or(ResolveError::MissingTicker)?;

        for condition in conditions {
            match self.compute(ticker, condition)? {
                Ok(value) if satisfies(condition, value) => {}
                Ok(value) => {
                    tracing::debug!(ticker, metric = %condition.field, value, "candidate failed derived condition");
                    return Ok(false);
                }
                Err(error) if condition.on_missing == NullPolicy::Ignore => {
                    tracing::debug!(ticker, metric = %condition.field, code = %error.code, "metric unavailable, condition ignored");
                }
                Err(error) => {
                    tracing::debug!(ticker, metric = %condition.field, code = %error.code, "candidate excluded");
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Computes one derived metric for one ticker. The outer error is fatal
    /// to the request; the inner one only disqualifies the candidate.
    pub fn compute(
        &self,
        ticker: &str,
        condition: &CompiledCondition,
    ) -> Result<Result<f64, MetricError>, ResolveError> {
        let metric = self
            .registry
            .get(&condition.field)
            .ok_or_else(|| ResolveError::UnknownMetric(condition.field.clone()))?;

        let Some(inputs) = self.fetch_inputs(ticker, metric, condition.window.as_ref())? else {
            return Ok(Err(MetricError::no_data(ticker)));
        };
        Ok((metric.compute)(&inputs))
    }

    /// Fetches the trailing rows a metric needs and reshapes them. `None`
    /// when no rows exist for the ticker.
    fn fetch_inputs(
        &self,
        ticker: &str,
        metric: &DerivedMetric,
        window: Option<&WindowSpec>,
    ) -> Result<Option<BaseMetrics>, ResolveError> {
        let (unit, length) = window
            .map(|w| (w.unit, w.length))
            .unwrap_or((WindowUnit::Quarters, self.history_length));
        let (table, period) = match unit {
            WindowUnit::Quarters => (Table::FundamentalsQuarterly, "fiscal_period"),
            WindowUnit::Years => (Table::FundamentalsAnnual, "fiscal_year"),
        };

        let mut columns: Vec<&str> = Vec::new();
        for name in metric.requires {
            let column = input_column(name);
            if !columns.contains(&column) {
                columns.push(column);
            }
        }
        if metric.requires.contains(&"eps_growth") && !columns.contains(&"eps") {
            columns.push("eps");
        }

        let mut select = Query::select();
        select.column(ColumnName(period.to_string()));
        for column in &columns {
            select.column(ColumnName(column.to_string()));
        }
        select
            .from(self.catalog.table_ref(table))
            .and_where(Expr::col(ColumnName(JOIN_KEY.to_string())).eq(ticker))
            .order_by(ColumnName(period.to_string()), Order::Desc)
            .limit(u64::from(length));
        let mut rows = self.query(&select)?;

        let needs_fallback = columns.contains(&FREE_CASH_FLOW)
            && rows.iter().all(|row| row.get(FREE_CASH_FLOW).map_or(true, |v| v.is_null()));
        if needs_fallback {
            let cash_flows = self.fetch_cash_flows(ticker, length)?;
            merge_cash_flows(&mut rows, cash_flows, unit, period, length as usize);
        }

        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(reshape(metric, &rows)))
    }

    fn fetch_cash_flows(&self, ticker: &str, length: u32) -> Result<Vec<Row>, ResolveError> {
        let mut select = Query::select();
        select
            .column(ColumnName("period_end".to_string()))
            .column(ColumnName(FREE_CASH_FLOW.to_string()))
            .from(self.catalog.table_ref(Table::CashflowStatements))
            .and_where(Expr::col(ColumnName(JOIN_KEY.to_string())).eq(ticker))
            .and_where(Expr::col(ColumnName(FREE_CASH_FLOW.to_string())).is_not_null())
            .order_by(ColumnName("period_end".to_string()), Order::Desc)
            .limit(u64::from(length));
        self.query(&select)
    }

    fn query(&self, select: &sea_query::SelectStatement) -> Result<Vec<Row>, ResolveError> {
        let (sql, values) = select.build(PostgresQueryBuilder);
        self.store.query(&sql, &values.0).map_err(|error| {
            tracing::error!(
                sql = %sql,
                params = ?values.0.iter().map(value_to_json).collect::<Vec<_>>(),
                error = %error,
                "derived metric fetch failed"
            );
            ResolveError::Store(error)
        })
    }
}

/// Folds secondary cash-flow rows into the fact rows by period, then keeps
/// the newest `length` rows.
fn merge_cash_flows(rows: &mut Vec<Row>, cash_flows: Vec<Row>, unit: WindowUnit, period: &str, length: usize) {
    for cash_flow in cash_flows {
        let Some(key) = cash_flow.get("period_end").and_then(|v| PeriodKey::parse(v, unit)) else {
            continue;
        };
        let value = cash_flow.get(FREE_CASH_FLOW).cloned().unwrap_or_default();

        let existing = rows
            .iter_mut()
            .find(|row| row.get(period).and_then(|v| PeriodKey::parse(v, unit)) == Some(key));
        match existing {
            Some(row) => {
                row.insert(FREE_CASH_FLOW.to_string(), value);
            }
            None => {
                let mut row = Row::new();
                row.insert(period.to_string(), key.to_json());
                row.insert(FREE_CASH_FLOW.to_string(), value);
                rows.push(row);
            }
        }
    }

    rows.sort_by_key(|row| Reverse(row.get(period).and_then(|v| PeriodKey::parse(v, unit))));
    rows.truncate(length);
}

/// Rows arrive newest first. Series come out oldest to newest without
/// nulls; scalars take the newest non-null value.
fn reshape(metric: &DerivedMetric, rows: &[Row]) -> BaseMetrics {
    let newest_first = |column: &str| -> Vec<f64> {
        rows.iter()
            .filter_map(|row| row.get(column).and_then(|v| v.as_f64()))
            .collect()
    };

    let mut inputs = BaseMetrics::default();
    for name in metric.requires {
        let values = newest_first(input_column(name));
        if is_series_input(name) {
            inputs.series.insert(name.to_string(), values.into_iter().rev().collect());
        } else {
            inputs.scalars.insert(name.to_string(), values.first().copied());
        }
    }

    if metric.requires.contains(&"eps_growth") {
        if let [latest, previous, ..] = newest_first("eps")[..] {
            let growth = if previous <= 0.0 {
                0.0
            } else {
                (latest - previous) / previous * 100.0
            };
            inputs.scalars.insert("eps_growth".to_string(), Some(growth));
        }
    }
    inputs
}

fn satisfies(condition: &CompiledCondition, value: f64) -> bool {
    if let Some(range) = &condition.range {
        return range.contains(value);
    }
    match (condition.operator, condition.value.as_ref().and_then(Literal::as_f64)) {
        (Some(operator), Some(threshold)) => operator.evaluate(value, threshold),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Operator, RangeSpec};
    use crate::metrics::MetricErrorCode;
    use crate::store::SqliteStore;
    use sea_query::Value;
    use std::sync::Mutex;

    /// Answers every query with canned rows and records what it was asked.
    struct FakeStore {
        responses: Vec<(&'static str, Vec<Row>)>,
        seen: Mutex<Vec<(String, Vec<Value>)>>,
    }

    impl FakeStore {
        fn new(responses: Vec<(&'static str, Vec<Row>)>) -> Self {
            Self { responses, seen: Mutex::new(Vec::new()) }
        }
    }

    impl Store for FakeStore {
        fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, StoreError> {
            self.seen.lock().unwrap().push((sql.to_string(), params.to_vec()));
            let ticker = params.first().map(value_to_json).unwrap_or_default();
            Ok(self
                .responses
                .iter()
                .filter(|(table, _)| sql.contains(&format!("FROM \"{}\"", table)))
                .flat_map(|(_, rows)| rows.iter())
                .filter(|row| row.get(JOIN_KEY) == Some(&ticker))
                .cloned()
                .collect())
        }
    }

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn derived(field: &str, operator: Operator, value: f64) -> CompiledCondition {
        CompiledCondition {
            sql: None,
            params: Vec::new(),
            is_derived: true,
            requires_subquery: false,
            field: field.to_string(),
            operator: Some(operator),
            value: Some(Literal::Float(value)),
            window: None,
            range: None,
            trend: None,
            on_missing: NullPolicy::Exclude,
        }
    }

    fn years(length: u32) -> Option<WindowSpec> {
        Some(WindowSpec { unit: WindowUnit::Years, length, aggregation: None })
    }

    fn candidates(tickers: &[&str]) -> Vec<Row> {
        tickers.iter().map(|t| row(json!({ "ticker": t, "name": t }))).collect()
    }

    #[test]
    fn test_peg_uses_eps_history_growth() {
        let store = FakeStore::new(vec![(
            "fundamentals_quarterly",
            vec![
                row(json!({"ticker":"AAA","fiscal_period":"2024-06-30","pe_ratio":50.0,"eps_growth":null,"eps":2.5})),
                row(json!({"ticker":"AAA","fiscal_period":"2024-03-31","pe_ratio":45.0,"eps_growth":null,"eps":2.0})),
            ],
        )]);
        let catalog = FieldCatalog::new();
        let resolver = DerivedMetricResolver::new(&store, &catalog, &ScreenerConfig::default());

        let value = resolver
            .compute("AAA", &derived("peg_ratio", Operator::Lt, 3.0))
            .unwrap()
            .unwrap();
        assert_eq!(value, 2.0);

        let (sql, params) = store.seen.lock().unwrap()[0].clone();
        assert!(sql.contains("ORDER BY \"fiscal_period\" DESC"));
        assert_eq!(params[0], Value::from("AAA"));
    }

    #[test]
    fn test_no_rows_is_no_data() {
        let store = FakeStore::new(Vec::new());
        let catalog = FieldCatalog::new();
        let resolver = DerivedMetricResolver::new(&store, &catalog, &ScreenerConfig::default());
        let error = resolver
            .compute("ZZZ", &derived("debt_to_fcf", Operator::Lt, 3.0))
            .unwrap()
            .unwrap_err();
        assert_eq!(error.code, MetricErrorCode::NoData);
    }

    #[test]
    fn test_failing_candidate_is_dropped_in_order() {
        let store = FakeStore::new(vec![(
            "fundamentals_annual",
            vec![
                row(json!({"ticker":"AAA","fiscal_year":2023,"eps":4.0})),
                row(json!({"ticker":"AAA","fiscal_year":2022,"eps":2.0})),
                row(json!({"ticker":"BBB","fiscal_year":2023,"eps":2.1})),
                row(json!({"ticker":"BBB","fiscal_year":2022,"eps":2.0})),
                row(json!({"ticker":"CCC","fiscal_year":2023,"eps":9.0})),
                row(json!({"ticker":"CCC","fiscal_year":2022,"eps":3.0})),
            ],
        )]);
        let catalog = FieldCatalog::new();
        let resolver = DerivedMetricResolver::new(&store, &catalog, &ScreenerConfig::default());

        let mut condition = derived("eps_cagr", Operator::Gt, 0.5);
        condition.window = years(2);
        let results = resolver
            .resolve(candidates(&["AAA", "BBB", "CCC", "DDD"]), &[condition])
            .unwrap();
        let tickers: Vec<_> = results.iter().map(|r| r["ticker"].clone()).collect();
        assert_eq!(tickers, vec![json!("AAA"), json!("CCC")]);
    }

    #[test]
    fn test_ignore_policy_keeps_candidate_on_metric_error() {
        let store = FakeStore::new(Vec::new());
        let catalog = FieldCatalog::new();
        let resolver = DerivedMetricResolver::new(&store, &catalog, &ScreenerConfig::default());

        let mut lenient = derived("fcf_margin", Operator::Gt, 10.0);
        lenient.on_missing = NullPolicy::Ignore;
        assert_eq!(resolver.resolve(candidates(&["AAA"]), &[lenient]).unwrap().len(), 1);

        let strict = derived("fcf_margin", Operator::Gt, 10.0);
        assert!(resolver.resolve(candidates(&["AAA"]), &[strict]).unwrap().is_empty());
    }

    #[test]
    fn test_short_circuits_after_first_failure() {
        let store = FakeStore::new(Vec::new());
        let catalog = FieldCatalog::new();
        let resolver = DerivedMetricResolver::new(&store, &catalog, &ScreenerConfig::default());

        let conditions = [
            derived("debt_to_fcf", Operator::Lt, 3.0),
            derived("fcf_margin", Operator::Gt, 10.0),
        ];
        assert!(resolver.resolve(candidates(&["AAA"]), &conditions).unwrap().is_empty());
        // only the first condition fetched (fundamentals + cash flow fallback)
        assert_eq!(store.seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_range_condition() {
        let store = FakeStore::new(vec![(
            "fundamentals_quarterly",
            vec![row(json!({"ticker":"AAA","fiscal_period":"2024-06-30","free_cash_flow":25.0,"revenue":200.0}))],
        )]);
        let catalog = FieldCatalog::new();
        let resolver = DerivedMetricResolver::new(&store, &catalog, &ScreenerConfig::default());

        let mut condition = derived("fcf_margin", Operator::Gt, 0.0);
        condition.operator = None;
        condition.value = None;
        condition.range = Some(RangeSpec { min: Some(10.0), max: Some(15.0), inclusive: true });
        assert_eq!(resolver.resolve(candidates(&["AAA"]), &[condition.clone()]).unwrap().len(), 1);

        condition.range = Some(RangeSpec { min: Some(12.5), max: None, inclusive: false });
        assert!(resolver.resolve(candidates(&["AAA"]), &[condition]).unwrap().is_empty());
    }

    #[test]
    fn test_missing_ticker_is_fatal() {
        let store = FakeStore::new(Vec::new());
        let catalog = FieldCatalog::new();
        let resolver = DerivedMetricResolver::new(&store, &catalog, &ScreenerConfig::default());
        let err = resolver
            .resolve(vec![row(json!({"name": "Nameless"}))], &[derived("peg_ratio", Operator::Lt, 1.0)])
            .unwrap_err();
        assert!(matches!(err, ResolveError::MissingTicker));
    }

    #[test]
    fn test_merge_cash_flows_by_year() {
        let mut rows = vec![
            row(json!({"fiscal_year":2023,"total_debt":100.0,"free_cash_flow":null})),
            row(json!({"fiscal_year":2022,"total_debt":90.0,"free_cash_flow":null})),
        ];
        let cash_flows = vec![
            row(json!({"period_end":"2024-03-31","free_cash_flow":60.0})),
            row(json!({"period_end":"2023-03-31","free_cash_flow":50.0})),
        ];
        merge_cash_flows(&mut rows, cash_flows, WindowUnit::Years, "fiscal_year", 2);

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["fiscal_year"], 2024);
        assert_eq!(rows[0]["free_cash_flow"], 60.0);
        assert_eq!(rows[1]["fiscal_year"], 2023);
        assert_eq!(rows[1]["free_cash_flow"], 50.0);
        assert_eq!(rows[1]["total_debt"], 100.0);
    }

    #[test]
    fn test_merge_cash_flows_by_date() {
        let mut rows = vec![row(json!({"fiscal_period":"2024-06-30","free_cash_flow":null}))];
        let cash_flows = vec![
            row(json!({"period_end":"2024-06-30","free_cash_flow":12.0})),
            row(json!({"period_end":"2024-05-31","free_cash_flow":7.0})),
        ];
        merge_cash_flows(&mut rows, cash_flows, WindowUnit::Quarters, "fiscal_period", 10);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["free_cash_flow"], 12.0);
        assert_eq!(rows[1]["fiscal_period"], "2024-05-31");
    }

    #[test]
    fn test_reshape_orders_series_oldest_first() {
        let metric = DerivedMetricRegistry::global().get("peg_ratio").unwrap();
        let rows = vec![
            row(json!({"pe_ratio":null,"eps":3.0,"eps_growth":5.0})),
            row(json!({"pe_ratio":20.0,"eps":null,"eps_growth":4.0})),
            row(json!({"pe_ratio":22.0,"eps":-1.0,"eps_growth":3.0})),
        ];
        let inputs = reshape(metric, &rows);
        assert_eq!(inputs.series("eps_history"), &[-1.0, 3.0]);
        assert_eq!(inputs.scalar("pe_ratio"), Some(20.0));
        // previous eps is negative, so growth collapses to zero
        assert_eq!(inputs.scalar("eps_growth"), Some(0.0));
    }

    #[test]
    fn test_parallel_resolution_preserves_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        let catalog = FieldCatalog::new();
        store.init_schema(&catalog).unwrap();
        store
            .execute_batch(
                "INSERT INTO fundamentals_quarterly (ticker, fiscal_period, total_debt, free_cash_flow) VALUES
                    ('A1', '2024-03-31', 100, 50),
                    ('A2', '2024-03-31', 100, 10),
                    ('A3', '2024-03-31', 100, 80),
                    ('A4', '2024-03-31', 100, 25);",
            )
            .unwrap();

        let config = ScreenerConfig { resolver_workers: 3, ..Default::default() };
        let resolver = DerivedMetricResolver::new(&store, &catalog, &config);
        let results = resolver
            .resolve(candidates(&["A1", "A2", "A3", "A4"]), &[derived("debt_to_fcf", Operator::Lte, 4.0)])
            .unwrap();
        let tickers: Vec<_> = results.iter().map(|r| r["ticker"].clone()).collect();
        assert_eq!(tickers, vec![json!("A1"), json!("A3"), json!("A4")]);
    }

    #[test]
    fn test_cash_flow_fallback_against_sqlite() {
        let store = SqliteStore::open_in_memory().unwrap();
        let catalog = FieldCatalog::new();
        store.init_schema(&catalog).unwrap();
        store
            .execute_batch(
                "INSERT INTO fundamentals_annual (ticker, fiscal_year, total_debt) VALUES ('AAA', 2023, 300);
                 INSERT INTO cashflow_statements (ticker, period_end, free_cash_flow) VALUES ('AAA', '2023-12-31', 150);",
            )
            .unwrap();
        let resolver = DerivedMetricResolver::new(&store, &catalog, &ScreenerConfig::default());

        let mut condition = derived("debt_to_fcf", Operator::Lt, 3.0);
        condition.window = years(3);
        assert_eq!(resolver.compute("AAA", &condition).unwrap(), Ok(2.0));
    }
}
