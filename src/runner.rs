//! Executes a compiled query and hands the candidates to the resolver.

use crate::catalog::FieldCatalog;
use crate::config::ScreenerConfig;
use crate::resolver::{DerivedMetricResolver, ResolveError};
use crate::sql_compiler::{value_to_json, CompiledQuery};
use crate::store::{Row, Store, StoreError};
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("base query failed: {0}")]
    Store(#[from] StoreError),
    #[error("derived metric resolution failed: {0}")]
    Resolve(#[from] ResolveError),
}

pub struct Runner<'a> {
    store: &'a dyn Store,
    resolver: DerivedMetricResolver<'a>,
}

impl<'a> Runner<'a> {
    pub fn new(store: &'a dyn Store, catalog: &'a FieldCatalog, config: &ScreenerConfig) -> Self {
        Self {
            store,
            resolver: DerivedMetricResolver::new(store, catalog, config),
        }
    }

    pub fn run(&self, compiled: &CompiledQuery) -> Result<Vec<Row>, RunError> {
        let started = Instant::now();

        let candidates = self
            .store
            .query(&compiled.sql, &compiled.params)
            .map_err(|error| {
                tracing::error!(
                    sql = %compiled.sql,
                    params = ?compiled.params.iter().map(value_to_json).collect::<Vec<_>>(),
                    error = %error,
                    "base query failed"
                );
                error
            })?;
        let candidate_count = candidates.len();

        let results = if compiled.derived_metrics.is_empty() {
            candidates
        } else {
            let mut passed = self.resolver.resolve(candidates, &compiled.derived_metrics)?;
            passed.truncate(usize::try_from(compiled.limit).unwrap_or(usize::MAX));
            passed
        };

        tracing::info!(
            candidates = candidate_count,
            results = results.len(),
            derived = compiled.derived_metrics.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "screen complete"
        );
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_query::Value;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CannedStore {
        rows: Vec<Row>,
        calls: AtomicUsize,
    }

    impl Store for CannedStore {
        fn query(&self, _sql: &str, _params: &[Value]) -> Result<Vec<Row>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.rows.clone())
        }
    }

    struct BrokenStore;

    impl Store for BrokenStore {
        fn query(&self, _sql: &str, _params: &[Value]) -> Result<Vec<Row>, StoreError> {
            Err(StoreError::Poisoned)
        }
    }

    fn compiled(derived: bool) -> CompiledQuery {
        let compiler = crate::sql_compiler::SqlCompiler::new();
        let payload = if derived {
            r#"{"filter":{"and":[{"field":"pe_ratio","operator":"<","value":20},{"field":"peg_ratio","operator":"<","value":1}]}}"#
        } else {
            r#"{"field":"pe_ratio","operator":"<","value":20}"#
        };
        compiler.compile(&crate::parser::parse_str(payload).unwrap()).unwrap()
    }

    #[test]
    fn test_no_derived_metrics_returns_candidates() {
        let store = CannedStore {
            rows: vec![json!({"ticker":"AAA"}).as_object().cloned().unwrap()],
            calls: AtomicUsize::new(0),
        };
        let catalog = FieldCatalog::new();
        let runner = Runner::new(&store, &catalog, &ScreenerConfig::default());

        let results = runner.run(&compiled(false)).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_derived_metrics_go_through_resolver() {
        // every query returns the single candidate row, which carries no
        // fundamentals, so the PEG condition cannot be computed
        let store = CannedStore {
            rows: vec![json!({"ticker":"AAA"}).as_object().cloned().unwrap()],
            calls: AtomicUsize::new(0),
        };
        let catalog = FieldCatalog::new();
        let runner = Runner::new(&store, &catalog, &ScreenerConfig::default());

        let results = runner.run(&compiled(true)).unwrap();
        assert!(results.is_empty());
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_store_failure_is_fatal() {
        let catalog = FieldCatalog::new();
        let runner = Runner::new(&BrokenStore, &catalog, &ScreenerConfig::default());
        assert!(matches!(runner.run(&compiled(false)), Err(RunError::Store(_))));
    }
}
