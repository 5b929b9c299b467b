//! Derived metric registry.
//!
//! A derived metric is computed from base fields after the base query has
//! run. Each definition names the base inputs it needs and a pure compute
//! function that either yields a number or a [`MetricError`]; an error means
//! the candidate does not qualify, never that the request failed.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricErrorCode {
    NoData,
    PegRatioInvalid,
    DebtToFcfInvalid,
    EpsCagrInvalid,
    RevenueCagrInvalid,
    FcfMarginInvalid,
    EarningsConsistencyScoreInvalid,
}

impl MetricErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricErrorCode::NoData => "NO_DATA",
            MetricErrorCode::PegRatioInvalid => "PEG_RATIO_INVALID",
            MetricErrorCode::DebtToFcfInvalid => "DEBT_TO_FCF_INVALID",
            MetricErrorCode::EpsCagrInvalid => "EPS_CAGR_INVALID",
            MetricErrorCode::RevenueCagrInvalid => "REVENUE_CAGR_INVALID",
            MetricErrorCode::FcfMarginInvalid => "FCF_MARGIN_INVALID",
            MetricErrorCode::EarningsConsistencyScoreInvalid => {
                "EARNINGS_CONSISTENCY_SCORE_INVALID"
            }
        }
    }
}

impl fmt::Display for MetricErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A derived metric could not be computed for one candidate.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{code}: {message}")]
pub struct MetricError {
    pub code: MetricErrorCode,
    pub message: String,
}

impl MetricError {
    pub fn new(code: MetricErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn no_data(ticker: &str) -> Self {
        Self::new(MetricErrorCode::NoData, format!("no fundamentals for {}", ticker))
    }
}

/// Base inputs for one candidate and one derived condition.
///
/// Series are ordered oldest to newest. Scalars hold the newest non-null
/// value, or `None` when every fetched row was null.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BaseMetrics {
    pub scalars: HashMap<String, Option<f64>>,
    pub series: HashMap<String, Vec<f64>>,
}

impl BaseMetrics {
    pub fn scalar(&self, name: &str) -> Option<f64> {
        self.scalars.get(name).copied().flatten()
    }

    pub fn series(&self, name: &str) -> &[f64] {
        self.series.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn with_scalar(mut self, name: &str, value: f64) -> Self {
        self.scalars.insert(name.to_string(), Some(value));
        self
    }

    pub fn with_series(mut self, name: &str, values: Vec<f64>) -> Self {
        self.series.insert(name.to_string(), values);
        self
    }
}

/// Whether a required input name denotes a time series.
pub fn is_series_input(name: &str) -> bool {
    name.ends_with("_history") || name.ends_with("_series")
}

/// Base column an input name reads from: `eps_history` → `eps`.
pub fn input_column(name: &str) -> &str {
    name.strip_suffix("_history")
        .or_else(|| name.strip_suffix("_series"))
        .unwrap_or(name)
}

pub type ComputeFn = fn(&BaseMetrics) -> Result<f64, MetricError>;

#[derive(Debug, Clone)]
pub struct DerivedMetric {
    pub name: &'static str,
    pub requires: &'static [&'static str],
    /// Metrics over a series need an explicit trailing window.
    pub requires_window: bool,
    pub compute: ComputeFn,
}

static REGISTRY: Lazy<DerivedMetricRegistry> = Lazy::new(DerivedMetricRegistry::new);

#[derive(Debug)]
pub struct DerivedMetricRegistry {
    metrics: HashMap<&'static str, DerivedMetric>,
}

impl DerivedMetricRegistry {
    fn new() -> Self {
        let definitions = [
            DerivedMetric {
                name: "peg_ratio",
                requires: &["pe_ratio", "eps_growth", "eps_history"],
                requires_window: false,
                compute: peg_ratio,
            },
            DerivedMetric {
                name: "debt_to_fcf",
                requires: &["total_debt", "free_cash_flow"],
                requires_window: false,
                compute: debt_to_fcf,
            },
            DerivedMetric {
                name: "eps_cagr",
                requires: &["eps_history"],
                requires_window: true,
                compute: eps_cagr,
            },
            DerivedMetric {
                name: "revenue_cagr",
                requires: &["revenue_history"],
                requires_window: true,
                compute: revenue_cagr,
            },
            DerivedMetric {
                name: "fcf_margin",
                requires: &["free_cash_flow", "revenue"],
                requires_window: false,
                compute: fcf_margin,
            },
            DerivedMetric {
                name: "earnings_consistency_score",
                requires: &["eps_history"],
                requires_window: true,
                compute: earnings_consistency_score,
            },
        ];

        Self {
            metrics: definitions.into_iter().map(|m| (m.name, m)).collect(),
        }
    }

    /// The process-wide registry, built on first use and never mutated.
    pub fn global() -> &'static DerivedMetricRegistry {
        &REGISTRY
    }

    pub fn get(&self, name: &str) -> Option<&DerivedMetric> {
        self.metrics.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.metrics.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.metrics.keys().copied()
    }
}

/// `pe_ratio / eps_growth`
pub fn peg_ratio(inputs: &BaseMetrics) -> Result<f64, MetricError> {
    let invalid = |message: &str| MetricError::new(MetricErrorCode::PegRatioInvalid, message);

    let pe = inputs
        .scalar("pe_ratio")
        .ok_or_else(|| invalid("pe_ratio is missing"))?;
    let growth = inputs
        .scalar("eps_growth")
        .ok_or_else(|| invalid("eps_growth is missing"))?;
    if growth <= 0.0 {
        return Err(invalid("eps_growth must be positive"));
    }
    Ok(pe / growth)
}

/// `total_debt / free_cash_flow`
pub fn debt_to_fcf(inputs: &BaseMetrics) -> Result<f64, MetricError> {
    let invalid = |message: &str| MetricError::new(MetricErrorCode::DebtToFcfInvalid, message);

    let debt = inputs
        .scalar("total_debt")
        .ok_or_else(|| invalid("total_debt is missing"))?;
    match inputs.scalar("free_cash_flow") {
        Some(fcf) if fcf > 0.0 => Ok(debt / fcf),
        Some(_) => Err(invalid("free_cash_flow must be positive")),
        None => Err(invalid("free_cash_flow is missing")),
    }
}

pub fn eps_cagr(inputs: &BaseMetrics) -> Result<f64, MetricError> {
    cagr(inputs.series("eps_history"), MetricErrorCode::EpsCagrInvalid, "eps")
}

pub fn revenue_cagr(inputs: &BaseMetrics) -> Result<f64, MetricError> {
    cagr(
        inputs.series("revenue_history"),
        MetricErrorCode::RevenueCagrInvalid,
        "revenue",
    )
}

/// `(last / first)^(1 / (n - 1)) - 1` over an oldest-to-newest series.
fn cagr(series: &[f64], code: MetricErrorCode, label: &str) -> Result<f64, MetricError> {
    if series.len() < 2 {
        return Err(MetricError::new(
            code,
            format!("at least 2 {} values required", label),
        ));
    }

    let first = series[0];
    let last = series[series.len() - 1];
    if first <= 0.0 {
        return Err(MetricError::new(
            code,
            format!("starting {} must be positive", label),
        ));
    }

    let periods = (series.len() - 1) as f64;
    let value = (last / first).powf(1.0 / periods) - 1.0;
    if !value.is_finite() {
        return Err(MetricError::new(code, format!("{} growth is undefined", label)));
    }
    Ok(value)
}

/// `free_cash_flow / revenue * 100`
pub fn fcf_margin(inputs: &BaseMetrics) -> Result<f64, MetricError> {
    let invalid = |message: &str| MetricError::new(MetricErrorCode::FcfMarginInvalid, message);

    let fcf = inputs
        .scalar("free_cash_flow")
        .ok_or_else(|| invalid("free_cash_flow is missing"))?;
    match inputs.scalar("revenue") {
        Some(revenue) if revenue > 0.0 => Ok(fcf / revenue * 100.0),
        Some(_) => Err(invalid("revenue must be positive")),
        None => Err(invalid("revenue is missing")),
    }
}

/// Share of periods with positive EPS.
pub fn earnings_consistency_score(inputs: &BaseMetrics) -> Result<f64, MetricError> {
    let series = inputs.series("eps_history");
    if series.len() < 2 {
        return Err(MetricError::new(
            MetricErrorCode::EarningsConsistencyScoreInvalid,
            "at least 2 eps values required",
        ));
    }
    let positive = series.iter().filter(|eps| **eps > 0.0).count();
    Ok(positive as f64 / series.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_contents() {
        let registry = DerivedMetricRegistry::global();
        for name in [
            "peg_ratio",
            "debt_to_fcf",
            "eps_cagr",
            "revenue_cagr",
            "fcf_margin",
            "earnings_consistency_score",
        ] {
            assert!(registry.contains(name), "missing {}", name);
        }
        assert!(!registry.contains("pe_ratio"));
        assert!(registry.get("eps_cagr").unwrap().requires_window);
        assert!(!registry.get("peg_ratio").unwrap().requires_window);
    }

    #[test]
    fn test_input_names() {
        assert!(is_series_input("eps_history"));
        assert!(is_series_input("revenue_series"));
        assert!(!is_series_input("eps_growth"));
        assert_eq!(input_column("eps_history"), "eps");
        assert_eq!(input_column("revenue_series"), "revenue");
        assert_eq!(input_column("pe_ratio"), "pe_ratio");
    }

    #[test]
    fn test_peg_ratio() {
        let inputs = BaseMetrics::default()
            .with_scalar("pe_ratio", 18.0)
            .with_scalar("eps_growth", 9.0);
        assert_eq!(peg_ratio(&inputs).unwrap(), 2.0);

        let zero_growth = BaseMetrics::default()
            .with_scalar("pe_ratio", 18.0)
            .with_scalar("eps_growth", 0.0);
        assert_eq!(
            peg_ratio(&zero_growth).unwrap_err().code,
            MetricErrorCode::PegRatioInvalid
        );

        let missing_pe = BaseMetrics::default().with_scalar("eps_growth", 9.0);
        assert!(peg_ratio(&missing_pe).is_err());
    }

    #[test]
    fn test_eps_cagr() {
        let doubled = BaseMetrics::default().with_series("eps_history", vec![2.0, 4.0]);
        assert!((eps_cagr(&doubled).unwrap() - 1.0).abs() < 1e-12);

        let three_years = BaseMetrics::default().with_series("eps_history", vec![1.0, 2.0, 4.0]);
        assert!((eps_cagr(&three_years).unwrap() - 1.0).abs() < 1e-12);

        for series in [vec![0.0, 4.0], vec![-1.0, 4.0], vec![4.0]] {
            let inputs = BaseMetrics::default().with_series("eps_history", series);
            assert_eq!(
                eps_cagr(&inputs).unwrap_err().code,
                MetricErrorCode::EpsCagrInvalid
            );
        }
    }

    #[test]
    fn test_revenue_cagr_shrinking() {
        let inputs = BaseMetrics::default().with_series("revenue_history", vec![100.0, 81.0, 64.0]);
        let value = revenue_cagr(&inputs).unwrap();
        assert!((value - (-0.2)).abs() < 1e-12);
    }

    #[test]
    fn test_debt_to_fcf() {
        let inputs = BaseMetrics::default()
            .with_scalar("total_debt", 500.0)
            .with_scalar("free_cash_flow", 250.0);
        assert_eq!(debt_to_fcf(&inputs).unwrap(), 2.0);

        let negative = BaseMetrics::default()
            .with_scalar("total_debt", 500.0)
            .with_scalar("free_cash_flow", -10.0);
        assert_eq!(
            debt_to_fcf(&negative).unwrap_err().code,
            MetricErrorCode::DebtToFcfInvalid
        );
    }

    #[test]
    fn test_fcf_margin() {
        let inputs = BaseMetrics::default()
            .with_scalar("free_cash_flow", 25.0)
            .with_scalar("revenue", 200.0);
        assert_eq!(fcf_margin(&inputs).unwrap(), 12.5);

        let no_revenue = BaseMetrics::default()
            .with_scalar("free_cash_flow", 25.0)
            .with_scalar("revenue", 0.0);
        assert!(fcf_margin(&no_revenue).is_err());
    }

    #[test]
    fn test_earnings_consistency_score() {
        let inputs = BaseMetrics::default().with_series("eps_history", vec![1.0, -0.5, 2.0, 3.0]);
        assert_eq!(earnings_consistency_score(&inputs).unwrap(), 0.75);

        let short = BaseMetrics::default().with_series("eps_history", vec![1.0]);
        assert!(earnings_consistency_score(&short).is_err());
    }
}
