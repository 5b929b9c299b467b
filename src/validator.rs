//! Multi-pass validation of filter trees.
//!
//! Every pass walks the whole tree and collects its violations; the first
//! pass that reports anything stops the pipeline. Passes run in this order:
//!
//! 1. structure      - group arity, field presence, exactly one shape
//! 2. conflicts      - unsatisfiable bounds among AND-conjoined conditions
//! 3. metric support - known fields, complete windows
//! 4. derived inputs - metric specific preconditions
//! 5. temporal       - trend/window pairing, units, lengths
//! 6. null handling  - `on_missing` policy names
//! 7. ranges         - bounds present, ordered, numeric
//!
//! The validator is the trust boundary: payloads come from UI and
//! natural-language front ends and are never assumed to be well formed.

use crate::ast::{
    Aggregation, Condition, FilterNode, NullPolicy, Operator, Range, ScreenerQuery, Trend,
    WindowUnit,
};
use crate::catalog::{FieldCatalog, FieldKind};
use crate::config::ScreenerConfig;
use crate::metrics::DerivedMetricRegistry;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationCode {
    InvalidStructure,
    LogicalConflict,
    UnsupportedMetric,
    InvalidWindow,
    DerivedMetricMissingInput,
    InvalidNullPolicy,
    TemporalPeriodMissing,
    InvalidTemporalUnit,
    InvalidTemporalWindow,
    InvalidRange,
}

impl ValidationCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationCode::InvalidStructure => "INVALID_STRUCTURE",
            ValidationCode::LogicalConflict => "LOGICAL_CONFLICT",
            ValidationCode::UnsupportedMetric => "UNSUPPORTED_METRIC",
            ValidationCode::InvalidWindow => "INVALID_WINDOW",
            ValidationCode::DerivedMetricMissingInput => "DERIVED_METRIC_MISSING_INPUT",
            ValidationCode::InvalidNullPolicy => "INVALID_NULL_POLICY",
            ValidationCode::TemporalPeriodMissing => "TEMPORAL_PERIOD_MISSING",
            ValidationCode::InvalidTemporalUnit => "INVALID_TEMPORAL_UNIT",
            ValidationCode::InvalidTemporalWindow => "INVALID_TEMPORAL_WINDOW",
            ValidationCode::InvalidRange => "INVALID_RANGE",
        }
    }
}

impl fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("{code}: {message}")]
pub struct ValidationError {
    pub code: ValidationCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl ValidationError {
    pub fn new(code: ValidationCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            field: None,
        }
    }

    pub fn for_field(code: ValidationCode, field: &str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            field: if field.is_empty() { None } else { Some(field.to_string()) },
        }
    }
}

/// Bounds the validator enforces on values that end up embedded in SQL.
#[derive(Debug, Clone, Copy)]
pub struct ValidationLimits {
    pub max_window_length: u32,
    pub max_limit: u64,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self::from(&ScreenerConfig::default())
    }
}

impl From<&ScreenerConfig> for ValidationLimits {
    fn from(config: &ScreenerConfig) -> Self {
        Self {
            max_window_length: config.max_window_length,
            max_limit: config.max_limit,
        }
    }
}

type Pass<'a> = fn(&Validator<'a>, &FilterNode, &mut Vec<ValidationError>);

pub struct Validator<'a> {
    catalog: &'a FieldCatalog,
    registry: &'static DerivedMetricRegistry,
    limits: ValidationLimits,
}

impl<'a> Validator<'a> {
    pub fn new(catalog: &'a FieldCatalog) -> Self {
        Self::with_limits(catalog, ValidationLimits::default())
    }

    pub fn with_limits(catalog: &'a FieldCatalog, limits: ValidationLimits) -> Self {
        Self {
            catalog,
            registry: DerivedMetricRegistry::global(),
            limits,
        }
    }

    /// Validates a filter tree, reporting the first violation found.
    pub fn validate(&self, filter: &FilterNode) -> Result<(), ValidationError> {
        match self.violations(filter).into_iter().next() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Validates the filter tree, then the query-level sort and limit.
    pub fn validate_query(&self, query: &ScreenerQuery) -> Result<(), ValidationError> {
        self.validate(&query.filter)?;

        if let Some(limit) = query.limit {
            if limit == 0 || limit > self.limits.max_limit {
                return Err(ValidationError::new(
                    ValidationCode::InvalidStructure,
                    format!("limit must be within 1..={}", self.limits.max_limit),
                ));
            }
        }

        for key in &query.sort {
            if self.registry.contains(&key.field) {
                return Err(ValidationError::for_field(
                    ValidationCode::UnsupportedMetric,
                    &key.field,
                    format!("cannot sort on derived metric '{}'", key.field),
                ));
            }
            if !self.catalog.contains(&key.field) {
                return Err(ValidationError::for_field(
                    ValidationCode::UnsupportedMetric,
                    &key.field,
                    format!("cannot sort on unknown field '{}'", key.field),
                ));
            }
        }
        Ok(())
    }

    /// All violations of the first failing pass, in tree order.
    pub fn violations(&self, filter: &FilterNode) -> Vec<ValidationError> {
        let passes: [(&str, Pass<'a>); 7] = [
            ("structure", Self::check_structure),
            ("conflicts", Self::check_conflicts),
            ("metric_support", Self::check_metric_support),
            ("derived_inputs", Self::check_derived_inputs),
            ("temporal", Self::check_temporal_rules),
            ("null_handling", Self::check_null_handling),
            ("ranges", Self::check_ranges),
        ];

        for (name, pass) in passes {
            let mut errors = Vec::new();
            pass(self, filter, &mut errors);
            if !errors.is_empty() {
                tracing::debug!(pass = name, violations = errors.len(), "filter rejected");
                return errors;
            }
        }
        Vec::new()
    }

    fn is_derived(&self, field: &str) -> bool {
        self.registry.contains(field)
    }

    // ---- pass 1 --------------------------------------------------------

    fn check_structure(&self, node: &FilterNode, errors: &mut Vec<ValidationError>) {
        match node {
            FilterNode::And(children) | FilterNode::Or(children) => {
                if children.len() < 2 {
                    let name = if matches!(node, FilterNode::And(_)) { "AND" } else { "OR" };
                    errors.push(ValidationError::new(
                        ValidationCode::InvalidStructure,
                        format!("{} must contain at least two conditions", name),
                    ));
                }
                for child in children {
                    self.check_structure(child, errors);
                }
            }
            FilterNode::Not(child) => self.check_structure(child, errors),
            FilterNode::Condition(condition) => check_condition_shape(condition, errors),
        }
    }

    // ---- pass 2 --------------------------------------------------------

    fn check_conflicts(&self, node: &FilterNode, errors: &mut Vec<ValidationError>) {
        track_conflicts(node, &mut BoundTracker::default(), errors);
    }

    // ---- pass 3 --------------------------------------------------------

    fn check_metric_support(&self, node: &FilterNode, errors: &mut Vec<ValidationError>) {
        node.for_each_condition(&mut |condition| {
            let field = condition.field_name();

            let def = self.catalog.get(field);
            if def.is_none() && !self.is_derived(field) {
                errors.push(ValidationError::for_field(
                    ValidationCode::UnsupportedMetric,
                    field,
                    format!("Metric '{}' is not supported", field),
                ));
                return;
            }

            if let Some(window) = &condition.window {
                if window.unit.is_none() || window.length.is_none() {
                    errors.push(ValidationError::for_field(
                        ValidationCode::InvalidWindow,
                        field,
                        "Window must define type and length",
                    ));
                }
                if let Some(aggregation) = &window.aggregation {
                    if let Err(message) = aggregation.parse::<Aggregation>() {
                        errors.push(ValidationError::for_field(
                            ValidationCode::InvalidWindow,
                            field,
                            message,
                        ));
                    }
                }
            }

            // Remaining checks concern base fields only.
            let Some(def) = def else { return };

            let temporal = condition.window.is_some() || condition.trend.is_some();
            if temporal && !def.is_periodic() {
                errors.push(ValidationError::for_field(
                    ValidationCode::InvalidWindow,
                    field,
                    format!("'{}' has no period history to window over", field),
                ));
            }
            if condition.range.is_some() && condition.window.is_some() {
                errors.push(ValidationError::for_field(
                    ValidationCode::InvalidWindow,
                    field,
                    "windowed conditions must use an operator, not a range",
                ));
            }
            if def.kind == FieldKind::Numeric {
                if let Some(value) = &condition.value {
                    if !value.is_numeric() {
                        errors.push(ValidationError::for_field(
                            ValidationCode::InvalidStructure,
                            field,
                            format!("'{}' must be compared against a number", field),
                        ));
                    }
                }
            } else if condition.range.is_some() {
                errors.push(ValidationError::for_field(
                    ValidationCode::InvalidStructure,
                    field,
                    format!("range requires a numeric field, '{}' is text", field),
                ));
            }
        });
    }

    // ---- pass 4 --------------------------------------------------------

    fn check_derived_inputs(&self, node: &FilterNode, errors: &mut Vec<ValidationError>) {
        self.walk_derived(node, true, errors);
    }

    fn walk_derived(&self, node: &FilterNode, conjunctive: bool, errors: &mut Vec<ValidationError>) {
        match node {
            FilterNode::And(children) => {
                for child in children {
                    self.walk_derived(child, conjunctive, errors);
                }
            }
            FilterNode::Or(children) => {
                for child in children {
                    self.walk_derived(child, false, errors);
                }
            }
            FilterNode::Not(child) => self.walk_derived(child, false, errors),
            FilterNode::Condition(condition) => {
                self.check_derived_condition(condition, conjunctive, errors)
            }
        }
    }

    fn check_derived_condition(
        &self,
        condition: &Condition,
        conjunctive: bool,
        errors: &mut Vec<ValidationError>,
    ) {
        let field = condition.field_name();
        let Some(metric) = self.registry.get(field) else {
            return;
        };

        if !conjunctive {
            errors.push(ValidationError::for_field(
                ValidationCode::InvalidStructure,
                field,
                format!(
                    "derived metric '{}' can only be combined with AND, not under OR or NOT",
                    field
                ),
            ));
        }
        if condition.trend.is_some() {
            errors.push(ValidationError::for_field(
                ValidationCode::InvalidStructure,
                field,
                format!("trend conditions are not supported on derived metric '{}'", field),
            ));
        }
        if let Some(value) = &condition.value {
            if !value.is_numeric() {
                errors.push(ValidationError::for_field(
                    ValidationCode::InvalidStructure,
                    field,
                    format!("derived metric '{}' must be compared against a number", field),
                ));
            }
        }

        let periods = condition
            .window
            .as_ref()
            .and_then(|w| w.length.as_ref())
            .and_then(|length| length.as_positive_int());

        match (&condition.window, periods) {
            (None, _) if metric.requires_window => {
                errors.push(ValidationError::for_field(
                    ValidationCode::DerivedMetricMissingInput,
                    field,
                    format!("Derived metric '{}' requires a time window", field),
                ));
            }
            (Some(_), Some(n)) if n < 2 => {
                // Series metrics and the EPS growth behind PEG both need two points.
                errors.push(ValidationError::for_field(
                    ValidationCode::DerivedMetricMissingInput,
                    field,
                    format!("Derived metric '{}' needs a window of at least 2 periods", field),
                ));
            }
            _ => {}
        }
    }

    // ---- pass 5 --------------------------------------------------------

    fn check_temporal_rules(&self, node: &FilterNode, errors: &mut Vec<ValidationError>) {
        node.for_each_condition(&mut |condition| {
            let field = condition.field_name();

            let Some(window) = &condition.window else {
                if condition.trend.is_some() {
                    errors.push(ValidationError::for_field(
                        ValidationCode::TemporalPeriodMissing,
                        field,
                        format!("Trend condition for '{}' requires a time window", field),
                    ));
                }
                return;
            };

            let unit = window.unit.as_deref().unwrap_or("");
            if unit.parse::<WindowUnit>().is_err() {
                errors.push(ValidationError::for_field(
                    ValidationCode::InvalidTemporalUnit,
                    field,
                    format!("Unsupported time unit '{}' for '{}'", unit, field),
                ));
            }

            match window.length.as_ref().and_then(|l| l.as_positive_int()) {
                None => errors.push(ValidationError::for_field(
                    ValidationCode::InvalidTemporalWindow,
                    field,
                    format!("Time window for '{}' must be a positive integer", field),
                )),
                Some(n) if n > self.limits.max_window_length => {
                    errors.push(ValidationError::for_field(
                        ValidationCode::InvalidTemporalWindow,
                        field,
                        format!(
                            "Time window for '{}' exceeds {} periods",
                            field, self.limits.max_window_length
                        ),
                    ))
                }
                Some(n) if n < 2 && condition.trend.is_some() => {
                    errors.push(ValidationError::for_field(
                        ValidationCode::InvalidTemporalWindow,
                        field,
                        format!("Trend for '{}' needs at least 2 periods", field),
                    ))
                }
                Some(_) => {}
            }
        });
    }

    // ---- pass 6 --------------------------------------------------------

    fn check_null_handling(&self, node: &FilterNode, errors: &mut Vec<ValidationError>) {
        node.for_each_condition(&mut |condition| {
            if let Some(policy) = &condition.on_missing {
                if policy.parse::<NullPolicy>().is_err() {
                    errors.push(ValidationError::for_field(
                        ValidationCode::InvalidNullPolicy,
                        condition.field_name(),
                        format!(
                            "Invalid on_missing policy for '{}'. Allowed: fail, ignore, fallback",
                            condition.field_name()
                        ),
                    ));
                }
            }
        });
    }

    // ---- pass 7 --------------------------------------------------------

    fn check_ranges(&self, node: &FilterNode, errors: &mut Vec<ValidationError>) {
        node.for_each_condition(&mut |condition| {
            if let Some(range) = &condition.range {
                check_range(condition.field_name(), range, errors);
            }
        });
    }
}

fn check_condition_shape(condition: &Condition, errors: &mut Vec<ValidationError>) {
    let field = condition.field_name();
    if field.is_empty() {
        errors.push(ValidationError::new(
            ValidationCode::InvalidStructure,
            "Condition missing field",
        ));
        return;
    }

    match condition.shape_count() {
        0 => errors.push(ValidationError::for_field(
            ValidationCode::InvalidStructure,
            field,
            format!("Condition for '{}' has no operator, range, or trend", field),
        )),
        1 => {}
        _ => errors.push(ValidationError::for_field(
            ValidationCode::InvalidStructure,
            field,
            format!(
                "Condition for '{}' must use exactly one of operator, range, or trend",
                field
            ),
        )),
    }

    if let Some(operator) = &condition.operator {
        if let Err(message) = operator.parse::<Operator>() {
            errors.push(ValidationError::for_field(
                ValidationCode::InvalidStructure,
                field,
                message,
            ));
        }
        if matches!(condition.value, None | Some(crate::ast::Literal::Null)) {
            errors.push(ValidationError::for_field(
                ValidationCode::InvalidStructure,
                field,
                format!("Operator condition for '{}' missing value", field),
            ));
        }
    }

    if let Some(trend) = &condition.trend {
        if let Err(message) = trend.parse::<Trend>() {
            errors.push(ValidationError::for_field(
                ValidationCode::InvalidStructure,
                field,
                message,
            ));
        }
    }
}

fn check_range(field: &str, range: &Range, errors: &mut Vec<ValidationError>) {
    if range.min.is_none() && range.max.is_none() {
        errors.push(ValidationError::for_field(
            ValidationCode::InvalidRange,
            field,
            format!("Range for '{}' must define at least min or max", field),
        ));
        return;
    }

    if let (Some(inclusive), Some(exclusive)) = (range.inclusive, range.exclusive) {
        if inclusive == exclusive {
            errors.push(ValidationError::for_field(
                ValidationCode::InvalidRange,
                field,
                format!("Range for '{}' has conflicting inclusive/exclusive flags", field),
            ));
        }
    }

    let non_numeric = [&range.min, &range.max]
        .into_iter()
        .flatten()
        .any(|bound| !bound.is_numeric());
    if non_numeric {
        errors.push(ValidationError::for_field(
            ValidationCode::InvalidRange,
            field,
            format!("Range values for '{}' must be numeric", field),
        ));
        return;
    }

    if let (Some(min), Some(max)) = range.numeric_bounds() {
        if min > max {
            errors.push(ValidationError::for_field(
                ValidationCode::InvalidRange,
                field,
                format!("Range for '{}' has min greater than max", field),
            ));
        }
    }
}

fn track_conflicts(node: &FilterNode, tracker: &mut BoundTracker, errors: &mut Vec<ValidationError>) {
    match node {
        FilterNode::And(children) => {
            for child in children {
                track_conflicts(child, tracker, errors);
            }
        }
        // Disjuncts and negations never share bounds with their siblings.
        FilterNode::Or(children) => {
            for child in children {
                track_conflicts(child, &mut BoundTracker::default(), errors);
            }
        }
        FilterNode::Not(child) => track_conflicts(child, &mut BoundTracker::default(), errors),
        FilterNode::Condition(condition) => {
            if let Some(error) = tracker.apply(condition) {
                errors.push(error);
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Bound {
    value: f64,
    inclusive: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct Bounds {
    lower: Option<Bound>,
    upper: Option<Bound>,
}

impl Bounds {
    fn tighten_lower(&mut self, bound: Bound) {
        self.lower = Some(match self.lower {
            Some(current)
                if current.value > bound.value
                    || (current.value == bound.value && !current.inclusive) =>
            {
                current
            }
            _ => bound,
        });
    }

    fn tighten_upper(&mut self, bound: Bound) {
        self.upper = Some(match self.upper {
            Some(current)
                if current.value < bound.value
                    || (current.value == bound.value && !current.inclusive) =>
            {
                current
            }
            _ => bound,
        });
    }

    fn is_empty(&self) -> bool {
        match (self.lower, self.upper) {
            (Some(lower), Some(upper)) => {
                lower.value > upper.value
                    || (lower.value == upper.value && !(lower.inclusive && upper.inclusive))
            }
            _ => false,
        }
    }
}

/// Running `[min, max]` per field across AND-conjoined conditions.
#[derive(Debug, Default)]
struct BoundTracker {
    fields: HashMap<String, Bounds>,
}

impl BoundTracker {
    fn apply(&mut self, condition: &Condition) -> Option<ValidationError> {
        // Windowed conditions constrain an aggregate, not the column itself.
        if condition.window.is_some() {
            return None;
        }
        let field = condition.field_name();
        let bounds = self.fields.entry(field.to_string()).or_default();
        let was_empty = bounds.is_empty();

        if let (Some(operator), Some(value)) = (&condition.operator, &condition.value) {
            let (Ok(operator), Some(value)) = (operator.parse::<Operator>(), value.as_f64()) else {
                return None;
            };
            let bound = |inclusive| Bound { value, inclusive };
            match operator {
                Operator::Lt => bounds.tighten_upper(bound(false)),
                Operator::Lte => bounds.tighten_upper(bound(true)),
                Operator::Gt => bounds.tighten_lower(bound(false)),
                Operator::Gte => bounds.tighten_lower(bound(true)),
                Operator::Eq => {
                    bounds.tighten_lower(bound(true));
                    bounds.tighten_upper(bound(true));
                }
                Operator::NotEq => {}
            }
        } else if let Some(range) = &condition.range {
            let inclusive = range.is_inclusive();
            let (min, max) = range.numeric_bounds();
            // An inverted range is reported by the range pass.
            if matches!((min, max), (Some(min), Some(max)) if min > max) {
                return None;
            }
            if let Some(min) = min {
                bounds.tighten_lower(Bound { value: min, inclusive });
            }
            if let Some(max) = max {
                bounds.tighten_upper(Bound { value: max, inclusive });
            }
        }

        if bounds.is_empty() && !was_empty {
            let describe = |bound: Option<Bound>, strict: &str, loose: &str| {
                bound
                    .map(|b| format!("{} {}", if b.inclusive { loose } else { strict }, b.value))
                    .unwrap_or_default()
            };
            return Some(ValidationError::for_field(
                ValidationCode::LogicalConflict,
                field,
                format!(
                    "Unsatisfiable condition: {} {} conflicts with {} {}",
                    field,
                    describe(bounds.upper, "<", "<="),
                    field,
                    describe(bounds.lower, ">", ">="),
                ),
            ));
        }
        None
    }
}
