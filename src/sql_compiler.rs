//! SQL compiler that turns a validated filter tree into a parameterized
//! PostgreSQL-dialect query using sea-query.
//!
//! Compilation happens in three layers:
//!
//! - [`SqlCompiler::compile_condition`] turns one leaf into a predicate
//!   fragment, or marks it as derived when the field is a registry metric.
//! - [`SqlCompiler::compile_group`] joins fragments under AND/OR, wrapping
//!   NOT subtrees, and keeps `$n` placeholders globally ordered.
//! - [`SqlCompiler::compile`] validates the query, then wraps the predicate
//!   in the base SELECT (projection, joins, sort, limit).
//!
//! Values are always bound as parameters. Window lengths and table names are
//! embedded in the text, so both are re-checked here before use.

use crate::ast::{
    Aggregation, Condition, FilterNode, Literal, NullPolicy, Operator, Range, RangeSpec,
    ScreenerQuery, SortDirection, Trend, Window, WindowSpec, WindowUnit,
};
use crate::catalog::{ColumnName, FieldCatalog, FieldDef, Table, TableAlias, BASE_PROJECTION, JOIN_KEY};
use crate::config::ScreenerConfig;
use crate::metrics::DerivedMetricRegistry;
use crate::validator::{ValidationError, ValidationLimits, Validator};
use sea_query::{
    Alias, Expr, JoinType, Order, PostgresQueryBuilder, SelectStatement, Value,
};
use serde_json::json;
use std::collections::BTreeSet;
use thiserror::Error;

/// Share of the window average a value may deviate by and still count as
/// a stable trend.
const STABLE_TOLERANCE: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("unknown field '{0}'")]
    UnknownField(String),
    #[error("invalid condition on '{field}': {message}")]
    InvalidCondition { field: String, message: String },
    #[error("derived metric '{0}' can only be combined with AND")]
    NonConjunctiveDerived(String),
    #[error("query has {placeholders} placeholders but {params} parameters")]
    ParameterMismatch { placeholders: usize, params: usize },
}

impl CompileError {
    fn invalid(field: &str, message: impl Into<String>) -> Self {
        CompileError::InvalidCondition {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

impl LogicalOp {
    fn as_sql(&self) -> &'static str {
        match self {
            LogicalOp::And => " AND ",
            LogicalOp::Or => " OR ",
        }
    }
}

/// One compiled leaf. `sql` is `None` exactly when the condition is derived.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledCondition {
    pub sql: Option<String>,
    pub params: Vec<Value>,
    pub is_derived: bool,
    pub requires_subquery: bool,
    pub field: String,
    pub operator: Option<Operator>,
    pub value: Option<Literal>,
    pub window: Option<WindowSpec>,
    pub range: Option<RangeSpec>,
    pub trend: Option<Trend>,
    pub on_missing: NullPolicy,
}

impl CompiledCondition {
    fn derived(field: &str) -> Self {
        Self {
            sql: None,
            params: Vec::new(),
            is_derived: true,
            requires_subquery: false,
            field: field.to_string(),
            operator: None,
            value: None,
            window: None,
            range: None,
            trend: None,
            on_missing: NullPolicy::Exclude,
        }
    }

    fn predicate(field: &str, sql: String, params: Vec<Value>) -> Self {
        Self {
            sql: Some(sql),
            params,
            is_derived: false,
            ..Self::derived(field)
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut object = serde_json::Map::new();
        object.insert("field".into(), json!(self.field));
        if let Some(operator) = &self.operator {
            object.insert("operator".into(), json!(operator.as_sql()));
        }
        if let Some(value) = &self.value {
            object.insert("value".into(), literal_to_json(value));
        }
        if let Some(range) = &self.range {
            object.insert(
                "range".into(),
                json!({ "min": range.min, "max": range.max, "inclusive": range.inclusive }),
            );
        }
        if let Some(window) = &self.window {
            object.insert(
                "window".into(),
                json!({
                    "type": window.unit.as_str(),
                    "length": window.length,
                    "aggregation": window.aggregation.map(|a| a.as_str()),
                }),
            );
        }
        if let Some(trend) = &self.trend {
            object.insert("trend".into(), json!(trend.as_str()));
        }
        object.insert("on_missing".into(), json!(self.on_missing.as_str()));
        serde_json::Value::Object(object)
    }
}

/// Result of compiling a subtree: its predicate (if any), the parameters it
/// binds in placeholder order, and the derived conditions it deferred.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledGroup {
    pub sql: Option<String>,
    pub params: Vec<Value>,
    pub derived: Vec<CompiledCondition>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<Value>,
    pub derived_metrics: Vec<CompiledCondition>,
    /// Maximum number of results. Only part of `sql` when there are no
    /// derived conditions; otherwise the runner applies it after resolution.
    pub limit: u64,
}

impl CompiledQuery {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "sql": self.sql,
            "params": self.params.iter().map(value_to_json).collect::<Vec<_>>(),
            "limit": self.limit,
            "derived_metrics": self
                .derived_metrics
                .iter()
                .map(CompiledCondition::to_json)
                .collect::<Vec<_>>(),
        })
    }
}

/// SQL Compiler that converts filter trees to SQL queries
pub struct SqlCompiler {
    catalog: FieldCatalog,
    registry: &'static DerivedMetricRegistry,
    limits: ValidationLimits,
    default_limit: u64,
}

impl SqlCompiler {
    pub fn new() -> Self {
        Self::with_config(&ScreenerConfig::default())
    }

    pub fn with_config(config: &ScreenerConfig) -> Self {
        Self {
            catalog: FieldCatalog::with_tables(&config.tables),
            registry: DerivedMetricRegistry::global(),
            limits: ValidationLimits::from(config),
            default_limit: config.default_limit,
        }
    }

    pub fn catalog(&self) -> &FieldCatalog {
        &self.catalog
    }

    pub fn validator(&self) -> Validator<'_> {
        Validator::with_limits(&self.catalog, self.limits)
    }

    /// Validates and compiles a full request into the base query.
    pub fn compile(&self, query: &ScreenerQuery) -> Result<CompiledQuery, CompileError> {
        self.validator().validate_query(query)?;

        let group = self.compile_node(&query.filter, 1, true)?;

        let mut select = SelectStatement::new();
        for column in BASE_PROJECTION {
            select.column((TableAlias::Companies, ColumnName(column.to_string())));
        }

        let referenced = self.referenced_fields(query);
        for def in &referenced {
            if !BASE_PROJECTION.contains(&def.name) {
                select.expr_as(
                    Expr::col((def.alias, ColumnName(def.column.to_string()))),
                    Alias::new(def.name),
                );
            }
        }

        select.from_as(self.catalog.table_ref(Table::Companies), TableAlias::Companies);

        let mut aliases: Vec<TableAlias> = referenced
            .iter()
            .map(|def| def.alias)
            .filter(|alias| *alias != TableAlias::Companies)
            .collect();
        aliases.sort();
        aliases.dedup();
        for alias in aliases {
            select.join_as(
                JoinType::LeftJoin,
                self.catalog.table_ref(alias.table()),
                alias,
                Expr::cust(self.join_condition(alias)),
            );
        }

        if let Some(predicate) = &group.sql {
            select.and_where(Expr::cust(predicate));
        }

        if query.sort.is_empty() {
            select.order_by((TableAlias::Companies, ColumnName(JOIN_KEY.to_string())), Order::Asc);
        }
        for key in &query.sort {
            let def = self
                .catalog
                .get(&key.field)
                .ok_or_else(|| CompileError::UnknownField(key.field.clone()))?;
            let order = match key.direction {
                SortDirection::Asc => Order::Asc,
                SortDirection::Desc => Order::Desc,
            };
            select.order_by((def.alias, ColumnName(def.column.to_string())), order);
        }
        // With derived conditions the runner applies the limit after resolution.
        let limit = query.limit.unwrap_or(self.default_limit);
        if group.derived.is_empty() {
            select.limit(limit);
        }

        let sql = select.to_string(PostgresQueryBuilder);
        check_placeholders(&sql, group.params.len())?;

        tracing::debug!(
            sql = %sql,
            params = group.params.len(),
            derived = group.derived.len(),
            "compiled screener query"
        );

        Ok(CompiledQuery {
            sql,
            params: group.params,
            derived_metrics: group.derived,
            limit,
        })
    }

    /// Compiles sibling nodes joined by `op`, numbering placeholders from
    /// `start_index`.
    pub fn compile_group(
        &self,
        nodes: &[FilterNode],
        op: LogicalOp,
        start_index: usize,
    ) -> Result<CompiledGroup, CompileError> {
        self.group(nodes, op, start_index, op == LogicalOp::And)
    }

    fn group(
        &self,
        nodes: &[FilterNode],
        op: LogicalOp,
        start_index: usize,
        conjunctive: bool,
    ) -> Result<CompiledGroup, CompileError> {
        let mut fragments = Vec::new();
        let mut result = CompiledGroup::default();

        for node in nodes {
            let child = self.compile_node(node, start_index + result.params.len(), conjunctive)?;
            fragments.extend(child.sql);
            result.params.extend(child.params);
            result.derived.extend(child.derived);
        }

        result.sql = match fragments.len() {
            0 => None,
            1 => fragments.pop(),
            _ => Some(format!("({})", fragments.join(op.as_sql()))),
        };
        Ok(result)
    }

    fn compile_node(
        &self,
        node: &FilterNode,
        index: usize,
        conjunctive: bool,
    ) -> Result<CompiledGroup, CompileError> {
        match node {
            FilterNode::And(children) => self.group(children, LogicalOp::And, index, conjunctive),
            FilterNode::Or(children) => self.group(children, LogicalOp::Or, index, false),
            FilterNode::Not(child) => {
                let inner = self.compile_node(child, index, false)?;
                Ok(CompiledGroup {
                    sql: inner.sql.map(|sql| format!("NOT ({})", sql)),
                    ..inner
                })
            }
            FilterNode::Condition(condition) => {
                let compiled = self.compile_condition(condition, index)?;
                if compiled.is_derived {
                    if !conjunctive {
                        return Err(CompileError::NonConjunctiveDerived(compiled.field));
                    }
                    return Ok(CompiledGroup {
                        derived: vec![compiled],
                        ..Default::default()
                    });
                }
                Ok(CompiledGroup {
                    sql: compiled.sql,
                    params: compiled.params,
                    derived: Vec::new(),
                })
            }
        }
    }

    /// Compiles one leaf. `index` is the number of its first placeholder.
    pub fn compile_condition(
        &self,
        condition: &Condition,
        index: usize,
    ) -> Result<CompiledCondition, CompileError> {
        let field = condition.field_name();
        let on_missing = match &condition.on_missing {
            Some(policy) => policy
                .parse::<NullPolicy>()
                .map_err(|message| CompileError::invalid(field, message))?,
            None => NullPolicy::default(),
        };

        if self.registry.contains(field) {
            return self.compile_derived(condition, on_missing);
        }

        let def = self
            .catalog
            .get(field)
            .ok_or_else(|| CompileError::UnknownField(field.to_string()))?;

        let mut compiled = match (&condition.range, &condition.trend, &condition.window) {
            (Some(_), _, Some(_)) => {
                return Err(CompileError::invalid(field, "range cannot carry a window"))
            }
            (Some(range), _, None) => self.compile_range(def, range, index, on_missing)?,
            (None, Some(trend), Some(window)) => self.compile_trend(def, trend, window)?,
            (None, Some(_), None) => {
                return Err(CompileError::invalid(field, "trend requires a window"))
            }
            (None, None, Some(window)) => self.compile_window(def, condition, window, index)?,
            (None, None, None) => self.compile_basic(def, condition, index, on_missing)?,
        };
        compiled.on_missing = on_missing;
        Ok(compiled)
    }

    fn compile_derived(
        &self,
        condition: &Condition,
        on_missing: NullPolicy,
    ) -> Result<CompiledCondition, CompileError> {
        let field = condition.field_name();
        if condition.trend.is_some() {
            return Err(CompileError::invalid(field, "derived metrics cannot carry a trend"));
        }

        let mut compiled = CompiledCondition::derived(field);
        compiled.on_missing = on_missing;
        compiled.window = match &condition.window {
            Some(window) => Some(self.window_spec(field, window)?),
            None => None,
        };
        match &condition.range {
            Some(range) => compiled.range = Some(range_spec(field, range)?),
            None => {
                let (operator, value) = operator_and_value(field, condition)?;
                if !value.is_numeric() {
                    return Err(CompileError::invalid(field, "threshold must be numeric"));
                }
                compiled.operator = Some(operator);
                compiled.value = Some(value.clone());
            }
        }
        Ok(compiled)
    }

    fn compile_basic(
        &self,
        def: &FieldDef,
        condition: &Condition,
        index: usize,
        on_missing: NullPolicy,
    ) -> Result<CompiledCondition, CompileError> {
        let (operator, value) = operator_and_value(def.name, condition)?;
        let column = def.column_ref();
        let (operand, requires_subquery) = self.null_aware_operand(def, on_missing);

        let predicate = format!("{} {} ${}", operand, operator.as_sql(), index);
        let mut compiled = CompiledCondition::predicate(
            def.name,
            apply_null_policy(&column, predicate, on_missing),
            vec![literal_to_value(def.name, value)?],
        );
        compiled.requires_subquery = requires_subquery;
        compiled.operator = Some(operator);
        compiled.value = Some(value.clone());
        Ok(compiled)
    }

    fn compile_range(
        &self,
        def: &FieldDef,
        range: &Range,
        index: usize,
        on_missing: NullPolicy,
    ) -> Result<CompiledCondition, CompileError> {
        let spec = range_spec(def.name, range)?;
        let column = def.column_ref();
        let (operand, requires_subquery) = self.null_aware_operand(def, on_missing);

        let (predicate, params) = match (spec.min, spec.max) {
            (Some(min), Some(max)) if spec.inclusive => (
                format!("{} BETWEEN ${} AND ${}", operand, index, index + 1),
                vec![Value::from(min), Value::from(max)],
            ),
            (Some(min), Some(max)) => (
                format!("({} > ${} AND {} < ${})", operand, index, operand, index + 1),
                vec![Value::from(min), Value::from(max)],
            ),
            (Some(min), None) => (
                format!("{} {} ${}", operand, if spec.inclusive { ">=" } else { ">" }, index),
                vec![Value::from(min)],
            ),
            (None, Some(max)) => (
                format!("{} {} ${}", operand, if spec.inclusive { "<=" } else { "<" }, index),
                vec![Value::from(max)],
            ),
            (None, None) => return Err(CompileError::invalid(def.name, "range has no bounds")),
        };

        let mut compiled = CompiledCondition::predicate(
            def.name,
            apply_null_policy(&column, predicate, on_missing),
            params,
        );
        compiled.requires_subquery = requires_subquery;
        compiled.range = Some(spec);
        Ok(compiled)
    }

    fn compile_trend(
        &self,
        def: &FieldDef,
        trend: &str,
        window: &Window,
    ) -> Result<CompiledCondition, CompileError> {
        let trend = trend
            .parse::<Trend>()
            .map_err(|message| CompileError::invalid(def.name, message))?;
        let spec = self.window_spec(def.name, window)?;
        if !def.is_periodic() {
            return Err(CompileError::invalid(def.name, "field has no period history"));
        }
        if spec.length < 2 {
            return Err(CompileError::invalid(def.name, "trend needs at least 2 periods"));
        }

        let trailing = self.trailing_window(def, &spec);
        let n = spec.length;
        let sql = match trend {
            Trend::Increasing | Trend::Decreasing => {
                let violation = if trend == Trend::Increasing {
                    "v <= prev_v"
                } else {
                    "v >= prev_v"
                };
                format!(
                    "EXISTS (SELECT COUNT(*) FROM (SELECT v, LAG(v) OVER (ORDER BY p) AS prev_v FROM ({trailing}) w) t \
                     HAVING COUNT(*) >= {n} \
                     AND SUM(CASE WHEN prev_v IS NOT NULL AND {violation} THEN 1 ELSE 0 END) = 0)"
                )
            }
            Trend::Stable => format!(
                "EXISTS (SELECT COUNT(*) FROM (SELECT v, AVG(v) OVER () AS avg_v FROM ({trailing}) w) t \
                 HAVING COUNT(*) >= {n} \
                 AND SUM(CASE WHEN ABS(v - avg_v) > {STABLE_TOLERANCE} * ABS(avg_v) THEN 1 ELSE 0 END) = 0)"
            ),
        };

        let mut compiled = CompiledCondition::predicate(def.name, sql, Vec::new());
        compiled.requires_subquery = true;
        compiled.trend = Some(trend);
        compiled.window = Some(spec);
        Ok(compiled)
    }

    fn compile_window(
        &self,
        def: &FieldDef,
        condition: &Condition,
        window: &Window,
        index: usize,
    ) -> Result<CompiledCondition, CompileError> {
        let spec = self.window_spec(def.name, window)?;
        if !def.is_periodic() {
            return Err(CompileError::invalid(def.name, "field has no period history"));
        }
        let (operator, value) = operator_and_value(def.name, condition)?;
        if !value.is_numeric() {
            return Err(CompileError::invalid(def.name, "windowed threshold must be numeric"));
        }

        let trailing = self.trailing_window(def, &spec);
        let aggregate = match spec.aggregation.unwrap_or(Aggregation::Avg) {
            Aggregation::Avg => format!("(SELECT AVG(v) FROM ({trailing}) w)"),
            Aggregation::Sum => format!("(SELECT SUM(v) FROM ({trailing}) w)"),
            Aggregation::Latest => format!("(SELECT v FROM ({trailing}) w ORDER BY p DESC LIMIT 1)"),
            Aggregation::Cagr => format!(
                "(SELECT CASE WHEN n > 1 AND first_v > 0 AND last_v >= 0 \
                 THEN POWER(last_v * 1.0 / NULLIF(first_v, 0), 1.0 / (n - 1)) - 1 END \
                 FROM (SELECT FIRST_VALUE(v) OVER (ORDER BY p) AS first_v, \
                 FIRST_VALUE(v) OVER (ORDER BY p DESC) AS last_v, \
                 COUNT(*) OVER () AS n FROM ({trailing}) w) t LIMIT 1)"
            ),
        };

        let mut compiled = CompiledCondition::predicate(
            def.name,
            format!("{} {} ${}", aggregate, operator.as_sql(), index),
            vec![literal_to_value(def.name, value)?],
        );
        compiled.requires_subquery = true;
        compiled.operator = Some(operator);
        compiled.value = Some(value.clone());
        compiled.window = Some(spec);
        Ok(compiled)
    }

    /// Newest `length` non-null values of a periodic field for the current
    /// row's ticker, as `(v, p)` pairs.
    fn trailing_window(&self, def: &FieldDef, spec: &WindowSpec) -> String {
        let (table, period) = self.period_source(spec.unit);
        format!(
            "SELECT h.{col} AS v, h.{period} AS p FROM {table} h \
             WHERE h.{key} = c.{key} AND h.{col} IS NOT NULL \
             ORDER BY h.{period} DESC LIMIT {length}",
            col = def.column,
            key = JOIN_KEY,
            length = spec.length,
        )
    }

    fn period_source(&self, unit: WindowUnit) -> (&str, &'static str) {
        match unit {
            WindowUnit::Quarters => (self.catalog.table_name(Table::FundamentalsQuarterly), "fiscal_period"),
            WindowUnit::Years => (self.catalog.table_name(Table::FundamentalsAnnual), "fiscal_year"),
        }
    }

    /// Column expression a predicate compares. With the fallback policy a
    /// periodic field falls back to its latest non-null annual value.
    fn null_aware_operand(&self, def: &FieldDef, on_missing: NullPolicy) -> (String, bool) {
        let column = def.column_ref();
        if on_missing != NullPolicy::Fallback || !def.is_periodic() {
            return (column, false);
        }
        let (annual, period) = self.period_source(WindowUnit::Years);
        (
            format!(
                "COALESCE({column}, (SELECT a.{col} FROM {annual} a \
                 WHERE a.{key} = c.{key} AND a.{col} IS NOT NULL \
                 ORDER BY a.{period} DESC LIMIT 1))",
                col = def.column,
                key = JOIN_KEY,
            ),
            true,
        )
    }

    fn window_spec(&self, field: &str, window: &Window) -> Result<WindowSpec, CompileError> {
        let unit = window
            .unit
            .as_deref()
            .ok_or_else(|| CompileError::invalid(field, "window has no type"))?
            .parse::<WindowUnit>()
            .map_err(|message| CompileError::invalid(field, message))?;

        // The length ends up in the SQL text.
        let length = window
            .length
            .as_ref()
            .and_then(Literal::as_positive_int)
            .filter(|n| *n <= self.limits.max_window_length)
            .ok_or_else(|| {
                CompileError::invalid(
                    field,
                    format!("window length must be within 1..={}", self.limits.max_window_length),
                )
            })?;

        let aggregation = match &window.aggregation {
            Some(name) => Some(
                name.parse::<Aggregation>()
                    .map_err(|message| CompileError::invalid(field, message))?,
            ),
            None => None,
        };

        Ok(WindowSpec { unit, length, aggregation })
    }

    fn join_condition(&self, alias: TableAlias) -> String {
        let a = alias.as_str();
        match alias {
            TableAlias::Fundamentals => format!(
                "{a}.{key} = c.{key} AND {a}.fiscal_period = \
                 (SELECT MAX(q.fiscal_period) FROM {table} q WHERE q.{key} = c.{key})",
                key = JOIN_KEY,
                table = self.catalog.table_name(Table::FundamentalsQuarterly),
            ),
            _ => format!("{a}.{key} = c.{key}", key = JOIN_KEY),
        }
    }

    /// Catalog fields read directly by the base query: unwindowed filter
    /// conditions and sort keys, in first-seen order.
    fn referenced_fields(&self, query: &ScreenerQuery) -> Vec<&FieldDef> {
        let mut seen = BTreeSet::new();
        let mut fields = Vec::new();
        let mut push = |name: &str| {
            if let Some(def) = self.catalog.get(name) {
                if seen.insert(def.name) {
                    fields.push(def);
                }
            }
        };

        query.filter.for_each_condition(&mut |condition| {
            if condition.window.is_none() && condition.trend.is_none() {
                push(condition.field_name());
            }
        });
        for key in &query.sort {
            push(&key.field);
        }
        fields
    }
}

impl Default for SqlCompiler {
    fn default() -> Self {
        Self::new()
    }
}

fn operator_and_value<'c>(
    field: &str,
    condition: &'c Condition,
) -> Result<(Operator, &'c Literal), CompileError> {
    let operator = condition
        .operator
        .as_deref()
        .ok_or_else(|| CompileError::invalid(field, "missing operator"))?
        .parse::<Operator>()
        .map_err(|message| CompileError::invalid(field, message))?;
    match &condition.value {
        Some(Literal::Null) | None => Err(CompileError::invalid(field, "missing value")),
        Some(value) => Ok((operator, value)),
    }
}

fn range_spec(field: &str, range: &Range) -> Result<RangeSpec, CompileError> {
    let bound = |literal: &Option<Literal>| match literal {
        None => Ok(None),
        Some(literal) => literal
            .as_f64()
            .map(Some)
            .ok_or_else(|| CompileError::invalid(field, "range bounds must be numeric")),
    };
    let min = bound(&range.min)?;
    let max = bound(&range.max)?;
    if min.is_none() && max.is_none() {
        return Err(CompileError::invalid(field, "range must set min or max"));
    }
    Ok(RangeSpec { min, max, inclusive: range.is_inclusive() })
}

fn apply_null_policy(column: &str, predicate: String, on_missing: NullPolicy) -> String {
    match on_missing {
        NullPolicy::Fail => format!("({} IS NOT NULL AND {})", column, predicate),
        NullPolicy::Ignore => format!("({} IS NULL OR {})", column, predicate),
        NullPolicy::Exclude | NullPolicy::Fallback => predicate,
    }
}

/// Convert a literal into a bound parameter
fn literal_to_value(field: &str, literal: &Literal) -> Result<Value, CompileError> {
    match literal {
        Literal::Integer(n) => Ok(Value::BigInt(Some(*n))),
        Literal::Float(n) => Ok(Value::Double(Some(*n))),
        Literal::String(s) => Ok(Value::String(Some(Box::new(s.clone())))),
        Literal::Bool(b) => Ok(Value::Bool(Some(*b))),
        Literal::Null => Err(CompileError::invalid(field, "null cannot be compared")),
    }
}

pub fn literal_to_json(literal: &Literal) -> serde_json::Value {
    match literal {
        Literal::Integer(n) => json!(n),
        Literal::Float(n) => json!(n),
        Literal::String(s) => json!(s),
        Literal::Bool(b) => json!(b),
        Literal::Null => serde_json::Value::Null,
    }
}

pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::BigInt(Some(n)) => json!(n),
        Value::Int(Some(n)) => json!(n),
        Value::Double(Some(n)) => json!(n),
        Value::String(Some(s)) => json!(s.as_str()),
        Value::Bool(Some(b)) => json!(b),
        _ => serde_json::Value::Null,
    }
}

/// Every placeholder `$1..=$n` appears and nothing beyond `params`.
fn check_placeholders(sql: &str, params: usize) -> Result<(), CompileError> {
    let mut seen = BTreeSet::new();
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
            if let Ok(n) = sql[start..end].parse::<usize>() {
                seen.insert(n);
            }
            i = end.max(start);
        } else {
            i += 1;
        }
    }

    let contiguous = seen.iter().copied().eq(1..=seen.len());
    if seen.len() != params || !contiguous {
        return Err(CompileError::ParameterMismatch {
            placeholders: seen.len(),
            params,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_str;
    use crate::validator::ValidationCode;

    fn compile(json: &str) -> CompiledQuery {
        SqlCompiler::new().compile(&parse_str(json).unwrap()).unwrap()
    }

    fn condition(json: &str) -> Condition {
        match parse_str(json).unwrap().filter {
            FilterNode::Condition(condition) => condition,
            other => panic!("expected condition, got {:?}", other),
        }
    }

    #[test]
    fn test_parameter_order_follows_tree() {
        let query = compile(
            r#"{"filter":{"and":[
                {"field":"pe_ratio","operator":"<","value":20},
                {"field":"revenue","operator":">","value":1000}
            ]}}"#,
        );
        assert!(query.sql.contains("pe_ratio < $1"));
        assert!(query.sql.contains("revenue > $2"));
        assert_eq!(query.params, vec![Value::BigInt(Some(20)), Value::BigInt(Some(1000))]);
        assert!(query.derived_metrics.is_empty());
    }

    #[test]
    fn test_base_query_shape() {
        let query = compile(r#"{"field":"pe_ratio","operator":"<","value":20}"#);
        assert!(query.sql.starts_with("SELECT \"c\".\"ticker\""));
        assert!(query.sql.contains("FROM \"companies\" AS \"c\""));
        assert!(query.sql.contains("LEFT JOIN \"fundamentals_quarterly\" AS \"f\""));
        assert!(query.sql.contains("SELECT MAX(q.fiscal_period)"));
        assert!(query.sql.contains("\"f\".\"pe_ratio\" AS \"pe_ratio\""));
        assert!(!query.sql.contains("\"ownership\""));
        assert!(query.sql.contains("ORDER BY \"c\".\"ticker\" ASC"));
        assert!(query.sql.contains("LIMIT 100"));
    }

    #[test]
    fn test_range_between_and_exclusive() {
        let compiler = SqlCompiler::new();
        let inclusive = compiler
            .compile_condition(&condition(r#"{"field":"pe_ratio","range":{"min":5,"max":15,"inclusive":true}}"#), 1)
            .unwrap();
        assert_eq!(inclusive.sql.as_deref(), Some("f.pe_ratio BETWEEN $1 AND $2"));
        assert_eq!(inclusive.params, vec![Value::Double(Some(5.0)), Value::Double(Some(15.0))]);

        let exclusive = compiler
            .compile_condition(&condition(r#"{"field":"pe_ratio","range":{"min":5,"max":15,"exclusive":true}}"#), 3)
            .unwrap();
        assert_eq!(exclusive.sql.as_deref(), Some("(f.pe_ratio > $3 AND f.pe_ratio < $4)"));

        let max_only = compiler
            .compile_condition(&condition(r#"{"field":"roe","range":{"max":15}}"#), 1)
            .unwrap();
        assert_eq!(max_only.sql.as_deref(), Some("f.roe <= $1"));
        assert_eq!(max_only.params.len(), 1);
    }

    #[test]
    fn test_derived_condition_has_no_sql() {
        let query = compile(
            r#"{"filter":{"and":[
                {"field":"pe_ratio","operator":"<","value":20},
                {"field":"peg_ratio","operator":"<","value":1.5}
            ]}}"#,
        );
        assert_eq!(query.params.len(), 1);
        assert!(!query.sql.contains("peg_ratio"));
        assert_eq!(query.derived_metrics.len(), 1);

        let derived = &query.derived_metrics[0];
        assert!(derived.is_derived);
        assert!(derived.sql.is_none());
        assert_eq!(derived.field, "peg_ratio");
        assert_eq!(derived.operator, Some(Operator::Lt));
        assert_eq!(derived.value, Some(Literal::Float(1.5)));
    }

    #[test]
    fn test_only_derived_conditions_have_no_where() {
        let query = compile(r#"{"field":"peg_ratio","operator":"<","value":1.5}"#);
        assert!(!query.sql.contains("WHERE"));
        assert!(query.params.is_empty());
        assert_eq!(query.derived_metrics.len(), 1);
    }

    #[test]
    fn test_limit_deferred_with_derived_conditions() {
        let query = compile(
            r#"{"filter":{"and":[
                {"field":"pe_ratio","operator":"<","value":20},
                {"field":"debt_to_fcf","operator":"<","value":3}
            ]},"limit":7}"#,
        );
        assert!(!query.sql.contains("LIMIT"));
        assert_eq!(query.limit, 7);
        assert_eq!(query.to_json()["limit"], 7);

        let plain = compile(r#"{"filter":{"field":"pe_ratio","operator":"<","value":20},"limit":7}"#);
        assert!(plain.sql.contains("LIMIT 7"));
        assert_eq!(plain.limit, 7);
    }

    #[test]
    fn test_null_policies() {
        let compiler = SqlCompiler::new();
        let fail = compiler
            .compile_condition(&condition(r#"{"field":"pe_ratio","operator":"<","value":20,"on_missing":"fail"}"#), 1)
            .unwrap();
        assert_eq!(fail.sql.as_deref(), Some("(f.pe_ratio IS NOT NULL AND f.pe_ratio < $1)"));

        let ignore = compiler
            .compile_condition(&condition(r#"{"field":"pe_ratio","operator":"<","value":20,"on_missing":"ignore"}"#), 1)
            .unwrap();
        assert_eq!(ignore.sql.as_deref(), Some("(f.pe_ratio IS NULL OR f.pe_ratio < $1)"));

        let fallback = compiler
            .compile_condition(&condition(r#"{"field":"roe","operator":">","value":15,"on_missing":"fallback"}"#), 1)
            .unwrap();
        let sql = fallback.sql.unwrap();
        assert!(sql.starts_with("COALESCE(f.roe, (SELECT a.roe FROM fundamentals_annual a"));
        assert!(sql.ends_with("> $1"));
        assert!(fallback.requires_subquery);
    }

    #[test]
    fn test_window_aggregations() {
        let compiler = SqlCompiler::new();
        let avg = compiler
            .compile_condition(
                &condition(r#"{"field":"revenue","operator":">","value":1000,"window":{"type":"quarters","length":4,"aggregation":"avg"}}"#),
                1,
            )
            .unwrap();
        let sql = avg.sql.unwrap();
        assert!(sql.starts_with("(SELECT AVG(v)"));
        assert!(sql.contains("FROM fundamentals_quarterly h"));
        assert!(sql.contains("LIMIT 4"));
        assert!(sql.ends_with("> $1"));
        assert!(avg.requires_subquery);
        assert_eq!(avg.params, vec![Value::BigInt(Some(1000))]);

        let cagr = compiler
            .compile_condition(
                &condition(r#"{"field":"eps","operator":">","value":0.15,"window":{"type":"years","length":5,"aggregation":"cagr"}}"#),
                2,
            )
            .unwrap();
        let sql = cagr.sql.unwrap();
        assert!(sql.contains("POWER("));
        assert!(sql.contains("NULLIF(first_v, 0)"));
        assert!(sql.contains("FROM fundamentals_annual h"));
        assert!(sql.contains("ORDER BY h.fiscal_year DESC LIMIT 5"));
        assert!(sql.ends_with("> $2"));
    }

    #[test]
    fn test_trend_subqueries() {
        let compiler = SqlCompiler::new();
        let increasing = compiler
            .compile_condition(
                &condition(r#"{"field":"revenue","trend":"increasing","window":{"type":"years","length":3}}"#),
                1,
            )
            .unwrap();
        let sql = increasing.sql.unwrap();
        assert!(sql.starts_with("EXISTS (SELECT COUNT(*) FROM (SELECT v, LAG(v)"));
        assert!(sql.contains("LAG(v) OVER (ORDER BY p)"));
        assert!(sql.contains("COUNT(*) >= 3"));
        assert!(sql.contains("v <= prev_v"));
        assert!(increasing.params.is_empty());

        let stable = compiler
            .compile_condition(
                &condition(r#"{"field":"operating_margin","trend":"stable","period":{"unit":"quarter","last":4}}"#),
                1,
            )
            .unwrap();
        let sql = stable.sql.unwrap();
        assert!(sql.starts_with("EXISTS (SELECT COUNT(*) FROM"));
        assert!(sql.contains("AVG(v) OVER ()"));
        assert!(sql.contains("0.1 * ABS(avg_v)"));
        assert!(sql.contains("FROM fundamentals_quarterly h"));
    }

    #[test]
    fn test_nested_or_and_not() {
        let query = compile(
            r#"{"filter":{"and":[
                {"or":[
                    {"field":"sector","operator":"=","value":"Technology"},
                    {"field":"roe","operator":">","value":20}
                ]},
                {"not":{"field":"debt_to_equity","operator":">","value":2}}
            ]}}"#,
        );
        assert!(query.sql.contains("((c.sector = $1 OR f.roe > $2) AND NOT (f.debt_to_equity > $3))"));
        assert_eq!(query.params.len(), 3);
        assert_eq!(query.params[0], Value::String(Some(Box::new("Technology".to_string()))));
    }

    #[test]
    fn test_or_root_is_allowed() {
        let query = compile(
            r#"{"filter":{"or":[
                {"field":"pe_ratio","operator":"<","value":10},
                {"field":"promoter_holding","operator":">","value":50}
            ]}}"#,
        );
        assert!(query.sql.contains("(f.pe_ratio < $1 OR o.promoter_holding > $2)"));
        assert!(query.sql.contains("LEFT JOIN \"ownership\" AS \"o\""));
    }

    #[test]
    fn test_derived_under_or_is_rejected() {
        let compiler = SqlCompiler::new();
        let nodes = vec![
            FilterNode::Condition(Condition::compare("peg_ratio", "<", 1.0)),
            FilterNode::Condition(Condition::compare("pe_ratio", "<", 10i64)),
        ];
        let err = compiler.compile_group(&nodes, LogicalOp::Or, 1).unwrap_err();
        assert_eq!(err, CompileError::NonConjunctiveDerived("peg_ratio".into()));

        let group = compiler.compile_group(&nodes, LogicalOp::And, 4).unwrap();
        assert_eq!(group.sql.as_deref(), Some("f.pe_ratio < $4"));
        assert_eq!(group.derived.len(), 1);
    }

    #[test]
    fn test_compile_rechecks_without_validation() {
        let compiler = SqlCompiler::new();
        let err = compiler
            .compile_condition(&condition(r#"{"field":"pe_ratio","operator":"~","value":1}"#), 1)
            .unwrap_err();
        assert!(matches!(err, CompileError::InvalidCondition { .. }));

        let err = compiler
            .compile_condition(&condition(r#"{"field":"pe_ratio","range":{}}"#), 1)
            .unwrap_err();
        assert!(matches!(err, CompileError::InvalidCondition { .. }));

        let err = compiler
            .compile_condition(
                &condition(r#"{"field":"revenue","trend":"increasing","window":{"type":"years","length":400}}"#),
                1,
            )
            .unwrap_err();
        assert!(matches!(err, CompileError::InvalidCondition { .. }));
    }

    #[test]
    fn test_validation_runs_first() {
        let err = SqlCompiler::new()
            .compile(&parse_str(r#"{"field":"shoe_size","operator":">","value":9}"#).unwrap())
            .unwrap_err();
        match err {
            CompileError::Validation(e) => assert_eq!(e.code, ValidationCode::UnsupportedMetric),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_sort_limit_and_table_mapping() {
        let mut config = ScreenerConfig::default();
        config.tables.mappings.insert("companies".into(), "market.stocks".into());
        let compiler = SqlCompiler::with_config(&config);
        let query = compiler
            .compile(
                &parse_str(
                    r#"{"filter":{"field":"industry","operator":"=","value":"Banks"},
                        "sort":[{"field":"roe","direction":"desc"}],"limit":5}"#,
                )
                .unwrap(),
            )
            .unwrap();
        assert!(query.sql.contains("FROM \"market\".\"stocks\" AS \"c\""));
        assert!(query.sql.contains("\"c\".\"industry\" AS \"industry\""));
        assert!(query.sql.contains("ORDER BY \"f\".\"roe\" DESC"));
        assert!(query.sql.contains("LIMIT 5"));
    }

    #[test]
    fn test_placeholder_check() {
        assert!(check_placeholders("a < $1 AND b > $2", 2).is_ok());
        assert!(check_placeholders("a < 1", 0).is_ok());
        assert_eq!(
            check_placeholders("a < $1 AND b > $3", 2),
            Err(CompileError::ParameterMismatch { placeholders: 2, params: 2 })
        );
        assert!(check_placeholders("a < $1", 2).is_err());
    }

    #[test]
    fn test_compiled_query_json() {
        let query = compile(
            r#"{"filter":{"and":[
                {"field":"roe","operator":">","value":12.5},
                {"field":"eps_cagr","operator":">","value":0.1,"window":{"type":"years","length":3}}
            ]}}"#,
        );
        let json = query.to_json();
        assert_eq!(json["params"], json!([12.5]));
        assert_eq!(json["derived_metrics"][0]["field"], "eps_cagr");
        assert_eq!(json["derived_metrics"][0]["window"]["type"], "years");
        assert_eq!(json["derived_metrics"][0]["window"]["length"], 3);
    }
}
