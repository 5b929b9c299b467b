//! 筛选 DSL 的语法树
//!
//! The tree mirrors the JSON payload one-to-one and keeps operator, trend,
//! unit and policy names as the raw strings the client sent. Nothing here is
//! trusted: the validator decides whether a tree is acceptable and the
//! compiler converts the raw names into the typed enums below.

use std::fmt;
use std::str::FromStr;

/// 一次完整的筛选请求
#[derive(Debug, Clone, PartialEq)]
pub struct ScreenerQuery {
    pub filter: FilterNode,
    pub sort: Vec<SortKey>,
    /// 未指定时使用配置中的默认值
    pub limit: Option<u64>,
}

impl ScreenerQuery {
    pub fn new(filter: FilterNode) -> Self {
        Self {
            filter,
            sort: Vec::new(),
            limit: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub field: String,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// 过滤条件树
#[derive(Debug, Clone, PartialEq)]
pub enum FilterNode {
    /// 逻辑与 (AND), 至少两个子节点
    And(Vec<FilterNode>),
    /// 逻辑或 (OR), 至少两个子节点
    Or(Vec<FilterNode>),
    /// 逻辑非 (NOT)
    Not(Box<FilterNode>),
    /// 叶子条件
    Condition(Condition),
}

impl FilterNode {
    /// Visits every leaf condition in left-to-right order.
    pub fn for_each_condition<'a>(&'a self, f: &mut impl FnMut(&'a Condition)) {
        match self {
            FilterNode::And(children) | FilterNode::Or(children) => {
                for child in children {
                    child.for_each_condition(f);
                }
            }
            FilterNode::Not(child) => child.for_each_condition(f),
            FilterNode::Condition(condition) => f(condition),
        }
    }
}

/// A leaf condition exactly as received.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Condition {
    pub field: Option<String>,
    pub operator: Option<String>,
    pub value: Option<Literal>,
    pub range: Option<Range>,
    pub window: Option<Window>,
    pub trend: Option<String>,
    pub on_missing: Option<String>,
}

impl Condition {
    /// Shorthand for a basic `field <op> value` condition.
    pub fn compare(field: &str, operator: &str, value: impl Into<Literal>) -> Self {
        Self {
            field: Some(field.to_string()),
            operator: Some(operator.to_string()),
            value: Some(value.into()),
            ..Default::default()
        }
    }

    pub fn field_name(&self) -> &str {
        self.field.as_deref().unwrap_or("")
    }

    /// Number of shapes (operator, range, trend) this condition carries.
    pub fn shape_count(&self) -> usize {
        [
            self.operator.is_some(),
            self.range.is_some(),
            self.trend.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Range {
    pub min: Option<Literal>,
    pub max: Option<Literal>,
    pub inclusive: Option<bool>,
    pub exclusive: Option<bool>,
}

impl Range {
    /// Bounds are inclusive unless the client asked otherwise.
    pub fn is_inclusive(&self) -> bool {
        if self.exclusive == Some(true) {
            return false;
        }
        self.inclusive.unwrap_or(true)
    }

    pub fn numeric_bounds(&self) -> (Option<f64>, Option<f64>) {
        (
            self.min.as_ref().and_then(Literal::as_f64),
            self.max.as_ref().and_then(Literal::as_f64),
        )
    }
}

/// Trailing span of fiscal periods. `unit` is `type` in the payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Window {
    pub unit: Option<String>,
    pub length: Option<Literal>,
    pub aggregation: Option<String>,
}

/// 字面量值
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Integer(i64),
    Float(f64),
    String(String),
    Bool(bool),
    Null,
}

impl Literal {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Literal::Integer(n) => Some(*n as f64),
            Literal::Float(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        self.as_f64().is_some()
    }

    /// Strictly positive integer, as required for window lengths.
    pub fn as_positive_int(&self) -> Option<u32> {
        match self {
            Literal::Integer(n) if *n > 0 => u32::try_from(*n).ok(),
            Literal::Float(n) if *n > 0.0 && n.fract() == 0.0 && *n <= u32::MAX as f64 => {
                Some(*n as u32)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Integer(n) => write!(f, "{}", n),
            Literal::Float(n) => write!(f, "{}", n),
            Literal::String(s) => write!(f, "\"{}\"", s),
            Literal::Bool(b) => write!(f, "{}", b),
            Literal::Null => write!(f, "null"),
        }
    }
}

impl From<i64> for Literal {
    fn from(n: i64) -> Self {
        Literal::Integer(n)
    }
}

impl From<f64> for Literal {
    fn from(n: f64) -> Self {
        Literal::Float(n)
    }
}

impl From<&str> for Literal {
    fn from(s: &str) -> Self {
        Literal::String(s.to_string())
    }
}

/// 比较运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Lt,    // <
    Gt,    // >
    Lte,   // <=
    Gte,   // >=
    Eq,    // =
    NotEq, // !=
}

impl Operator {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Operator::Lt => "<",
            Operator::Gt => ">",
            Operator::Lte => "<=",
            Operator::Gte => ">=",
            Operator::Eq => "=",
            Operator::NotEq => "!=",
        }
    }

    pub fn evaluate(&self, left: f64, right: f64) -> bool {
        match self {
            Operator::Lt => left < right,
            Operator::Gt => left > right,
            Operator::Lte => left <= right,
            Operator::Gte => left >= right,
            Operator::Eq => left == right,
            Operator::NotEq => left != right,
        }
    }
}

impl FromStr for Operator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "<" => Ok(Operator::Lt),
            ">" => Ok(Operator::Gt),
            "<=" => Ok(Operator::Lte),
            ">=" => Ok(Operator::Gte),
            "=" | "==" => Ok(Operator::Eq),
            "!=" | "<>" => Ok(Operator::NotEq),
            other => Err(format!("unsupported operator '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

impl Trend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trend::Increasing => "increasing",
            Trend::Decreasing => "decreasing",
            Trend::Stable => "stable",
        }
    }
}

impl FromStr for Trend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "increasing" => Ok(Trend::Increasing),
            "decreasing" => Ok(Trend::Decreasing),
            "stable" => Ok(Trend::Stable),
            other => Err(format!("unsupported trend '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowUnit {
    Quarters,
    Years,
}

impl WindowUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowUnit::Quarters => "quarters",
            WindowUnit::Years => "years",
        }
    }
}

impl FromStr for WindowUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quarters" | "quarter" => Ok(WindowUnit::Quarters),
            "years" | "year" => Ok(WindowUnit::Years),
            other => Err(format!("unsupported window unit '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Avg,
    Sum,
    Latest,
    Cagr,
}

impl Aggregation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Avg => "avg",
            Aggregation::Sum => "sum",
            Aggregation::Latest => "latest",
            Aggregation::Cagr => "cagr",
        }
    }
}

impl FromStr for Aggregation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "avg" => Ok(Aggregation::Avg),
            "sum" => Ok(Aggregation::Sum),
            "latest" => Ok(Aggregation::Latest),
            "cagr" => Ok(Aggregation::Cagr),
            other => Err(format!("unsupported aggregation '{}'", other)),
        }
    }
}

/// How a condition treats a missing value. `Exclude` applies when the
/// payload names no policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NullPolicy {
    #[default]
    Exclude,
    Fail,
    Ignore,
    Fallback,
}

impl NullPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            NullPolicy::Exclude => "exclude",
            NullPolicy::Fail => "fail",
            NullPolicy::Ignore => "ignore",
            NullPolicy::Fallback => "fallback",
        }
    }
}

impl FromStr for NullPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fail" => Ok(NullPolicy::Fail),
            "ignore" => Ok(NullPolicy::Ignore),
            "fallback" => Ok(NullPolicy::Fallback),
            other => Err(format!("unsupported on_missing policy '{}'", other)),
        }
    }
}

/// Typed window, produced once a [`Window`] has passed validation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSpec {
    pub unit: WindowUnit,
    pub length: u32,
    pub aggregation: Option<Aggregation>,
}

/// Typed numeric range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeSpec {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub inclusive: bool,
}

impl RangeSpec {
    pub fn contains(&self, value: f64) -> bool {
        let above = match self.min {
            Some(min) if self.inclusive => value >= min,
            Some(min) => value > min,
            None => true,
        };
        let below = match self.max {
            Some(max) if self.inclusive => value <= max,
            Some(max) => value < max,
            None => true,
        };
        above && below
    }
}
