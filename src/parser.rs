//! 筛选请求的解析器
//!
//! 把客户端提交的 JSON 负载转换为 [`ScreenerQuery`]。
//!
//! ## 解析流程
//!
//! ```text
//! parse_payload()
//!   ├─ 含 "filter" 键 → parse_node(filter) + parse_sort() + parse_limit()
//!   └─ 否则整个对象视为过滤树 → parse_node()
//!
//! parse_node()
//!   ├─ "and" → 数组, 逐个 parse_node()
//!   ├─ "or"  → 数组, 逐个 parse_node()
//!   ├─ "not" → 对象, parse_node()
//!   └─ 其他 → parse_condition()
//!                ├─ field / operator / value / trend / on_missing
//!                ├─ range  → parse_range()
//!                └─ window | period → parse_window()
//! ```
//!
//! 解析器只负责形状: 数组长度、字段是否已知、取值是否合法都留给
//! [`crate::validator`] 判断。

use crate::ast::{Condition, FilterNode, Literal, Range, ScreenerQuery, SortDirection, SortKey, Window};
use serde_json::{Map, Value};
use thiserror::Error;

/// 解析错误, `path` 指向出错的 JSON 位置 (例如 `filter.and[1].range`)
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message} (at {path})")]
pub struct ParseError {
    pub message: String,
    pub path: String,
}

impl ParseError {
    fn new(message: impl Into<String>, path: &str) -> Self {
        Self {
            message: message.into(),
            path: if path.is_empty() { "$".to_string() } else { path.to_string() },
        }
    }
}

/// 解析 JSON 文本
pub fn parse_str(input: &str) -> Result<ScreenerQuery, ParseError> {
    let value: Value = serde_json::from_str(input)
        .map_err(|e| ParseError::new(format!("invalid JSON: {}", e), ""))?;
    parse_payload(&value)
}

/// 解析已经反序列化的 JSON 负载
pub fn parse_payload(value: &Value) -> Result<ScreenerQuery, ParseError> {
    let object = value
        .as_object()
        .ok_or_else(|| ParseError::new("payload must be an object", ""))?;

    // 裸过滤树
    let Some(filter) = object.get("filter") else {
        return Ok(ScreenerQuery::new(parse_node(value, "")?));
    };

    let filter = parse_node(filter, "filter")?;
    let sort = match object.get("sort") {
        Some(sort) => parse_sort(sort, "sort")?,
        None => Vec::new(),
    };
    let limit = match object.get("limit") {
        Some(Value::Null) | None => None,
        Some(limit) => Some(
            limit
                .as_u64()
                .ok_or_else(|| ParseError::new("limit must be a non-negative integer", "limit"))?,
        ),
    };

    Ok(ScreenerQuery { filter, sort, limit })
}

fn parse_node(value: &Value, path: &str) -> Result<FilterNode, ParseError> {
    let object = value
        .as_object()
        .ok_or_else(|| ParseError::new("filter node must be an object", path))?;

    let logical: Vec<&str> = ["and", "or", "not"]
        .into_iter()
        .filter(|key| object.contains_key(*key))
        .collect();

    if logical.len() > 1 {
        return Err(ParseError::new(
            format!("node mixes logical keys: {}", logical.join(", ")),
            path,
        ));
    }

    match logical.first() {
        Some(&key) => {
            if object.contains_key("field") {
                return Err(ParseError::new(
                    format!("'{}' node cannot also carry a field", key),
                    path,
                ));
            }
            let child_path = join_path(path, key);
            match key {
                "not" => Ok(FilterNode::Not(Box::new(parse_node(&object[key], &child_path)?))),
                _ => {
                    let items = object[key].as_array().ok_or_else(|| {
                        ParseError::new(format!("'{}' must be an array", key), &child_path)
                    })?;
                    let children = items
                        .iter()
                        .enumerate()
                        .map(|(i, item)| parse_node(item, &format!("{}[{}]", child_path, i)))
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(if key == "and" {
                        FilterNode::And(children)
                    } else {
                        FilterNode::Or(children)
                    })
                }
            }
        }
        None => Ok(FilterNode::Condition(parse_condition(object, path)?)),
    }
}

fn parse_condition(object: &Map<String, Value>, path: &str) -> Result<Condition, ParseError> {
    let window = match (object.get("window"), object.get("period")) {
        (Some(_), Some(_)) => {
            return Err(ParseError::new("condition cannot carry both window and period", path))
        }
        (Some(window), None) => Some(parse_window(window, "type", "length", &join_path(path, "window"))?),
        (None, Some(period)) => Some(parse_window(period, "unit", "last", &join_path(path, "period"))?),
        (None, None) => None,
    };

    Ok(Condition {
        field: optional_string(object, "field", path)?,
        operator: optional_string(object, "operator", path)?,
        value: match object.get("value") {
            Some(value) => Some(parse_literal(value, &join_path(path, "value"))?),
            None => None,
        },
        range: match object.get("range") {
            Some(range) => Some(parse_range(range, &join_path(path, "range"))?),
            None => None,
        },
        window,
        trend: optional_string(object, "trend", path)?,
        on_missing: optional_string(object, "on_missing", path)?,
    })
}

fn parse_range(value: &Value, path: &str) -> Result<Range, ParseError> {
    let object = value
        .as_object()
        .ok_or_else(|| ParseError::new("range must be an object", path))?;

    Ok(Range {
        min: optional_literal(object, "min", path)?,
        max: optional_literal(object, "max", path)?,
        inclusive: optional_bool(object, "inclusive", path)?,
        exclusive: optional_bool(object, "exclusive", path)?,
    })
}

/// `window: {type, length}` 与 `period: {unit, last}` 两种写法映射到同一结构
fn parse_window(value: &Value, unit_key: &str, length_key: &str, path: &str) -> Result<Window, ParseError> {
    let object = value
        .as_object()
        .ok_or_else(|| ParseError::new("window must be an object", path))?;

    Ok(Window {
        unit: optional_string(object, unit_key, path)?,
        length: optional_literal(object, length_key, path)?,
        aggregation: optional_string(object, "aggregation", path)?,
    })
}

fn parse_sort(value: &Value, path: &str) -> Result<Vec<SortKey>, ParseError> {
    let items: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![value],
        _ => return Err(ParseError::new("sort must be an object or an array", path)),
    };

    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            let item_path = format!("{}[{}]", path, i);
            let object = item
                .as_object()
                .ok_or_else(|| ParseError::new("sort key must be an object", &item_path))?;
            let field = optional_string(object, "field", &item_path)?
                .ok_or_else(|| ParseError::new("sort key missing field", &item_path))?;
            let direction = match optional_string(object, "direction", &item_path)?.as_deref() {
                None | Some("asc") => SortDirection::Asc,
                Some("desc") => SortDirection::Desc,
                Some(other) => {
                    return Err(ParseError::new(
                        format!("unknown sort direction '{}'", other),
                        &item_path,
                    ))
                }
            };
            Ok(SortKey { field, direction })
        })
        .collect()
}

fn parse_literal(value: &Value, path: &str) -> Result<Literal, ParseError> {
    match value {
        Value::Null => Ok(Literal::Null),
        Value::Bool(b) => Ok(Literal::Bool(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(Literal::Integer(i)),
            None => n
                .as_f64()
                .map(Literal::Float)
                .ok_or_else(|| ParseError::new("number out of range", path)),
        },
        Value::String(s) => Ok(Literal::String(s.clone())),
        Value::Array(_) | Value::Object(_) => {
            Err(ParseError::new("value must be a scalar", path))
        }
    }
}

fn optional_literal(object: &Map<String, Value>, key: &str, path: &str) -> Result<Option<Literal>, ParseError> {
    match object.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => parse_literal(value, &join_path(path, key)).map(Some),
    }
}

fn optional_string(object: &Map<String, Value>, key: &str, path: &str) -> Result<Option<String>, ParseError> {
    match object.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ParseError::new(
            format!("'{}' must be a string", key),
            &join_path(path, key),
        )),
    }
}

fn optional_bool(object: &Map<String, Value>, key: &str, path: &str) -> Result<Option<bool>, ParseError> {
    match object.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(ParseError::new(
            format!("'{}' must be a boolean", key),
            &join_path(path, key),
        )),
    }
}

fn join_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}
