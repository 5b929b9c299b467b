//! Request facade: parse, compile, run.
//!
//! This is the surface the CLI (or any service wrapper) talks to. It owns
//! the compiler and the store, and renders failures into the public
//! [`ErrorBody`]. Execution failures never expose SQL to the caller.

use crate::ast::ScreenerQuery;
use crate::config::ScreenerConfig;
use crate::parser::{parse_payload, parse_str, ParseError};
use crate::runner::{RunError, Runner};
use crate::sql_compiler::{CompileError, CompiledQuery, SqlCompiler};
use crate::store::{Row, Store};
use crate::validator::ValidationCode;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScreenerError {
    #[error("invalid payload: {0}")]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Run(#[from] RunError),
}

/// Error as reported to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl ErrorBody {
    fn new(code: &str, message: impl Into<String>, field: Option<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            field,
        }
    }
}

impl ScreenerError {
    pub fn body(&self) -> ErrorBody {
        let structure = ValidationCode::InvalidStructure.as_str();
        match self {
            ScreenerError::Parse(e) => ErrorBody::new(structure, e.message.clone(), Some(e.path.clone())),
            ScreenerError::Compile(CompileError::Validation(e)) => {
                ErrorBody::new(e.code.as_str(), e.message.clone(), e.field.clone())
            }
            ScreenerError::Compile(CompileError::UnknownField(field)) => ErrorBody::new(
                ValidationCode::UnsupportedMetric.as_str(),
                self.to_string(),
                Some(field.clone()),
            ),
            ScreenerError::Compile(CompileError::InvalidCondition { field, .. })
            | ScreenerError::Compile(CompileError::NonConjunctiveDerived(field)) => {
                ErrorBody::new(structure, self.to_string(), Some(field.clone()))
            }
            ScreenerError::Compile(CompileError::ParameterMismatch { .. }) => {
                ErrorBody::new("COMPILATION_ERROR", "query could not be compiled", None)
            }
            ScreenerError::Run(_) => ErrorBody::new("EXECUTION_ERROR", "query execution failed", None),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScreenResponse {
    pub results: Vec<Row>,
}

pub struct Screener<S: Store> {
    config: ScreenerConfig,
    compiler: SqlCompiler,
    store: S,
}

impl<S: Store> Screener<S> {
    pub fn new(config: ScreenerConfig, store: S) -> Self {
        Self {
            compiler: SqlCompiler::with_config(&config),
            config,
            store,
        }
    }

    pub fn compiler(&self) -> &SqlCompiler {
        &self.compiler
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn compile(&self, query: &ScreenerQuery) -> Result<CompiledQuery, ScreenerError> {
        Ok(self.compiler.compile(query)?)
    }

    pub fn screen(&self, query: &ScreenerQuery) -> Result<ScreenResponse, ScreenerError> {
        let compiled = self.compile(query)?;
        let runner = Runner::new(&self.store, self.compiler.catalog(), &self.config);
        Ok(ScreenResponse {
            results: runner.run(&compiled)?,
        })
    }

    pub fn screen_json(&self, payload: &str) -> Result<ScreenResponse, ScreenerError> {
        self.screen(&parse_str(payload)?)
    }

    pub fn screen_value(&self, payload: &serde_json::Value) -> Result<ScreenResponse, ScreenerError> {
        self.screen(&parse_payload(payload)?)
    }
}
