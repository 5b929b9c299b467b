//! Stock screener: JSON filter DSL compiled to parameterized SQL, with
//! derived metrics resolved per candidate after the base query.
//!
//! ```text
//! payload ─ parser ─ validator ─ sql_compiler ─ runner ─┬─ store (base query)
//!                                                        └─ resolver ─ metrics
//! ```

pub mod ast;
pub mod catalog;
pub mod config;
pub mod metrics;
pub mod parser;
pub mod resolver;
pub mod runner;
pub mod screener;
pub mod sql_compiler;
pub mod store;
pub mod validator;

pub use config::ScreenerConfig;
pub use screener::{ErrorBody, ScreenResponse, Screener, ScreenerError};
pub use sql_compiler::{CompiledQuery, SqlCompiler};
pub use store::{SqliteStore, Store};
