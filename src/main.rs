//! 股票筛选器命令行
//!
//! ```text
//! screener compile query.json        # 只编译, 输出 SQL 与参数
//! screener run --db data.db query.json
//! screener repl [--db data.db]       # 交互模式, 每行一个 JSON 请求
//! ```
//!
//! 输入文件为 `-` 时从标准输入读取。

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::io::Read;
use std::path::{Path, PathBuf};
use stock_screener::parser::parse_str;
use stock_screener::{Screener, ScreenerConfig, ScreenerError, SqliteStore};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG_FILE: &str = "screener.json";
const CONFIG_ENV: &str = "SCREENER_CONFIG";
const HISTORY_FILE: &str = ".screener_history";

#[derive(Parser)]
#[command(name = "screener")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Compile and run stock screening filters")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to $SCREENER_CONFIG, then ./screener.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a request and print the SQL, parameters and derived conditions
    Compile {
        /// Request file, or `-` for stdin
        input: String,
    },

    /// Run a request against a SQLite database
    Run {
        /// Database path (overrides the configuration)
        #[arg(long)]
        db: Option<PathBuf>,
        /// Create the reference schema before running
        #[arg(long)]
        init_schema: bool,
        /// Request file, or `-` for stdin
        input: String,
    },

    /// Interactive mode, one JSON request per line
    Repl {
        /// Database path; without one requests are only compiled
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stock_screener=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Compile { input } => {
            let payload = read_input(&input)?;
            let screener = Screener::new(config, SqliteStore::open_in_memory()?);
            print_outcome(compile(&screener, &payload));
        }
        Commands::Run { db, init_schema, input } => {
            let payload = read_input(&input)?;
            let screener = open_screener(config, db)?;
            if init_schema {
                screener.store().init_schema(screener.compiler().catalog())?;
            }
            print_outcome(run(&screener, &payload));
        }
        Commands::Repl { db } => {
            let execute = db.is_some() || config.database.is_some();
            let screener = if execute {
                open_screener(config, db)?
            } else {
                Screener::new(config, SqliteStore::open_in_memory()?)
            };
            repl(&screener, execute)?;
        }
    }
    Ok(())
}

/// 配置来源优先级: --config > 环境变量 > 当前目录的 screener.json > 默认值
fn load_config(explicit: Option<&Path>) -> Result<ScreenerConfig> {
    if let Some(path) = explicit {
        return ScreenerConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()));
    }
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return ScreenerConfig::from_json_file(&path).with_context(|| format!("loading {}", path));
    }

    if !Path::new(DEFAULT_CONFIG_FILE).exists() {
        tracing::warn!("no {} found, using defaults", DEFAULT_CONFIG_FILE);
        return Ok(ScreenerConfig::default());
    }
    let config = ScreenerConfig::from_json_file(DEFAULT_CONFIG_FILE)?;
    tracing::info!(
        file = DEFAULT_CONFIG_FILE,
        tables = config.tables.get_mappings().len(),
        "configuration loaded"
    );
    Ok(config)
}

fn open_screener(config: ScreenerConfig, db: Option<PathBuf>) -> Result<Screener<SqliteStore>> {
    let path = db
        .or_else(|| config.database.clone())
        .context("no database given: pass --db or set `database` in the configuration")?;
    let store = SqliteStore::open(&path).with_context(|| format!("opening {}", path.display()))?;
    tracing::info!(db = %path.display(), "database opened");
    Ok(Screener::new(config, store))
}

fn read_input(input: &str) -> Result<String> {
    if input == "-" {
        let mut buffer = String::new();
        std::io::stdin().read_to_string(&mut buffer).context("reading stdin")?;
        return Ok(buffer);
    }
    std::fs::read_to_string(input).with_context(|| format!("reading {}", input))
}

fn compile(screener: &Screener<SqliteStore>, payload: &str) -> Result<serde_json::Value, ScreenerError> {
    let query = parse_str(payload)?;
    Ok(screener.compile(&query)?.to_json())
}

fn run(screener: &Screener<SqliteStore>, payload: &str) -> Result<serde_json::Value, ScreenerError> {
    let response = screener.screen_json(payload)?;
    Ok(serde_json::to_value(response).unwrap_or_default())
}

/// 成功输出到 stdout, 失败输出错误体到 stderr
fn print_outcome(outcome: Result<serde_json::Value, ScreenerError>) {
    match outcome {
        Ok(value) => println!("{}", pretty(&value)),
        Err(e) => {
            tracing::debug!(error = %e, "request rejected");
            let body = serde_json::to_value(e.body()).unwrap_or_default();
            eprintln!("{}", pretty(&serde_json::json!({ "error": body })));
        }
    }
}

fn pretty(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn repl(screener: &Screener<SqliteStore>, execute: bool) -> Result<()> {
    let mut editor = DefaultEditor::new()?;
    // 历史文件不存在时忽略
    let _ = editor.load_history(HISTORY_FILE);

    println!("--- Stock Screener ({}) ---", if execute { "run" } else { "compile only" });
    println!("每行输入一个 JSON 请求, :q 退出");

    loop {
        match editor.readline("screener> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if matches!(line, ":q" | ":quit" | "exit") {
                    break;
                }
                editor.add_history_entry(line)?;

                let outcome = if execute {
                    run(screener, line)
                } else {
                    compile(screener, line)
                };
                print_outcome(outcome);
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        }
    }

    if let Err(e) = editor.save_history(HISTORY_FILE) {
        tracing::warn!("cannot save history: {}", e);
    }
    Ok(())
}
