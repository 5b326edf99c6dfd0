// ██╗   ██╗ █████╗ ██╗     ██╗   ██╗███████╗    ██╗   ██╗██████╗
// ██║   ██║██╔══██╗██║     ██║   ██║██╔════╝    ██║   ██║██╔══██╗
// ██║   ██║███████║██║     ██║   ██║█████╗█████╗██║   ██║██████╔╝
// ╚██╗ ██╔╝██╔══██║██║     ██║   ██║██╔══╝╚════╝██║   ██║██╔═══╝
//  ╚████╔╝ ██║  ██║███████╗╚██████╔╝███████╗    ╚██████╔╝██║
//   ╚═══╝  ╚═╝  ╚═╝╚══════╝ ╚═════╝ ╚══════╝     ╚═════╝ ╚═╝
//
// E N G I N E
//
// Watches the KRX corporate value-up board, archives every new filing's
// PDF, asks an LLM which of the framework's targets each filing commits
// to, and keeps the answers in Google Sheets. One run per schedule tick;
// the process exits when the run is done.

mod analyzer;
mod cli;
mod config;
mod dedup;
mod error;
mod extractor;
mod framework;
mod lister;
mod metrics;
mod models;
mod notifier;
mod pipeline;
mod quota_breaker;
mod rate_budget;
mod retriever;
mod sheets;
mod stock_codes;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::analyzer::claude::ClaudeProvider;
use crate::analyzer::gemini::GeminiProvider;
use crate::analyzer::{LlmProvider, StructuredAnalyzer};
use crate::cli::Cli;
use crate::config::{Config, ProviderKind};
use crate::lister::KindLister;
use crate::notifier::TelegramNotifier;
use crate::pipeline::{Pipeline, RunOptions, Services};
use crate::retriever::KindRetriever;
use crate::sheets::google::GoogleClient;
use crate::stock_codes::StockCodeMapper;

fn print_banner() {
    let banner = r#"
    ╔══════════════════════════════════════════════════════════╗
    ║                                                          ║
    ║        📈  VALUE-UP DISCLOSURE ENGINE  📈                 ║
    ║                                                          ║
    ║   Source:    KIND 기업가치 제고 계획 공시                    ║
    ║   Extract:   pdf-extract + lopdf                         ║
    ║   Analyze:   Claude | Gemini structured extraction       ║
    ║   Store:     Google Sheets + Drive                       ║
    ║   Notify:    Telegram                                    ║
    ║                                                          ║
    ╚══════════════════════════════════════════════════════════╝
    "#;
    println!("{}", banner);
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        fmt().with_env_filter(filter).json().with_target(true).init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .init();
    }
}

/// First characters of a key, enough to tell which one is loaded.
fn key_prefix(key: &str) -> String {
    let prefix: String = key.chars().take(8).collect();
    format!("{}...", prefix)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // clap reads env overrides, so .env has to be loaded before parsing.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let config = Config::from_env();

    init_tracing(config.log_json);
    print_banner();

    info!(
        mode = ?cli.mode,
        days = cli.days,
        period = ?cli.period,
        max_pages = cli.max_pages,
        max_items = cli.max_items,
        dry_run = cli.dry_run,
        skip_pdf = cli.skip_pdf,
        "🚀 VALUE-UP ENGINE starting"
    );

    let missing = config.missing_required(cli.runs_analysis());
    if !missing.is_empty() {
        error!(missing = ?missing, "필수 환경변수가 설정되지 않았습니다");
        std::process::exit(1);
    }

    let code = run(&cli, &config).await?;
    info!(exit_code = code, "💤 VALUE-UP ENGINE done");
    std::process::exit(code);
}

async fn run(cli: &Cli, config: &Config) -> anyhow::Result<i32> {
    let client = config.http_client().context("building the HTTP client")?;
    let spreadsheet_id = config
        .spreadsheet_id
        .clone()
        .context("VALUEUP_GSPREAD_ID is not set")?;

    let auth = Arc::new(sheets::auth::from_config(client.clone(), config).context("loading Google credentials")?);
    if auth.mode() == "service-account" {
        info!(email = %config.service_account_email(), "Using service account; share the spreadsheet and folders with it");
    }
    let google = Arc::new(GoogleClient::new(client.clone(), auth, config));

    let analyzer = if cli.runs_analysis() {
        let key = config
            .provider_api_key()
            .with_context(|| format!("{} is not set", config.provider_key_var()))?;
        let provider: Arc<dyn LlmProvider> = match config.provider {
            ProviderKind::Claude => Arc::new(ClaudeProvider::new(
                client.clone(),
                &config.claude_api_url,
                key,
                &config.claude_model,
            )),
            ProviderKind::Gemini => Arc::new(GeminiProvider::new(
                client.clone(),
                &config.gemini_api_url,
                key,
                &config.gemini_model,
            )),
        };
        info!(provider = %config.provider, key = %key_prefix(key), "✅ Analyzer ready");
        Some(StructuredAnalyzer::new(provider, config.max_retries))
    } else {
        None
    };

    let services = Services {
        lister: Arc::new(KindLister::new(client.clone(), config)),
        retriever: Arc::new(KindRetriever::new(client.clone(), config)),
        stock_codes: Arc::new(StockCodeMapper::new(client.clone(), config)),
        sheets: google.clone(),
        drive: google,
        analyzer,
    };
    let pipeline = Pipeline::new(config, spreadsheet_id, services);

    let today = chrono::Local::now().date_naive();
    let report = pipeline.run(&RunOptions::from(cli), today).await;

    if let Some(path) = &config.github_output {
        match report.summary.write_github_output(path) {
            Ok(()) => info!(path = %path, "GITHUB_OUTPUT written"),
            Err(e) => warn!(path = %path, error = %e, "GITHUB_OUTPUT could not be written"),
        }
    }

    TelegramNotifier::new(client, config)
        .notify_run(&report.summary, &report.new_records, Some(&report.spreadsheet_url))
        .await;

    for message in report.summary.error_messages.iter().take(5) {
        warn!(error = %message, "Run error");
    }
    if report.summary.errors > 5 {
        warn!("... 외 {}건", report.summary.errors - 5);
    }

    Ok(report.summary.exit_code())
}
