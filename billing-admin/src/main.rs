use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use std::fmt::Display;
use std::io::Write;
use std::path::PathBuf;

use gateway_billing::observability::{self, LogFormat};
use gateway_billing::tariff::TariffUpdate;
use gateway_billing::{BillingConfig, BillingService, Error, ErrorDetails};

#[derive(Parser, Debug)]
#[command(version, about = "Inspect and manage token usage, rate limits and tariffs")]
struct Cli {
    /// Use the billing config file at the specified path. Without it, the
    /// configuration is read from the environment.
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Sets the log format used for all logs (written to stderr).
    #[arg(long)]
    #[arg(value_enum)]
    #[clap(default_value_t = LogFormat::default())]
    log_format: LogFormat,

    /// Enable debug logs
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Token usage of a key measured against its tariff
    Usage { api_key: String },
    /// Reset a key's token counter to zero
    ResetUsage { api_key: String },
    /// Reset every key's token counter
    ResetMonthly,
    /// Aggregate usage over all keys
    Stats,
    /// Counter backend health
    Health,
    /// Current request window of a key, without counting a request
    RateLimitInfo { api_key: String },
    /// Drop a key's request window
    ResetRateLimit { api_key: String },
    /// Tariff management. Overrides set here only live for this process;
    /// persist them in the `[tariffs]` table of the config file.
    #[command(subcommand)]
    Tariff(TariffCommand),
}

#[derive(Subcommand, Debug)]
enum TariffCommand {
    /// Tariff assigned to a key
    Get { api_key: String },
    /// Set a custom tariff
    Set(SetTariffArgs),
    /// Apply a plan preset (basic, premium, enterprise, unlimited)
    Apply { api_key: String, plan: String },
    /// Remove a custom tariff
    Remove { api_key: String },
    /// All custom tariffs
    List,
    /// Distribution of custom tariffs
    Stats,
    /// Check a key's tariff
    Validate { api_key: String },
}

#[derive(Args, Debug)]
struct SetTariffArgs {
    api_key: String,
    #[arg(long)]
    max_tokens: u64,
    #[arg(long, default_value = "Custom")]
    name: String,
    #[arg(long, default_value = "Custom tariff")]
    description: String,
    #[arg(long)]
    max_requests_per_window: Option<u32>,
    #[arg(long)]
    window_seconds: Option<u64>,
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value, Error> {
    serde_json::to_value(value).map_err(|e| {
        Error::new(ErrorDetails::Serialization {
            message: format!("Failed to serialize command output: {e}"),
        })
    })
}

async fn run(service: &BillingService, command: Command) -> Result<serde_json::Value, Error> {
    match command {
        Command::Usage { api_key } => {
            let detailed = service.usage().get_detailed_usage(&api_key).await;
            let tariff_usage = service.tariff_usage(&api_key).await;
            Ok(json!({
                "api_key": detailed.api_key,
                "used_tokens": detailed.used_tokens,
                "last_updated": detailed.last_updated,
                "storage_type": detailed.storage_type,
                "max_tokens": tariff_usage.tariff.max_tokens,
                "remaining_tokens": tariff_usage.remaining_tokens,
                "usage_percentage": tariff_usage.usage_percentage,
                "tariff_name": tariff_usage.tariff.name,
            }))
        }
        Command::ResetUsage { api_key } => {
            let success = service.usage().reset_usage(&api_key).await;
            Ok(json!({ "success": success }))
        }
        Command::ResetMonthly => to_json(&service.usage().reset_monthly_usage().await),
        Command::Stats => to_json(&service.usage().get_all_usage_stats().await),
        Command::Health => Ok(json!({
            "usage": to_json(&service.health_check().await)?,
            "redis": to_json(&service.rate_limiter().get_redis_health())?,
        })),
        Command::RateLimitInfo { api_key } => {
            to_json(&service.rate_limiter().get_rate_limit_info(&api_key).await)
        }
        Command::ResetRateLimit { api_key } => {
            let success = service.rate_limiter().reset_rate_limit(&api_key).await;
            Ok(json!({ "success": success }))
        }
        Command::Tariff(command) => run_tariff(service, command),
    }
}

fn run_tariff(service: &BillingService, command: TariffCommand) -> Result<serde_json::Value, Error> {
    let tariffs = service.tariffs();
    match command {
        TariffCommand::Get { api_key } => to_json(tariffs.get_tariff(&api_key).as_ref()),
        TariffCommand::Set(args) => {
            let update = TariffUpdate {
                max_tokens: args.max_tokens,
                name: args.name,
                description: args.description,
                max_requests_per_window: args.max_requests_per_window,
                window_seconds: args.window_seconds,
            };
            to_json(tariffs.set_tariff(&args.api_key, update)?.as_ref())
        }
        TariffCommand::Apply { api_key, plan } => {
            to_json(tariffs.apply_tariff_plan_by_name(&api_key, &plan)?.as_ref())
        }
        TariffCommand::Remove { api_key } => {
            Ok(json!({ "success": tariffs.remove_tariff(&api_key) }))
        }
        TariffCommand::List => to_json(&tariffs.list_tariffs()),
        TariffCommand::Stats => to_json(&tariffs.tariff_stats()),
        TariffCommand::Validate { api_key } => to_json(&tariffs.validate_api_key_tariff(&api_key)),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    observability::setup_logs(cli.debug, cli.log_format).expect_pretty("Failed to set up logs");

    let config = match &cli.config_file {
        Some(path) => BillingConfig::load_from_path(path),
        None => BillingConfig::from_env(),
    }
    .expect_pretty("Failed to load config");

    let service = BillingService::from_config(&config)
        .await
        .expect_pretty("Failed to initialize billing service");

    let output = run(&service, cli.command)
        .await
        .expect_pretty("Command failed");
    let rendered = serde_json::to_string_pretty(&output).expect_pretty("Failed to render output");

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{rendered}").expect_pretty("Failed to write output");
}

/// ┌──────────────────────────────────────────────────────────────────────────┐
/// │                           MAIN.RS ESCAPE HATCH                           │
/// └──────────────────────────────────────────────────────────────────────────┘
///
/// We don't allow panic, unwrap, or similar methods in the codebase, except
/// for the private `expect_pretty` method, which is to be used only in
/// main.rs. It logs an error message and exits with a status code of 1.
trait ExpectPretty<T> {
    fn expect_pretty(self, msg: &str) -> T;
}

impl<T, E: Display> ExpectPretty<T> for Result<T, E> {
    fn expect_pretty(self, msg: &str) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                tracing::error!("{msg}: {err}");
                std::process::exit(1);
            }
        }
    }
}
