use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::error::{Error, ErrorDetails};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

fn env_filter(debug: bool) -> EnvFilter {
    let default_level = if debug { "debug" } else { "info" };
    // `RUST_LOG` wins over the built-in default
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("warn,gateway_billing={default_level},billing_admin={default_level}").into()
    })
}

/// Install the global `tracing` subscriber.
///
/// Logs go to stderr so that stdout stays free for command output.
pub fn setup_logs(debug: bool, log_format: LogFormat) -> Result<(), Error> {
    let log_layer = match log_format {
        LogFormat::Pretty => Box::new(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            as Box<dyn Layer<_> + Send + Sync>,
        LogFormat::Json => Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        ),
    };

    tracing_subscriber::registry()
        .with(log_layer.with_filter(env_filter(debug)))
        .try_init()
        .map_err(|e| {
            Error::new(ErrorDetails::Observability {
                message: format!("Failed to install log subscriber: {e}"),
            })
        })
}
