use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use kafka_binder::config::BinderConfig;
use kafka_binder::consumer::{
    BindingConsumer, ConsumerError, ConverterRegistry, InboundMessage, MessageProcessor, Payload,
    ShutdownReason,
};
use kafka_binder::telemetry::{init_telemetry, init_tracing, shutdown_telemetry, LogFormat, TelemetryConfig};
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "kafka-binder")]
#[command(about = "Run a Kafka consumer binding with a logging handler", long_about = None)]
#[command(version)]
struct Cli {
    /// Binder settings file (YAML)
    #[arg(short, long, default_value = "binder.yml")]
    config: PathBuf,

    /// Name of the binding to run
    #[arg(short, long)]
    binding: String,

    /// Log output format (json or pretty)
    #[arg(long, default_value = "json", env = "KAFKA_BINDER_LOG_FORMAT")]
    log_format: LogFormat,

    /// Export traces over OTLP, configured through the `OTEL_*` variables
    #[arg(long, env = "KAFKA_BINDER_OTEL")]
    otel: bool,
}

/// Logs every decoded payload
struct LoggingProcessor;

#[async_trait]
impl MessageProcessor for LoggingProcessor {
    type Error = ConsumerError;

    async fn process(&self, message: &InboundMessage) -> Result<(), ConsumerError> {
        let record = message.record();
        let payload = match message.payload() {
            Payload::Json(value) => value.to_string(),
            Payload::Text(text) => text.clone(),
            Payload::Bytes(bytes) => format!("<{} bytes>", bytes.len()),
        };
        info!(
            topic = record.partition().topic(),
            partition = record.partition().partition(),
            offset = record.offset(),
            payload = %payload,
            "Record received"
        );

        if let Some(ack) = message.acknowledgment() {
            ack.acknowledge()?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "LoggingProcessor"
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.otel {
        init_telemetry(TelemetryConfig::from_env().with_log_format(cli.log_format))
            .context("Failed to initialise telemetry")?;
    } else {
        init_tracing(cli.log_format).context("Failed to initialise logging")?;
    }

    let result = run(&cli).await;
    if cli.otel {
        shutdown_telemetry();
    }
    result
}

async fn run(cli: &Cli) -> Result<()> {
    let binder = BinderConfig::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    let binding = binder
        .binding(&cli.binding, &ConverterRegistry::with_defaults())
        .with_context(|| format!("Invalid binding '{}'", cli.binding))?;

    let consumer = BindingConsumer::new(&binder.brokers, binding, LoggingProcessor)
        .await
        .context("Failed to start binding")?;

    let handle = consumer.handle();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                handle.shutdown();
            }
            Err(err) => {
                error!("Failed to listen for shutdown signal: {}", err);
            }
        }
    });

    let reason = consumer.run().await.context("Binding failed")?;
    info!(reason = %reason, "Binding stopped");

    if let ShutdownReason::FatalRecord { .. } = reason {
        anyhow::bail!("binding '{}' stopped on a fatal record", cli.binding);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_flags() {
        let cli = Cli::try_parse_from(["kafka-binder", "--binding", "orders-in", "--otel", "--log-format", "pretty"])
            .unwrap();
        assert_eq!(cli.binding, "orders-in");
        assert_eq!(cli.config, PathBuf::from("binder.yml"));
        assert_eq!(cli.log_format, LogFormat::Pretty);
        assert!(cli.otel);

        assert!(Cli::try_parse_from(["kafka-binder"]).is_err(), "binding is required");
    }
}
