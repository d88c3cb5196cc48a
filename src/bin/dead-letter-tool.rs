// Copyright (c) 2025 - Cowboy AI, Inc.
//! Dead-Letter Tool
//!
//! Operator utility for the dead-letter queue on a NATS JetStream deployment.
//!
//! Run with: cargo run --bin dead-letter-tool --features nats -- <command>
//!
//! Settings not given as flags come from `MessagingConfig::from_env`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cim_messaging::{processor_fn, EventBus, MessagingConfig};
use std::time::Duration;
use tracing::{info, warn};

/// Inspect, purge or replay the dead-letter queue
#[derive(Parser, Debug)]
#[command(name = "dead-letter-tool")]
#[command(about = "Operate on the dead-letter queue of a cim-messaging deployment")]
struct Cli {
    /// Broker endpoint
    #[arg(long, env = "BROKER_URL")]
    broker_url: Option<String>,

    /// Exchange replayed events are published to
    #[arg(long, env = "EVENT_EXCHANGE")]
    exchange: Option<String>,

    /// Dead-letter exchange
    #[arg(long, env = "DEAD_LETTER_EXCHANGE")]
    dead_letter_exchange: Option<String>,

    /// Dead-letter queue to operate on
    #[arg(long, env = "DEAD_LETTER_QUEUE")]
    dead_letter_queue: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Print message and consumer counts
    Stats,
    /// Drop every parked message
    Purge,
    /// Republish parked events to their original routing keys
    Replay {
        /// Seconds to wait for the queue to drain
        #[arg(long, default_value = "30")]
        wait: u64,
    },
}

impl Cli {
    fn config(&self) -> Result<MessagingConfig> {
        let mut config = MessagingConfig::from_env().context("Invalid messaging configuration")?;
        if let Some(url) = &self.broker_url {
            config = config.with_broker_url(url.clone());
        }
        if let Some(exchange) = &self.exchange {
            config = config.with_exchange(exchange.clone());
        }
        if let Some(exchange) = &self.dead_letter_exchange {
            config = config.with_dead_letter_exchange(exchange.clone());
        }
        if let Some(queue) = &self.dead_letter_queue {
            config = config.with_dead_letter_queue(queue.clone());
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.config()?;
    let dead_letter_queue = config.dead_letter_queue.clone();

    let bus = EventBus::nats(config);
    bus.start().await.context("Failed to start event bus")?;

    let outcome = run(&bus, cli.command).await;
    bus.close().await.context("Failed to close event bus")?;
    outcome.with_context(|| format!("Command failed on queue '{}'", dead_letter_queue))
}

async fn run(bus: &EventBus, command: Command) -> Result<()> {
    let dead_letters = bus.dead_letters();
    match command {
        Command::Stats => {
            let stats = dead_letters.dead_letter_stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Purge => {
            let purged = dead_letters.purge_dead_letter_queue().await?;
            println!("purged {} message(s)", purged);
        }
        Command::Replay { wait } => {
            let before = dead_letters.dead_letter_stats().await?;
            info!(messages = before.message_count, "Replaying dead-lettered events");

            dead_letters
                .process_dead_letter_queue(processor_fn(|message| async move {
                    if message.envelope.is_none() {
                        warn!(
                            queue = %message.original_queue,
                            "Discarding dead-lettered message that is not a valid event"
                        );
                        return Ok(false);
                    }
                    Ok(true)
                }))
                .await?;

            let deadline = tokio::time::Instant::now() + Duration::from_secs(wait);
            loop {
                let stats = dead_letters.dead_letter_stats().await?;
                if stats.message_count == 0 {
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    warn!(remaining = stats.message_count, "Replay wait elapsed");
                    break;
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            println!("replayed {} message(s)", before.message_count);
        }
    }
    Ok(())
}
