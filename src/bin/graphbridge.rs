//! Graphbridge CLI: inspect configuration and replay captured traffic.
//!
//! Usage:
//!   graphbridge check [--config path]
//!   graphbridge transform --topic <topic> <payload.json> [--config path]
//!   graphbridge replay <capture.jsonl> [--config path]

use chrono::Utc;
use clap::{Parser, Subcommand};
use graphbridge::config::default_config_path;
use graphbridge::{
    BridgeConfig, Clock, GraphSink, ManualClock, Pipeline, RawMessage, TopicRouter, Transformer,
};
use serde::Deserialize;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "graphbridge",
    version,
    about = "Delivery pipeline from topic-routed messages into a graph store"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to the YAML configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate the configuration, then list the mappings
    Check,
    /// Transform one payload and print the resulting record
    Transform {
        /// Topic the payload arrived on
        #[arg(long)]
        topic: String,
        /// File holding the JSON payload
        payload: PathBuf,
    },
    /// Feed a JSON-lines capture through the pipeline into an in-memory store
    Replay {
        /// Capture file, one `{"topic": .., "payload": {..}}` per line
        capture: PathBuf,
    },
}

#[derive(Deserialize)]
struct CapturedMessage {
    topic: String,
    payload: serde_json::Value,
}

fn load_config(path: Option<PathBuf>) -> Result<BridgeConfig, String> {
    let path = path
        .or_else(default_config_path)
        .ok_or_else(|| "no --config given and no default config directory".to_string())?;
    BridgeConfig::load(&path).map_err(|e| e.to_string())
}

fn cmd_check(config: &BridgeConfig) -> i32 {
    println!("{:<32}  {:<24}  {:<16}  {:<8}", "TOPIC", "TARGET", "SPACE", "TRIGGER");
    println!("{}", "-".repeat(86));
    for m in &config.mappings {
        println!(
            "{:<32}  {:<24}  {:<16}  {:<8}",
            m.topic,
            m.target().to_string(),
            m.space,
            m.trigger_key.as_deref().unwrap_or("-")
        );
    }
    println!(
        "buffer timeout {}s, retry queue {} / {}s, debounce {}s, min interval {}s",
        config.buffer.timeout_secs,
        config.retry.max_queue_size,
        config.retry.max_age_secs,
        config.trigger.debounce_secs,
        config.trigger.min_interval_secs
    );
    0
}

fn cmd_transform(config: &BridgeConfig, topic: &str, payload: &Path) -> i32 {
    let bytes = match std::fs::read(payload) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("Error: cannot read '{}': {}", payload.display(), e);
            return 1;
        }
    };
    let router = match TopicRouter::new(&config.mappings) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    let Some(mapping) = router.resolve(topic) else {
        eprintln!("Error: no mapping for topic '{}'", topic);
        return 1;
    };

    let record = RawMessage::decode(topic, &bytes, Utc::now())
        .and_then(|raw| Transformer::new(config.prefixes.clone()).transform(&raw, &mapping));
    match record {
        Ok(record) => match serde_json::to_string_pretty(&record.to_node_apply()) {
            Ok(json) => {
                println!("{}", json);
                0
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                1
            }
        },
        Err(e) => {
            eprintln!("Invalid: {}", e);
            2
        }
    }
}

async fn replay(config: &BridgeConfig, capture: &Path) -> Result<String, String> {
    let file = std::fs::File::open(capture)
        .map_err(|e| format!("cannot open '{}': {}", capture.display(), e))?;

    let clock = Arc::new(ManualClock::new(Utc::now()));
    let sink = Arc::new(GraphSink::new());
    let pipeline = Pipeline::new(config, sink.clone())
        .map_err(|e| e.to_string())?
        .with_clock(clock.clone());

    let mut undecodable = 0usize;
    for (n, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| e.to_string())?;
        if line.trim().is_empty() {
            continue;
        }
        let raw = serde_json::from_str::<CapturedMessage>(&line)
            .map_err(|e| e.to_string())
            .and_then(|m| {
                let bytes = serde_json::to_vec(&m.payload).map_err(|e| e.to_string())?;
                RawMessage::decode(m.topic, &bytes, clock.now()).map_err(|e| e.to_string())
            });
        match raw {
            Ok(raw) => pipeline.handle(raw).await,
            Err(e) => {
                undecodable += 1;
                tracing::warn!(line = n + 1, error = %e, "skipping capture line");
            }
        }
    }

    // Simulated time: long enough for every buffer deadline and trigger
    let step =
        chrono::Duration::seconds(i64::try_from(config.pipeline.tick_interval_secs).unwrap_or(1));
    let horizon = config.buffer.timeout()
        + chrono::Duration::seconds(i64::try_from(config.trigger.min_interval_secs).unwrap_or(0))
        + chrono::Duration::seconds(i64::try_from(config.trigger.debounce_secs).unwrap_or(0));
    let mut elapsed = chrono::Duration::zero();
    pipeline.tick().await;
    while !pipeline.is_settled() && elapsed <= horizon {
        clock.advance(step);
        elapsed += step;
        pipeline.tick().await;
    }

    Ok(format!(
        "{}\nrecords in store: {}, undecodable lines: {}",
        pipeline.stats(),
        sink.len(),
        undecodable
    ))
}

fn cmd_replay(config: &BridgeConfig, capture: &Path) -> i32 {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to create tokio runtime: {}", e);
            return 1;
        }
    };
    match runtime.block_on(replay(config, capture)) {
        Ok(summary) => {
            println!("{}", summary);
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(cli.log_level)
        .init();

    let config = match load_config(cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let code = match cli.command {
        Commands::Check => cmd_check(&config),
        Commands::Transform { topic, payload } => cmd_transform(&config, &topic, &payload),
        Commands::Replay { capture } => cmd_replay(&config, &capture),
    };
    std::process::exit(code);
}
