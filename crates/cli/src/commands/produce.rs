//! `produce` command

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use messaging::{InMemoryProducer, ProducerGateway};
use serde_json::Value;
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;
use streamgate_config::{ProducerConfig, ProducerMode};
use tracing::info;

use super::split_list;

#[derive(Args, Debug)]
pub struct ProduceArgs {
    /// Destination topic
    #[arg(short, long)]
    topic: String,

    /// Record key
    #[arg(short, long, default_value = "")]
    key: String,

    /// Producer name, overrides the configured one
    #[arg(long)]
    name: Option<String>,

    /// Bootstrap brokers (repeatable or comma-separated)
    #[arg(short, long)]
    brokers: Vec<String>,

    /// Protocol version
    #[arg(long)]
    version: Option<String>,

    /// Wait for each acknowledgement instead of sending in the background
    #[arg(long)]
    sync: bool,

    /// Seconds to wait for outstanding records on close
    #[arg(long, default_value_t = 10)]
    drain_timeout: u64,

    /// Send to an in-memory producer instead of a broker
    #[arg(long)]
    dry_run: bool,

    /// JSON payloads; read one per line from stdin when empty
    payloads: Vec<String>,
}

impl ProduceArgs {
    fn apply(&self, mut config: ProducerConfig) -> ProducerConfig {
        if let Some(name) = &self.name {
            config.name = name.clone();
        }
        let brokers = split_list(&self.brokers);
        if !brokers.is_empty() {
            config.brokers = brokers;
        }
        if let Some(version) = &self.version {
            config.version = version.clone();
        }
        if self.sync {
            config.mode = ProducerMode::Sync;
        }
        config
    }
}

pub async fn execute(args: ProduceArgs, config: Option<ProducerConfig>) -> Result<()> {
    let config = args.apply(config.unwrap_or_default());
    let name = config.name.clone();

    let payloads = if args.payloads.is_empty() {
        read_payloads(std::io::stdin().lock())?
    } else {
        parse_payloads(&args.payloads)?
    };

    let gateway = if args.dry_run {
        ProducerGateway::with_client(config, Arc::new(InMemoryProducer::new()))?
    } else {
        ProducerGateway::new(config)
            .await
            .with_context(|| format!("connecting producer {:?}", name))?
    };
    info!(producer = %name, mode = ?gateway.mode(), "Producer ready");

    let sent = send_all(&gateway, &name, &args.topic, &args.key, &payloads).await?;

    gateway
        .close(Duration::from_secs(args.drain_timeout))
        .await
        .context("closing producer")?;

    let stats = gateway.stats();
    println!(
        "{} {} record(s) to {} ({} delivered, {} dead-lettered)",
        "Sent".green().bold(),
        sent,
        args.topic,
        stats.delivered,
        stats.dead_lettered
    );
    Ok(())
}

async fn send_all(
    gateway: &ProducerGateway,
    name: &str,
    topic: &str,
    key: &str,
    payloads: &[Value],
) -> Result<usize> {
    for (i, payload) in payloads.iter().enumerate() {
        gateway
            .send(name, topic, key, payload)
            .await
            .with_context(|| format!("sending record {}", i + 1))?;
    }
    Ok(payloads.len())
}

fn parse_payloads(raw: &[String]) -> Result<Vec<Value>> {
    raw.iter()
        .map(|p| serde_json::from_str(p).with_context(|| format!("invalid JSON payload {:?}", p)))
        .collect()
}

fn read_payloads(input: impl BufRead) -> Result<Vec<Value>> {
    let mut payloads = Vec::new();
    for (n, line) in input.lines().enumerate() {
        let line = line.context("reading stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        let value = serde_json::from_str(&line)
            .with_context(|| format!("invalid JSON on line {}", n + 1))?;
        payloads.push(value);
    }
    if payloads.is_empty() {
        bail!("no payloads given");
    }
    Ok(payloads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_read_payloads_skips_blank_lines() {
        let input = "{\"id\":1}\n\n{\"id\":2}\n";
        let payloads = read_payloads(input.as_bytes()).unwrap();
        assert_eq!(payloads, vec![json!({"id": 1}), json!({"id": 2})]);
    }

    #[test]
    fn test_read_payloads_reports_line() {
        let err = read_payloads("{}\nnope\n".as_bytes()).unwrap_err();
        assert!(err.to_string().contains("line 2"));
        assert!(read_payloads("".as_bytes()).is_err());
    }

    #[tokio::test]
    async fn test_send_all_through_memory_producer() {
        let producer = InMemoryProducer::new();
        let config = ProducerConfig::new(ProducerMode::Sync, "P1", vec!["b1".to_string()], "2.1.0");
        let gateway = ProducerGateway::with_client(config, Arc::new(producer.clone())).unwrap();

        let payloads = parse_payloads(&["1".to_string(), "{\"a\":true}".to_string()]).unwrap();
        let sent = send_all(&gateway, "P1", "audit", "k", &payloads).await.unwrap();

        assert_eq!(sent, 2);
        assert_eq!(producer.delivered().len(), 2);
        assert!(send_all(&gateway, "P2", "audit", "k", &payloads).await.is_err());
    }
}
