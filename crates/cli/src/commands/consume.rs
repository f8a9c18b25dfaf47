//! `consume` command

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use messaging::{
    ClaimScript, ConsumerGroup, ConsumerStreams, InMemoryGroupClient, Message, ShutdownController,
};
use std::sync::Arc;
use streamgate_config::{ConsumerGroupConfig, OffsetReset};
use tracing::{info, warn};

use super::split_list;

#[derive(Args, Debug)]
pub struct ConsumeArgs {
    /// Topics to consume (repeatable or comma-separated)
    #[arg(short, long)]
    topic: Vec<String>,

    /// Consumer group id
    #[arg(short, long)]
    group: Option<String>,

    /// Bootstrap brokers (repeatable or comma-separated)
    #[arg(short, long)]
    brokers: Vec<String>,

    /// Protocol version
    #[arg(long)]
    version: Option<String>,

    /// sticky, roundrobin or range
    #[arg(long)]
    strategy: Option<String>,

    /// Start from the oldest offset when the group has none committed
    #[arg(long)]
    from_oldest: bool,

    /// Stop after this many messages
    #[arg(short = 'n', long)]
    max_messages: Option<usize>,

    /// Run against an in-memory group fed with numbered messages
    #[arg(long)]
    dry_run: bool,
}

impl ConsumeArgs {
    fn apply(&self, mut config: ConsumerGroupConfig) -> ConsumerGroupConfig {
        let topics = split_list(&self.topic);
        if !topics.is_empty() {
            config.topics = topics;
        }
        let brokers = split_list(&self.brokers);
        if !brokers.is_empty() {
            config.brokers = brokers;
        }
        if let Some(group) = &self.group {
            config.group_id = group.clone();
        }
        if let Some(version) = &self.version {
            config.version = version.clone();
        }
        if let Some(strategy) = &self.strategy {
            config.rebalance_strategy = strategy.clone();
        }
        if self.from_oldest {
            config.offset_reset = OffsetReset::Oldest;
        }
        config
    }
}

pub async fn execute(args: ConsumeArgs, config: Option<ConsumerGroupConfig>) -> Result<()> {
    let config = args.apply(config.unwrap_or_default());

    let (group, streams) = if args.dry_run {
        start_dry_run(config).await?
    } else {
        ConsumerGroup::start(config.clone())
            .await
            .with_context(|| format!("starting consumer group {:?}", config.group_id))?
    };
    let group = Arc::new(group);
    info!(group_id = group.group_id(), "Consumer group started");

    let signals = ShutdownController::new()
        .with_consumer_group(group.clone())
        .spawn()
        .context("registering signal handlers")?;

    let received = print_messages(&group, streams, args.max_messages).await;

    if !group.is_finished() {
        if let Err(e) = group.close().await {
            warn!(error = %e, "Failed to close consumer group");
        }
    }
    group.wait().await;
    signals.abort();

    println!("{} {} message(s)", "Consumed".green().bold(), received);
    Ok(())
}

async fn start_dry_run(config: ConsumerGroupConfig) -> Result<(ConsumerGroup, ConsumerStreams)> {
    let (client, controller) = InMemoryGroupClient::new(config.group_id.clone());
    let claims = config
        .topics
        .iter()
        .map(|topic| ClaimScript::numbered(topic.clone(), 0, 0, 10))
        .collect();
    controller.assign(claims);

    let group = ConsumerGroup::start_with(config, move |_| async move { Ok(client) }).await?;
    Ok(group)
}

async fn print_messages(
    group: &ConsumerGroup,
    mut streams: ConsumerStreams,
    max: Option<usize>,
) -> usize {
    let mut received = 0;
    loop {
        if max.map_or(false, |m| received >= m) {
            break;
        }
        tokio::select! {
            message = streams.messages.recv() => match message {
                Some(message) => {
                    print_message(&message);
                    received += 1;
                }
                None => break,
            },
            Some(error) = streams.errors.recv() => {
                eprintln!("{} {}", "consumer error:".yellow(), error);
            }
            _ = group.wait() => break,
        }
    }
    received
}

fn print_message(message: &Message) {
    println!(
        "{} key={} {}",
        message.to_string().cyan(),
        message.key_str().unwrap_or_default(),
        String::from_utf8_lossy(&message.value)
    );
}
