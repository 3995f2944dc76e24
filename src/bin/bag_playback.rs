//! Play a ROS2 bag through the full playback pipeline
//!
//! Messages are read window by window through a read-ahead provider, optionally
//! decoded through the parsed message cache, and batched into frames. At the
//! end the tool prints how many frames were dispatched and what they held.
//!
//! Usage:
//!   cargo run --bin bag_playback -- <bag_dir> [--topics /a,/b] [--window-ms 100] [--parse]
//!   cargo run --bin bag_playback -- --config providers.yaml -vv

use anyhow::{bail, Context, Result};
use clap::Parser;
use rosbags_playback::parsed_cache::{readers_for_topics, ParsedMessageCache};
use rosbags_playback::pipeline::{
    Action, AdvertisePayload, FrameTicket, Pipeline, PlayerConnection, PlayerEvent, PlayerState,
    PlayerTopic, PublishPayload, Requester, Store, SubscribePayload, TokioFrameScheduler,
};
use rosbags_playback::providers::{ExtensionPoint, Progress, ProviderMetadata};
use rosbags_playback::{ProviderConfig, Time};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn, Level};

/// Play a ROS2 bag and report frame statistics
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Bag directory to play
    bag: Option<PathBuf>,

    /// YAML provider tree to play instead of a single bag
    #[arg(short, long, conflicts_with = "bag")]
    config: Option<PathBuf>,

    /// Topics to play (comma-separated list, all topics if empty)
    #[arg(short, long, value_delimiter = ',')]
    topics: Vec<String>,

    /// Size of each read window in milliseconds
    #[arg(short, long, default_value_t = 100)]
    window_ms: u64,

    /// Decode payloads through the parsed message cache
    #[arg(short, long)]
    parse: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Default)]
struct FrameStats {
    frames: usize,
    messages_by_topic: BTreeMap<String, usize>,
    last_receive_time: Option<Time>,
}

/// Tallies frames instead of rendering them
#[derive(Default)]
struct StatsStore {
    stats: Mutex<FrameStats>,
}

impl Store for StatsStore {
    fn dispatch(&self, action: Action) {
        let Action::FrameReceived {
            frame,
            last_receive_time,
        } = action
        else {
            debug!(?action, "store action");
            return;
        };
        if let Ok(mut stats) = self.stats.lock() {
            stats.frames += 1;
            stats.last_receive_time = last_receive_time;
            for (topic, messages) in frame {
                *stats.messages_by_topic.entry(topic).or_default() += messages.len();
            }
        }
    }
}

/// Playback here is driven by the read loop, so requests only get logged
struct LoggingConnection;

impl PlayerConnection for LoggingConnection {
    fn subscribe(&self, request: SubscribePayload) {
        debug!(topic = %request.topic, "player subscribe");
    }
    fn unsubscribe(&self, request: SubscribePayload) {
        debug!(topic = %request.topic, "player unsubscribe");
    }
    fn advertise(&self, request: AdvertisePayload) {
        debug!(topic = %request.topic, "player advertise");
    }
    fn unadvertise(&self, request: AdvertisePayload) {
        debug!(topic = %request.topic, "player unadvertise");
    }
    fn publish(&self, request: PublishPayload) {
        warn!(topic = %request.topic, "publishing is not supported during bag playback");
    }
    fn request_messages(&self) {}
}

fn extension_point() -> ExtensionPoint {
    ExtensionPoint {
        progress_callback: Arc::new(|progress: Progress| debug!(?progress, "progress")),
        report_metadata_callback: Arc::new(|metadata: ProviderMetadata| match metadata {
            ProviderMetadata::UpdateReconnecting { reconnecting } => {
                warn!(reconnecting, "source connection changed")
            }
            ProviderMetadata::Notification {
                severity,
                message,
                details,
            } => warn!(?severity, %details, "{message}"),
        }),
        add_topics_callback: Arc::new(|_: Vec<String>| {}),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let level = match args.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = match (&args.bag, &args.config) {
        (_, Some(path)) => ProviderConfig::from_file(path)
            .with_context(|| format!("Failed to load provider config {}", path.display()))?,
        (Some(bag), None) => ProviderConfig::ReadAhead {
            read_ahead_range_ms: None,
            children: vec![ProviderConfig::Bag {
                path: bag.clone(),
                children: Vec::new(),
            }],
        },
        (None, None) => bail!("Either a bag directory or --config is required"),
    };
    if args.window_ms == 0 {
        bail!("--window-ms must be positive");
    }

    let provider = config.build().context("Failed to build providers")?;
    let info = provider
        .initialize(extension_point())
        .await
        .context("Failed to initialize providers")?;
    info!(start = %info.start, end = %info.end, topics = info.topics.len(), "initialized");

    let topics: Vec<String> = if args.topics.is_empty() {
        info.topics.iter().map(|t| t.name.clone()).collect()
    } else {
        args.topics.clone()
    };

    let store = Arc::new(StatsStore::default());
    let mut pipeline = Pipeline::default();
    pipeline.initialize(
        store.clone(),
        Arc::new(TokioFrameScheduler::default()),
        Arc::new(LoggingConnection),
    );
    pipeline.consume(PlayerEvent::Topics(info.topics.iter().map(PlayerTopic::from).collect()))?;
    pipeline.consume(PlayerEvent::Datatypes(info.datatypes.clone()))?;
    pipeline.consume(PlayerEvent::PlayerState(PlayerState {
        start_time: info.start,
        end_time: info.end,
        is_playing: true,
        speed: 1.0,
    }))?;
    for topic in &topics {
        pipeline.subscribe(SubscribePayload::new(topic).with_requester(Requester::panel("bag_playback")));
    }

    let readers = readers_for_topics(&info.topics, &Arc::new(info.datatypes.clone()));
    let mut cache = ParsedMessageCache::new();
    let mut parse_failures = 0usize;
    let window = Time::from_millis(i64::try_from(args.window_ms).context("--window-ms is too large")?);
    let started = Instant::now();

    let mut cursor = info.start;
    let mut last_ticket: Option<FrameTicket> = None;
    while cursor <= info.end {
        let window_end = cursor.add(window).subtract(Time::ONE_NANOSECOND).clamp_to(cursor, info.end);
        let messages = provider
            .get_messages(cursor, window_end, &topics)
            .await
            .with_context(|| format!("Failed to read messages in [{cursor}, {window_end}]"))?;

        if args.parse {
            if let Err(e) = cache.parse_messages(&messages, &readers) {
                parse_failures += 1;
                warn!(error = %e, "failed to parse window");
            }
        }
        for message in messages {
            last_ticket = Some(pipeline.consume(PlayerEvent::Message(message))?);
        }
        pipeline.consume(PlayerEvent::UpdateTime(window_end))?;

        // Wait for the frame before reading more, as a store would
        if let Some(ticket) = last_ticket.take() {
            ticket.wait().await;
        }
        cursor = window_end.add(Time::ONE_NANOSECOND);
    }
    provider.close().await.context("Failed to close providers")?;

    let elapsed = started.elapsed();
    let stats = store
        .stats
        .lock()
        .map_err(|_| anyhow::anyhow!("frame statistics lock poisoned"))?;
    let total: usize = stats.messages_by_topic.values().sum();
    println!("Duration:          {:.3}s", info.end.subtract(info.start).to_sec_f64());
    println!("Played in:         {:.3}s", elapsed.as_secs_f64());
    println!("Frames:            {}", stats.frames);
    println!("Messages:          {total}");
    if let Some(time) = stats.last_receive_time {
        println!("Last receive time: {time}");
    }
    if args.parse {
        println!("Parsed cache:      {} entries, {} bytes", cache.len(), cache.size_in_bytes());
        println!("Parse failures:    {parse_failures}");
    }
    for (topic, count) in &stats.messages_by_topic {
        println!("  {topic:<40} {count}");
    }
    Ok(())
}
