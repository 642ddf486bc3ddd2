use anyhow::Context;
use clap::{Parser, Subcommand};
use order_relay::events::{InMemoryEventStore, OrderEvent};
use order_relay::kafka::profile::{ProfileCatalog, STANDARD};
use order_relay::kafka::{AdminConnector, KafkaAdminConnector, MemoryLog, TopicLifecycleManager};
use order_relay::{Backend, Config, Metrics, Relay};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "order-relay")]
#[command(about = "Profile-driven Kafka delivery of order events", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[arg(long, help = "Run against an in-process log instead of Kafka")]
    dry_run: bool,

    #[arg(long, help = "Print counters in Prometheus text format on exit")]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create missing topics and report shape drift
    Topics {
        /// Delete this topic if it exists instead of reconciling
        #[arg(long, value_name = "TOPIC")]
        delete: Option<String>,
    },
    /// Publish one order event under a delivery profile
    Publish {
        #[arg(short, long, default_value = STANDARD)]
        profile: String,
        /// JSON file holding the event; a bare CREATED event is sent otherwise
        #[arg(short, long, value_name = "FILE")]
        file: Option<PathBuf>,
        #[arg(long, default_value = "demo-order")]
        order_id: String,
        #[arg(long, default_value = "demo-user")]
        user_id: String,
    },
    /// Run the configured consumption pipelines until Ctrl+C
    Consume,
    /// Describe the cluster and the configured topics
    Cluster,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting order-relay");
    info!("Loading configuration from {:?}", args.config);

    let config = match Config::from_file(&args.config) {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e).context("loading configuration");
        }
    };

    info!(
        kafka_brokers = ?config.kafka.brokers,
        primary_topic = %config.topics.primary,
        secondary_topic = %config.topics.secondary,
        dead_letter_topic = %config.topics.dead_letter,
        consumer_profiles = ?config.consumer.profiles,
        dry_run = args.dry_run,
        "Configuration summary"
    );

    let metrics = Metrics::new()?;
    let catalog = Arc::new(ProfileCatalog::from_config(&config)?);

    match args.command {
        Command::Topics { delete } => {
            let topics = open_topics(&config, args.dry_run)?;
            let result = match delete {
                Some(name) => topics.delete_topic_if_exists(&name).await.map(|deleted| {
                    info!(topic = %name, deleted, "Delete finished");
                }),
                None => topics.reconcile(&config.required_topics()).await.map(|report| {
                    info!(
                        created = ?report.created,
                        verified = ?report.verified,
                        drifted = report.drifted.len(),
                        "Topics reconciled"
                    );
                }),
            };
            topics.close();
            result?;
        }
        Command::Cluster => {
            let topics = open_topics(&config, args.dry_run)?;
            let cluster = topics.describe_cluster().await;
            let mut descriptions = Vec::new();
            for spec in config.required_topics() {
                if let Ok(Some(description)) = topics.describe_topic(&spec.name).await {
                    descriptions.push(description);
                }
            }
            topics.close();
            println!("{}", serde_json::to_string_pretty(&cluster?)?);
            println!("{}", serde_json::to_string_pretty(&descriptions)?);
        }
        Command::Publish {
            profile,
            file,
            order_id,
            user_id,
        } => {
            let event = match file {
                Some(path) => {
                    let text = std::fs::read_to_string(&path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    serde_json::from_str::<OrderEvent>(&text).context("parsing order event")?
                }
                None => OrderEvent::created(order_id, user_id),
            };

            let relay = build_relay(config, catalog, metrics.clone(), args.dry_run).await?;
            let (topics, _) = relay.prepare().await?;
            let outcome = relay.gateway().submit(&profile, &event).await;
            relay.publisher().flush(Duration::from_secs(30)).await?;
            topics.close();
            println!("{:?}", outcome?);
        }
        Command::Consume => {
            let relay = build_relay(config, catalog, metrics.clone(), args.dry_run).await?;
            let shutdown = CancellationToken::new();

            let signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Received shutdown signal");
                }
                signal.cancel();
            });

            let reports = relay.run(shutdown).await?;
            let processed: u64 = reports.iter().map(|r| r.processed).sum();
            info!(workers = reports.len(), processed, "Shutdown complete");
        }
    }

    if args.metrics {
        print!("{}", metrics.render()?);
    }
    Ok(())
}

fn open_topics(config: &Config, dry_run: bool) -> anyhow::Result<TopicLifecycleManager> {
    let connector: Box<dyn AdminConnector> = if dry_run {
        Box::new(MemoryLog::new())
    } else {
        Box::new(KafkaAdminConnector::from_config(config))
    };
    Ok(TopicLifecycleManager::open(connector.as_ref(), config.topics.drift_policy)?)
}

async fn build_relay(
    config: Config,
    catalog: Arc<ProfileCatalog>,
    metrics: Metrics,
    dry_run: bool,
) -> anyhow::Result<Relay> {
    let backend = if dry_run {
        Backend::memory(&MemoryLog::new())
    } else {
        Backend::kafka(&config, &catalog)
            .await
            .context("connecting to Kafka")?
    };
    let store = Arc::new(InMemoryEventStore::new());
    Ok(Relay::new(config, catalog, backend, store, metrics)?)
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("order_relay=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("order_relay=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
