use crate::events::EventStore;
use crate::gateway::OrderGateway;
use crate::kafka::admin::{AdminConnector, AdminSession, KafkaAdminConnector};
use crate::kafka::consumer::{KafkaSourceFactory, RecordSourceFactory};
use crate::kafka::dead_letter::DeadLetterSink;
use crate::kafka::memory::MemoryLog;
use crate::kafka::message::TopicRole;
use crate::kafka::pipeline::{ConsumptionPipeline, PipelineHandle, WorkerReport};
use crate::kafka::producer::Publisher;
use crate::kafka::profile::{ProfileCatalog, STANDARD, TRANSACTIONAL};
use crate::kafka::topic_manager::{ReconcileReport, TopicLifecycleManager};
use crate::kafka::transaction::TransactionCoordinator;
use crate::kafka::transport::{KafkaTransactionalLog, KafkaTransport, LogTransport, TransactionalLog};
use crate::metrics::Metrics;
use crate::{Config, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// The log service clients a relay runs on.
#[derive(Clone)]
pub struct Backend {
    /// Connects the admin client of each topic session.
    pub admin: Arc<dyn AdminConnector>,
    pub transport: Arc<dyn LogTransport>,
    /// `None` when transactions are disabled.
    pub transactional: Option<Arc<dyn TransactionalLog>>,
    pub sources: Arc<dyn RecordSourceFactory>,
}

impl Backend {
    /// rdkafka clients for every profile in `catalog`. Registers a fresh
    /// transactional id when transactions are enabled.
    pub async fn kafka(config: &Config, catalog: &ProfileCatalog) -> Result<Self> {
        let bootstrap = config.bootstrap_servers();
        let client_id = &config.kafka.client_id;

        let transport = KafkaTransport::new(catalog, &bootstrap, client_id)?;

        let transactional = if config.producer.enable_transactions {
            let transactional_id =
                TransactionCoordinator::generate_transactional_id(&config.producer.transactional_id_prefix);
            let log = KafkaTransactionalLog::connect(
                catalog.producer_profile(TRANSACTIONAL)?,
                &bootstrap,
                client_id,
                transactional_id,
            )
            .await?;
            Some(Arc::new(log) as Arc<dyn TransactionalLog>)
        } else {
            None
        };

        let sources = KafkaSourceFactory::new(bootstrap, config.consumer.group_id.clone(), client_id.clone());

        Ok(Self {
            admin: Arc::new(KafkaAdminConnector::from_config(config)),
            transport: Arc::new(transport),
            transactional,
            sources: Arc::new(sources),
        })
    }

    /// Every seam backed by one in-memory cluster.
    pub fn memory(log: &MemoryLog) -> Self {
        Self {
            admin: Arc::new(log.clone()),
            transport: Arc::new(log.clone()),
            transactional: Some(Arc::new(log.clone())),
            sources: Arc::new(log.clone()),
        }
    }
}

/// Process orchestration: reconcile topics, publish, run the configured
/// consumption pipelines until shutdown.
pub struct Relay {
    config: Config,
    catalog: Arc<ProfileCatalog>,
    backend: Backend,
    store: Arc<dyn EventStore>,
    dead_letters: Arc<DeadLetterSink>,
    publisher: Arc<Publisher>,
    admin: AdminSession,
    metrics: Metrics,
}

impl Relay {
    pub fn new(
        config: Config,
        catalog: Arc<ProfileCatalog>,
        backend: Backend,
        store: Arc<dyn EventStore>,
        metrics: Metrics,
    ) -> Result<Self> {
        let dead_letters = Arc::new(DeadLetterSink::new(
            Arc::clone(&backend.transport),
            catalog.producer_profile(STANDARD)?.clone(),
            config.topic_name(TopicRole::DeadLetter),
            metrics.clone(),
        ));

        let mut publisher = Publisher::new(
            Arc::clone(&catalog),
            Arc::clone(&backend.transport),
            Arc::clone(&dead_letters),
            config.topics.clone(),
            metrics.clone(),
        );
        if let Some(log) = &backend.transactional {
            publisher = publisher.with_coordinator(Arc::new(TransactionCoordinator::new(
                Arc::clone(log),
                metrics.clone(),
            )));
        }

        Ok(Self {
            config,
            catalog,
            backend,
            store,
            dead_letters,
            publisher: Arc::new(publisher),
            admin: AdminSession::default(),
            metrics,
        })
    }

    pub fn publisher(&self) -> Arc<Publisher> {
        Arc::clone(&self.publisher)
    }

    /// Cluster introspection through the gateway works while a topic
    /// session opened by this relay is open.
    pub fn gateway(&self) -> OrderGateway {
        OrderGateway::new(
            Arc::clone(&self.publisher),
            Arc::clone(&self.store),
            self.admin.clone(),
        )
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn open_topics(&self) -> Result<TopicLifecycleManager> {
        TopicLifecycleManager::open_in(
            self.admin.clone(),
            self.backend.admin.as_ref(),
            self.config.topics.drift_policy,
        )
    }

    /// Opens the admin session and reconciles the required topics. The
    /// session is closed again if reconciliation fails.
    pub async fn prepare(&self) -> Result<(TopicLifecycleManager, ReconcileReport)> {
        let topics = self.open_topics()?;
        match topics.reconcile(&self.config.required_topics()).await {
            Ok(report) => Ok((topics, report)),
            Err(e) => {
                topics.close();
                Err(e)
            }
        }
    }

    /// Runs until `shutdown` is cancelled, then drains queued sends and
    /// closes the admin session. Returns the reports of every worker, or the
    /// first pipeline failure.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<Vec<WorkerReport>> {
        let (topics, _) = self.prepare().await?;

        let result = self.serve(&shutdown).await;

        if let Err(e) = self.publisher.flush(FLUSH_TIMEOUT).await {
            warn!(error = %e, "Flushing queued sends failed");
        }
        topics.close();
        info!("Relay stopped");
        result
    }

    async fn serve(&self, shutdown: &CancellationToken) -> Result<Vec<WorkerReport>> {
        let token = shutdown.child_token();
        let mut handles = Vec::with_capacity(self.config.consumer.profiles.len());

        for name in &self.config.consumer.profiles {
            match self.start_pipeline(name, &token).await {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    token.cancel();
                    futures::future::join_all(handles.into_iter().map(PipelineHandle::join)).await;
                    return Err(e);
                }
            }
        }

        info!(pipelines = handles.len(), "Relay running");
        let mut reports = Vec::new();
        let mut failure = None;
        for result in futures::future::join_all(handles.into_iter().map(PipelineHandle::join)).await {
            match result {
                Ok(mut worker_reports) => reports.append(&mut worker_reports),
                Err(e) => {
                    warn!(error = %e, "Pipeline ended with an error");
                    failure.get_or_insert(e);
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(reports),
        }
    }

    async fn start_pipeline(&self, name: &str, token: &CancellationToken) -> Result<PipelineHandle> {
        let profile = self.catalog.consumer_profile(name)?.clone();
        let topic = self.config.topic_name(profile.source).to_string();
        ConsumptionPipeline::new(
            profile,
            vec![topic],
            Arc::clone(&self.backend.sources),
            Arc::clone(&self.store),
            Arc::clone(&self.dead_letters),
            self.metrics.clone(),
        )
        .with_poll_timeout(self.config.poll_timeout())
        .with_shutdown_policy(self.config.consumer.shutdown_policy)
        .start(token)
        .await
    }
}
