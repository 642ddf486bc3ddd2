use crate::kafka::message::TopicSpec;
use crate::{Config, Error, Result};
use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::error::KafkaError;
use rdkafka::metadata::Metadata;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::ClientConfig;
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokerInfo {
    pub id: i32,
    pub host: String,
    pub port: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterInfo {
    pub cluster_id: Option<String>,
    /// Not every client exposes the controller; `None` when unknown.
    pub controller_id: Option<i32>,
    pub brokers: Vec<BrokerInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionInfo {
    pub id: i32,
    pub leader: i32,
    pub replicas: Vec<i32>,
    pub isr: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicDescription {
    pub name: String,
    pub partitions: Vec<PartitionInfo>,
}

impl TopicDescription {
    pub fn partition_count(&self) -> i32 {
        self.partitions.len() as i32
    }

    /// Replica count of the first partition; 0 for a topic without partitions.
    pub fn replication_factor(&self) -> i32 {
        self.partitions
            .first()
            .map(|p| p.replicas.len() as i32)
            .unwrap_or(0)
    }
}

/// The admin protocol operations topic reconciliation and monitoring need.
///
/// `create_topics` treats an already existing topic as success and
/// `delete_topics` treats a missing one as success.
#[async_trait]
pub trait AdminApi: Send + Sync {
    async fn describe_cluster(&self) -> Result<ClusterInfo>;

    async fn list_topics(&self) -> Result<Vec<String>>;

    async fn create_topics(&self, specs: &[TopicSpec]) -> Result<()>;

    /// Descriptions of the named topics that exist; absent topics are omitted.
    async fn describe_topics(&self, names: &[String]) -> Result<Vec<TopicDescription>>;

    async fn delete_topics(&self, names: &[String]) -> Result<()>;
}

/// Builds a fresh admin client each time a session opens.
pub trait AdminConnector: Send + Sync {
    fn connect(&self) -> Result<Arc<dyn AdminApi>>;
}

/// Connects [`KafkaAdmin`] clients to the configured brokers.
#[derive(Debug, Clone)]
pub struct KafkaAdminConnector {
    bootstrap_servers: String,
    client_id: String,
    timeout: Duration,
}

impl KafkaAdminConnector {
    pub fn new(bootstrap_servers: impl Into<String>, client_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            client_id: client_id.into(),
            timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.bootstrap_servers(),
            config.kafka.client_id.clone(),
            config.admin_timeout(),
        )
    }
}

impl AdminConnector for KafkaAdminConnector {
    fn connect(&self) -> Result<Arc<dyn AdminApi>> {
        let admin = KafkaAdmin::new(&self.bootstrap_servers, &self.client_id, self.timeout)?;
        debug!(bootstrap_servers = %self.bootstrap_servers, "Admin client connected");
        Ok(Arc::new(admin))
    }
}

/// Slot holding the admin client of the open session, if any.
///
/// Clones share the slot. Once the session is released every clone fails
/// with `Error::AdminSessionClosed` and the client itself is dropped.
#[derive(Clone, Default)]
pub struct AdminSession {
    client: Arc<RwLock<Option<Arc<dyn AdminApi>>>>,
}

impl AdminSession {
    pub fn is_open(&self) -> bool {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// The live client. Callers hold it only for the duration of one call.
    pub fn client(&self) -> Result<Arc<dyn AdminApi>> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::AdminSessionClosed)
    }

    pub(crate) fn install(&self, client: Arc<dyn AdminApi>) -> Result<()> {
        let mut slot = self.client.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(Error::Config("admin session is already open".to_string()));
        }
        *slot = Some(client);
        Ok(())
    }

    /// Drops the client. Returns whether a session was open.
    pub(crate) fn release(&self) -> bool {
        self.client
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }
}

/// rdkafka admin client.
pub struct KafkaAdmin {
    client: Arc<AdminClient<DefaultClientContext>>,
    timeout: Duration,
}

impl KafkaAdmin {
    pub fn new(bootstrap_servers: &str, client_id: &str, timeout: Duration) -> Result<Self> {
        let client: AdminClient<_> = ClientConfig::new()
            .set("bootstrap.servers", bootstrap_servers)
            .set("client.id", format!("{}-admin", client_id))
            .create()
            .map_err(Error::Kafka)?;

        Ok(Self {
            client: Arc::new(client),
            timeout,
        })
    }

    fn options(&self) -> AdminOptions {
        AdminOptions::new()
            .operation_timeout(Some(self.timeout))
            .request_timeout(Some(self.timeout))
    }

    async fn metadata(&self, topic: Option<String>, operation: &str) -> Result<Metadata> {
        let client = Arc::clone(&self.client);
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || client.inner().fetch_metadata(topic.as_deref(), timeout))
            .await
            .map_err(|e| Error::transport("", e))?
            .map_err(|e| classify(operation, e))
    }
}

#[async_trait]
impl AdminApi for KafkaAdmin {
    #[instrument(skip(self))]
    async fn describe_cluster(&self) -> Result<ClusterInfo> {
        let metadata = self.metadata(None, "describe_cluster").await?;
        let brokers = metadata
            .brokers()
            .iter()
            .map(|b| BrokerInfo {
                id: b.id(),
                host: b.host().to_string(),
                port: b.port(),
            })
            .collect();

        let client = Arc::clone(&self.client);
        let timeout = self.timeout;
        let cluster_id = tokio::task::spawn_blocking(move || client.inner().fetch_cluster_id(timeout))
            .await
            .map_err(|e| Error::transport("", e))?;

        Ok(ClusterInfo {
            cluster_id,
            controller_id: None,
            brokers,
        })
    }

    #[instrument(skip(self))]
    async fn list_topics(&self) -> Result<Vec<String>> {
        let metadata = self.metadata(None, "list_topics").await?;
        Ok(metadata
            .topics()
            .iter()
            .filter(|t| t.error().is_none())
            .map(|t| t.name().to_string())
            .collect())
    }

    #[instrument(skip(self, specs), fields(count = specs.len()))]
    async fn create_topics(&self, specs: &[TopicSpec]) -> Result<()> {
        let new_topics: Vec<NewTopic<'_>> = specs
            .iter()
            .map(|spec| {
                NewTopic::new(
                    &spec.name,
                    spec.partitions,
                    TopicReplication::Fixed(spec.replication_factor),
                )
            })
            .collect();

        let results = tokio::time::timeout(
            self.timeout,
            self.client.create_topics(&new_topics, &self.options()),
        )
        .await
        .map_err(|_| Error::AdminTimeout {
            operation: "create_topics".to_string(),
        })?
        .map_err(|e| classify("create_topics", e))?;

        for result in results {
            match result {
                Ok(topic) => info!(topic = %topic, "Topic created"),
                Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!(topic = %topic, "Topic already exists")
                }
                Err((_, code)) if is_timeout(code) => {
                    return Err(Error::AdminTimeout {
                        operation: "create_topics".to_string(),
                    })
                }
                Err((_, code)) => return Err(Error::Kafka(KafkaError::AdminOp(code))),
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn describe_topics(&self, names: &[String]) -> Result<Vec<TopicDescription>> {
        let mut descriptions = Vec::with_capacity(names.len());
        for name in names {
            let metadata = self.metadata(Some(name.clone()), "describe_topics").await?;
            descriptions.extend(
                metadata
                    .topics()
                    .iter()
                    .filter(|t| t.name() == name && t.error().is_none())
                    .map(|t| TopicDescription {
                        name: t.name().to_string(),
                        partitions: t
                            .partitions()
                            .iter()
                            .map(|p| PartitionInfo {
                                id: p.id(),
                                leader: p.leader(),
                                replicas: p.replicas().to_vec(),
                                isr: p.isr().to_vec(),
                            })
                            .collect(),
                    }),
            );
        }
        Ok(descriptions)
    }

    #[instrument(skip(self))]
    async fn delete_topics(&self, names: &[String]) -> Result<()> {
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let results = tokio::time::timeout(self.timeout, self.client.delete_topics(&refs, &self.options()))
            .await
            .map_err(|_| Error::AdminTimeout {
                operation: "delete_topics".to_string(),
            })?
            .map_err(|e| classify("delete_topics", e))?;

        for result in results {
            match result {
                Ok(topic) => info!(topic = %topic, "Topic deleted"),
                Err((topic, RDKafkaErrorCode::UnknownTopicOrPartition)) => {
                    debug!(topic = %topic, "Topic already absent")
                }
                Err((_, code)) if is_timeout(code) => {
                    return Err(Error::AdminTimeout {
                        operation: "delete_topics".to_string(),
                    })
                }
                Err((_, code)) => return Err(Error::Kafka(KafkaError::AdminOp(code))),
            }
        }
        Ok(())
    }
}

fn is_timeout(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::OperationTimedOut | RDKafkaErrorCode::RequestTimedOut
    )
}

fn classify(operation: &str, error: KafkaError) -> Error {
    match error.rdkafka_error_code() {
        Some(code) if is_timeout(code) => Error::AdminTimeout {
            operation: operation.to_string(),
        },
        _ => Error::Kafka(error),
    }
}
