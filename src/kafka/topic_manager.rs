use crate::config::DriftPolicy;
use crate::error::TopicDrift;
use crate::kafka::admin::{AdminConnector, AdminSession, ClusterInfo, TopicDescription};
use crate::kafka::message::TopicSpec;
use crate::{Error, Result};
use tracing::{info, instrument, warn};

/// What `create_topic_if_not_exists` found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicStatus {
    Created,
    /// Exists with the requested shape.
    Verified,
    /// Exists with a different shape. Left untouched.
    Drifted(TopicDrift),
}

/// Outcome of reconciling every required topic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: Vec<String>,
    pub verified: Vec<String>,
    pub drifted: Vec<TopicDrift>,
}

/// Owns the admin session.
///
/// Opened once at startup, before any pipeline polls, and consumed by
/// [`TopicLifecycleManager::close`] at shutdown. The admin client exists
/// only while the manager does; dropping the manager also closes the
/// session.
pub struct TopicLifecycleManager {
    session: AdminSession,
    drift_policy: DriftPolicy,
}

impl TopicLifecycleManager {
    /// Connects a new admin client into a private session.
    pub fn open(connector: &dyn AdminConnector, drift_policy: DriftPolicy) -> Result<Self> {
        Self::open_in(AdminSession::default(), connector, drift_policy)
    }

    /// Connects a new admin client into `session`. Handles cloned from
    /// `session` reach the client until this manager is closed.
    pub fn open_in(
        session: AdminSession,
        connector: &dyn AdminConnector,
        drift_policy: DriftPolicy,
    ) -> Result<Self> {
        session.install(connector.connect()?)?;
        info!(?drift_policy, "Admin session opened");
        Ok(Self {
            session,
            drift_policy,
        })
    }

    pub fn session(&self) -> &AdminSession {
        &self.session
    }

    pub fn close(self) {
        drop(self);
    }

    /// Creates the topic if absent, otherwise compares its shape.
    /// Never alters an existing topic.
    #[instrument(skip(self, spec), fields(topic = %spec.name))]
    pub async fn create_topic_if_not_exists(&self, spec: &TopicSpec) -> Result<TopicStatus> {
        match self.describe_topic(&spec.name).await? {
            Some(actual) => {
                let drift = TopicDrift {
                    topic: spec.name.clone(),
                    expected_partitions: spec.partitions,
                    actual_partitions: actual.partition_count(),
                    expected_replication: spec.replication_factor,
                    actual_replication: actual.replication_factor(),
                };
                if drift.actual_partitions == drift.expected_partitions
                    && drift.actual_replication == drift.expected_replication
                {
                    info!(
                        partitions = spec.partitions,
                        replication_factor = spec.replication_factor,
                        "Topic already exists"
                    );
                    Ok(TopicStatus::Verified)
                } else {
                    warn!(
                        expected_partitions = drift.expected_partitions,
                        actual_partitions = drift.actual_partitions,
                        expected_replication = drift.expected_replication,
                        actual_replication = drift.actual_replication,
                        "Topic exists with a different shape"
                    );
                    Ok(TopicStatus::Drifted(drift))
                }
            }
            None => {
                info!(
                    partitions = spec.partitions,
                    replication_factor = spec.replication_factor,
                    "Creating topic"
                );
                self.session.client()?.create_topics(std::slice::from_ref(spec)).await?;
                Ok(TopicStatus::Created)
            }
        }
    }

    /// Ensures every spec exists. Under `fail-fast` the first drifted topic
    /// is returned as `Error::TopicDrift`.
    #[instrument(skip(self, specs), fields(count = specs.len()))]
    pub async fn reconcile(&self, specs: &[TopicSpec]) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for spec in specs {
            match self.create_topic_if_not_exists(spec).await? {
                TopicStatus::Created => report.created.push(spec.name.clone()),
                TopicStatus::Verified => report.verified.push(spec.name.clone()),
                TopicStatus::Drifted(drift) => {
                    if self.drift_policy == DriftPolicy::FailFast {
                        return Err(Error::TopicDrift(drift));
                    }
                    report.drifted.push(drift);
                }
            }
        }
        info!(
            created = report.created.len(),
            verified = report.verified.len(),
            drifted = report.drifted.len(),
            "Topic reconciliation finished"
        );
        Ok(report)
    }

    /// Returns whether a topic was deleted.
    #[instrument(skip(self))]
    pub async fn delete_topic_if_exists(&self, name: &str) -> Result<bool> {
        let admin = self.session.client()?;
        let topics = admin.list_topics().await?;
        if !topics.iter().any(|t| t == name) {
            info!("Topic does not exist, nothing to delete");
            return Ok(false);
        }
        admin.delete_topics(&[name.to_string()]).await?;
        info!("Topic deleted");
        Ok(true)
    }

    pub async fn describe_cluster(&self) -> Result<ClusterInfo> {
        self.session.client()?.describe_cluster().await
    }

    pub async fn describe_topic(&self, name: &str) -> Result<Option<TopicDescription>> {
        let mut found = self.session.client()?.describe_topics(&[name.to_string()]).await?;
        Ok(found.pop())
    }
}

impl Drop for TopicLifecycleManager {
    fn drop(&mut self) {
        if self.session.release() {
            info!("Admin session closed");
        }
    }
}
