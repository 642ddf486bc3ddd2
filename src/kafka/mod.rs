pub mod admin;
pub mod backoff;
pub mod consumer;
pub mod dead_letter;
pub mod key_strategy;
pub mod memory;
pub mod message;
pub mod pipeline;
pub mod producer;
pub mod profile;
pub mod serializer;
pub mod topic_manager;
pub mod transaction;
pub mod transport;


pub use admin::{
    AdminApi, AdminConnector, AdminSession, ClusterInfo, KafkaAdmin, KafkaAdminConnector, TopicDescription,
};
pub use backoff::BackoffPolicy;
pub use consumer::{KafkaSourceFactory, RecordSource, RecordSourceFactory};
pub use dead_letter::{DeadLetterOutcome, DeadLetterSink};
pub use key_strategy::KeyStrategy;
pub use memory::MemoryLog;
pub use message::{DeadLetterRecord, InboundRecord, Message, Payload, TopicRole, TopicSpec};
pub use pipeline::{ConsumptionPipeline, PipelineHandle, WorkerReport, WorkerState};
pub use producer::{Ack, PublishOutcome, Publisher};
pub use profile::{ConsumerProfile, DeliveryProfile, ProfileCatalog};
pub use serializer::JsonSerializer;
pub use topic_manager::{ReconcileReport, TopicLifecycleManager, TopicStatus};
pub use transaction::{NoParticipant, Participant, PersistEvent, TransactionCoordinator};
pub use transport::{KafkaTransactionalLog, KafkaTransport, LogTransport, TransactionalLog};
