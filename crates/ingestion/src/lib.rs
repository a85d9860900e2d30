mod intake;
mod pending;
mod source;

pub use intake::{IngestOutcome, SignatureIntake};
pub use pending::{
    missing_retry_delay, InsertOutcome, MissingOutcome, PendingBuffer, PendingBufferConfig,
    PendingEntry,
};
pub use source::{
    subscription_targets, EnrichedBatch, EnrichmentClient, EnrichmentError, EnrichmentErrorKind,
    EnrichmentTelemetrySnapshot, HeliusEnhancedClient, LogsSubscription, SubscriptionTarget,
};
