// logs2sentinel-sink - routing and delivery stage
//
// Takes parsed records, shapes them per destination table, uploads batches
// to the Logs Ingestion endpoint, and persists terminally failed batches
// (redacted) for replay.
//
// Layers:
// - auth: OAuth2 client-credentials bearer tokens
// - upload: one POST per batch against the Data Collection Rule
// - route: transform / coerce / validate / batch / concurrent dispatch
// - failed_batch + redact + replay: durability for failed uploads

pub mod auth;
pub mod failed_batch;
pub mod redact;
pub mod replay;
pub mod route;
pub mod upload;

pub use auth::{AccessTokenProvider, AuthError, ClientCredentialsProvider, StaticTokenProvider};
pub use failed_batch::{batch_id, FailedBatchRecord, FailedBatchStore, StoreError};
pub use redact::{redact_batch, redact_record};
pub use replay::{replay_failed_batches, ReplaySummary};
pub use route::{
    HealthStatus, RouteReport, SentinelSink, SentinelSinkConfig, SinkError, SinkHealth,
};
pub use upload::{BatchUploader, DcrUploader, UploadError};
