pub mod authenticity;
pub mod classifier;
pub mod dlq;
pub mod encryption;
pub mod idempotency;
pub mod imaging;
pub mod ingest;
pub mod liveness;
pub mod normalize;
pub mod parsers;
pub mod pii;
pub mod pipeline;
pub mod processor;
pub mod queue;
pub mod recognition;
pub mod storage;
pub mod strategies;
pub mod template;
pub mod text;
pub mod webhook;
