//! mixscope - privacy protocol ingestion and linkability analysis
//!
//! Provides:
//! - Paced, retrying fetch layer over a chain data source
//! - Per-protocol parsers turning raw transactions into deposits, withdrawals and transfers
//! - Per-protocol indexers and an orchestrator over the protocol registry
//! - A typed, synchronous event bus
//! - A timing/amount correlation engine computing anonymity sets and ranked links

pub mod bus;
pub mod config;
pub mod consts;
pub mod correlation;
pub mod error;
pub mod fetch;
pub mod indexer;
pub mod orchestrator;
pub mod parser;
pub mod raw;
pub mod store;
pub mod types;

pub use bus::{BusEvent, EventBus, SubscriptionId, Topic};
pub use config::{ParserConfig, ParserKind, ProtocolConfig, ProtocolRegistry};
pub use correlation::{
    analyze, CorrelationConfig, CorrelationEngine, EngineHandle, MetricsSnapshot, PrivacyMetrics,
};
pub use error::{ConfigError, FetchError, IndexerError, SourceError, StoreError};
pub use fetch::{ChainDataSource, FetchClient, RetryPolicy, SignatureInfo};
pub use indexer::{Indexer, IndexerSettings, RunReport};
pub use orchestrator::Orchestrator;
pub use parser::{DomainEvent, ProtocolParser, Unclassified};
pub use raw::RawTransaction;
pub use store::{MemoryStore, Store, UpsertOutcome};
pub use types::*;
