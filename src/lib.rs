pub mod config;

pub mod core {
    pub mod record;
    pub mod types;

    pub use record::{DerivedFields, Holding, InstrumentStatus, Record, RecordDelta};
    pub use types::{ConnectionId, InstrumentKey, SourceId, Timestamp, Version};
}

pub mod store {
    pub mod market_data;
    pub mod subscription;

    pub use market_data::{MarketDataStore, Snapshot, StoreError, StoreStatsSnapshot};
    pub use subscription::RecordSubscription;
}

pub mod feed {
    pub mod ingestor;
    pub mod types;
    pub mod websocket;

    pub use ingestor::{FeedIngestor, IngestOutcome};
    pub use types::{FeedMessage, FeedStatsSnapshot, IngestError, MessageType};
    pub use websocket::WebSocketFeedServer;
}

pub mod health {
    pub mod monitor;
    pub mod reconnect;
    pub mod state;

    pub use monitor::{Connection, HealthError, HealthMonitor};
    pub use reconnect::{ReconnectError, ReconnectSupervisor, Reconnector};
    pub use state::{ConnectionHealth, ConnectionRole, HealthEvent, HealthState, HealthTransition};
}

pub mod gateway {
    pub mod orchestrator;
    pub mod server;
    pub mod signal;
    pub mod sink;

    pub use orchestrator::{AckRecord, SignalOrchestrator};
    pub use server::WorkstationServer;
    pub use signal::{
        DeliveryError, DeliveryOutcome, DeliveryStatus, FanOutReport, Signal, SignalId, SignalScope,
        SkipReason,
    };
    pub use sink::{ChannelSink, WorkstationSink};
}

pub mod archive {
    pub mod archiver;
    pub mod sink;

    pub use archiver::{ArchiveStatsSnapshot, Archiver};
    pub use sink::{ArchiveBatch, ArchiveError, ArchiveSink, FileArchiveSink, MemoryArchiveSink};
}

pub mod api {
    pub mod read;

    pub use read::{PortfolioSummary, ReadApi};
}

// Re-export key types for convenience
pub use crate::api::{PortfolioSummary, ReadApi};
pub use crate::config::GatewayConfig;
pub use crate::core::{Record, RecordDelta, Timestamp};
pub use crate::feed::FeedIngestor;
pub use crate::gateway::{Signal, SignalOrchestrator};
pub use crate::health::{HealthMonitor, HealthState};
pub use crate::store::{MarketDataStore, StoreError};

// Error types
pub use anyhow::Result;

// Logging
pub use tracing;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
