use std::sync::Arc;
use std::time::Duration;

use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;

use crate::error::ConsultationError;

pub mod completion;
pub mod directory;
pub mod gateway;
pub mod orchestrator;
pub mod persistence;
pub mod records;
pub mod store;

pub use completion::{CompletionBackend, CompletionChunk, CompletionStream, OpenAiCompletionClient};
pub use directory::{AppointmentDirectory, SupabaseAppointmentDirectory};
pub use gateway::StreamingGateway;
pub use orchestrator::ConsultationService;
pub use persistence::{derive_record_id, PersistenceSync};
pub use records::{DurableRecordStore, MemoryRecordStore, SupabaseRecordStore};
pub use store::{MemorySessionStore, RedisSessionStore, SessionMutation, SessionStore};

/// Shared engine state handed to the router. Built once at startup: the
/// gateway registry and store pool must be process-wide, not per-request.
pub struct ConsultationState {
    pub consultations: ConsultationService,
    pub persistence: PersistenceSync,
}

impl ConsultationState {
    /// Wires the production collaborators: Redis session store, Supabase
    /// appointment directory and record store, OpenAI-compatible completion
    /// backend.
    pub async fn from_config(config: &AppConfig) -> Result<Self, ConsultationError> {
        let supabase = Arc::new(SupabaseClient::new(config));
        let store: Arc<dyn SessionStore> = Arc::new(RedisSessionStore::new(config).await?);
        let gateway = StreamingGateway::new(Duration::from_secs(config.channel_ttl_seconds));
        let backend: Arc<dyn CompletionBackend> = Arc::new(OpenAiCompletionClient::new(config));
        let directory: Arc<dyn AppointmentDirectory> =
            Arc::new(SupabaseAppointmentDirectory::new(supabase.clone()));
        let records: Arc<dyn DurableRecordStore> = Arc::new(SupabaseRecordStore::new(supabase));

        Ok(Self::assemble(store, gateway, backend, directory, records))
    }

    /// Assembles the engine over explicit collaborators; tests inject the
    /// in-memory store/record implementations and scripted backends here.
    pub fn assemble(
        store: Arc<dyn SessionStore>,
        gateway: StreamingGateway,
        backend: Arc<dyn CompletionBackend>,
        directory: Arc<dyn AppointmentDirectory>,
        records: Arc<dyn DurableRecordStore>,
    ) -> Self {
        let consultations = ConsultationService::new(
            Arc::clone(&store),
            gateway.clone(),
            backend,
            directory,
        );
        let persistence = PersistenceSync::new(store, records, gateway);

        Self {
            consultations,
            persistence,
        }
    }
}
