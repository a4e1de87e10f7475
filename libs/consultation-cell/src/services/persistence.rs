use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::error::ConsultationError;
use crate::models::{ConsultationSession, DurableConsultationRecord, SessionStatus};
use crate::services::gateway::StreamingGateway;
use crate::services::records::DurableRecordStore;
use crate::services::store::SessionStore;

const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_BACKOFF: Duration = Duration::from_millis(50);

/// Derives the durable record id for a session.
///
/// Pure and stable: the same session id always yields the same id (the first
/// eight big-endian bytes of the SHA-256 digest, masked non-negative), so
/// repeated persistence targets the same row instead of creating duplicates.
/// A cross-session collision is indistinguishable from a version race and
/// surfaces as a `Conflict` once the retries are exhausted.
pub fn derive_record_id(session_id: &str) -> i64 {
    let digest = Sha256::digest(session_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) & i64::MAX as u64) as i64
}

/// Drains ended sessions into the durable record store.
pub struct PersistenceSync {
    store: Arc<dyn SessionStore>,
    records: Arc<dyn DurableRecordStore>,
    gateway: StreamingGateway,
}

impl PersistenceSync {
    pub fn new(
        store: Arc<dyn SessionStore>,
        records: Arc<dyn DurableRecordStore>,
        gateway: StreamingGateway,
    ) -> Self {
        Self {
            store,
            records,
            gateway,
        }
    }

    /// Marks the session ENDED and persists it. All-or-nothing: when
    /// persistence fails the session status is rolled back to ACTIVE and the
    /// error is returned. On success the session's live channel, if any, is
    /// closed as part of the same operation.
    pub async fn end_session(
        &self,
        session_id: &str,
    ) -> Result<DurableConsultationRecord, ConsultationError> {
        let ended = self
            .store
            .mutate(
                session_id,
                Box::new(|session| {
                    session.status = SessionStatus::Ended;
                }),
            )
            .await?;

        match self.persist(&ended).await {
            Ok(record) => {
                self.gateway.close(session_id).await;
                info!(
                    "Session {} ended and persisted as record {}",
                    session_id, record.id
                );
                Ok(record)
            }
            Err(e) => {
                let rollback = self
                    .store
                    .mutate(
                        session_id,
                        Box::new(|session| {
                            session.status = SessionStatus::Active;
                        }),
                    )
                    .await;
                if let Err(rollback_err) = rollback {
                    error!(
                        "Failed to roll back session {} after persistence failure: {}",
                        session_id, rollback_err
                    );
                }
                Err(e)
            }
        }
    }

    /// Read-modify-write against the durable store with bounded retry. A lost
    /// insert race re-enters the loop as an update; a conditional update that
    /// matched nothing means another writer moved the version, so re-read and
    /// try again.
    pub async fn persist(
        &self,
        session: &ConsultationSession,
    ) -> Result<DurableConsultationRecord, ConsultationError> {
        let record_id = derive_record_id(&session.session_id);

        for attempt in 1..=PERSIST_ATTEMPTS {
            match self.records.find(record_id).await? {
                None => {
                    let record = DurableConsultationRecord::from_session(record_id, session, 0);
                    match self.records.insert(&record).await {
                        Ok(()) => return Ok(record),
                        Err(ConsultationError::Conflict(_)) => {
                            warn!(
                                "Lost insert race for record {} (attempt {}), retrying as update",
                                record_id, attempt
                            );
                        }
                        Err(e) => return Err(e),
                    }
                }
                Some(existing) => {
                    let record = DurableConsultationRecord::from_session(
                        record_id,
                        session,
                        existing.version + 1,
                    );
                    if self
                        .records
                        .compare_and_update(&record, existing.version)
                        .await?
                    {
                        return Ok(record);
                    }
                    warn!(
                        "Version conflict persisting session {} (attempt {})",
                        session.session_id, attempt
                    );
                }
            }

            tokio::time::sleep(PERSIST_BACKOFF * attempt).await;
        }

        Err(ConsultationError::Conflict(format!(
            "Could not persist session {} after {} attempts",
            session.session_id, PERSIST_ATTEMPTS
        )))
    }
}
