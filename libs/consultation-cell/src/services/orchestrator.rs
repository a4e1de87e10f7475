use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ConsultationError;
use crate::models::{
    ConsultationEvent, ConsultationSession, MessageRecord, MessageRole, OpenChannelParams,
    SendMessageRequest, SendMessageResponse,
};
use crate::services::completion::{CompletionBackend, CompletionChunk};
use crate::services::directory::AppointmentDirectory;
use crate::services::gateway::StreamingGateway;
use crate::services::store::SessionStore;

/// Bound on the gap between consecutive completion tokens.
const TOKEN_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Retry policy for the finalize write when the session lock is contended.
const FINALIZE_ATTEMPTS: u32 = 3;
const FINALIZE_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Drives consultation turns: validates the request, records the user turn
/// under the session lock, then streams the reply on a detached task that
/// relays tokens to the gateway and finalizes the assistant record. All
/// session writes go through the store's `mutate`, so concurrent turns on the
/// same session serialize instead of racing.
pub struct ConsultationService {
    store: Arc<dyn SessionStore>,
    gateway: StreamingGateway,
    backend: Arc<dyn CompletionBackend>,
    directory: Arc<dyn AppointmentDirectory>,
}

impl ConsultationService {
    pub fn new(
        store: Arc<dyn SessionStore>,
        gateway: StreamingGateway,
        backend: Arc<dyn CompletionBackend>,
        directory: Arc<dyn AppointmentDirectory>,
    ) -> Self {
        Self {
            store,
            gateway,
            backend,
            directory,
        }
    }

    /// Opens the push channel for a session, creating the session when no id
    /// is supplied. The first event on the channel is `connect` carrying the
    /// session id the client should use from then on.
    pub async fn open_channel(
        &self,
        params: OpenChannelParams,
    ) -> Result<(String, mpsc::Receiver<ConsultationEvent>), ConsultationError> {
        let session = self
            .ensure_session(
                params.session_id.as_deref(),
                params.patient_id,
                params.appointment_id,
            )
            .await?;

        let receiver = self.gateway.open(&session.session_id).await;
        self.gateway
            .push(
                &session.session_id,
                ConsultationEvent::Connect {
                    session_id: session.session_id.clone(),
                },
            )
            .await;

        Ok((session.session_id, receiver))
    }

    /// Accepts a patient question. The user record is committed before this
    /// returns, so history survives any backend failure; the reply itself
    /// streams out-of-band and the caller only gets the session id.
    pub async fn send_message(
        &self,
        request: SendMessageRequest,
    ) -> Result<SendMessageResponse, ConsultationError> {
        let question = request.question.trim().to_string();
        if question.is_empty() {
            return Err(ConsultationError::Validation(
                "Question must not be empty".to_string(),
            ));
        }

        let session = self
            .ensure_session(
                request.session_id.as_deref(),
                request.patient_id,
                request.appointment_id,
            )
            .await?;
        let session_id = session.session_id;

        let updated = self
            .store
            .mutate(
                &session_id,
                Box::new(move |session| session.push_user(question)),
            )
            .await?;

        info!(
            "User turn recorded for session {} ({} records), dispatching completion",
            session_id,
            updated.message_history.len()
        );

        let service = self.clone();
        let turn_session = session_id.clone();
        let history = updated.message_history;
        tokio::spawn(async move {
            service.run_turn(turn_session, history).await;
        });

        Ok(SendMessageResponse { session_id })
    }

    pub async fn get_history(
        &self,
        session_id: &str,
    ) -> Result<ConsultationSession, ConsultationError> {
        self.store.read(session_id).await
    }

    async fn ensure_session(
        &self,
        session_id: Option<&str>,
        patient_id: Uuid,
        appointment_id: Uuid,
    ) -> Result<ConsultationSession, ConsultationError> {
        if patient_id.is_nil() || appointment_id.is_nil() {
            return Err(ConsultationError::Validation(
                "Patient and appointment identifiers are required".to_string(),
            ));
        }

        match session_id {
            Some(id) if !id.trim().is_empty() => match self.store.read(id).await {
                Ok(session) => {
                    if session.patient_id != patient_id
                        || session.appointment_id != appointment_id
                    {
                        return Err(ConsultationError::Conflict(format!(
                            "Session {} belongs to a different appointment",
                            id
                        )));
                    }
                    Ok(session)
                }
                Err(ConsultationError::NotFound(_)) => {
                    self.create_session(Some(id), patient_id, appointment_id).await
                }
                Err(e) => Err(e),
            },
            _ => self.create_session(None, patient_id, appointment_id).await,
        }
    }

    async fn create_session(
        &self,
        session_id: Option<&str>,
        patient_id: Uuid,
        appointment_id: Uuid,
    ) -> Result<ConsultationSession, ConsultationError> {
        // The directory is authoritative; if it cannot answer, no session.
        self.directory
            .verify_consultation_access(appointment_id, patient_id)
            .await?;

        let session_id = session_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        self.store
            .create_or_get(&session_id, patient_id, appointment_id)
            .await
    }

    /// The detached turn path. Its only externally visible side effects are
    /// store mutations and gateway pushes; errors end here as an `error`
    /// event, never as a crash of the submitting request.
    async fn run_turn(&self, session_id: String, history: Vec<MessageRecord>) {
        let stream = match self.backend.stream_completion(&history).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Completion dispatch failed for session {}: {}", session_id, e);
                self.emit_error(&session_id, &e).await;
                return;
            }
        };

        let mut stream = Box::pin(stream.timeout(TOKEN_IDLE_TIMEOUT));

        while let Some(item) = stream.next().await {
            match item {
                Ok(Ok(CompletionChunk::Token(token))) => {
                    self.gateway
                        .push(
                            &session_id,
                            ConsultationEvent::Message {
                                role: MessageRole::Assistant,
                                content: token.clone(),
                                session_id: session_id.clone(),
                            },
                        )
                        .await;

                    if let Err(e) = self.store.append_reply_buffer(&session_id, &token).await {
                        warn!(
                            "Failed to buffer completion token for session {}: {}",
                            session_id, e
                        );
                    }
                }
                Ok(Ok(CompletionChunk::Done)) => break,
                Ok(Err(e)) => {
                    warn!("Completion stream failed for session {}: {}", session_id, e);
                    self.abort_turn(&session_id, &e).await;
                    return;
                }
                Err(_elapsed) => {
                    let e = ConsultationError::Backend(
                        "Completion stream idle timeout".to_string(),
                    );
                    warn!("Completion stream timed out for session {}", session_id);
                    self.abort_turn(&session_id, &e).await;
                    return;
                }
            }
        }

        self.finalize_turn(&session_id).await;
    }

    /// Commits the accumulated reply as the assistant record and signals turn
    /// completion. An empty reply still finalizes so user/assistant records
    /// keep alternating.
    async fn finalize_turn(&self, session_id: &str) {
        let reply = match self.store.take_reply_buffer(session_id).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(
                    "Failed to read reply buffer for session {}: {}",
                    session_id, e
                );
                self.emit_error(session_id, &e).await;
                return;
            }
        };

        for attempt in 1..=FINALIZE_ATTEMPTS {
            let assembled = reply.clone();
            match self
                .store
                .mutate(
                    session_id,
                    Box::new(move |session| session.push_assistant(assembled)),
                )
                .await
            {
                Ok(session) => {
                    info!(
                        "Assistant turn finalized for session {} ({} chars, {} records)",
                        session_id,
                        reply.len(),
                        session.message_history.len()
                    );
                    self.gateway
                        .push(
                            session_id,
                            ConsultationEvent::Complete {
                                session_id: session_id.to_string(),
                            },
                        )
                        .await;
                    return;
                }
                Err(ConsultationError::Busy(_)) if attempt < FINALIZE_ATTEMPTS => {
                    warn!(
                        "Session {} locked, retrying finalize (attempt {})",
                        session_id, attempt
                    );
                    tokio::time::sleep(FINALIZE_RETRY_DELAY).await;
                }
                Err(ConsultationError::NotFound(_)) => {
                    // Session expired mid-turn; there is no history left to
                    // attach the reply to.
                    warn!(
                        "Session {} expired before the turn could finalize, dropping reply",
                        session_id
                    );
                    return;
                }
                Err(e) => {
                    warn!(
                        "Failed to finalize assistant turn for session {}: {}",
                        session_id, e
                    );
                    self.emit_error(session_id, &e).await;
                    return;
                }
            }
        }
    }

    /// A failed stream never commits a partial assistant record: the buffered
    /// fragment is discarded and the user turn stays as the last record, so a
    /// retry is safe.
    async fn abort_turn(&self, session_id: &str, error: &ConsultationError) {
        if let Err(e) = self.store.take_reply_buffer(session_id).await {
            warn!(
                "Failed to discard reply buffer for session {}: {}",
                session_id, e
            );
        }
        self.emit_error(session_id, error).await;
    }

    async fn emit_error(&self, session_id: &str, error: &ConsultationError) {
        self.gateway
            .push(
                session_id,
                ConsultationEvent::Error {
                    message: error.to_string(),
                    session_id: session_id.to_string(),
                },
            )
            .await;
    }
}

impl Clone for ConsultationService {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            gateway: self.gateway.clone(),
            backend: Arc::clone(&self.backend),
            directory: Arc::clone(&self.directory),
        }
    }
}
