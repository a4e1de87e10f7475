use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use consultation_cell::*;

/// One scripted backend outcome; each consultation turn consumes the next.
pub enum ScriptedTurn {
    /// Stream these tokens, then signal completion.
    Reply(Vec<&'static str>),
    /// Stream these tokens, then fail mid-stream.
    FailAfter(Vec<&'static str>, &'static str),
    /// Fail before any token is produced.
    DispatchFailure(&'static str),
}

pub struct ScriptedCompletionBackend {
    turns: Mutex<VecDeque<ScriptedTurn>>,
}

impl ScriptedCompletionBackend {
    pub fn new(turns: Vec<ScriptedTurn>) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns.into()),
        })
    }
}

#[async_trait]
impl CompletionBackend for ScriptedCompletionBackend {
    async fn stream_completion(
        &self,
        _history: &[MessageRecord],
    ) -> Result<CompletionStream, ConsultationError> {
        let turn = self
            .turns
            .lock()
            .await
            .pop_front()
            .unwrap_or(ScriptedTurn::Reply(vec![]));

        match turn {
            ScriptedTurn::Reply(tokens) => {
                let mut items: Vec<Result<CompletionChunk, ConsultationError>> = tokens
                    .into_iter()
                    .map(|token| Ok(CompletionChunk::Token(token.to_string())))
                    .collect();
                items.push(Ok(CompletionChunk::Done));
                Ok(Box::pin(futures::stream::iter(items)))
            }
            ScriptedTurn::FailAfter(tokens, message) => {
                let mut items: Vec<Result<CompletionChunk, ConsultationError>> = tokens
                    .into_iter()
                    .map(|token| Ok(CompletionChunk::Token(token.to_string())))
                    .collect();
                items.push(Err(ConsultationError::Backend(message.to_string())));
                Ok(Box::pin(futures::stream::iter(items)))
            }
            ScriptedTurn::DispatchFailure(message) => {
                Err(ConsultationError::Backend(message.to_string()))
            }
        }
    }
}

/// Directory that admits every appointment/patient pair.
pub struct AllowAllDirectory;

#[async_trait]
impl AppointmentDirectory for AllowAllDirectory {
    async fn verify_consultation_access(
        &self,
        _appointment_id: Uuid,
        _patient_id: Uuid,
    ) -> Result<(), ConsultationError> {
        Ok(())
    }
}

/// Directory whose backing service is down; the engine must fail closed.
pub struct UnavailableDirectory;

#[async_trait]
impl AppointmentDirectory for UnavailableDirectory {
    async fn verify_consultation_access(
        &self,
        _appointment_id: Uuid,
        _patient_id: Uuid,
    ) -> Result<(), ConsultationError> {
        Err(ConsultationError::Database(
            "Appointment directory unavailable: connection refused".to_string(),
        ))
    }
}

/// Record store whose writes always fail, for rollback tests.
pub struct FailingRecordStore;

#[async_trait]
impl DurableRecordStore for FailingRecordStore {
    async fn find(
        &self,
        _record_id: i64,
    ) -> Result<Option<DurableConsultationRecord>, ConsultationError> {
        Ok(None)
    }

    async fn insert(&self, _record: &DurableConsultationRecord) -> Result<(), ConsultationError> {
        Err(ConsultationError::Database(
            "Durable record store unavailable".to_string(),
        ))
    }

    async fn compare_and_update(
        &self,
        _record: &DurableConsultationRecord,
        _expected_version: i64,
    ) -> Result<bool, ConsultationError> {
        Err(ConsultationError::Database(
            "Durable record store unavailable".to_string(),
        ))
    }
}

/// Delegates to an inner memory store but reports a version conflict for the
/// first `conflicts` conditional updates.
pub struct ContendedRecordStore {
    pub inner: MemoryRecordStore,
    conflicts: AtomicU32,
}

impl ContendedRecordStore {
    pub fn new(conflicts: u32) -> Self {
        Self {
            inner: MemoryRecordStore::new(),
            conflicts: AtomicU32::new(conflicts),
        }
    }
}

#[async_trait]
impl DurableRecordStore for ContendedRecordStore {
    async fn find(
        &self,
        record_id: i64,
    ) -> Result<Option<DurableConsultationRecord>, ConsultationError> {
        self.inner.find(record_id).await
    }

    async fn insert(&self, record: &DurableConsultationRecord) -> Result<(), ConsultationError> {
        self.inner.insert(record).await
    }

    async fn compare_and_update(
        &self,
        record: &DurableConsultationRecord,
        expected_version: i64,
    ) -> Result<bool, ConsultationError> {
        let remaining = self.conflicts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.conflicts.store(remaining - 1, Ordering::SeqCst);
            return Ok(false);
        }
        self.inner.compare_and_update(record, expected_version).await
    }
}

/// Assembles an engine over the in-memory session store, an allow-all
/// directory and the given backend/record store/gateway.
pub fn build_state(
    backend: Arc<dyn CompletionBackend>,
    records: Arc<dyn DurableRecordStore>,
    gateway: StreamingGateway,
) -> (Arc<ConsultationState>, Arc<MemorySessionStore>) {
    let store = Arc::new(MemorySessionStore::default());
    let state = ConsultationState::assemble(
        store.clone(),
        gateway,
        backend,
        Arc::new(AllowAllDirectory),
        records,
    );
    (Arc::new(state), store)
}

/// Polls the session history until it reaches `expected` records or times out.
pub async fn wait_for_history_len(
    state: &ConsultationState,
    session_id: &str,
    expected: usize,
    timeout_ms: u64,
) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if let Ok(session) = state.consultations.get_history(session_id).await {
            if session.message_history.len() >= expected {
                return true;
            }
        }
        if std::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Collects channel events until a terminal `complete`/`error` or timeout.
pub async fn collect_until_terminal(
    receiver: &mut mpsc::Receiver<ConsultationEvent>,
    timeout_ms: u64,
) -> Vec<ConsultationEvent> {
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);

    loop {
        match tokio::time::timeout_at(deadline, receiver.recv()).await {
            Ok(Some(event)) => {
                let terminal = matches!(
                    event,
                    ConsultationEvent::Complete { .. } | ConsultationEvent::Error { .. }
                );
                events.push(event);
                if terminal {
                    return events;
                }
            }
            _ => return events,
        }
    }
}

// Test modules
mod gateway_test;
