use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opening instruction seeded into every consultation at creation.
pub const SYSTEM_PROMPT: &str = "You are the AI consultation assistant of Serena Clinic. \
The patient you are talking to has a booked appointment. Answer their questions about \
symptoms and preparation concisely and empathetically, and defer anything that needs a \
diagnosis to the doctor they will see.";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// One finalized line of dialogue. Assistant records always carry the fully
/// assembled reply, never a partial stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageRecord {
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Active,
    Ended,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsultationSession {
    pub session_id: String,
    pub patient_id: Uuid,
    pub appointment_id: Uuid,
    pub status: SessionStatus,
    pub message_history: Vec<MessageRecord>,
    /// Bumped by the session store on every successful write.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConsultationSession {
    pub fn new(session_id: String, patient_id: Uuid, appointment_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            patient_id,
            appointment_id,
            status: SessionStatus::Active,
            message_history: vec![MessageRecord {
                role: MessageRole::System,
                content: SYSTEM_PROMPT.to_string(),
                created_at: now,
            }],
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Appends the patient's question. A retry of a still-unanswered question
    /// is not appended again, so a failed turn can be resubmitted without
    /// duplicating the user record.
    pub fn push_user(&mut self, content: String) {
        if let Some(last) = self.message_history.last() {
            if last.role == MessageRole::User && last.content == content {
                return;
            }
        }
        self.push(MessageRole::User, content);
    }

    /// Appends the assembled assistant reply for the pending user turn.
    pub fn push_assistant(&mut self, content: String) {
        self.push(MessageRole::Assistant, content);
    }

    fn push(&mut self, role: MessageRole, content: String) {
        self.message_history.push(MessageRecord {
            role,
            content,
            created_at: Utc::now(),
        });
    }
}

/// Archived form of an ended session. `id` is derived from the session id,
/// `version` is the durable store's own optimistic-concurrency counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurableConsultationRecord {
    pub id: i64,
    pub session_id: String,
    pub patient_id: Uuid,
    pub appointment_id: Uuid,
    pub status: SessionStatus,
    pub message_history: Vec<MessageRecord>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DurableConsultationRecord {
    pub fn from_session(record_id: i64, session: &ConsultationSession, version: i64) -> Self {
        Self {
            id: record_id,
            session_id: session.session_id.clone(),
            patient_id: session.patient_id,
            appointment_id: session.appointment_id,
            status: session.status,
            message_history: session.message_history.clone(),
            version,
            created_at: session.created_at,
            updated_at: Utc::now(),
        }
    }
}

/// Wire events pushed over a consultation channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConsultationEvent {
    Connect {
        session_id: String,
    },
    Message {
        role: MessageRole,
        content: String,
        session_id: String,
    },
    Complete {
        session_id: String,
    },
    Error {
        message: String,
        session_id: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageRequest {
    pub session_id: Option<String>,
    pub appointment_id: Uuid,
    pub patient_id: Uuid,
    pub question: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendMessageResponse {
    pub session_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenChannelParams {
    pub session_id: Option<String>,
    pub appointment_id: Uuid,
    pub patient_id: Uuid,
}
