use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::info;

use shared_models::error::AppError;

use crate::models::{ConsultationSession, OpenChannelParams, SendMessageRequest};
use crate::services::ConsultationState;

/// Open the push channel for a consultation session (SSE). Creates the
/// session when no id is supplied; the first event is `connect` with the id.
pub async fn open_channel(
    State(state): State<Arc<ConsultationState>>,
    Query(params): Query<OpenChannelParams>,
) -> Result<impl IntoResponse, AppError> {
    info!(
        "Opening consultation channel for appointment: {}",
        params.appointment_id
    );

    let (session_id, receiver) = state.consultations.open_channel(params).await?;
    info!("Consultation channel open for session: {}", session_id);

    let stream = ReceiverStream::new(receiver).map(|event| {
        Ok::<Event, Infallible>(
            Event::default()
                .json_data(&event)
                .unwrap_or_else(|_| Event::default().data("{}")),
        )
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

/// Submit a patient question; the reply streams over the session's channel.
pub async fn send_message(
    State(state): State<Arc<ConsultationState>>,
    Json(request): Json<SendMessageRequest>,
) -> Result<Json<Value>, AppError> {
    info!(
        "Consultation message for appointment: {}",
        request.appointment_id
    );

    let response = state.consultations.send_message(request).await?;

    Ok(Json(json!({
        "session_id": response.session_id
    })))
}

/// End a session and archive it as a durable record.
pub async fn end_session(
    State(state): State<Arc<ConsultationState>>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    info!("Ending consultation session: {}", session_id);

    let record = state.persistence.end_session(&session_id).await?;

    Ok(Json(json!({
        "success": true,
        "record_id": record.id
    })))
}

/// Full session history, straight from the session store.
pub async fn get_history(
    State(state): State<Arc<ConsultationState>>,
    Path(session_id): Path<String>,
) -> Result<Json<ConsultationSession>, AppError> {
    let session = state.consultations.get_history(&session_id).await?;
    Ok(Json(session))
}
