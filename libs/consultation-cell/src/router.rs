use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use crate::handlers::{end_session, get_history, open_channel, send_message};
use crate::services::ConsultationState;

pub fn create_consultation_router(state: Arc<ConsultationState>) -> Router {
    Router::new()
        .route("/events", get(open_channel))
        .route("/messages", post(send_message))
        .route("/{session_id}/end", post(end_session))
        .route("/{session_id}/history", get(get_history))
        .with_state(state)
}
