use std::sync::Arc;

use axum::{routing::get, Router};

use consultation_cell::router::create_consultation_router;
use consultation_cell::services::ConsultationState;

pub fn create_router(state: Arc<ConsultationState>) -> Router {
    Router::new()
        .route("/", get(|| async { "Serena Clinic API is running!" }))
        .nest("/consultations", create_consultation_router(state))
}
