use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use shared_database::supabase::SupabaseClient;

use crate::error::ConsultationError;

/// Appointment statuses that admit an AI consultation.
const CONSULTABLE_STATUSES: [&str; 3] = ["scheduled", "confirmed", "in_progress"];

/// Authoritative check that an appointment/patient pair may hold a
/// consultation. The engine fails closed: if the directory cannot answer,
/// no session is created.
#[async_trait]
pub trait AppointmentDirectory: Send + Sync {
    async fn verify_consultation_access(
        &self,
        appointment_id: Uuid,
        patient_id: Uuid,
    ) -> Result<(), ConsultationError>;
}

pub struct SupabaseAppointmentDirectory {
    supabase: Arc<SupabaseClient>,
}

impl SupabaseAppointmentDirectory {
    pub fn new(supabase: Arc<SupabaseClient>) -> Self {
        Self { supabase }
    }
}

#[async_trait]
impl AppointmentDirectory for SupabaseAppointmentDirectory {
    async fn verify_consultation_access(
        &self,
        appointment_id: Uuid,
        patient_id: Uuid,
    ) -> Result<(), ConsultationError> {
        let path = format!(
            "/rest/v1/appointments?id=eq.{}&patient_id=eq.{}&select=id,status",
            appointment_id, patient_id
        );

        let rows: Vec<Value> = self
            .supabase
            .request(Method::GET, &path, None)
            .await
            .map_err(|e| {
                warn!("Appointment directory unavailable: {}", e);
                ConsultationError::Database(format!("Appointment directory unavailable: {}", e))
            })?;

        let appointment = rows.into_iter().next().ok_or_else(|| {
            ConsultationError::Validation(format!(
                "Appointment {} not found for patient {}",
                appointment_id, patient_id
            ))
        })?;

        let status = appointment["status"].as_str().unwrap_or("");
        if !CONSULTABLE_STATUSES.contains(&status) {
            return Err(ConsultationError::Validation(format!(
                "Appointment {} is not eligible for consultation (status: {})",
                appointment_id, status
            )));
        }

        Ok(())
    }
}
