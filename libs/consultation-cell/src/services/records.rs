use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use shared_database::supabase::SupabaseClient;

use crate::error::ConsultationError;
use crate::models::DurableConsultationRecord;

/// Long-term home of ended consultations. Writers must tolerate concurrent
/// writers via the record's own version counter: `compare_and_update` only
/// applies when the version read earlier still matches.
#[async_trait]
pub trait DurableRecordStore: Send + Sync {
    async fn find(
        &self,
        record_id: i64,
    ) -> Result<Option<DurableConsultationRecord>, ConsultationError>;

    /// Inserts a new record; a `Conflict` means another writer inserted the
    /// same record id first.
    async fn insert(&self, record: &DurableConsultationRecord) -> Result<(), ConsultationError>;

    /// Conditional update. Returns `false` when `expected_version` no longer
    /// matches the stored row.
    async fn compare_and_update(
        &self,
        record: &DurableConsultationRecord,
        expected_version: i64,
    ) -> Result<bool, ConsultationError>;
}

// ==============================================================================
// SUPABASE IMPLEMENTATION
// ==============================================================================

const RECORDS_PATH: &str = "/rest/v1/consultation_records";

pub struct SupabaseRecordStore {
    supabase: Arc<SupabaseClient>,
}

impl SupabaseRecordStore {
    pub fn new(supabase: Arc<SupabaseClient>) -> Self {
        Self { supabase }
    }

    fn record_body(record: &DurableConsultationRecord) -> Value {
        json!({
            "id": record.id,
            "session_id": record.session_id,
            "patient_id": record.patient_id,
            "appointment_id": record.appointment_id,
            "status": record.status,
            "message_history": record.message_history,
            "version": record.version,
            "created_at": record.created_at,
            "updated_at": record.updated_at,
        })
    }
}

#[async_trait]
impl DurableRecordStore for SupabaseRecordStore {
    async fn find(
        &self,
        record_id: i64,
    ) -> Result<Option<DurableConsultationRecord>, ConsultationError> {
        let path = format!("{}?id=eq.{}", RECORDS_PATH, record_id);
        let rows: Vec<DurableConsultationRecord> = self
            .supabase
            .request(Method::GET, &path, None)
            .await
            .map_err(|e| ConsultationError::Database(e.to_string()))?;

        Ok(rows.into_iter().next())
    }

    async fn insert(&self, record: &DurableConsultationRecord) -> Result<(), ConsultationError> {
        let result: Result<Vec<Value>, _> = self
            .supabase
            .request_with_prefer(
                Method::POST,
                RECORDS_PATH,
                Some(Self::record_body(record)),
                Some("return=representation"),
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() => Err(ConsultationError::Conflict(format!(
                "Durable record {} inserted concurrently",
                record.id
            ))),
            Err(e) => Err(ConsultationError::Database(e.to_string())),
        }
    }

    async fn compare_and_update(
        &self,
        record: &DurableConsultationRecord,
        expected_version: i64,
    ) -> Result<bool, ConsultationError> {
        // PostgREST applies the PATCH only to rows matching the filters; with
        // return=representation an empty result set is a version conflict.
        let path = format!(
            "{}?id=eq.{}&version=eq.{}",
            RECORDS_PATH, record.id, expected_version
        );
        let rows: Vec<Value> = self
            .supabase
            .request_with_prefer(
                Method::PATCH,
                &path,
                Some(Self::record_body(record)),
                Some("return=representation"),
            )
            .await
            .map_err(|e| ConsultationError::Database(e.to_string()))?;

        Ok(!rows.is_empty())
    }
}

// ==============================================================================
// IN-MEMORY IMPLEMENTATION
// ==============================================================================

/// Process-local record store honoring the same conditional-update contract,
/// for tests and local development.
#[derive(Default)]
pub struct MemoryRecordStore {
    rows: Arc<RwLock<HashMap<i64, DurableConsultationRecord>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl DurableRecordStore for MemoryRecordStore {
    async fn find(
        &self,
        record_id: i64,
    ) -> Result<Option<DurableConsultationRecord>, ConsultationError> {
        Ok(self.rows.read().await.get(&record_id).cloned())
    }

    async fn insert(&self, record: &DurableConsultationRecord) -> Result<(), ConsultationError> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&record.id) {
            return Err(ConsultationError::Conflict(format!(
                "Durable record {} inserted concurrently",
                record.id
            )));
        }
        rows.insert(record.id, record.clone());
        Ok(())
    }

    async fn compare_and_update(
        &self,
        record: &DurableConsultationRecord,
        expected_version: i64,
    ) -> Result<bool, ConsultationError> {
        let mut rows = self.rows.write().await;
        match rows.get(&record.id) {
            Some(existing) if existing.version == expected_version => {
                rows.insert(record.id, record.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
