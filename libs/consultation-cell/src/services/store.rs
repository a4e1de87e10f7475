use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::{Config, Connection, Pool, Runtime};
use redis::AsyncCommands;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared_config::AppConfig;

use crate::error::ConsultationError;
use crate::models::ConsultationSession;

/// A change applied to a session while its per-session lock is held.
pub type SessionMutation = Box<dyn FnOnce(&mut ConsultationSession) + Send>;

/// Source of truth for active conversations.
///
/// `mutate` is the only write path: it serializes read-modify-write cycles per
/// session, bumps the session version and refreshes the retention TTL. The
/// reply buffer accumulates streamed tokens for the in-flight turn and shares
/// the session's expiry policy; it never appears in `message_history` until
/// the turn finalizes.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Atomically creates the session (seeded with its system record) or
    /// returns the existing one after verifying the patient/appointment pair
    /// matches. A mismatch is a `Conflict`, never an overwrite.
    async fn create_or_get(
        &self,
        session_id: &str,
        patient_id: Uuid,
        appointment_id: Uuid,
    ) -> Result<ConsultationSession, ConsultationError>;

    async fn read(&self, session_id: &str) -> Result<ConsultationSession, ConsultationError>;

    /// Applies `mutation` under the session lock. Fails with `Busy` when the
    /// lock cannot be acquired within the wait bound; the mutation is never
    /// silently skipped.
    async fn mutate(
        &self,
        session_id: &str,
        mutation: SessionMutation,
    ) -> Result<ConsultationSession, ConsultationError>;

    async fn append_reply_buffer(
        &self,
        session_id: &str,
        chunk: &str,
    ) -> Result<(), ConsultationError>;

    /// Returns the accumulated reply and clears the buffer.
    async fn take_reply_buffer(&self, session_id: &str) -> Result<String, ConsultationError>;
}

// ==============================================================================
// REDIS IMPLEMENTATION
// ==============================================================================

const SESSION_KEY_PREFIX: &str = "consult:session:";
const LOCK_KEY_PREFIX: &str = "consult:lock:";
const REPLY_KEY_PREFIX: &str = "consult:reply:";

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Deletes the lock key only while it still holds this owner's token, so a
/// holder whose lease expired cannot release a lock someone else re-acquired.
const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

pub struct RedisSessionStore {
    pool: Pool,
    session_ttl: Duration,
    lock_wait: Duration,
    lock_lease: Duration,
}

impl RedisSessionStore {
    pub async fn new(config: &AppConfig) -> Result<Self, ConsultationError> {
        let redis_url = config
            .redis_url
            .clone()
            .unwrap_or_else(|| "redis://localhost:6379".to_string());

        let cfg = Config::from_url(redis_url);
        let pool = cfg.create_pool(Some(Runtime::Tokio1)).map_err(|e| {
            ConsultationError::Store(format!("Failed to create Redis pool: {}", e))
        })?;

        // Test connection
        let mut conn = pool.get().await.map_err(|e| {
            ConsultationError::Store(format!("Failed to connect to Redis: {}", e))
        })?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| ConsultationError::Store(format!("Redis ping failed: {}", e)))?;

        info!("Redis session store initialized successfully");

        Ok(Self {
            pool,
            session_ttl: Duration::from_secs(config.session_ttl_seconds),
            lock_wait: Duration::from_millis(config.lock_wait_ms),
            lock_lease: Duration::from_millis(config.lock_lease_ms),
        })
    }

    async fn get_connection(&self) -> Result<Connection, ConsultationError> {
        self.pool.get().await.map_err(|e| {
            ConsultationError::Store(format!("Failed to get Redis connection: {}", e))
        })
    }

    /// Polls `SET NX PX` until the lock is held or the wait bound elapses.
    /// The lease bounds how long a crashed holder can block other writers.
    async fn acquire_lock(
        &self,
        conn: &mut Connection,
        session_id: &str,
    ) -> Result<String, ConsultationError> {
        let lock_key = format!("{}{}", LOCK_KEY_PREFIX, session_id);
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.lock_wait;

        loop {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(&lock_key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(self.lock_lease.as_millis() as u64)
                .query_async(conn)
                .await
                .map_err(|e| ConsultationError::Store(format!("Lock acquire failed: {}", e)))?;

            if acquired.is_some() {
                return Ok(token);
            }

            if Instant::now() + LOCK_POLL_INTERVAL > deadline {
                return Err(ConsultationError::Busy(format!(
                    "Could not lock session {} within {}ms",
                    session_id,
                    self.lock_wait.as_millis()
                )));
            }

            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    async fn release_lock(&self, conn: &mut Connection, session_id: &str, token: &str) {
        let lock_key = format!("{}{}", LOCK_KEY_PREFIX, session_id);
        let script = redis::Script::new(RELEASE_LOCK_SCRIPT);
        let released: Result<i32, _> = script.key(&lock_key).arg(token).invoke_async(conn).await;

        // An expired lease is already gone; the script keeps that harmless.
        if let Err(e) = released {
            warn!("Failed to release lock for session {}: {}", session_id, e);
        }
    }

    async fn load(
        &self,
        conn: &mut Connection,
        session_id: &str,
    ) -> Result<Option<ConsultationSession>, ConsultationError> {
        let session_key = format!("{}{}", SESSION_KEY_PREFIX, session_id);
        let raw: Option<String> = conn
            .get(&session_key)
            .await
            .map_err(|e| ConsultationError::Store(format!("Session read failed: {}", e)))?;

        match raw {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    /// Writes the session back and restarts its retention window.
    async fn save(
        &self,
        conn: &mut Connection,
        session: &ConsultationSession,
    ) -> Result<(), ConsultationError> {
        let session_key = format!("{}{}", SESSION_KEY_PREFIX, session.session_id);
        let data = serde_json::to_string(session)?;

        let _: () = conn
            .set_ex(&session_key, data, self.session_ttl.as_secs())
            .await
            .map_err(|e| ConsultationError::Store(format!("Session write failed: {}", e)))?;

        Ok(())
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn create_or_get(
        &self,
        session_id: &str,
        patient_id: Uuid,
        appointment_id: Uuid,
    ) -> Result<ConsultationSession, ConsultationError> {
        let mut conn = self.get_connection().await?;
        let token = self.acquire_lock(&mut conn, session_id).await?;

        let result = match self.load(&mut conn, session_id).await {
            Ok(Some(existing)) => {
                if existing.patient_id != patient_id || existing.appointment_id != appointment_id
                {
                    Err(ConsultationError::Conflict(format!(
                        "Session {} belongs to a different appointment",
                        session_id
                    )))
                } else {
                    Ok(existing)
                }
            }
            Ok(None) => {
                let session = ConsultationSession::new(
                    session_id.to_string(),
                    patient_id,
                    appointment_id,
                );
                match self.save(&mut conn, &session).await {
                    Ok(()) => {
                        debug!("Created consultation session {}", session_id);
                        Ok(session)
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };

        self.release_lock(&mut conn, session_id, &token).await;
        result
    }

    async fn read(&self, session_id: &str) -> Result<ConsultationSession, ConsultationError> {
        let mut conn = self.get_connection().await?;
        self.load(&mut conn, session_id)
            .await?
            .ok_or_else(|| ConsultationError::NotFound(session_id.to_string()))
    }

    async fn mutate(
        &self,
        session_id: &str,
        mutation: SessionMutation,
    ) -> Result<ConsultationSession, ConsultationError> {
        let mut conn = self.get_connection().await?;
        let token = self.acquire_lock(&mut conn, session_id).await?;

        let result = match self.load(&mut conn, session_id).await {
            Ok(Some(mut session)) => {
                mutation(&mut session);
                session.version += 1;
                session.updated_at = Utc::now();
                match self.save(&mut conn, &session).await {
                    Ok(()) => Ok(session),
                    Err(e) => Err(e),
                }
            }
            Ok(None) => Err(ConsultationError::NotFound(session_id.to_string())),
            Err(e) => Err(e),
        };

        self.release_lock(&mut conn, session_id, &token).await;
        result
    }

    async fn append_reply_buffer(
        &self,
        session_id: &str,
        chunk: &str,
    ) -> Result<(), ConsultationError> {
        let mut conn = self.get_connection().await?;
        let reply_key = format!("{}{}", REPLY_KEY_PREFIX, session_id);

        let _: () = conn
            .append(&reply_key, chunk)
            .await
            .map_err(|e| ConsultationError::Store(format!("Buffer append failed: {}", e)))?;
        let _: () = conn
            .expire(&reply_key, self.session_ttl.as_secs() as i64)
            .await
            .map_err(|e| ConsultationError::Store(format!("Buffer expire failed: {}", e)))?;

        Ok(())
    }

    async fn take_reply_buffer(&self, session_id: &str) -> Result<String, ConsultationError> {
        let mut conn = self.get_connection().await?;
        let reply_key = format!("{}{}", REPLY_KEY_PREFIX, session_id);

        let value: Option<String> = conn
            .get(&reply_key)
            .await
            .map_err(|e| ConsultationError::Store(format!("Buffer read failed: {}", e)))?;
        let _: () = conn
            .del(&reply_key)
            .await
            .map_err(|e| ConsultationError::Store(format!("Buffer clear failed: {}", e)))?;

        Ok(value.unwrap_or_default())
    }
}

// ==============================================================================
// IN-MEMORY IMPLEMENTATION
// ==============================================================================

struct MemoryEntry {
    session: ConsultationSession,
    expires_at: Instant,
}

/// Single-process store honoring the same contract as the Redis one: the same
/// per-session exclusive lock with a bounded acquire wait, lazy TTL expiry,
/// version bump and TTL refresh on every successful mutation. Used by tests
/// and as a fallback deployment without Redis.
pub struct MemorySessionStore {
    entries: Arc<RwLock<HashMap<String, MemoryEntry>>>,
    buffers: Arc<RwLock<HashMap<String, String>>>,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    session_ttl: Duration,
    lock_wait: Duration,
}

impl MemorySessionStore {
    pub fn new(session_ttl: Duration, lock_wait: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            buffers: Arc::new(RwLock::new(HashMap::new())),
            locks: Arc::new(Mutex::new(HashMap::new())),
            session_ttl,
            lock_wait,
        }
    }

    async fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn acquire(&self, session_id: &str) -> Result<OwnedMutexGuard<()>, ConsultationError> {
        let lock = self.session_lock(session_id).await;
        tokio::time::timeout(self.lock_wait, lock.lock_owned())
            .await
            .map_err(|_| {
                ConsultationError::Busy(format!(
                    "Could not lock session {} within {}ms",
                    session_id,
                    self.lock_wait.as_millis()
                ))
            })
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(21_600), Duration::from_secs(5))
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_or_get(
        &self,
        session_id: &str,
        patient_id: Uuid,
        appointment_id: Uuid,
    ) -> Result<ConsultationSession, ConsultationError> {
        let _guard = self.acquire(session_id).await?;

        let mut entries = self.entries.write().await;
        let now = Instant::now();

        match entries.get(session_id) {
            Some(entry) if entry.expires_at > now => {
                let existing = &entry.session;
                if existing.patient_id != patient_id || existing.appointment_id != appointment_id
                {
                    return Err(ConsultationError::Conflict(format!(
                        "Session {} belongs to a different appointment",
                        session_id
                    )));
                }
                Ok(existing.clone())
            }
            _ => {
                let session = ConsultationSession::new(
                    session_id.to_string(),
                    patient_id,
                    appointment_id,
                );
                entries.insert(
                    session_id.to_string(),
                    MemoryEntry {
                        session: session.clone(),
                        expires_at: now + self.session_ttl,
                    },
                );
                Ok(session)
            }
        }
    }

    async fn read(&self, session_id: &str) -> Result<ConsultationSession, ConsultationError> {
        let entries = self.entries.read().await;
        match entries.get(session_id) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(entry.session.clone()),
            _ => Err(ConsultationError::NotFound(session_id.to_string())),
        }
    }

    async fn mutate(
        &self,
        session_id: &str,
        mutation: SessionMutation,
    ) -> Result<ConsultationSession, ConsultationError> {
        let _guard = self.acquire(session_id).await?;

        let mut entries = self.entries.write().await;
        let now = Instant::now();

        let entry = match entries.get_mut(session_id) {
            Some(entry) if entry.expires_at > now => entry,
            _ => return Err(ConsultationError::NotFound(session_id.to_string())),
        };

        mutation(&mut entry.session);
        entry.session.version += 1;
        entry.session.updated_at = Utc::now();
        entry.expires_at = now + self.session_ttl;

        Ok(entry.session.clone())
    }

    async fn append_reply_buffer(
        &self,
        session_id: &str,
        chunk: &str,
    ) -> Result<(), ConsultationError> {
        let mut buffers = self.buffers.write().await;
        buffers
            .entry(session_id.to_string())
            .or_default()
            .push_str(chunk);
        Ok(())
    }

    async fn take_reply_buffer(&self, session_id: &str) -> Result<String, ConsultationError> {
        let mut buffers = self.buffers.write().await;
        Ok(buffers.remove(session_id).unwrap_or_default())
    }
}
