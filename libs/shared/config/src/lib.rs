use std::env;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub redis_url: Option<String>,
    pub ai_backend_url: String,
    pub ai_backend_api_key: String,
    pub ai_model: String,
    pub session_ttl_seconds: u64,
    pub lock_wait_ms: u64,
    pub lock_lease_ms: u64,
    pub channel_ttl_seconds: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            supabase_url: env::var("SUPABASE_URL")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_URL not set, using empty value");
                    String::new()
                }),
            supabase_anon_key: env::var("SUPABASE_ANON_PUBLIC_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
                    String::new()
                }),
            redis_url: env::var("REDIS_URL").ok(),
            ai_backend_url: env::var("AI_BACKEND_URL")
                .unwrap_or_else(|_| {
                    warn!("AI_BACKEND_URL not set, using empty value");
                    String::new()
                }),
            ai_backend_api_key: env::var("AI_BACKEND_API_KEY")
                .unwrap_or_else(|_| {
                    warn!("AI_BACKEND_API_KEY not set, using empty value");
                    String::new()
                }),
            ai_model: env::var("AI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            session_ttl_seconds: env_u64("SESSION_TTL_SECONDS", 21_600),
            lock_wait_ms: env_u64("SESSION_LOCK_WAIT_MS", 5_000),
            lock_lease_ms: env_u64("SESSION_LOCK_LEASE_MS", 10_000),
            channel_ttl_seconds: env_u64("CHANNEL_TTL_SECONDS", 1_800),
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.supabase_url.is_empty()
            && !self.supabase_anon_key.is_empty()
            && !self.ai_backend_url.is_empty()
    }

    pub fn is_session_store_configured(&self) -> bool {
        self.redis_url.is_some()
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    match env::var(name) {
        Ok(value) => value.parse().unwrap_or_else(|_| {
            warn!("{} is not a valid integer, using default {}", name, default);
            default
        }),
        Err(_) => default,
    }
}
