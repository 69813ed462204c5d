//! Process configuration, loaded once from the environment (plus an optional
//! `.env` file via [`dotenvy`]) and cached for the lifetime of the process.
//!
//! Only `DATABASE_URL` is hard-required; everything else either carries a
//! sensible default or is an optional capability that fails at the point of
//! use (e.g. the partner webhook token).

use std::collections::HashMap;
use std::sync::LazyLock;

use thiserror::Error;
use tokio::sync::OnceCell;

static ENV_VARS: LazyLock<OnceCell<Env>> = LazyLock::new(OnceCell::new);

pub async fn get_var(var: Var) -> EnvResult<&'static str> {
    let vars = ENV_VARS.get_or_try_init(|| async { Env::new() }).await?;
    match var {
        Var::DatabaseUrl => Ok(&vars.database_url),
        Var::ServerApiPort => Ok(&vars.server_api_port),
        Var::CorsAllowOrigins => Ok(&vars.cors_allow_origins),
        Var::ClinicUtcOffsetMinutes => Ok(&vars.clinic_utc_offset_minutes),
        Var::ApiServiceName => Ok(&vars.api_service_name),
        Var::ApiTracerName => Ok(&vars.api_tracer_name),
        Var::WebhookPostToken => vars
            .webhook_post_token
            .as_deref()
            .ok_or_else(|| EnvErr::MissingValue("WEBHOOK_POST_TOKEN".into())),
        Var::OtelExporterEndpoint => vars
            .otel_exporter_otlp_endpoint
            .as_deref()
            .ok_or_else(|| EnvErr::MissingValue("OTEL_EXPORTER_OTLP_ENDPOINT".into())),
    }
}

#[derive(Debug, Clone)]
pub struct Env {
    pub database_url: String,
    pub server_api_port: String,
    pub cors_allow_origins: String,
    pub clinic_utc_offset_minutes: String,
    pub webhook_post_token: Option<String>,
    pub otel_exporter_otlp_endpoint: Option<String>,
    pub api_service_name: String,
    pub api_tracer_name: String,
}

impl Env {
    pub fn new() -> EnvResult<Self> {
        let vars: HashMap<String, String> = dotenvy::vars().collect();

        Ok(Self {
            database_url: required(&vars, "DATABASE_URL")?,
            server_api_port: defaulted(&vars, "SERVER_API_PORT", "3000"),
            cors_allow_origins: defaulted(&vars, "CORS_ALLOW_ORIGINS", "*"),
            clinic_utc_offset_minutes: defaulted(&vars, "CLINIC_UTC_OFFSET_MINUTES", "0"),
            webhook_post_token: optional(&vars, "WEBHOOK_POST_TOKEN"),
            otel_exporter_otlp_endpoint: optional(&vars, "OTEL_EXPORTER_OTLP_ENDPOINT"),
            api_service_name: defaulted(&vars, "API_SERVICE_NAME", "clinic-rewards-api"),
            api_tracer_name: defaulted(&vars, "API_TRACER_NAME", "clinic-rewards-tracer"),
        })
    }
}

fn required(vars: &HashMap<String, String>, key: &str) -> EnvResult<String> {
    optional(vars, key).ok_or_else(|| EnvErr::MissingValue(key.into()))
}

fn defaulted(vars: &HashMap<String, String>, key: &str, default: &str) -> String {
    optional(vars, key).unwrap_or_else(|| default.to_string())
}

fn optional(vars: &HashMap<String, String>, key: &str) -> Option<String> {
    vars.get(key).filter(|v| !v.is_empty()).cloned()
}

#[derive(Debug)]
pub enum Var {
    DatabaseUrl,
    ServerApiPort,
    CorsAllowOrigins,
    ClinicUtcOffsetMinutes,
    WebhookPostToken,
    OtelExporterEndpoint,
    ApiServiceName,
    ApiTracerName,
}

#[macro_export]
macro_rules! var {
    ($ev:expr) => {
        $crate::util::env::get_var($ev)
    };
}

pub type EnvResult<T> = core::result::Result<T, EnvErr>;

#[derive(Debug, Error)]
pub enum EnvErr {
    #[error("missing required environment variable '{0}'")]
    MissingValue(String),

    #[error("invalid value for environment variable '{0}': {1}")]
    InvalidValue(String, String),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults_apply_when_unset() {
        let vars = HashMap::from([("DATABASE_URL".to_string(), "postgres://x".to_string())]);

        assert_eq!(defaulted(&vars, "SERVER_API_PORT", "3000"), "3000");
        assert_eq!(required(&vars, "DATABASE_URL").unwrap(), "postgres://x");
        assert!(optional(&vars, "WEBHOOK_POST_TOKEN").is_none());
    }

    #[test]
    fn test_empty_value_treated_as_unset() {
        let vars = HashMap::from([("WEBHOOK_POST_TOKEN".to_string(), String::new())]);
        assert!(optional(&vars, "WEBHOOK_POST_TOKEN").is_none());
    }
}
