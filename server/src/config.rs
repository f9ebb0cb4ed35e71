//! Deployment configuration (SPEC_FULL.md §D). Same precedence rule as
//! the teacher's `parse_database_url`: a `--flag` CLI arg wins over the
//! matching environment variable, which wins over a hardcoded default.

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: Option<String>,
    pub media_service_url: String,
    pub webhook_listen_addr: String,
    pub public_base_url: Option<String>,
    pub poll_enabled: bool,
}

impl Config {
    pub fn from_env_and_args() -> Self {
        Self {
            database_url: arg_or_env("--database-url", "DATABASE_URL"),
            media_service_url: arg_or_env("--media-service-url", "MEDIA_SERVICE_URL")
                .unwrap_or_else(|| "http://localhost:4000".to_string()),
            webhook_listen_addr: arg_or_env("--webhook-listen-addr", "WEBHOOK_LISTEN_ADDR")
                .unwrap_or_else(|| "0.0.0.0:8088".to_string()),
            public_base_url: arg_or_env("--public-base-url", "PUBLIC_BASE_URL"),
            poll_enabled: arg_or_env("--poll-enabled", "POLL_ENABLED")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
        }
    }
}

fn arg_or_env(flag: &str, env_var: &str) -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    if let Some(value) = args.windows(2).find(|w| w[0] == flag).map(|w| w[1].clone()) {
        return Some(value);
    }
    std::env::var(env_var).ok()
}
