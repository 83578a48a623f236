//! Server configuration from environment variables
//!
//! `PLUGINS` — comma/semicolon separated plugin identifiers to load.
//! `PORT` — listen port (default 3000).
//! `LOG_LEVEL` — error | warn | log | debug | verbose, mapped onto tracing.
//! `CORS_ALLOW_ORIGINS` — comma separated origins, `*` for any.
//! `EXPRESS_SESSION_SECRET` — HMAC key for short-lived client secrets.

use std::collections::HashMap;

/// Typed server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub log_level: String,
    pub plugins: Vec<String>,
    pub cors_allow_origins: Vec<String>,
    pub session_secret: String,
    /// Accepted API keys; empty disables API-key auth checks
    pub api_keys: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            log_level: "log".to_string(),
            plugins: Vec::new(),
            cors_allow_origins: vec!["*".to_string()],
            session_secret: "insecure-dev-secret".to_string(),
            api_keys: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load from process environment
    pub fn from_env() -> Self {
        let env: HashMap<String, String> = std::env::vars().collect();
        Self::from_map(&env)
    }

    /// Load from an explicit map; used by tests
    pub fn from_map(env: &HashMap<String, String>) -> Self {
        let defaults = Self::default();
        Self {
            port: env
                .get("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: env
                .get("LOG_LEVEL")
                .cloned()
                .unwrap_or(defaults.log_level),
            plugins: env
                .get("PLUGINS")
                .map(|raw| split_list(raw))
                .unwrap_or_default(),
            cors_allow_origins: env
                .get("CORS_ALLOW_ORIGINS")
                .map(|raw| split_list(raw))
                .unwrap_or(defaults.cors_allow_origins),
            session_secret: env
                .get("EXPRESS_SESSION_SECRET")
                .cloned()
                .unwrap_or(defaults.session_secret),
            api_keys: env
                .get("API_KEYS")
                .map(|raw| split_list(raw))
                .unwrap_or_default(),
        }
    }

    /// Map the configured level onto a tracing filter directive
    pub fn tracing_directive(&self) -> &'static str {
        match self.log_level.as_str() {
            "error" => "error",
            "warn" => "warn",
            "debug" => "debug",
            "verbose" => "trace",
            _ => "info",
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split([',', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_map(&HashMap::new());
        assert_eq!(config.port, 3000);
        assert_eq!(config.tracing_directive(), "info");
        assert!(config.plugins.is_empty());
    }

    #[test]
    fn test_env_parsing() {
        let mut env = HashMap::new();
        env.insert("PORT".to_string(), "8080".to_string());
        env.insert("LOG_LEVEL".to_string(), "verbose".to_string());
        env.insert("PLUGINS".to_string(), "search;files, web".to_string());
        env.insert(
            "CORS_ALLOW_ORIGINS".to_string(),
            "https://a.example,https://b.example".to_string(),
        );

        let config = ServerConfig::from_map(&env);
        assert_eq!(config.port, 8080);
        assert_eq!(config.tracing_directive(), "trace");
        assert_eq!(config.plugins, vec!["search", "files", "web"]);
        assert_eq!(config.cors_allow_origins.len(), 2);
    }
}
