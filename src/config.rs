use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ChatError, Result};

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_addr: String,
    pub frontend_origin: String,
    pub jwt_secret: String,
    /// Shared secret of notification producers. When unset the internal
    /// notification route refuses every caller.
    pub internal_token: Option<String>,
    /// When unset the service runs on the in-memory store and an open directory.
    pub mongo_uri: Option<String>,
    pub database_name: String,
    pub history_page_size: usize,
    pub history_max_page_size: usize,
    pub max_message_len: usize,
    pub heartbeat_interval: Duration,
    pub client_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let jwt_secret = env::var("JWT_SECRET")
            .map_err(|_| ChatError::Config("JWT_SECRET must be set".to_string()))?;

        Ok(Self {
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            frontend_origin: env::var("FRONTEND_ORIGIN")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            jwt_secret,
            internal_token: env::var("INTERNAL_API_TOKEN")
                .ok()
                .filter(|token| !token.trim().is_empty()),
            mongo_uri: env::var("MONGO_URI").ok().filter(|uri| !uri.trim().is_empty()),
            database_name: env::var("DATABASE_NAME").unwrap_or_else(|_| "chat_db".to_string()),
            history_page_size: parse_var("HISTORY_PAGE_SIZE", 50)?,
            history_max_page_size: parse_var("HISTORY_MAX_PAGE_SIZE", 200)?,
            max_message_len: parse_var("MAX_MESSAGE_LEN", 4000)?,
            heartbeat_interval: Duration::from_secs(parse_var("WS_HEARTBEAT_SECS", 5)?),
            client_timeout: Duration::from_secs(parse_var("WS_CLIENT_TIMEOUT_SECS", 30)?),
        })
    }

    /// Settings for tests and local tooling: in-memory storage, short heartbeats.
    pub fn local(jwt_secret: &str) -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            frontend_origin: "http://localhost:3000".to_string(),
            jwt_secret: jwt_secret.to_string(),
            internal_token: None,
            mongo_uri: None,
            database_name: "chat_db".to_string(),
            history_page_size: 50,
            history_max_page_size: 200,
            max_message_len: 4000,
            heartbeat_interval: Duration::from_secs(5),
            client_timeout: Duration::from_secs(30),
        }
    }

    /// Page bound for a history request, falling back to the default and clamped.
    pub fn page_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.history_page_size)
            .clamp(1, self.history_max_page_size)
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ChatError::Config(format!("{} has an invalid value: {}", name, raw))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_limit_clamps() {
        let config = Config::local("secret");
        assert_eq!(config.page_limit(None), 50);
        assert_eq!(config.page_limit(Some(0)), 1);
        assert_eq!(config.page_limit(Some(10)), 10);
        assert_eq!(config.page_limit(Some(10_000)), 200);
    }

    #[test]
    fn test_parse_var_default_and_error() {
        assert_eq!(parse_var::<usize>("TASKLINE_CHAT_UNSET_VAR", 7).unwrap(), 7);

        env::set_var("TASKLINE_CHAT_BAD_NUMBER", "twelve");
        let err = parse_var::<usize>("TASKLINE_CHAT_BAD_NUMBER", 7).unwrap_err();
        assert!(matches!(err, ChatError::Config(_)));
        env::remove_var("TASKLINE_CHAT_BAD_NUMBER");
    }
}
