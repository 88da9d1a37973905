use std::time::Duration;

/// Configuration for [`HttpBackend`](super::HttpBackend).
#[derive(Clone, Debug)]
pub struct HttpBackendConfig {
    /// Base URL of the planning API, without the `/api` suffix.
    pub base_url: String,
    /// Timeout for snapshot, artifact and file requests.
    ///
    /// Only the connect phase of the push channel is bounded by it.
    pub timeout: Duration,
}

impl Default for HttpBackendConfig {
    fn default() -> Self {
        Self::new("http://localhost:8080")
    }
}

impl HttpBackendConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Builds a config from `PLAN_SYNC_BASE_URL`, falling back to localhost.
    pub fn from_env() -> Self {
        match std::env::var("PLAN_SYNC_BASE_URL") {
            Ok(url) if !url.trim().is_empty() => Self::new(url.trim()),
            _ => Self::default(),
        }
    }

    /// Overrides the base URL (for proxies or test servers).
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Overrides the request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}
