//! Inference-server endpoint descriptor.

use crate::error::{Result, SessionError};
use serde::Serialize;
use std::fmt;

/// Immutable host/port/model triple for one inference server.
///
/// Changing the endpoint means building a new value; there are no setters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    host: String,
    port: String,
    model_key: Option<String>,
}

impl ConnectionInfo {
    pub fn new(
        host: impl Into<String>,
        port: impl Into<String>,
        model_key: Option<String>,
    ) -> Result<Self> {
        let host = host.into();
        let port = port.into();
        if host.trim().is_empty() {
            return Err(SessionError::InvalidConnection("host is empty".into()));
        }
        if port.trim().is_empty() {
            return Err(SessionError::InvalidConnection("port is empty".into()));
        }
        Ok(Self {
            host,
            port,
            model_key: model_key.filter(|m| !m.trim().is_empty()),
        })
    }

    /// Parse `host:port`, optionally prefixed with `http://` or `https://`.
    pub fn parse(api_host: &str, model_key: Option<String>) -> Result<Self> {
        let (scheme, rest) = match api_host.split_once("://") {
            Some((scheme, rest)) => (Some(scheme), rest),
            None => (None, api_host),
        };
        let rest = rest.trim_end_matches('/');
        let (host, port) = rest.rsplit_once(':').ok_or_else(|| {
            SessionError::InvalidConnection(format!("expected host:port, got '{}'", api_host))
        })?;
        let host = match scheme {
            Some(scheme) => format!("{}://{}", scheme, host),
            None => host.to_string(),
        };
        Self::new(host, port, model_key)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    /// Default model for new sessions, if one was configured.
    pub fn model_key(&self) -> Option<&str> {
        self.model_key.as_deref()
    }

    pub fn api_url(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns a copy pointing at a different default model.
    pub fn with_model(&self, model_key: Option<String>) -> Self {
        Self {
            host: self.host.clone(),
            port: self.port.clone(),
            model_key,
        }
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.model_key {
            Some(model) => write!(f, "{} ({})", self.api_url(), model),
            None => write!(f, "{} (no model)", self.api_url()),
        }
    }
}
