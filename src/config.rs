//! Command-line and environment configuration.

use crate::connection::ConnectionInfo;
use crate::error::Result;
use crate::http_server::ServerOptions;
use crate::inference::InferenceConnector;
use crate::session::SessionContext;
use clap::Args;
use std::sync::Arc;
use std::time::Duration;

/// Where the inference server lives and how sessions treat it.
#[derive(Args, Debug, Clone)]
pub struct BackendArgs {
    /// LM Studio address as host:port
    #[arg(long, env = "LMSTUDIO_API_HOST", default_value = "localhost:1234", global = true)]
    pub api_host: String,

    /// Default model for new sessions
    #[arg(long, env = "LMSTUDIO_MODEL", global = true)]
    pub model: Option<String>,

    /// Seconds after which a held session lock may be stolen
    #[arg(long, env = "LMSESSION_STALE_LOCK_SECS", default_value = "120", global = true)]
    pub stale_lock_secs: u64,
}

impl BackendArgs {
    pub fn connection_info(&self) -> Result<ConnectionInfo> {
        ConnectionInfo::parse(&self.api_host, self.model.clone())
    }

    pub fn session_context(&self, connector: Arc<dyn InferenceConnector>) -> Result<SessionContext> {
        Ok(SessionContext::new(connector, self.connection_info()?)
            .with_stale_after(Duration::from_secs(self.stale_lock_secs)))
    }
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Port to listen on
    #[arg(long, env = "LMSESSION_PORT", default_value = "8080")]
    pub port: u16,

    /// Unload sessions idle for this many seconds
    #[arg(long, env = "LMSESSION_IDLE_TTL_SECS", default_value = "1800")]
    pub idle_ttl_secs: u64,

    /// Seconds between idle-session sweeps
    #[arg(long, env = "LMSESSION_REAP_INTERVAL_SECS", default_value = "60")]
    pub reap_interval_secs: u64,

    /// Allowed CORS origins, comma separated (default: any)
    #[arg(long = "cors-origin", env = "LMSESSION_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Vec<String>,
}

impl ServeArgs {
    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            idle_ttl: Duration::from_secs(self.idle_ttl_secs),
            reap_interval: Duration::from_secs(self.reap_interval_secs.max(1)),
            cors_origins: self
                .cors_origins
                .iter()
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedConnector;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        backend: BackendArgs,
        #[command(flatten)]
        serve: ServeArgs,
    }

    #[test]
    fn flags_build_connection_and_options() {
        let cli = TestCli::parse_from([
            "lmsession",
            "--api-host",
            "192.168.0.28:1234",
            "--model",
            "m1",
            "--stale-lock-secs",
            "30",
            "--cors-origin",
            "http://localhost:3000, http://example.com",
        ]);
        let info = cli.backend.connection_info().unwrap();
        assert_eq!(info.api_url(), "192.168.0.28:1234");
        assert_eq!(info.model_key(), Some("m1"));

        let context = cli
            .backend
            .session_context(Arc::new(ScriptedConnector::new(["m1"])))
            .unwrap();
        assert_eq!(context.stale_after, Duration::from_secs(30));

        let options = cli.serve.server_options();
        assert_eq!(
            options.cors_origins,
            vec!["http://localhost:3000", "http://example.com"]
        );
        assert_eq!(options.idle_ttl, Duration::from_secs(1800));
    }

    #[test]
    fn bad_api_host_is_rejected() {
        let cli = TestCli::parse_from(["lmsession", "--api-host", "no-port"]);
        assert!(cli.backend.connection_info().is_err());
    }
}
