//! Tabmesh Hub - Standalone broker for the tabs of one device
//!
//! The broker outlives individual tabs: it routes frames between them,
//! holds messages for briefly disconnected tabs, evicts silent ones and
//! serves the shared key/value store.

use std::future::Future;
use std::net::SocketAddr;

use clap::Parser;
use tokio::net::TcpListener;

use tabmesh_core::MeshResult;
use tabmesh_runtime::LogConfig;
use tabmesh_transport::{HubBroker, HubBrokerConfig};

/// Command line options
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "tabmesh-hub", version, about = "Per-device tabmesh hub broker")]
pub struct HubArgs {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:7420")]
    pub listen: SocketAddr,

    /// Evict tabs silent for longer than this
    #[arg(long, default_value_t = 15_000)]
    pub heartbeat_timeout_ms: u64,

    #[arg(long, default_value_t = 5_000)]
    pub sweep_interval_ms: u64,

    /// Messages held per disconnected tab
    #[arg(long, default_value_t = 256)]
    pub max_pending_per_tab: usize,

    /// Base log level (RUST_LOG overrides)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[arg(long)]
    pub json_logs: bool,
}

impl HubArgs {
    pub fn broker_config(&self) -> HubBrokerConfig {
        HubBrokerConfig {
            heartbeat_timeout_ms: self.heartbeat_timeout_ms,
            sweep_interval_ms: self.sweep_interval_ms,
            max_pending_per_tab: self.max_pending_per_tab,
        }
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig::default()
            .with_level(self.log_level.clone())
            .json(self.json_logs)
    }
}

/// Bind and serve until ctrl-c
pub async fn run(args: HubArgs) -> MeshResult<()> {
    let listener = TcpListener::bind(args.listen).await.map_err(|e| {
        tabmesh_core::MeshError::ConnectionFailed(format!("bind {}: {}", args.listen, e))
    })?;
    let broker = HubBroker::new(args.broker_config());
    serve_until(listener, broker, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("ctrl-c handler failed: {}", e);
        }
    })
    .await
}

/// Serve `listener` with `broker` until `shutdown` resolves
pub async fn serve_until(
    listener: TcpListener,
    broker: HubBroker,
    shutdown: impl Future<Output = ()>,
) -> MeshResult<()> {
    let sweeper = broker.spawn_sweeper();
    let result = tokio::select! {
        served = broker.serve(listener) => served.map_err(Into::into),
        _ = shutdown => {
            tracing::info!(tabs = broker.tabs().len(), "hub shutting down");
            Ok(())
        }
    };
    sweeper.abort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tabmesh_core::Identity;
    use tabmesh_transport::{HubConfig, HubTransport, Transport};

    #[test]
    fn test_defaults() {
        let args = HubArgs::parse_from(["tabmesh-hub"]);
        assert_eq!(args.listen, "127.0.0.1:7420".parse::<SocketAddr>().unwrap());
        assert_eq!(args.broker_config(), HubBrokerConfig::default());
        assert!(!args.json_logs);
    }

    #[test]
    fn test_flags() {
        let args = HubArgs::parse_from([
            "tabmesh-hub",
            "--listen",
            "0.0.0.0:9000",
            "--heartbeat-timeout-ms",
            "2000",
            "--log-level",
            "debug",
            "--json-logs",
        ]);
        assert_eq!(args.listen.port(), 9000);
        assert_eq!(args.broker_config().heartbeat_timeout_ms, 2_000);
        assert_eq!(args.log_config(), LogConfig::default().with_level("debug").json(true));
    }

    #[test]
    fn test_rejects_bad_address() {
        assert!(HubArgs::try_parse_from(["tabmesh-hub", "--listen", "nowhere"]).is_err());
    }

    #[tokio::test]
    async fn test_serves_tabs_until_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let broker = HubBroker::new(HubBrokerConfig::default());
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(serve_until(listener, broker.clone(), async {
            let _ = stopped.await;
        }));

        let tab = HubTransport::tcp(
            Identity::generate(),
            HubConfig::default().with_addr(addr.to_string()),
        );
        tokio::time::timeout(Duration::from_secs(5), tab.connect())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(broker.tabs().len(), 1);

        stop.send(()).unwrap();
        server.await.unwrap().unwrap();
        tab.disconnect().await;
    }
}
