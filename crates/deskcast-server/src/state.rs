use crate::media::MediaEngine;
use crate::relay::SinkRegistry;
use anyhow::Context;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub ingest_address: SocketAddr,
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<TurnServer>,
    /// Address advertised to viewers in place of locally gathered host addresses
    pub public_ip: Option<IpAddr>,
    /// Sessions still negotiating after this long are closed
    pub negotiation_timeout: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        // A missing .env file is fine, variables may come from the environment
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup (the process environment in production)
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind_address = lookup("BIND_ADDRESS")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
            .parse()
            .context("BIND_ADDRESS is not a socket address")?;

        let ingest_address = lookup("INGEST_ADDRESS")
            .unwrap_or_else(|| "0.0.0.0:5004".to_string())
            .parse()
            .context("INGEST_ADDRESS is not a socket address")?;

        let stun_servers = lookup("STUN_SERVERS")
            .map(|s| split_list(&s).map(String::from).collect())
            .unwrap_or_else(|| vec!["stun:stun.l.google.com:19302".to_string()]);

        let turn_servers = match lookup("TURN_SERVERS") {
            Some(value) => split_list(&value)
                .map(parse_turn_server)
                .collect::<anyhow::Result<Vec<_>>>()?,
            None => vec![],
        };

        let public_ip = match lookup("PUBLIC_IP") {
            Some(ip) if !ip.trim().is_empty() => Some(
                ip.trim()
                    .parse()
                    .with_context(|| format!("PUBLIC_IP is not an IP address: {}", ip))?,
            ),
            _ => {
                tracing::warn!(
                    "PUBLIC_IP not set, viewers outside this network may fail to connect"
                );
                None
            }
        };

        let negotiation_timeout = match lookup("NEGOTIATION_TIMEOUT_SECS") {
            Some(secs) => {
                let secs: u64 = secs
                    .trim()
                    .parse()
                    .context("NEGOTIATION_TIMEOUT_SECS is not a number")?;
                (secs > 0).then(|| Duration::from_secs(secs))
            }
            None => None,
        };

        Ok(Config {
            bind_address,
            ingest_address,
            stun_servers,
            turn_servers,
            public_ip,
            negotiation_timeout,
        })
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_turn_server(entry: &str) -> anyhow::Result<TurnServer> {
    let mut parts = entry.splitn(3, '|');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(url), Some(username), Some(credential)) => Ok(TurnServer {
            url: url.to_string(),
            username: username.to_string(),
            credential: credential.to_string(),
        }),
        _ => anyhow::bail!("TURN_SERVERS entry must be url|username|credential: {}", entry),
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub registry: Arc<SinkRegistry>,
    pub engine: Arc<dyn MediaEngine>,
    /// Cancelled on process shutdown; every viewer session hangs off it
    pub shutdown: CancellationToken,
    /// Running viewer sessions, waited on before the server stops
    pub sessions: TaskTracker,
}

impl AppState {
    pub fn new(config: Config, engine: Arc<dyn MediaEngine>, shutdown: CancellationToken) -> Self {
        Self {
            config,
            registry: Arc::new(SinkRegistry::new()),
            engine,
            shutdown,
            sessions: TaskTracker::new(),
        }
    }
}
