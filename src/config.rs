use anyhow::{bail, Context, Result};
use tracing::Level;

/// Connection parameters for one side of the bridge, fully resolved.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub transport: TransportKind,
    pub tls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Websocket,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub source: EndpointConfig,
    pub remote: EndpointConfig,
    /// Topic filters mirrored in both directions. Empty list leaves the
    /// bridge connected but idle.
    pub topics: Vec<String>,
    pub log_level: Level,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve the full configuration through `lookup`. Kept separate from
    /// the process environment so tests can feed arbitrary variable sets.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let source = EndpointConfig::resolve("MQTT_SOURCE", &lookup)?;
        let remote = EndpointConfig::resolve("MQTT_REMOTE", &lookup)?;

        let topics = lookup("MQTT_TOPICS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let log_level = match lookup("LOG_LEVEL") {
            Some(raw) => raw
                .parse::<Level>()
                .with_context(|| format!("Invalid LOG_LEVEL: {}", raw))?,
            None => Level::WARN,
        };

        Ok(Self {
            source,
            remote,
            topics,
            log_level,
        })
    }
}

impl EndpointConfig {
    fn resolve<F>(prefix: &str, lookup: &F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| lookup(&format!("{}_{}", prefix, suffix));

        let host = var("HOST").with_context(|| format!("{}_HOST must be set", prefix))?;

        let port = match var("PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("Invalid {}_PORT: {}", prefix, raw))?,
            None => 1883,
        };

        let client_id = var("CLIENT_ID")
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| generated_client_id(prefix));

        let transport = match var("TRANSPORT").as_deref() {
            None | Some("tcp") => TransportKind::Tcp,
            Some("websockets") => TransportKind::Websocket,
            Some(other) => bail!(
                "Invalid {}_TRANSPORT: {} (expected 'tcp' or 'websockets')",
                prefix,
                other
            ),
        };

        let tls = match var("TLS") {
            Some(raw) => {
                parse_bool(&raw).with_context(|| format!("Invalid {}_TLS: {}", prefix, raw))?
            }
            None => false,
        };

        Ok(Self {
            host,
            port,
            client_id,
            transport,
            tls,
            username: var("USER"),
            password: var("PASSWORD"),
        })
    }
}

/// "MQTT_SOURCE" -> "mqtt-source-<uuid>"
fn generated_client_id(prefix: &str) -> String {
    format!(
        "{}-{}",
        prefix.to_ascii_lowercase().replace('_', "-"),
        uuid::Uuid::new_v4().simple()
    )
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => bail!("not a boolean"),
    }
}
