use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;
use crate::normalizer::BackendKind;

pub const DEFAULT_MANIFEST_PATH: &str = "mcp_servers/mcp_config.json";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Http,
    Websocket,
    Stdio,
}

/// How messages are delimited on a stdio backend's pipes. Incoming frames
/// are accepted in either form; this only selects what we write.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StdioFraming {
    #[default]
    Newline,
    ContentLength,
}

/// One backend entry as written in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: Option<BackendKind>,
    #[serde(default)]
    pub transport: Option<TransportKind>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: IndexMap<String, String>,
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub framing: StdioFraming,
}

fn default_enabled() -> bool {
    true
}

impl BackendConfig {
    pub fn stdio(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            kind: None,
            transport: Some(TransportKind::Stdio),
            endpoint: None,
            command: Some(command.into()),
            args,
            env: IndexMap::new(),
            headers: IndexMap::new(),
            timeout_ms: None,
            enabled: true,
            framing: StdioFraming::default(),
        }
    }

    pub fn remote(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: None,
            transport: None,
            endpoint: Some(endpoint.into()),
            command: None,
            args: Vec::new(),
            env: IndexMap::new(),
            headers: IndexMap::new(),
            timeout_ms: None,
            enabled: true,
            framing: StdioFraming::default(),
        }
    }

    /// Checks the entry and fills in everything that can be inferred.
    pub fn resolve(&self) -> Result<ResolvedBackend, GatewayError> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(GatewayError::config("<unnamed>", "backend name is empty"));
        }

        let endpoint = self
            .endpoint
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty());
        let command = self
            .command
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty());

        let transport = match self.transport {
            Some(kind) => kind,
            None if command.is_some() => TransportKind::Stdio,
            None => match endpoint {
                Some(url) if url.starts_with("ws://") || url.starts_with("wss://") => {
                    TransportKind::Websocket
                }
                Some(_) => TransportKind::Http,
                None => {
                    return Err(GatewayError::config(
                        name,
                        "either `command` or `endpoint` is required",
                    ))
                }
            },
        };

        let connection = match transport {
            TransportKind::Http | TransportKind::Websocket => {
                let endpoint = endpoint.ok_or_else(|| {
                    GatewayError::config(name, format!("transport={transport:?} requires `endpoint`"))
                })?;
                let valid_scheme = match transport {
                    TransportKind::Http => {
                        endpoint.starts_with("http://") || endpoint.starts_with("https://")
                    }
                    _ => endpoint.starts_with("ws://") || endpoint.starts_with("wss://"),
                };
                if !valid_scheme {
                    return Err(GatewayError::config(
                        name,
                        format!("endpoint `{endpoint}` does not match transport={transport:?}"),
                    ));
                }
                let headers = expand_values(&self.headers);
                if transport == TransportKind::Http {
                    Connection::Http {
                        endpoint: endpoint.to_string(),
                        headers,
                    }
                } else {
                    Connection::Websocket {
                        endpoint: endpoint.to_string(),
                        headers,
                    }
                }
            }
            TransportKind::Stdio => {
                let command = command
                    .or(endpoint)
                    .ok_or_else(|| GatewayError::config(name, "transport=stdio requires `command`"))?;
                Connection::Stdio {
                    command: command.to_string(),
                    args: self.args.clone(),
                    env: expand_values(&self.env),
                    framing: self.framing,
                }
            }
        };

        if self.timeout_ms == Some(0) {
            return Err(GatewayError::config(name, "`timeoutMs` must be positive"));
        }

        Ok(ResolvedBackend {
            name: name.to_string(),
            kind: self.kind.unwrap_or_else(|| BackendKind::infer(name)),
            enabled: self.enabled,
            timeout: self.timeout_ms.map(Duration::from_millis),
            connection,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Connection {
    Http {
        endpoint: String,
        headers: IndexMap<String, String>,
    },
    Websocket {
        endpoint: String,
        headers: IndexMap<String, String>,
    },
    Stdio {
        command: String,
        args: Vec<String>,
        env: IndexMap<String, String>,
        framing: StdioFraming,
    },
}

#[derive(Debug, Clone)]
pub struct ResolvedBackend {
    pub name: String,
    pub kind: BackendKind,
    pub enabled: bool,
    /// Per-backend ceiling applied to discovery requests.
    pub timeout: Option<Duration>,
    pub connection: Connection,
}

/// The backend manifest: `{"mcpServers": {"<name>": {...}}}`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendManifest {
    #[serde(default, alias = "servers")]
    pub mcp_servers: IndexMap<String, Value>,
}

impl BackendManifest {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading backend manifest {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("parsing backend manifest {}", path.display()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Decodes each entry on its own so one bad entry does not hide the rest.
    pub fn entries(&self) -> Vec<(String, std::result::Result<BackendConfig, GatewayError>)> {
        self.mcp_servers
            .iter()
            .map(|(name, raw)| {
                let parsed = serde_json::from_value::<BackendConfig>(raw.clone())
                    .map(|mut config| {
                        config.name = name.clone();
                        config
                    })
                    .map_err(|err| GatewayError::config(name.clone(), err.to_string()));
                (name.clone(), parsed)
            })
            .collect()
    }
}

/// Replaces `${VAR}` references with values from the process environment.
fn expand_values(values: &IndexMap<String, String>) -> IndexMap<String, String> {
    values
        .iter()
        .map(|(key, value)| (key.clone(), expand_env(value)))
        .collect()
}

fn expand_env(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let var = &after[..end];
                out.push_str(&std::env::var(var).unwrap_or_default());
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
