use indexmap::IndexMap;
use serde::Serialize;
use tool_gateway::{BackendHealth, ToolGateway};

use crate::registry::SessionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Overall {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub overall: Overall,
    pub backends: IndexMap<String, BackendHealth>,
    pub active_sessions: usize,
}

impl HealthSnapshot {
    pub async fn collect(gateway: &ToolGateway, registry: &SessionRegistry) -> Self {
        let backends = gateway.backend_health().await;
        let enabled = gateway.enabled_count().await;
        let connected = backends.values().filter(|b| b.connected).count();
        Self {
            overall: overall(connected, enabled),
            backends,
            active_sessions: registry.active_sessions(),
        }
    }
}

fn overall(connected: usize, enabled: usize) -> Overall {
    if enabled == 0 || connected == 0 {
        Overall::Unhealthy
    } else if connected >= enabled {
        Overall::Healthy
    } else {
        Overall::Degraded
    }
}
