use event_bus::EventBusConfig;
use eyre::{Result, WrapErr};
use std::env;

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_HEALTH_PORT: u16 = 8083;

/// Node settings, on top of the `EVENT_BUS_*` bus settings.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub redis_url: String,
    pub health_port: u16,
    /// Group name of the audit listener, empty to disable it
    pub audit_group: Option<String>,
    pub bus: EventBusConfig,
}

impl NodeConfig {
    /// Load from the environment.
    ///
    /// `EVENT_BUS_HEALTH_PORT` wins over `HEALTH_PORT`.
    pub fn from_env() -> Result<Self> {
        let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string());

        let health_port = match env::var("EVENT_BUS_HEALTH_PORT").or_else(|_| env::var("HEALTH_PORT"))
        {
            Ok(raw) => raw
                .parse()
                .wrap_err_with(|| format!("Invalid health port '{raw}'"))?,
            Err(_) => DEFAULT_HEALTH_PORT,
        };

        let audit_group = match env::var("EVENT_BUS_AUDIT_GROUP") {
            Ok(group) if group.trim().is_empty() => None,
            Ok(group) => Some(group),
            Err(_) => Some("audit".to_string()),
        };

        let bus = EventBusConfig::from_env().wrap_err("Failed to load event bus configuration")?;

        Ok(Self {
            redis_url,
            health_port,
            audit_group,
            bus,
        })
    }
}
