//! Environment configuration (`MYAPP_` prefix).
//!
//! Interval values accept `8s`, `30m`, `1h`, or bare seconds.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};

use foundry_host::InstructionConfig;

/// Where the service is deployed; resolved once at startup into concrete
/// object-store and leader-gate handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployTarget {
    K8s,
    OnPrem,
    Ocp,
}

impl std::str::FromStr for DeployTarget {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "k8s" => Ok(DeployTarget::K8s),
            "onprem" => Ok(DeployTarget::OnPrem),
            "ocp" => Ok(DeployTarget::Ocp),
            other => bail!("not supported deploy target {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Service configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub deploy_target: DeployTarget,
    pub data_dir: PathBuf,
    pub object_store_dir: PathBuf,
    pub cluster_monitor_interval: Duration,
    pub host_monitor_interval: Duration,
    pub image_expiration_interval: Duration,
    pub deletion_worker_interval: Duration,
    /// TTL of discovery images in the object store.
    pub image_expiration_time: Duration,
    /// Retention of soft-deleted rows before the deletion worker reaps them.
    pub deletion_retention: Duration,
    /// TTL of event records.
    pub event_retention: Duration,
    pub leader_namespace: String,
    pub log_format: LogFormat,
    pub log_level: String,
    pub enable_auth: bool,
    pub user_token: String,
    pub agent_secret: String,
    pub managed_domains: Vec<String>,
    pub service_version: String,
    /// Default release image for clusters that do not declare one.
    pub release_image: String,
    pub instructions: InstructionConfig,
}

impl Config {
    /// Read configuration from `MYAPP_*` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let data_dir = PathBuf::from(var_or("DATA_DIR", "/var/lib/foundry"));
        let object_store_dir = std::env::var(env_key("OBJECT_STORE_DIR"))
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("objects"));

        let default_images = InstructionConfig::default();
        let agent_image = var_or("AGENT_IMAGE", &default_images.inventory_image);
        let instructions = InstructionConfig {
            inventory_image: agent_image.clone(),
            connectivity_check_image: agent_image.clone(),
            free_addresses_image: agent_image.clone(),
            dhcp_lease_allocator_image: agent_image.clone(),
            api_vip_connectivity_check_image: agent_image,
            installer_image: var_or("INSTALLER_IMAGE", &default_images.installer_image),
            controller_image: var_or("CONTROLLER_IMAGE", &default_images.controller_image),
            verify_cidr: true,
        };

        Ok(Self {
            deploy_target: var_or("DEPLOY_TARGET", "k8s").parse()?,
            data_dir,
            object_store_dir,
            cluster_monitor_interval: duration_var("CLUSTER_MONITOR_INTERVAL", "10s")?,
            host_monitor_interval: duration_var("HOST_MONITOR_INTERVAL", "8s")?,
            image_expiration_interval: duration_var("IMAGE_EXPIRATION_INTERVAL", "30m")?,
            deletion_worker_interval: duration_var("DELETION_WORKER_INTERVAL", "1h")?,
            image_expiration_time: duration_var("IMAGE_EXPIRATION_TIME", "60m")?,
            deletion_retention: duration_var("DELETION_RETENTION", "72h")?,
            event_retention: duration_var("EVENT_RETENTION", "168h")?,
            leader_namespace: var_or("LEADER_NAMESPACE", "foundry"),
            log_format: match var_or("LOG_FORMAT", "text").as_str() {
                "json" => LogFormat::Json,
                _ => LogFormat::Text,
            },
            log_level: var_or("LOG_LEVEL", "info"),
            enable_auth: var_or("ENABLE_AUTH", "false") == "true",
            user_token: var_or("USER_TOKEN", ""),
            agent_secret: var_or("AGENT_SECRET", ""),
            managed_domains: var_or("MANAGED_DOMAINS", "")
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            release_image: var_or("RELEASE_IMAGE", ""),
            instructions,
        })
    }
}

fn env_key(name: &str) -> String {
    format!("MYAPP_{name}")
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(env_key(name)).unwrap_or_else(|_| default.to_string())
}

fn duration_var(name: &str, default: &str) -> anyhow::Result<Duration> {
    let raw = var_or(name, default);
    parse_duration(&raw).with_context(|| format!("invalid duration in {}: {raw}", env_key(name)))
}

/// Parse `8s` / `30m` / `1h` / bare seconds into a duration.
fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    let (value, unit) = match s.char_indices().find(|(_, c)| c.is_alphabetic()) {
        Some((idx, _)) => s.split_at(idx),
        None => (s, "s"),
    };
    let value: u64 = value.parse().context("not a number")?;
    let secs = match unit {
        "s" | "" => value,
        "m" => value * 60,
        "h" => value * 3600,
        other => bail!("unknown duration unit {other}"),
    };
    Ok(Duration::from_secs(secs))
}
