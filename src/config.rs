use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::debug;

use crate::{
    ServiceConfig,
    error::{Error, Result},
    schema::{ID_FIELD, ID_FIELD_TYPE, IdField},
};

/// Whitespace separated service URLs added to the configured subgraphs
pub const SERVICE_LIST_ENV: &str = "GATEWAY_SERVICE_LIST";

pub const DEFAULT_CONFIG_PATH: &str = "./schemas/supergraph.yaml";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_address")]
    pub gateway_address: String,
    #[serde(
        default = "default_poll_interval",
        deserialize_with = "duration_str::deserialize_duration"
    )]
    pub poll_interval: Duration,
    #[serde(
        default = "default_service_timeout",
        deserialize_with = "duration_str::deserialize_duration"
    )]
    pub service_timeout: Duration,
    #[serde(default = "default_max_requests_per_query")]
    pub max_requests_per_query: usize,
    #[serde(default = "default_max_service_response_size")]
    pub max_service_response_size: usize,
    #[serde(default)]
    pub disable_introspection: bool,
    /// Field every boundary type is identified by
    #[serde(default = "default_id_field_name")]
    pub id_field_name: String,
    #[serde(default = "default_id_field_type")]
    pub id_field_type: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub subgraphs: IndexMap<String, SubgraphConfig>,
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
    /// Directory schema files are resolved against
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubgraphConfig {
    pub routing_url: String,
    #[serde(default)]
    pub schema: Option<SchemaConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchemaConfig {
    pub file: String,
}

/// A named plugin with its raw configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PluginConfig {
    pub name: String,
    #[serde(default)]
    pub config: Value,
}

fn default_gateway_address() -> String {
    "0.0.0.0:8082".to_string()
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_service_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_requests_per_query() -> usize {
    50
}

fn default_max_service_response_size() -> usize {
    1024 * 1024
}

fn default_id_field_name() -> String {
    ID_FIELD.to_string()
}

fn default_id_field_type() -> String {
    ID_FIELD_TYPE.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            gateway_address: default_gateway_address(),
            poll_interval: default_poll_interval(),
            service_timeout: default_service_timeout(),
            max_requests_per_query: default_max_requests_per_query(),
            max_service_response_size: default_max_service_response_size(),
            disable_introspection: false,
            id_field_name: default_id_field_name(),
            id_field_type: default_id_field_type(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            subgraphs: IndexMap::new(),
            plugins: Vec::new(),
            base_dir: PathBuf::new(),
        }
    }
}

impl GatewayConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        let mut config = Self::from_yaml(&contents)?;
        config.base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok(config)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: GatewayConfig = serde_yaml::from_str(contents)?;
        if config.max_requests_per_query == 0 {
            return Err(Error::Config(
                "max-requests-per-query must be greater than zero".to_string(),
            ));
        }
        if config.id_field_name.trim().is_empty() || config.id_field_type.trim().is_empty() {
            return Err(Error::Config(
                "id-field-name and id-field-type must not be empty".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn id_field(&self) -> IdField {
        IdField::new(self.id_field_name.trim(), self.id_field_type.trim())
    }

    /// Configured subgraphs plus the services listed in [`SERVICE_LIST_ENV`].
    /// Local schema files are read here.
    pub fn service_configs(&self) -> Result<Vec<ServiceConfig>> {
        let mut services = Vec::new();
        for (name, subgraph) in &self.subgraphs {
            let schema = match &subgraph.schema {
                Some(schema) => {
                    let path = self.base_dir.join(&schema.file);
                    debug!(service = %name, path = %path.display(), "reading schema file");
                    Some(fs::read_to_string(&path).map_err(|e| {
                        Error::Config(format!(
                            "failed to read schema file {} for service {name}: {e}",
                            path.display()
                        ))
                    })?)
                }
                None => None,
            };
            services.push(ServiceConfig {
                name: name.clone(),
                url: subgraph.routing_url.clone(),
                schema,
            });
        }

        if let Ok(list) = std::env::var(SERVICE_LIST_ENV) {
            for url in list.split_whitespace() {
                if services.iter().any(|service| service.url == url) {
                    continue;
                }
                services.push(ServiceConfig {
                    name: url.to_string(),
                    url: url.to_string(),
                    schema: None,
                });
            }
        }

        if services.is_empty() {
            return Err(Error::Config("no services configured".to_string()));
        }
        Ok(services)
    }
}
