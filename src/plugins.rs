//! Request plugins
//!
//! Plugins run in configuration order around every request: `on_request`
//! may reject the request or enrich its [`RequestContext`], `on_response`
//! may add response headers.

use async_trait::async_trait;
use http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE, AUTHORIZATION, HeaderMap, HeaderName,
    HeaderValue, ORIGIN, VARY,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::PluginConfig;
use crate::error::{Error, Result};
use crate::federation_gateway::DebugOptions;
use crate::permissions::OperationPermissions;

/// State of a single inbound request
#[derive(Debug, Default)]
pub struct RequestContext {
    /// Inbound request headers
    pub headers: HeaderMap,
    /// Headers added to every service request
    pub outgoing_headers: HeaderMap,
    /// Allow-list for this request, `None` allows everything
    pub permissions: Option<OperationPermissions>,
    pub debug: DebugOptions,
    pub cancellation: CancellationToken,
}

impl RequestContext {
    pub fn new(headers: HeaderMap) -> Self {
        let debug = DebugOptions::from_headers(&headers);
        RequestContext {
            headers,
            debug,
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_request(&self, _ctx: &mut RequestContext) -> Result<()> {
        Ok(())
    }

    fn on_response(&self, _request: &HeaderMap, _preflight: bool, _response: &mut HeaderMap) {}
}

pub type BoxPlugin = Box<dyn Plugin>;

/// Instantiates the configured plugins in order
pub fn build_plugins(configs: &[PluginConfig]) -> Result<Vec<BoxPlugin>> {
    configs
        .iter()
        .map(|config| {
            let plugin: BoxPlugin = match config.name.as_str() {
                CorsPlugin::NAME => Box::new(CorsPlugin::new(parse_config(config)?)),
                AuthForwardPlugin::NAME => Box::new(AuthForwardPlugin::new(parse_config(config)?)),
                PermissionsPlugin::NAME => Box::new(PermissionsPlugin::new(parse_config(config)?)),
                other => return Err(Error::Config(format!("unknown plugin \"{other}\""))),
            };
            debug!(plugin = plugin.name(), "plugin enabled");
            Ok(plugin)
        })
        .collect()
}

fn parse_config<T: for<'de> Deserialize<'de> + Default>(config: &PluginConfig) -> Result<T> {
    if config.config.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(config.config.clone())
        .map_err(|e| Error::Config(format!("invalid configuration for plugin {}: {e}", config.name)))
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CorsConfig {
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default)]
    pub allowed_headers: Vec<String>,
    #[serde(default)]
    pub allow_credentials: bool,
    #[serde(default)]
    pub max_age: Option<u64>,
}

/// Adds CORS headers and answers preflight requests
#[derive(Debug, Clone)]
pub struct CorsPlugin {
    config: CorsConfig,
}

impl CorsPlugin {
    pub const NAME: &'static str = "cors";

    pub fn new(config: CorsConfig) -> Self {
        CorsPlugin { config }
    }

    fn allowed_origin(&self, origin: &str) -> Option<HeaderValue> {
        let allows_any = self.config.allowed_origins.iter().any(|o| o == "*");
        if allows_any && !self.config.allow_credentials {
            return Some(HeaderValue::from_static("*"));
        }
        if allows_any || self.config.allowed_origins.iter().any(|o| o == origin) {
            return HeaderValue::from_str(origin).ok();
        }
        None
    }
}

#[async_trait]
impl Plugin for CorsPlugin {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_response(&self, request: &HeaderMap, preflight: bool, response: &mut HeaderMap) {
        let Some(origin) = request.get(ORIGIN).and_then(|o| o.to_str().ok()) else {
            return;
        };
        let Some(allowed) = self.allowed_origin(origin) else {
            debug!(origin, "origin not allowed");
            return;
        };
        response.insert(ACCESS_CONTROL_ALLOW_ORIGIN, allowed);
        response.append(VARY, HeaderValue::from_static("Origin"));
        if self.config.allow_credentials {
            response.insert(ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
        }
        if preflight {
            response.insert(
                ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static("GET, POST, OPTIONS"),
            );
            let headers = if self.config.allowed_headers.is_empty() {
                "Content-Type, Authorization".to_string()
            } else {
                self.config.allowed_headers.join(", ")
            };
            if let Ok(headers) = HeaderValue::from_str(&headers) {
                response.insert(ACCESS_CONTROL_ALLOW_HEADERS, headers);
            }
            if let Some(max_age) = self.config.max_age {
                response.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from(max_age));
            }
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AuthForwardConfig {
    /// Expected length of the bearer token, unchecked when absent
    #[serde(default)]
    pub token_length: Option<usize>,
}

/// Forwards the `Authorization` header to services
#[derive(Debug, Clone)]
pub struct AuthForwardPlugin {
    config: AuthForwardConfig,
}

impl AuthForwardPlugin {
    pub const NAME: &'static str = "auth-forward";

    pub fn new(config: AuthForwardConfig) -> Self {
        AuthForwardPlugin { config }
    }
}

#[async_trait]
impl Plugin for AuthForwardPlugin {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> Result<()> {
        let Some(value) = ctx.headers.get(AUTHORIZATION).cloned() else {
            return Ok(());
        };
        let token = value
            .to_str()
            .ok()
            .and_then(|header| header.strip_prefix("Bearer "))
            .ok_or_else(|| Error::Unauthorized("malformed authorization header".to_string()))?;
        if let Some(expected) = self.config.token_length {
            if token.len() != expected {
                warn!(length = token.len(), expected, "rejected bearer token");
                return Err(Error::Unauthorized("invalid authorization token".to_string()));
            }
        }
        ctx.outgoing_headers.insert(AUTHORIZATION, value);
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PermissionsConfig {
    #[serde(default = "default_permissions_header")]
    pub header: String,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        PermissionsConfig {
            header: default_permissions_header(),
        }
    }
}

fn default_permissions_header() -> String {
    "x-permissions".to_string()
}

/// Reads the request's allow-list from a JSON header
#[derive(Debug, Clone)]
pub struct PermissionsPlugin {
    header: HeaderName,
}

impl PermissionsPlugin {
    pub const NAME: &'static str = "permissions";

    pub fn new(config: PermissionsConfig) -> Self {
        let header = HeaderName::from_bytes(config.header.to_ascii_lowercase().as_bytes())
            .unwrap_or(HeaderName::from_static("x-permissions"));
        PermissionsPlugin { header }
    }
}

#[async_trait]
impl Plugin for PermissionsPlugin {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> Result<()> {
        let permissions = match ctx.headers.get(&self.header) {
            Some(value) => serde_json::from_slice::<OperationPermissions>(value.as_bytes())
                .map_err(|e| Error::Unauthorized(format!("invalid permissions: {e}")))?,
            None => OperationPermissions::allow_all(),
        };
        ctx.permissions = Some(permissions);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::AllowedFields;
    use serde_json::json;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_build_plugins_in_order() {
        let configs = vec![
            PluginConfig { name: "permissions".to_string(), config: json!(null) },
            PluginConfig { name: "cors".to_string(), config: json!({ "allowed-origins": ["*"] }) },
        ];
        let plugins = build_plugins(&configs).unwrap();
        let names: Vec<_> = plugins.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["permissions", "cors"]);

        let unknown = vec![PluginConfig { name: "nope".to_string(), config: json!(null) }];
        assert!(matches!(build_plugins(&unknown), Err(Error::Config(_))));
    }

    #[test]
    fn test_cors_preflight_headers() {
        let plugin = CorsPlugin::new(CorsConfig {
            allowed_origins: vec!["https://app.example".to_string()],
            allowed_headers: vec!["Content-Type".to_string()],
            allow_credentials: true,
            max_age: Some(600),
        });
        let mut response = HeaderMap::new();
        plugin.on_response(&headers(&[("origin", "https://app.example")]), true, &mut response);

        assert_eq!(response[ACCESS_CONTROL_ALLOW_ORIGIN], "https://app.example");
        assert_eq!(response[ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
        assert_eq!(response[ACCESS_CONTROL_ALLOW_HEADERS], "Content-Type");
        assert_eq!(response[ACCESS_CONTROL_MAX_AGE], "600");

        let mut rejected = HeaderMap::new();
        plugin.on_response(&headers(&[("origin", "https://evil.example")]), false, &mut rejected);
        assert!(rejected.is_empty());
    }

    #[tokio::test]
    async fn test_auth_forward() {
        let plugin = AuthForwardPlugin::new(AuthForwardConfig { token_length: Some(4) });

        let mut ctx = RequestContext::new(headers(&[("authorization", "Bearer abcd")]));
        plugin.on_request(&mut ctx).await.unwrap();
        assert_eq!(ctx.outgoing_headers[AUTHORIZATION], "Bearer abcd");

        let mut ctx = RequestContext::new(headers(&[("authorization", "Bearer abc")]));
        assert!(matches!(plugin.on_request(&mut ctx).await, Err(Error::Unauthorized(_))));

        let mut ctx = RequestContext::new(HeaderMap::new());
        plugin.on_request(&mut ctx).await.unwrap();
        assert!(ctx.outgoing_headers.is_empty());
    }

    #[tokio::test]
    async fn test_permissions_from_header() {
        let plugin = PermissionsPlugin::new(PermissionsConfig::default());

        let mut ctx = RequestContext::new(headers(&[("x-permissions", r#"{"query": ["movies.id"]}"#)]));
        plugin.on_request(&mut ctx).await.unwrap();
        let permissions = ctx.permissions.unwrap();
        assert!(permissions.query.is_allowed("movies"));
        assert_eq!(permissions.mutation, AllowedFields::default());

        let mut ctx = RequestContext::new(HeaderMap::new());
        plugin.on_request(&mut ctx).await.unwrap();
        assert_eq!(ctx.permissions, Some(OperationPermissions::allow_all()));
    }
}
