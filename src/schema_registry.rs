use async_trait::async_trait;
use futures::future::join_all;
use indexmap::IndexMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::graphql_client::GraphQLClient;
use crate::schema::IdField;
use crate::schema_merger;
use crate::{FederatedSchema, Service, ServiceConfig, ServiceMap};

#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    async fn register_service(&self, service: ServiceConfig) -> Result<()>;

    /// Refreshes every service schema and installs a new merged snapshot
    /// when something changed (always when `force`). Returns whether a new
    /// snapshot was installed.
    async fn update_schema(&self, force: bool) -> Result<bool>;

    async fn get_schema(&self) -> Result<Arc<FederatedSchema>>;
}

/// Keeps the merged schema as an `Arc` snapshot that readers clone once per
/// request and updates replace wholesale.
pub struct InMemorySchemaRegistry {
    client: Option<GraphQLClient>,
    configs: RwLock<IndexMap<String, ServiceConfig>>,
    services: RwLock<ServiceMap>,
    federated_schema: RwLock<Option<Arc<FederatedSchema>>>,
    id_field: IdField,
}

impl InMemorySchemaRegistry {
    /// Registry whose services without a local schema are polled with `client`
    pub fn new(client: GraphQLClient) -> Self {
        InMemorySchemaRegistry {
            client: Some(client),
            ..Self::local()
        }
    }

    /// Registry that only accepts services with a local schema
    pub fn local() -> Self {
        InMemorySchemaRegistry {
            client: None,
            configs: RwLock::new(IndexMap::new()),
            services: RwLock::new(IndexMap::new()),
            federated_schema: RwLock::new(None),
            id_field: IdField::default(),
        }
    }

    /// Identifies boundary types by `id_field` instead of `id: ID!`
    pub fn with_id_field(mut self, id_field: IdField) -> Self {
        self.id_field = id_field;
        self
    }

    async fn load_service(&self, config: &ServiceConfig) -> Result<Service> {
        if let Some(sdl) = &config.schema {
            return Service::with_id_field(&config.name, &config.url, sdl, &self.id_field);
        }
        let Some(client) = &self.client else {
            return Err(Error::Config(format!(
                "service {} has no schema and the registry cannot poll",
                config.name
            )));
        };
        let info = client.fetch_service(&config.url).await?;
        // Services listed only by URL take the name they report
        let name = if config.name == config.url {
            info.name.as_str()
        } else {
            config.name.as_str()
        };
        Ok(Service::with_id_field(name, &config.url, info.schema, &self.id_field)?
            .with_version(info.version))
    }
}

fn unchanged(current: &ServiceMap, next: &ServiceMap) -> bool {
    current.len() == next.len()
        && next.iter().all(|(name, service)| {
            current.get(name).is_some_and(|old| {
                old.url == service.url && old.version == service.version && old.sdl == service.sdl
            })
        })
}

#[async_trait]
impl SchemaRegistry for InMemorySchemaRegistry {
    async fn register_service(&self, service: ServiceConfig) -> Result<()> {
        debug!(service = %service.name, url = %service.url, "registering service");
        let mut configs = self.configs.write().await;
        configs.insert(service.name.clone(), service);
        Ok(())
    }

    async fn update_schema(&self, force: bool) -> Result<bool> {
        let configs: Vec<ServiceConfig> = self.configs.read().await.values().cloned().collect();

        let loaded = join_all(configs.iter().map(|config| self.load_service(config))).await;
        let mut next = ServiceMap::new();
        for (config, result) in configs.iter().zip(loaded) {
            match result {
                Ok(service) => {
                    next.insert(service.name.clone(), service);
                }
                Err(e) => {
                    warn!(service = %config.name, url = %config.url, error = %e, "unable to load service schema");
                }
            }
        }

        let has_schema = self.federated_schema.read().await.is_some();
        if !force && has_schema && unchanged(&*self.services.read().await, &next) {
            debug!("service schemas unchanged");
            return Ok(false);
        }

        let merged = match schema_merger::merge_with(next.clone(), &self.id_field) {
            Ok(merged) => merged,
            Err(e) => {
                error!(error = %e, "schema merge failed, keeping previous schema");
                return Err(e);
            }
        };

        info!(
            services = next.len(),
            types = merged.schema.types.len(),
            "installed merged schema"
        );
        *self.services.write().await = next;
        *self.federated_schema.write().await = Some(Arc::new(merged));
        Ok(true)
    }

    async fn get_schema(&self) -> Result<Arc<FederatedSchema>> {
        if let Some(schema) = &*self.federated_schema.read().await {
            return Ok(Arc::clone(schema));
        }

        self.update_schema(true).await?;
        self.federated_schema
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::SchemaUnavailable("no services could be loaded".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn local(name: &str, sdl: &str) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            url: format!("http://{name}/query"),
            schema: Some(sdl.to_string()),
        }
    }

    #[tokio::test]
    async fn test_get_schema_merges_registered_services() {
        let registry = InMemorySchemaRegistry::local();
        registry
            .register_service(local("a", "type Query { a: String }"))
            .await
            .unwrap();
        registry
            .register_service(local("b", "type Query { b: Int }"))
            .await
            .unwrap();

        let schema = registry.get_schema().await.unwrap();
        assert_eq!(schema.owners("Query", "a"), ["a".to_string()]);
        assert_eq!(schema.owners("Query", "b"), ["b".to_string()]);
        assert!(schema.schema.get_type("__Schema").is_some());

        let again = registry.get_schema().await.unwrap();
        assert!(Arc::ptr_eq(&schema, &again));
    }

    #[tokio::test]
    async fn test_update_without_changes_keeps_snapshot() {
        let registry = InMemorySchemaRegistry::local();
        registry
            .register_service(local("a", "type Query { a: String }"))
            .await
            .unwrap();
        assert!(registry.update_schema(false).await.unwrap());
        assert!(!registry.update_schema(false).await.unwrap());
        assert!(registry.update_schema(true).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_merge_keeps_previous_schema() {
        let registry = InMemorySchemaRegistry::local();
        registry
            .register_service(local("a", "type Query { a: String }"))
            .await
            .unwrap();
        let before = registry.get_schema().await.unwrap();

        registry
            .register_service(local("b", "type Query { a: Int }"))
            .await
            .unwrap();
        assert!(matches!(registry.update_schema(false).await, Err(Error::Merge(_))));

        let after = registry.get_schema().await.unwrap();
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[tokio::test]
    async fn test_configured_id_field_applies_to_every_service() {
        let sdl = "type Movie @boundary { uuid: String! } type Query { movie(uuid: String!): Movie }";
        let registry = InMemorySchemaRegistry::local();
        registry.register_service(local("a", sdl)).await.unwrap();
        assert!(registry.get_schema().await.is_err());

        let registry = InMemorySchemaRegistry::local().with_id_field(IdField::new("uuid", "String!"));
        registry.register_service(local("a", sdl)).await.unwrap();
        let schema = registry.get_schema().await.unwrap();
        assert_eq!(schema.id_field.name, "uuid");
        assert_eq!(schema.boundary_query("a", "Movie").unwrap().field, "movie");
    }

    #[tokio::test]
    async fn test_polls_remote_services_and_drops_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "service": {
                    "name": "remote",
                    "version": "2.1",
                    "schema": "type Query { remote: String }"
                } }
            })))
            .mount(&server)
            .await;

        let client = GraphQLClient::new(Duration::from_secs(1), 1 << 20).unwrap();
        let registry = InMemorySchemaRegistry::new(client);
        registry
            .register_service(ServiceConfig {
                name: server.uri(),
                url: server.uri(),
                schema: None,
            })
            .await
            .unwrap();
        registry
            .register_service(ServiceConfig {
                name: "down".to_string(),
                url: "http://127.0.0.1:1/query".to_string(),
                schema: None,
            })
            .await
            .unwrap();

        let schema = registry.get_schema().await.unwrap();
        assert_eq!(schema.services.len(), 1);
        assert_eq!(schema.services["remote"].version, "2.1");
        assert_eq!(schema.owners("Query", "remote"), ["remote".to_string()]);
    }
}
