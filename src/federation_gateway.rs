use http::HeaderMap;
use serde_json::{Map, Value, json};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    GatewayConfig, GraphQLRequest, ServiceConfig,
    error::{Error, Result},
    graphql_client::GraphQLClient,
    introspection::{Introspector, is_introspection_root_field},
    operation::{Operation, Selection},
    permissions::filter_operation,
    plugins::{BoxPlugin, RequestContext, build_plugins},
    query_executor::{ExecutionContext, HttpQueryExecutor, QueryExecutor},
    query_planner::{FederatedQueryPlanner, QueryPlanner},
    response::{GraphQLError, GraphQLResponse, PathSegment, ResponseAssembler},
    schema::Schema,
    schema_registry::{InMemorySchemaRegistry, SchemaRegistry},
};

pub const DEBUG_HEADER: &str = "x-graphql-debug";

/// Which debug entries to add to the response `extensions`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DebugOptions {
    pub query: bool,
    pub variables: bool,
    pub plan: bool,
    pub timing: bool,
}

impl DebugOptions {
    /// Reads the `X-GraphQL-Debug` header: `all` or any of `query`,
    /// `variables`, `plan` and `timing`, separated by spaces or commas.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut options = DebugOptions::default();
        let Some(value) = headers.get(DEBUG_HEADER).and_then(|v| v.to_str().ok()) else {
            return options;
        };
        for flag in value.split(|c: char| c == ',' || c.is_whitespace()) {
            match flag.trim().to_ascii_lowercase().as_str() {
                "all" => {
                    options = DebugOptions {
                        query: true,
                        variables: true,
                        plan: true,
                        timing: true,
                    }
                }
                "query" => options.query = true,
                "variables" => options.variables = true,
                "plan" => options.plan = true,
                "timing" => options.timing = true,
                _ => {}
            }
        }
        options
    }

    fn any(&self) -> bool {
        self.query || self.variables || self.plan || self.timing
    }
}

#[derive(Clone, Debug, Default)]
pub struct GatewaySettings {
    pub disable_introspection: bool,
    /// Deadline for a whole operation, unbounded when absent
    pub request_timeout: Option<Duration>,
}

impl From<&GatewayConfig> for GatewaySettings {
    fn from(config: &GatewayConfig) -> Self {
        GatewaySettings {
            disable_introspection: config.disable_introspection,
            request_timeout: None,
        }
    }
}

pub struct FederationGateway {
    schema_registry: Arc<dyn SchemaRegistry>,
    query_planner: Box<dyn QueryPlanner + Send + Sync>,
    query_executor: Box<dyn QueryExecutor + Send + Sync>,
    plugins: Vec<BoxPlugin>,
    settings: GatewaySettings,
}

impl FederationGateway {
    pub fn new(
        schema_registry: Arc<dyn SchemaRegistry>,
        query_planner: Box<dyn QueryPlanner + Send + Sync>,
        query_executor: Box<dyn QueryExecutor + Send + Sync>,
    ) -> Self {
        FederationGateway {
            schema_registry,
            query_planner,
            query_executor,
            plugins: Vec::new(),
            settings: GatewaySettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: GatewaySettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_plugins(mut self, plugins: Vec<BoxPlugin>) -> Self {
        self.plugins = plugins;
        self
    }

    /// Builds the gateway described by `config` and loads the first schema.
    /// Fails when the services cannot be merged.
    pub async fn from_config(config: &GatewayConfig) -> Result<Self> {
        let client = GraphQLClient::new(config.service_timeout, config.max_service_response_size)?;
        let registry =
            Arc::new(InMemorySchemaRegistry::new(client.clone()).with_id_field(config.id_field()));
        let gateway = FederationGateway::new(
            registry,
            Box::new(FederatedQueryPlanner::new()),
            Box::new(HttpQueryExecutor::new(client, config.max_requests_per_query)),
        )
        .with_settings(GatewaySettings::from(config))
        .with_plugins(build_plugins(&config.plugins)?);

        gateway.load_schemas(config.service_configs()?).await?;
        Ok(gateway)
    }

    pub async fn register_service(&self, service: ServiceConfig) -> Result<()> {
        self.schema_registry.register_service(service).await
    }

    pub async fn load_schemas(&self, services: Vec<ServiceConfig>) -> Result<()> {
        for service in services {
            self.register_service(service).await?;
        }
        self.schema_registry.update_schema(true).await?;
        Ok(())
    }

    /// Refreshes the schema every `interval` until `shutdown` fires
    pub async fn poll_schemas(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.schema_registry.update_schema(false).await {
                        Ok(true) => info!("schema updated"),
                        Ok(false) => {}
                        Err(e) => warn!(error = %e, "schema update failed"),
                    }
                }
            }
        }
        debug!("schema polling stopped");
    }

    /// Runs the plugins, then the operation
    pub async fn handle(&self, request: GraphQLRequest, headers: HeaderMap) -> GraphQLResponse {
        let mut context = RequestContext::new(headers);
        for plugin in &self.plugins {
            if let Err(e) = plugin.on_request(&mut context).await {
                debug!(plugin = plugin.name(), error = %e, "request rejected by plugin");
                return GraphQLResponse::from_errors(vec![e.into()]);
            }
        }
        self.process_request(request, context).await
    }

    /// Headers the plugins add to the response of a request
    pub fn response_headers(&self, request: &HeaderMap, preflight: bool) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for plugin in &self.plugins {
            plugin.on_response(request, preflight, &mut headers);
        }
        headers
    }

    pub async fn process_request(
        &self,
        request: GraphQLRequest,
        context: RequestContext,
    ) -> GraphQLResponse {
        let start = Instant::now();
        let schema = match self.schema_registry.get_schema().await {
            Ok(schema) => schema,
            Err(e) => return GraphQLResponse::from_errors(vec![e.into()]),
        };

        let mut operation = match Operation::prepare(
            &request.query,
            request.operation_name.as_deref(),
            request.variables.as_ref(),
        ) {
            Ok(operation) => operation,
            Err(e) => return GraphQLResponse::from_errors(vec![e.into()]),
        };

        let mut permission_errors = Vec::new();
        if let Some(permissions) = &context.permissions {
            permission_errors = filter_operation(&mut operation, permissions);
            if operation.selection_set.is_empty() && !permission_errors.is_empty() {
                return GraphQLResponse {
                    data: Some(Value::Null),
                    errors: permission_errors,
                    extensions: Map::new(),
                };
            }
        }

        let Some(root_type) = schema.schema.root_type(operation.kind).map(str::to_string) else {
            return GraphQLResponse::from_errors(vec![
                Error::InvalidQuery(format!(
                    "schema does not support {} operations",
                    operation.kind.as_str()
                ))
                .into(),
            ]);
        };

        let (introspection_data, introspection_errors) = self.resolve_introspection(&mut operation, &schema.schema);

        let plan = match self.query_planner.plan_query(&operation, &schema).await {
            Ok(plan) => plan,
            Err(e) => return GraphQLResponse::from_errors(vec![e.into()]),
        };

        let execution_context = ExecutionContext {
            headers: context.outgoing_headers.clone(),
            cancellation: context.cancellation.clone(),
            deadline: self.settings.request_timeout.map(|timeout| start + timeout),
        };
        let mut result = match self
            .query_executor
            .execute_plan(&plan, &schema, &execution_context)
            .await
        {
            Ok(result) => result,
            Err(e) => return GraphQLResponse::from_errors(vec![e.into()]),
        };
        result.data.extend(introspection_data);

        let (data, null_errors) =
            ResponseAssembler::new(&schema.schema).assemble(&root_type, &operation.selection_set, &result.data);

        let mut errors = introspection_errors;
        errors.extend(result.errors);
        errors.extend(permission_errors);
        errors.extend(null_errors);

        let mut extensions = Map::new();
        if context.debug.any() {
            if context.debug.query {
                extensions.insert("query".to_string(), json!(request.query));
            }
            if context.debug.variables {
                extensions.insert("variables".to_string(), Value::Object(operation.variables.clone()));
            }
            if context.debug.plan {
                extensions.insert("plan".to_string(), serde_json::to_value(&plan).unwrap_or(Value::Null));
            }
            if context.debug.timing {
                extensions.insert(
                    "timing".to_string(),
                    json!(format!("{}ms", start.elapsed().as_millis())),
                );
            }
        }

        debug!(
            operation = operation.kind.as_str(),
            steps = plan.step_count(),
            errors = errors.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "operation completed"
        );

        GraphQLResponse {
            data,
            errors,
            extensions,
        }
    }

    /// Answers root `__schema` and `__type` fields from the merged schema and
    /// removes them from the operation. Disabled introspection turns each of
    /// them into an error.
    fn resolve_introspection(
        &self,
        operation: &mut Operation,
        schema: &Schema,
    ) -> (Map<String, Value>, Vec<GraphQLError>) {
        let mut data = Map::new();
        let mut errors = Vec::new();
        let introspector = Introspector::new(schema, &operation.variables);

        operation.selection_set.retain(|selection| {
            let Selection::Field(field) = selection else {
                return true;
            };
            if !is_introspection_root_field(&field.name) {
                return true;
            }
            let key = field.response_key().to_string();
            let path = vec![PathSegment::from(key.as_str())];
            if self.settings.disable_introspection {
                errors.push(GraphQLError::new("introspection is disabled").with_path(path));
                return false;
            }
            match introspector.resolve(field) {
                Ok(value) => {
                    data.insert(key, value);
                    true
                }
                Err(e) => {
                    errors.push(GraphQLError::from(e).with_path(path));
                    false
                }
            }
        });
        (data, errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_debug_header_flags() {
        let mut headers = HeaderMap::new();
        assert_eq!(DebugOptions::from_headers(&headers), DebugOptions::default());

        headers.insert(DEBUG_HEADER, HeaderValue::from_static("plan, timing"));
        let options = DebugOptions::from_headers(&headers);
        assert!(options.plan && options.timing);
        assert!(!options.query && !options.variables);

        headers.insert(DEBUG_HEADER, HeaderValue::from_static("all"));
        let options = DebugOptions::from_headers(&headers);
        assert!(options.query && options.variables && options.plan && options.timing);
    }

    async fn gateway(sdl: &str, settings: GatewaySettings) -> FederationGateway {
        let registry = Arc::new(InMemorySchemaRegistry::local());
        let client = GraphQLClient::new(Duration::from_secs(1), 1024).unwrap();
        let gateway = FederationGateway::new(
            registry,
            Box::new(FederatedQueryPlanner::new()),
            Box::new(HttpQueryExecutor::new(client, 10)),
        )
        .with_settings(settings);
        let service = ServiceConfig {
            name: "a".to_string(),
            url: "http://127.0.0.1:1/query".to_string(),
            schema: Some(sdl.to_string()),
        };
        gateway.load_schemas(vec![service]).await.unwrap();
        gateway
    }

    fn request(query: &str) -> GraphQLRequest {
        GraphQLRequest {
            query: query.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_introspection_without_service_calls() {
        let gateway = gateway("type Query { movie: String }", GatewaySettings::default()).await;
        let response = gateway
            .process_request(
                request("{ __typename __type(name: \"Query\") { name kind } }"),
                RequestContext::default(),
            )
            .await;
        assert!(response.errors.is_empty(), "{:?}", response.errors);
        assert_eq!(
            response.data,
            Some(json!({ "__typename": "Query", "__type": { "name": "Query", "kind": "OBJECT" } }))
        );
    }

    #[tokio::test]
    async fn test_disabled_introspection() {
        let settings = GatewaySettings {
            disable_introspection: true,
            ..Default::default()
        };
        let gateway = gateway("type Query { movie: String }", settings).await;
        let response = gateway
            .process_request(request("{ __schema { queryType { name } } }"), RequestContext::default())
            .await;
        assert_eq!(response.errors.len(), 1);
        assert_eq!(response.errors[0].message, "introspection is disabled");
        assert_eq!(response.data, Some(json!({})));
    }

    #[tokio::test]
    async fn test_invalid_query_has_no_data() {
        let gateway = gateway("type Query { movie: String }", GatewaySettings::default()).await;
        let response = gateway
            .process_request(request("{ movie"), RequestContext::default())
            .await;
        assert_eq!(response.data, None);
        assert_eq!(response.errors.len(), 1);
    }
}
