pub mod config;
pub mod error;
pub mod federation_gateway;
pub mod graphql_client;
pub mod introspection;
pub mod operation;
pub mod permissions;
pub mod plugins;
pub mod query_executor;
pub mod query_planner;
pub mod response;
pub mod schema;
pub mod schema_merger;
pub mod schema_registry;

pub use config::GatewayConfig;
pub use error::{Error, Result};
pub use federation_gateway::{FederationGateway, GatewaySettings};
pub use graphql_client::GraphQLClient;
pub use permissions::{AllowedFields, OperationPermissions};
pub use query_executor::HttpQueryExecutor;
pub use query_planner::FederatedQueryPlanner;
pub use response::{GraphQLError, GraphQLResponse};
pub use schema_merger::BoundaryQuery;
pub use schema_registry::InMemorySchemaRegistry;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::HashMap;

use operation::{OperationKind, SelectionSet, format_selection_set};
use schema::{IdField, Schema};

pub type ServiceMap = IndexMap<String, Service>;

/// A service as configured, before its schema is known
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub url: String,
    /// Local SDL; services without one are polled for their schema
    pub schema: Option<String>,
}

/// A service with a parsed and validated schema
#[derive(Clone, Debug)]
pub struct Service {
    pub name: String,
    pub url: String,
    pub version: String,
    pub sdl: String,
    pub schema: Schema,
}

impl Service {
    pub fn new(name: impl Into<String>, url: impl Into<String>, sdl: impl Into<String>) -> Result<Self> {
        Self::with_id_field(name, url, sdl, &IdField::default())
    }

    /// Parses and validates `sdl` with boundary types identified by `id_field`
    pub fn with_id_field(
        name: impl Into<String>,
        url: impl Into<String>,
        sdl: impl Into<String>,
        id_field: &IdField,
    ) -> Result<Self> {
        let name = name.into();
        let sdl = sdl.into();
        let schema = Schema::parse(&name, &sdl)?;
        schema.validate(&name, id_field)?;
        Ok(Service {
            name,
            url: url.into(),
            version: String::new(),
            sdl,
            schema,
        })
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQLRequest {
    pub query: String,
    #[serde(default)]
    pub variables: Option<Map<String, Value>>,
    #[serde(default)]
    pub operation_name: Option<String>,
}

/// The merged schema together with its routing tables
#[derive(Clone, Debug)]
pub struct FederatedSchema {
    pub services: ServiceMap,
    pub schema: Schema,
    /// `"Type.field"` to the services able to resolve it, preferred first
    pub type_to_service_map: HashMap<String, Vec<String>>,
    /// service -> boundary type -> lookup query
    pub boundary_queries: HashMap<String, HashMap<String, BoundaryQuery>>,
    pub id_field: IdField,
}

impl FederatedSchema {
    pub fn owners(&self, type_name: &str, field_name: &str) -> &[String] {
        self.type_to_service_map
            .get(&schema_merger::location_key(type_name, field_name))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn service_url(&self, service: &str) -> Option<&str> {
        self.services.get(service).map(|s| s.url.as_str())
    }

    pub fn boundary_query(&self, service: &str, type_name: &str) -> Option<&BoundaryQuery> {
        self.boundary_queries.get(service)?.get(type_name)
    }
}

/// One sub-query bound to a single service
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPlanStep {
    pub service_name: String,
    pub service_url: String,
    pub parent_type: String,
    #[serde(serialize_with = "serialize_selection_set")]
    pub selection_set: SelectionSet,
    /// Response keys leading to the objects this step extends
    pub insertion_point: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boundary_query: Option<BoundaryQuery>,
    pub then: Vec<QueryPlanStep>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPlan {
    pub operation_kind: OperationKind,
    pub root_steps: Vec<QueryPlanStep>,
}

impl QueryPlan {
    pub fn step_count(&self) -> usize {
        fn count(steps: &[QueryPlanStep]) -> usize {
            steps.iter().map(|step| 1 + count(&step.then)).sum()
        }
        count(&self.root_steps)
    }
}

fn serialize_selection_set<S: Serializer>(
    selection_set: &SelectionSet,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_selection_set(selection_set))
}
