//! Error types for the federation gateway

use serde_json::{Map, json};
use thiserror::Error;

use crate::response::GraphQLError;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the gateway
///
/// Variants are grouped by the stage that produces them: loading and merging
/// schemas, preparing and planning an operation, talking to services and
/// configuring the process.
#[derive(Error, Debug)]
pub enum Error {
    /// A service schema could not be parsed
    #[error("failed to parse schema for service {service}: {message}")]
    SchemaParse { service: String, message: String },

    /// A service schema uses federation directives incorrectly
    #[error("invalid schema for service {service}: {message}")]
    SchemaValidation { service: String, message: String },

    /// Service schemas could not be combined
    #[error("schema merge error: {0}")]
    Merge(String),

    /// No merged schema is available yet
    #[error("no schema available: {0}")]
    SchemaUnavailable(String),

    /// The client document could not be parsed or prepared
    #[error("{0}")]
    InvalidQuery(String),

    /// The operation could not be split into steps
    #[error("{0}")]
    Plan(String),

    /// Denied by the permission allow-list or an auth plugin
    #[error("{0}")]
    Unauthorized(String),

    /// HTTP transport errors while calling a service
    #[error("error during request: {0}")]
    Request(#[from] reqwest::Error),

    /// A service answered with a non-success status and no GraphQL body
    #[error("error during request: unexpected status {status} from {url}")]
    ServiceStatus { url: String, status: u16 },

    /// A service response was larger than allowed
    #[error("error during request: response from {url} exceeded max size of {limit} bytes")]
    ResponseTooLarge { url: String, limit: usize },

    /// The per-operation request budget was exhausted
    #[error("exceeded max requests per query ({0})")]
    TooManyRequests(usize),

    /// The inbound request was cancelled
    #[error("request cancelled")]
    Cancelled,

    /// The inbound request deadline passed
    #[error("request deadline exceeded")]
    DeadlineExceeded,

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML configuration errors
    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Convert error to GraphQL error format
    pub fn to_graphql_error(&self) -> GraphQLError {
        let mut extensions = Map::new();
        extensions.insert("code".to_string(), json!(self.code()));
        GraphQLError {
            message: self.to_string(),
            locations: Vec::new(),
            path: Vec::new(),
            extensions,
        }
    }

    /// Error code reported in `extensions.code`
    pub fn code(&self) -> &'static str {
        match self {
            Error::SchemaParse { .. } | Error::SchemaValidation { .. } | Error::Merge(_) => {
                "SCHEMA_ERROR"
            }
            Error::SchemaUnavailable(_) => "SCHEMA_UNAVAILABLE",
            Error::InvalidQuery(_) => "GRAPHQL_VALIDATION_FAILED",
            Error::Plan(_) => "QUERY_PLANNING_FAILED",
            Error::Unauthorized(_) => "UNAUTHORIZED",
            Error::Request(_)
            | Error::ServiceStatus { .. }
            | Error::ResponseTooLarge { .. } => "SERVICE_REQUEST_ERROR",
            Error::TooManyRequests(_) => "TOO_MANY_REQUESTS",
            Error::Cancelled => "REQUEST_CANCELLED",
            Error::DeadlineExceeded => "REQUEST_TIMEOUT",
            Error::Config(_) | Error::Yaml(_) => "CONFIGURATION_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    pub(crate) fn plan(message: impl Into<String>) -> Self {
        Error::Plan(message.into())
    }

    pub(crate) fn merge(message: impl Into<String>) -> Self {
        Error::Merge(message.into())
    }
}

impl From<Error> for GraphQLError {
    fn from(err: Error) -> Self {
        err.to_graphql_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graphql_error_carries_code() {
        let err = Error::plan("no service owns field Query.foo");
        let gql = err.to_graphql_error();
        assert_eq!(gql.message, "no service owns field Query.foo");
        assert_eq!(gql.extensions["code"], json!("QUERY_PLANNING_FAILED"));
        assert!(gql.path.is_empty());
    }

    #[test]
    fn test_request_limit_message() {
        let err = Error::TooManyRequests(50);
        assert_eq!(err.to_string(), "exceeded max requests per query (50)");
        assert_eq!(err.code(), "TOO_MANY_REQUESTS");
    }
}
