use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::{Error, Result};
use crate::response::GraphQLError;

pub const USER_AGENT: &str = concat!("meshgate/", env!("CARGO_PKG_VERSION"));

const SERVICE_QUERY: &str = "{ service { name version schema } }";

/// Body of a service response
#[derive(Debug, Default, Deserialize)]
pub struct ServiceResponse {
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub errors: Vec<GraphQLError>,
}

/// What a service reports about itself
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub version: String,
    pub schema: String,
}

/// HTTP client for talking GraphQL to services
#[derive(Clone)]
pub struct GraphQLClient {
    http: reqwest::Client,
    max_response_size: usize,
}

impl GraphQLClient {
    pub fn new(timeout: Duration, max_response_size: usize) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(GraphQLClient {
            http,
            max_response_size,
        })
    }

    /// Sends `query` to `url`. Variables are always inlined, so the variables
    /// object is empty.
    pub async fn request(&self, url: &str, query: &str, headers: &HeaderMap) -> Result<ServiceResponse> {
        let mut headers = headers.clone();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let mut response = self
            .http
            .post(url)
            .headers(headers)
            .json(&json!({ "query": query, "variables": {} }))
            .send()
            .await?;
        let status = response.status();

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > self.max_response_size {
                return Err(Error::ResponseTooLarge {
                    url: url.to_string(),
                    limit: self.max_response_size,
                });
            }
            body.extend_from_slice(&chunk);
        }
        debug!(url, status = status.as_u16(), bytes = body.len(), "service responded");

        match serde_json::from_slice::<ServiceResponse>(&body) {
            Ok(parsed) => Ok(parsed),
            Err(_) if !status.is_success() => Err(Error::ServiceStatus {
                url: url.to_string(),
                status: status.as_u16(),
            }),
            Err(e) => Err(Error::Serialization(e)),
        }
    }

    /// Asks a service for its name, version and SDL
    pub async fn fetch_service(&self, url: &str) -> Result<ServiceInfo> {
        let response = self.request(url, SERVICE_QUERY, &HeaderMap::new()).await?;
        if let Some(error) = response.errors.first() {
            return Err(Error::InvalidQuery(format!(
                "service at {url} answered the service query with an error: {}",
                error.message
            )));
        }
        let service = response
            .data
            .and_then(|mut data| data.get_mut("service").map(Value::take))
            .ok_or_else(|| {
                Error::InvalidQuery(format!("service at {url} did not return its schema"))
            })?;
        Ok(serde_json::from_value(service)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(max: usize) -> GraphQLClient {
        GraphQLClient::new(Duration::from_secs(2), max).unwrap()
    }

    #[tokio::test]
    async fn test_request_sends_query_with_user_agent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("user-agent", USER_AGENT))
            .and(body_json(json!({ "query": "{ a }", "variables": {} })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": { "a": 1 } })))
            .expect(1)
            .mount(&server)
            .await;

        let response = client(1024)
            .request(&server.uri(), "{ a }", &HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(response.data, Some(json!({ "a": 1 })));
        assert!(response.errors.is_empty());
    }

    #[tokio::test]
    async fn test_response_size_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "data": { "a": "x".repeat(512) } })),
            )
            .mount(&server)
            .await;

        let result = client(100).request(&server.uri(), "{ a }", &HeaderMap::new()).await;
        assert!(matches!(result, Err(Error::ResponseTooLarge { limit: 100, .. })));
    }

    #[tokio::test]
    async fn test_non_graphql_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let result = client(1024).request(&server.uri(), "{ a }", &HeaderMap::new()).await;
        assert!(matches!(result, Err(Error::ServiceStatus { status: 502, .. })));
    }

    #[tokio::test]
    async fn test_fetch_service() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_json(json!({ "query": SERVICE_QUERY, "variables": {} })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "service": { "name": "movies", "version": "1.0", "schema": "type Query { a: Int }" } }
            })))
            .mount(&server)
            .await;

        let info = client(1024).fetch_service(&server.uri()).await.unwrap();
        assert_eq!(info.name, "movies");
        assert_eq!(info.version, "1.0");
    }
}
