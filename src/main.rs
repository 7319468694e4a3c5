use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use http::header::{CONTENT_TYPE, LOCATION};
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use meshgate::config::{DEFAULT_CONFIG_PATH, LogFormat};
use meshgate::{FederationGateway, GatewayConfig, GraphQLRequest, GraphQLResponse};

#[derive(Parser, Debug)]
#[command(version, about = "GraphQL federation gateway")]
struct Args {
    /// Path to the gateway configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

fn full<T: Into<Bytes>>(value: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(value.into())
        .map_err(|never| match never {})
        .boxed()
}

const GRAPHIQL_HTML: &str = r#"
<!DOCTYPE html>
<html>
<head>
  <title>GraphiQL - meshgate</title>
  <link href="https://unpkg.com/graphiql@1.5.0/graphiql.min.css" rel="stylesheet" />
  <style>
    body { margin: 0; padding: 0; height: 100vh; }
    #graphiql { height: 100vh; }
  </style>
</head>
<body>
  <div id="graphiql"></div>

  <script src="https://unpkg.com/react@17.0.2/umd/react.production.min.js"></script>
  <script src="https://unpkg.com/react-dom@17.0.2/umd/react-dom.production.min.js"></script>
  <script src="https://unpkg.com/graphiql@1.5.0/graphiql.min.js"></script>
  <script>
    function graphQLFetcher(graphQLParams) {
      return fetch('/query', {
        method: 'post',
        headers: { 'Content-Type': 'application/json' },
        body: JSON.stringify(graphQLParams),
      }).then(response => response.json());
    }

    ReactDOM.render(
      React.createElement(GraphiQL, { fetcher: graphQLFetcher }),
      document.getElementById('graphiql')
    );
  </script>
</body>
</html>
"#;

async fn handle_request(
    req: Request<Incoming>,
    gateway: Arc<FederationGateway>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let request_headers = req.headers().clone();

    let mut response = match (&method, path.as_str()) {
        (&Method::POST, "/query") | (&Method::POST, "/graphql") => {
            let body = match req.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    debug!(error = %e, "failed to read request body");
                    return Ok(plain(StatusCode::BAD_REQUEST, "Failed to read request body"));
                }
            };
            match serde_json::from_slice::<GraphQLRequest>(&body) {
                Ok(request) => {
                    let result = gateway.handle(request, request_headers.clone()).await;
                    json_response(&result)
                }
                Err(e) => plain(StatusCode::BAD_REQUEST, format!("Invalid JSON request: {e}")),
            }
        }

        (&Method::GET, "/graphiql") => Response::builder()
            .header(CONTENT_TYPE, "text/html")
            .body(full(GRAPHIQL_HTML))
            .unwrap_or_else(|_| internal_server_error()),

        (&Method::GET, "/") => Response::builder()
            .status(StatusCode::FOUND)
            .header(LOCATION, "/graphiql")
            .body(full(""))
            .unwrap_or_else(|_| internal_server_error()),

        (&Method::OPTIONS, _) => Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(full(""))
            .unwrap_or_else(|_| internal_server_error()),

        _ => plain(StatusCode::NOT_FOUND, "Not Found"),
    };

    let extra = gateway.response_headers(&request_headers, method == Method::OPTIONS);
    response.headers_mut().extend(extra);
    Ok(response)
}

fn json_response(result: &GraphQLResponse) -> Response<BoxBody<Bytes, hyper::Error>> {
    match serde_json::to_vec(result) {
        Ok(body) => Response::builder()
            .header(CONTENT_TYPE, "application/json")
            .body(full(body))
            .unwrap_or_else(|_| internal_server_error()),
        Err(e) => {
            error!(error = %e, "failed to serialize response");
            internal_server_error()
        }
    }
}

fn plain(status: StatusCode, body: impl Into<Bytes>) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .body(full(body))
        .unwrap_or_else(|_| internal_server_error())
}

fn internal_server_error() -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::new(full("Internal Server Error"));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

#[derive(Clone)]
pub struct TokioExecutor;

impl<F> hyper::rt::Executor<F> for TokioExecutor
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn execute(&self, fut: F) {
        tokio::task::spawn(fut);
    }
}

fn init_tracing(config: &GatewayConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = GatewayConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    init_tracing(&config);

    let gateway = Arc::new(
        FederationGateway::from_config(&config)
            .await
            .context("failed to load service schemas")?,
    );

    let shutdown = CancellationToken::new();
    let poller = {
        let gateway = Arc::clone(&gateway);
        let shutdown = shutdown.clone();
        let interval = config.poll_interval;
        tokio::spawn(async move { gateway.poll_schemas(interval, shutdown).await })
    };

    let addr: SocketAddr = config
        .gateway_address
        .parse()
        .with_context(|| format!("invalid gateway-address {}", config.gateway_address))?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "federation gateway listening");
    info!("GraphiQL UI available at http://{addr}/graphiql");

    loop {
        let (stream, _addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        };
        let io = TokioIo::new(stream);
        let gateway = Arc::clone(&gateway);

        tokio::task::spawn(async move {
            let service = service_fn(move |req| handle_request(req, Arc::clone(&gateway)));

            if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor)
                .serve_connection(io, service)
                .await
            {
                debug!(error = %e, "error processing connection");
            }
        });
    }

    shutdown.cancel();
    poller.await?;
    Ok(())
}
