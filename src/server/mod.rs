// SPDX-License-Identifier: Apache-2.0

//! The scrape endpoint: `GET /metrics` returns the text exposition of the
//! registry, over HTTP or HTTPS. With HTTPS but no configured cert/key an
//! embedded self-signed localhost pair is used, which is enough for testing
//! scrape configs; production setups should configure their own.

use std::error::Error as StdError;
use std::fmt::{Debug, Display};
use std::fs;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::Method;
use http_body_util::Full;
use hyper::body::{Body, Bytes};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use prometheus::{Encoder, Registry, TextEncoder};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::error;

use crate::config::{Protocol, ServerConfig};

type BoxError = Box<dyn StdError + Send + Sync>;

const DEFAULT_CERT_PEM: &str = include_str!("default_cert.pem");
const DEFAULT_KEY_PEM: &str = include_str!("default_key.pem");

/// Serves the monitoring registry for pull-based scrapes.
pub struct ScrapeServer {
    config: ServerConfig,
    registry: Registry,
}

impl ScrapeServer {
    pub fn new(config: ServerConfig, registry: Registry) -> Self {
        Self { config, registry }
    }

    /// Binds the configured endpoint and serves scrapes until cancelled.
    /// Every error, including the initial bind, is returned to the caller
    /// and treated as fatal.
    pub async fn serve(&self, cancellation: CancellationToken) -> Result<(), BoxError> {
        let host = if self.config.host.is_empty() {
            "0.0.0.0"
        } else {
            self.config.host.as_str()
        };
        let listener = TcpListener::bind((host, self.config.port))
            .await
            .map_err(|e| -> BoxError {
                format!("unable to bind to {}:{}: {}", host, self.config.port, e).into()
            })?;

        let tls = match self.config.protocol {
            Protocol::Http => None,
            Protocol::Https => Some(tls_acceptor(&self.config)?),
        };

        let svc = MetricsService::new(self.registry.clone());

        // To bridge Tower->Hyper we must wrap the tower service
        let svc = TowerToHyperService::new(svc);

        let timer = hyper_util::rt::TokioTimer::new();
        let graceful = hyper_util::server::graceful::GracefulShutdown::new();

        let mut builder = Builder::new(TokioExecutor::new());
        builder.http1().timer(timer.clone());
        builder.http2().timer(timer);
        let builder = Arc::new(builder);

        loop {
            let stream = tokio::select! {
                r = listener.accept() => {
                    match r {
                        Ok((stream, _)) => stream,
                        Err(e) => return Err(e.into()),
                    }
                },
                _ = cancellation.cancelled() => break
            };

            match &tls {
                None => {
                    let io = TokioIo::new(stream);
                    let conn = builder.serve_connection(io, svc.clone());
                    let fut = graceful.watch(conn.into_owned());
                    tokio::spawn(async move {
                        let _ = fut.await.map_err(|e| {
                            error!("error serving metrics connection: {:?}", e);
                        });
                    });
                }
                Some(acceptor) => {
                    // the TLS handshake happens off the accept loop so one
                    // stalled client cannot block other scrapes
                    let acceptor = acceptor.clone();
                    let builder = builder.clone();
                    let svc = svc.clone();
                    tokio::spawn(async move {
                        match acceptor.accept(stream).await {
                            Ok(stream) => {
                                let io = TokioIo::new(stream);
                                let conn = builder.serve_connection(io, svc);
                                let _ = conn.await.map_err(|e| {
                                    error!("error serving metrics connection: {:?}", e);
                                });
                            }
                            Err(e) => error!("TLS handshake failed: {}", e),
                        }
                    });
                }
            }
        }

        // gracefully shutdown existing connections
        graceful.shutdown().await;

        Ok(())
    }
}

fn tls_acceptor(config: &ServerConfig) -> Result<TlsAcceptor, BoxError> {
    let (certs, key) = if config.cert.is_empty() {
        parse_pem(DEFAULT_CERT_PEM.as_bytes(), DEFAULT_KEY_PEM.as_bytes())?
    } else {
        let cert_pem = fs::read(&config.cert)
            .map_err(|e| -> BoxError { format!("unable to read {}: {}", config.cert, e).into() })?;
        let key_pem = fs::read(&config.key)
            .map_err(|e| -> BoxError { format!("unable to read {}: {}", config.key, e).into() })?;
        parse_pem(&cert_pem, &key_pem)?
    };

    let server_config = tokio_rustls::rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| -> BoxError { format!("invalid certificate or key: {}", e).into() })?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn parse_pem(
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), BoxError> {
    let certs = rustls_pemfile::certs(&mut &*cert_pem).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err("no certificate found in PEM data".into());
    }
    let key = rustls_pemfile::private_key(&mut &*key_pem)?
        .ok_or_else(|| -> BoxError { "no private key found in PEM data".into() })?;
    Ok((certs, key))
}

/// Service implementation for handling scrape requests
#[derive(Clone)]
struct MetricsService {
    registry: Registry,
}

impl MetricsService {
    fn new(registry: Registry) -> Self {
        Self { registry }
    }
}

impl<H> Service<Request<H>> for MetricsService
where
    H: Body + Send + Sync + 'static,
    <H as Body>::Data: Send + Sync + Clone,
    <H as Body>::Error: Display + Debug + Send + Sync + ToString,
{
    type Response = Response<Full<Bytes>>;
    type Error = hyper::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<H>) -> Self::Future {
        match (req.method(), req.uri().path()) {
            (&Method::GET, "/metrics") => {
                let encoder = TextEncoder::new();
                let mut output = Vec::new();
                match encoder.encode(&self.registry.gather(), &mut output) {
                    Ok(()) => {
                        let response = Response::builder()
                            .status(StatusCode::OK)
                            .header("Content-Type", encoder.format_type())
                            .body(Full::new(Bytes::from(output)))
                            .unwrap();
                        Box::pin(futures::future::ok(response))
                    }
                    Err(err) => {
                        let response = Response::builder()
                            .status(StatusCode::INTERNAL_SERVER_ERROR)
                            .body(Full::new(Bytes::from(format!("Failed to export: {}", err))))
                            .unwrap();
                        Box::pin(futures::future::ok(response))
                    }
                }
            }
            // Return 404 Not Found for other routes
            _ => {
                let response = Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Full::new(Bytes::from_static(b"Not Found")))
                    .unwrap();
                Box::pin(futures::future::ok(response))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use hyper_util::client::legacy::connect::HttpConnector;
    use hyper_util::client::legacy::Client;
    use hyper_util::rt::TokioTimer;
    use prometheus::{CounterVec, Opts};
    use std::net::TcpListener as StdTcpListener;
    use std::time::Duration;
    use tokio::time::timeout;

    fn test_registry() -> Registry {
        let registry = Registry::new();
        let counter = CounterVec::new(
            Opts::new("test_scrapes_total", "A test counter."),
            &["source"],
        )
        .unwrap();
        registry.register(Box::new(counter.clone())).unwrap();
        counter.with_label_values(&["s1"]).inc();
        registry
    }

    fn free_port() -> u16 {
        // bind to an ephemeral port and hand it to the server under test
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn serves_metrics_over_http() {
        let port = free_port();
        let server = ScrapeServer::new(
            ServerConfig {
                protocol: Protocol::Http,
                host: "127.0.0.1".to_string(),
                port,
                cert: String::new(),
                key: String::new(),
            },
            test_registry(),
        );

        let cancellation = CancellationToken::new();
        let cancel_handle = cancellation.clone();
        let server_handle = tokio::spawn(async move { server.serve(cancellation).await });

        // Give the server time to start
        tokio::time::sleep(Duration::from_millis(100)).await;

        let client: Client<HttpConnector, Full<Bytes>> =
            Client::builder(TokioExecutor::new())
                .pool_idle_timeout(Duration::from_secs(2))
                .timer(TokioTimer::new())
                .build::<_, Full<Bytes>>(HttpConnector::new());

        let uri = format!("http://127.0.0.1:{}/metrics", port);
        let response = timeout(Duration::from_secs(5), client.get(uri.parse().unwrap()))
            .await
            .expect("request timed out")
            .expect("request failed");
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("test_scrapes_total"));
        assert!(body.contains("# TYPE test_scrapes_total counter"));

        let uri = format!("http://127.0.0.1:{}/other", port);
        let response = timeout(Duration::from_secs(5), client.get(uri.parse().unwrap()))
            .await
            .expect("request timed out")
            .expect("request failed");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        cancel_handle.cancel();
        timeout(Duration::from_secs(5), server_handle)
            .await
            .expect("server shutdown timed out")
            .expect("server task failed")
            .expect("server returned error");
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let holder = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let port = holder.local_addr().unwrap().port();

        let server = ScrapeServer::new(
            ServerConfig {
                protocol: Protocol::Http,
                host: "127.0.0.1".to_string(),
                port,
                cert: String::new(),
                key: String::new(),
            },
            Registry::new(),
        );

        let result = server.serve(CancellationToken::new()).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("unable to bind"));
    }

    #[test]
    fn default_tls_pair_parses() {
        let (certs, _key) =
            parse_pem(DEFAULT_CERT_PEM.as_bytes(), DEFAULT_KEY_PEM.as_bytes()).unwrap();
        assert_eq!(certs.len(), 1);
    }

    #[test]
    fn https_acceptor_builds_from_default_pair() {
        let config = ServerConfig {
            protocol: Protocol::Https,
            host: String::new(),
            port: 0,
            cert: String::new(),
            key: String::new(),
        };
        assert!(tls_acceptor(&config).is_ok());
    }

    #[test]
    fn missing_cert_file_is_an_error() {
        let config = ServerConfig {
            protocol: Protocol::Https,
            host: String::new(),
            port: 0,
            cert: "/not/there/cert.pem".to_string(),
            key: "/not/there/key.pem".to_string(),
        };
        let error = match tls_acceptor(&config) {
            Ok(_) => panic!("expected an error"),
            Err(error) => error,
        };
        assert!(error.to_string().contains("unable to read"));
    }
}
