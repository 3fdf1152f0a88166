//! The HTTPS server exposing the mutator to the Kubernetes API server.
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use axum::{
    Json, Router,
    extract::Request,
    routing::{get, post},
};
use futures_util::{FutureExt, pin_mut, select};
use hyper::{body::Incoming, service::service_fn};
use hyper_util::rt::{TokioExecutor, TokioIo};
use k8s_openapi::api::core::v1::Pod;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use snafu::{ResultExt, Snafu};
use tokio::{
    net::TcpListener,
    signal::unix::{SignalKind, signal},
};
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        ServerConfig,
        crypto::ring::default_provider,
        pki_types::{CertificateDer, PrivateKeyDer, pem::PemObject},
        version::{TLS12, TLS13},
    },
};
use tower::{ServiceBuilder, ServiceExt};
use tower_http::trace::TraceLayer;
use tracing::{Instrument, instrument};

use crate::webhook::{MutatorContext, mutate_pod};

/// Path the mutating webhook configuration points the API server at.
pub const MUTATE_PATH: &str = "/mutate";

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read TLS file {path:?}"))]
    ReadTlsFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to parse PEM encoded certificate chain {path:?}"))]
    ParseCertificateChain {
        source: tokio_rustls::rustls::pki_types::pem::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to parse PEM encoded private key {path:?}"))]
    ParsePrivateKey {
        source: tokio_rustls::rustls::pki_types::pem::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to set safe TLS protocol versions"))]
    SetSafeTlsProtocolVersions { source: tokio_rustls::rustls::Error },

    #[snafu(display("failed to construct TLS server config, bad certificate/key"))]
    InvalidTlsPrivateKey { source: tokio_rustls::rustls::Error },

    #[snafu(display("failed to create TCP listener by binding to socket address {socket_addr:?}"))]
    BindTcpListener {
        source: std::io::Error,
        socket_addr: SocketAddr,
    },

    #[snafu(display("failed to create {kind} signal listener"))]
    CreateSignalListener {
        source: std::io::Error,
        kind: &'static str,
    },
}

/// Locations of the mounted PEM encoded certificate chain and private key.
#[derive(Clone, Debug)]
pub struct TlsFiles {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
}

/// Builds the router serving the mutator on [`MUTATE_PATH`].
pub fn router(context: Arc<MutatorContext>) -> Router {
    let handler_fn = |Json(review): Json<AdmissionReview<Pod>>| async move {
        let request: AdmissionRequest<Pod> = match review.try_into() {
            Ok(request) => request,
            Err(err) => {
                return Json(
                    AdmissionResponse::invalid(format!("failed to convert to request: {err}"))
                        .into_review(),
                );
            }
        };

        let response = mutate_pod(context, request).await;
        Json(response.into_review())
    };

    tracing::debug!(route = MUTATE_PATH, "registering route for pod mutator");
    Router::new().route(MUTATE_PATH, post(handler_fn))
}

/// A server which terminates TLS connections and serves the mutator router over HTTPS.
pub struct WebhookServer {
    config: Arc<ServerConfig>,
    socket_addr: SocketAddr,
    router: Router,
}

impl WebhookServer {
    #[instrument(name = "create_webhook_server", skip(router))]
    pub async fn new(socket_addr: SocketAddr, router: Router, tls: &TlsFiles) -> Result<Self> {
        let certificate_pem = read_tls_file(&tls.certificate).await?;
        let certificate_chain = CertificateDer::pem_slice_iter(&certificate_pem)
            .collect::<Result<Vec<_>, _>>()
            .with_context(|_| ParseCertificateChainSnafu {
                path: tls.certificate.clone(),
            })?;

        let private_key_pem = read_tls_file(&tls.private_key).await?;
        let private_key =
            PrivateKeyDer::from_pem_slice(&private_key_pem).with_context(|_| {
                ParsePrivateKeySnafu {
                    path: tls.private_key.clone(),
                }
            })?;

        let mut config = ServerConfig::builder_with_provider(default_provider().into())
            .with_protocol_versions(&[&TLS12, &TLS13])
            .context(SetSafeTlsProtocolVersionsSnafu)?
            .with_no_client_auth()
            .with_single_cert(certificate_chain, private_key)
            .context(InvalidTlsPrivateKeySnafu)?;
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        let router = router
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            // The health route is below the TraceLayer so as not to be instrumented
            .route("/health", get(|| async { "ok" }));

        Ok(Self {
            config: Arc::new(config),
            socket_addr,
            router,
        })
    }

    /// Runs the server until a SIGINT or SIGTERM is received.
    ///
    /// This does not implement graceful shutdown of in-flight connections.
    pub async fn run(self) -> Result<()> {
        let mut sigint = signal(SignalKind::interrupt())
            .context(CreateSignalListenerSnafu { kind: "SIGINT" })?;
        let mut sigterm = signal(SignalKind::terminate())
            .context(CreateSignalListenerSnafu { kind: "SIGTERM" })?;

        let future_server = self.run_server().fuse();
        let future_signal = async {
            select! {
                signal = sigint.recv().fuse() => {
                    if signal.is_some() {
                        tracing::debug!("received SIGINT");
                    }
                },
                signal = sigterm.recv().fuse() => {
                    if signal.is_some() {
                        tracing::debug!("received SIGTERM");
                    }
                },
            };
        }
        .fuse();

        pin_mut!(future_server);
        pin_mut!(future_signal);

        select! {
            result = future_server => result,
            () = future_signal => Ok(()),
        }
    }

    async fn run_server(self) -> Result<()> {
        let tls_acceptor = TlsAcceptor::from(self.config);
        let tcp_listener =
            TcpListener::bind(self.socket_addr)
                .await
                .context(BindTcpListenerSnafu {
                    socket_addr: self.socket_addr,
                })?;
        tracing::info!(socket_addr = %self.socket_addr, "webhook server listening");

        loop {
            let tls_acceptor = tls_acceptor.clone();
            let router = self.router.clone();

            let (tcp_stream, remote_addr) = match tcp_listener.accept().await {
                Ok((stream, addr)) => (stream, addr),
                Err(err) => {
                    tracing::trace!(%err, "failed to accept incoming TCP connection");
                    continue;
                }
            };

            let span = tracing::debug_span!("accept connection", %remote_addr);
            tokio::spawn(
                async move {
                    let tls_stream = match tls_acceptor.accept(tcp_stream).await {
                        Ok(tls_stream) => TokioIo::new(tls_stream),
                        Err(err) => {
                            tracing::trace!(%err, "error during tls handshake");
                            return;
                        }
                    };

                    let hyper_service = service_fn(move |request: Request<Incoming>| {
                        router.clone().oneshot(request)
                    });

                    hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection_with_upgrades(tls_stream, hyper_service)
                        .await
                        .unwrap_or_else(|err| {
                            tracing::warn!(%err, "failed to serve connection");
                        });
                }
                .instrument(span),
            );
        }
    }
}

async fn read_tls_file(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|_| ReadTlsFileSnafu { path })
}
