//! HTTPS listener
//!
//! 🔒 Terminates TLS with the on-demand certificate acceptor and hands
//! requests to a [`PageHandler`].

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use pagesgate_tls::TlsAcceptor;
use pagesgate_tls::challenge::ACME_TLS_ALPN_PROTOCOL;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Serves pages for requests arriving over TLS
#[async_trait]
pub trait PageHandler: Send + Sync {
    /// `server_name` is the SNI name the certificate was chosen for
    async fn handle(&self, req: Request<Incoming>, server_name: &str) -> Response<Full<Bytes>>;
}

/// 📄 Answers every request with a short plain-text notice
#[derive(Debug, Default)]
pub struct FallbackHandler;

#[async_trait]
impl PageHandler for FallbackHandler {
    async fn handle(&self, req: Request<Incoming>, server_name: &str) -> Response<Full<Bytes>> {
        fallback_response(req.uri().path(), server_name)
    }
}

fn fallback_response(path: &str, server_name: &str) -> Response<Full<Bytes>> {
    let body = format!("pagesgate: no page handler configured for {}{}\n", server_name, path);
    let mut res = Response::new(Full::new(Bytes::from(body)));
    *res.status_mut() = StatusCode::NOT_FOUND;
    res.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    res
}

/// 🔒 TLS listener
pub struct HttpsServer {
    listener: TcpListener,
    acceptor: Arc<TlsAcceptor>,
    handler: Arc<dyn PageHandler>,
}

impl HttpsServer {
    pub async fn bind(
        addr: SocketAddr,
        acceptor: Arc<TlsAcceptor>,
        handler: Arc<dyn PageHandler>,
    ) -> pagesgate_core::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| pagesgate_core::Error::Server(format!("Failed to bind HTTPS listener on {}: {}", addr, e)))?;
        Ok(Self {
            listener,
            acceptor,
            handler,
        })
    }

    pub fn local_addr(&self) -> pagesgate_core::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `cancel` fires.
    pub async fn serve(self, cancel: CancellationToken) -> pagesgate_core::Result<()> {
        tracing::info!("🔒 HTTPS listening on https://{}", self.local_addr()?);

        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!("HTTPS accept error: {}", e);
                        continue;
                    }
                },
            };

            let acceptor = self.acceptor.clone();
            let handler = self.handler.clone();

            tokio::task::spawn(async move {
                let (tls, server_name) = match acceptor.accept(stream).await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::debug!("🤝 TLS handshake with {} failed: {}", peer, e);
                        return;
                    }
                };

                // validation handshakes carry no requests
                if tls.get_ref().1.alpn_protocol() == Some(ACME_TLS_ALPN_PROTOCOL) {
                    return;
                }

                let server_name = Arc::<str>::from(server_name);
                let service = service_fn(move |req| {
                    let handler = handler.clone();
                    let server_name = server_name.clone();
                    async move { Ok::<_, Infallible>(handler.handle(req, &server_name).await) }
                });

                if let Err(err) = auto::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(tls), service)
                    .await
                {
                    tracing::debug!("Error serving HTTPS connection from {}: {:?}", peer, err);
                }
            });
        }

        tracing::info!("🛑 HTTPS listener stopped");
        Ok(())
    }
}
