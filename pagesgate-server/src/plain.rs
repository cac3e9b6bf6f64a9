//! Plain HTTP listener
//!
//! 🌐 Answers HTTP-01 validations from the challenge cache and redirects
//! everything else to HTTPS.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST, LOCATION};
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use pagesgate_tls::ChallengeCache;
use pagesgate_tls::challenge::http_challenge_key;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// 🌐 HTTP-01 responder and HTTPS redirector
pub struct HttpServer {
    listener: TcpListener,
    challenges: Arc<ChallengeCache>,
    https_port: u16,
}

impl HttpServer {
    pub async fn bind(
        addr: SocketAddr,
        challenges: Arc<ChallengeCache>,
        https_port: u16,
    ) -> pagesgate_core::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| pagesgate_core::Error::Server(format!("Failed to bind HTTP listener on {}: {}", addr, e)))?;
        Ok(Self {
            listener,
            challenges,
            https_port,
        })
    }

    pub fn local_addr(&self) -> pagesgate_core::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `cancel` fires.
    pub async fn serve(self, cancel: CancellationToken) -> pagesgate_core::Result<()> {
        tracing::info!("🌐 HTTP listening on http://{}", self.local_addr()?);

        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!("HTTP accept error: {}", e);
                        continue;
                    }
                },
            };

            let io = TokioIo::new(stream);
            let challenges = self.challenges.clone();
            let https_port = self.https_port;

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let res = respond(&req, &challenges, https_port);
                    async move { Ok::<_, Infallible>(res) }
                });
                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    tracing::debug!("Error serving HTTP connection from {}: {:?}", peer, err);
                }
            });
        }

        tracing::info!("🛑 HTTP listener stopped");
        Ok(())
    }
}

/// Host of the request without port, lower-cased
fn request_host<B>(req: &Request<B>) -> Option<String> {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())?;

    let host = match host.rsplit_once(':') {
        // keep bracketed IPv6 literals intact
        Some((name, port)) if !name.ends_with(':') && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    };
    let host = host.trim().to_ascii_lowercase();
    (!host.is_empty()).then_some(host)
}

/// Build the response for one plain HTTP request.
pub fn respond<B>(req: &Request<B>, challenges: &ChallengeCache, https_port: u16) -> Response<Full<Bytes>> {
    let Some(host) = request_host(req) else {
        return text(StatusCode::BAD_REQUEST, "Missing Host header");
    };

    if let Some(token) = req.uri().path().strip_prefix(CHALLENGE_PREFIX) {
        return match challenges.get(&http_challenge_key(&host, token)) {
            Some(key_authorization) => {
                tracing::info!("🌐 Answering HTTP-01 validation for {}", host);
                text(StatusCode::OK, &key_authorization)
            }
            None => text(StatusCode::NOT_FOUND, "No challenge for this token"),
        };
    }

    let authority = if https_port == 443 {
        host
    } else {
        format!("{}:{}", host, https_port)
    };
    let path = req.uri().path_and_query().map(|p| p.as_str()).unwrap_or("/");

    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(LOCATION, format!("https://{}{}", authority, path))
        .body(Full::new(Bytes::new()))
        .unwrap_or_else(|_| text(StatusCode::BAD_REQUEST, "Invalid redirect target"))
}

fn text(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    let mut res = Response::new(Full::new(Bytes::from(body.to_string())));
    *res.status_mut() = status;
    res.headers_mut()
        .insert(CONTENT_TYPE, http::HeaderValue::from_static("text/plain; charset=utf-8"));
    res
}
