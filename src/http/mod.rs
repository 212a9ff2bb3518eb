//! HTTP responder plugged into the listener loop
//!
//! [`HttpService`] accepts one connection per `service_one` call and answers
//! one request on it (keep-alive is off). In [`ServeMode::Single`] the
//! connection is served to completion before returning; in
//! [`ServeMode::Concurrent`] it is spawned onto a worker pool and drained on
//! close.

mod handler;

pub use handler::{Reply, RequestHandler, RequestParts, DEFAULT_CONTENT_TYPE};

use std::convert::Infallible;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::os::fd::{AsFd, BorrowedFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinSet;

use crate::config::ServeMode;
use crate::error::{HandlerError, ResourceError};
use crate::listener::Service;

/// Responder configuration
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub mode: ServeMode,
    /// Directory files are served from
    pub root: PathBuf,
    /// Upper bound for serving one connection
    pub request_timeout: Duration,
    /// How long `close` waits for in-flight connections
    pub drain_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            mode: ServeMode::Concurrent,
            root: PathBuf::from("."),
            request_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// Listening socket plus the machinery to answer requests on it
pub struct HttpService {
    listener: TcpListener,
    handler: Arc<RequestHandler>,
    runtime: Runtime,
    in_flight: JoinSet<()>,
    config: HttpConfig,
}

impl HttpService {
    /// Wrap an already bound listener
    pub fn new(listener: TcpListener, config: HttpConfig) -> Result<Self, ResourceError> {
        // A readiness event may be stale by the time we accept
        listener
            .set_nonblocking(true)
            .map_err(ResourceError::Listener)?;

        let runtime = match config.mode {
            ServeMode::Single => Builder::new_current_thread().enable_all().build(),
            ServeMode::Concurrent => Builder::new_multi_thread()
                .enable_all()
                .thread_name("sighttpd-conn")
                .build(),
        }
        .map_err(ResourceError::Runtime)?;

        if let Ok(addr) = listener.local_addr() {
            log::info!(
                "Serving HTTP on {} ({:?} mode, root {})",
                addr,
                config.mode,
                config.root.display()
            );
        }

        Ok(Self {
            listener,
            handler: Arc::new(RequestHandler::new(config.root.clone())),
            runtime,
            in_flight: JoinSet::new(),
            config,
        })
    }

    /// Bind `addr` and wrap the listener
    pub fn bind(addr: impl ToSocketAddrs, config: HttpConfig) -> Result<Self, ResourceError> {
        let listener = TcpListener::bind(addr).map_err(ResourceError::Listener)?;
        Self::new(listener, config)
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Number of spawned connections not yet finished
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn reap(&mut self) {
        while let Some(result) = self.in_flight.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    log::error!("Connection task panicked: {}", e);
                }
            }
        }
    }
}

impl Service for HttpService {
    fn readiness_fd(&self) -> BorrowedFd<'_> {
        self.listener.as_fd()
    }

    fn service_one(&mut self) -> Result<(), HandlerError> {
        let (stream, peer) = self.listener.accept().map_err(HandlerError::Accept)?;

        let stream = {
            let _guard = self.runtime.enter();
            stream
                .set_nonblocking(true)
                .and_then(|()| tokio::net::TcpStream::from_std(stream))
        }
        .map_err(|e| HandlerError::Connection {
            peer: peer.to_string(),
            reason: e.to_string(),
        })?;

        let connection = serve_connection(
            stream,
            peer,
            Arc::clone(&self.handler),
            self.config.request_timeout,
        );

        match self.config.mode {
            ServeMode::Single => self.runtime.block_on(connection),
            ServeMode::Concurrent => {
                self.in_flight.spawn_on(
                    async move {
                        if let Err(e) = connection.await {
                            log::warn!("Request handling failed: {}", e);
                        }
                    },
                    self.runtime.handle(),
                );
                self.reap();
                Ok(())
            }
        }
    }

    fn idle(&mut self) {
        self.reap();
    }

    fn close(self) -> Result<(), ResourceError> {
        let Self {
            listener,
            runtime,
            mut in_flight,
            config,
            ..
        } = self;

        // Stop accepting before draining
        drop(listener);

        if !in_flight.is_empty() {
            log::info!(
                "Waiting up to {:?} for {} in-flight connections",
                config.drain_timeout,
                in_flight.len()
            );
            let drained = runtime.block_on(async {
                tokio::time::timeout(config.drain_timeout, async {
                    while in_flight.join_next().await.is_some() {}
                })
                .await
            });
            if drained.is_err() {
                log::warn!("Abandoning {} connections after drain timeout", in_flight.len());
            }
        }

        drop(in_flight);
        runtime.shutdown_timeout(Duration::from_millis(100));
        log::debug!("HTTP listener closed");
        Ok(())
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    handler: Arc<RequestHandler>,
    timeout: Duration,
) -> Result<(), HandlerError> {
    let service = service_fn(move |request| {
        let handler = Arc::clone(&handler);
        async move { Ok::<_, Infallible>(respond(&handler, peer, request).await) }
    });

    let connection = http1::Builder::new()
        .keep_alive(false)
        .serve_connection(TokioIo::new(stream), service);

    match tokio::time::timeout(timeout, connection).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(HandlerError::Connection {
            peer: peer.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(HandlerError::Timeout {
            peer: peer.to_string(),
        }),
    }
}

async fn respond(
    handler: &RequestHandler,
    peer: SocketAddr,
    request: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let (parts, body) = request.into_parts();

    let content_type = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_ascii_lowercase();

    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            log::warn!("Failed to read request body from {}: {}", peer, e);
            return plain_response(StatusCode::BAD_REQUEST);
        }
    };

    let reply = handler.handle(&RequestParts {
        method: &parts.method,
        path: parts.uri.path(),
        query: parts.uri.query(),
        content_type: &content_type,
        body: &body,
    });

    log::info!(
        "request from {} - - \"{} {} {:?}\" {}",
        peer.ip(),
        parts.method,
        parts.uri,
        parts.version,
        reply.status.as_u16()
    );

    into_response(reply)
}

fn into_response(reply: Reply) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(reply.body));
    *response.status_mut() = reply.status;
    if let Ok(value) = HeaderValue::from_str(&reply.content_type) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}

fn plain_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}
