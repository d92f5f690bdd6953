// pws_exporter - Prometheus metrics exporter for personal weather stations
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

//! Submission endpoint for the Weather Underground "PWS Upload Protocol", as
//! documented at <https://support.weather.com/s/article/PWS-Upload-Protocol>.
//!
//! The same router is served over plain HTTP and over TLS, since which one a
//! station uses depends on its firmware.

use crate::measurement::{Measurement, SubmissionQuery};
use axum::extract::rejection::QueryRejection;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{StatusCode, Version};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Extension, Router};
use hyper::server::conn::Http;
use openssl::error::ErrorStack;
use openssl::ssl::{Ssl, SslContext};
use std::error;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_openssl::SslStream;
use tower_http::trace::TraceLayer;

/// Path stations submit to.
pub const SUBMISSION_PATH: &str = "/weatherstation/updateweatherstation.php";

/// The only `action` value defined by the protocol.
pub const SUBMISSION_ACTION: &str = "updateraww";

const SUCCESS_BODY: &str = "success\n";
const BAD_REQUEST_BODY: &str = "Bad Request\n";

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_HEADER_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause before accepting again after an accept error such as running out of file descriptors.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Callback invoked with the station ID and measurement of each accepted submission.
pub type SubmissionHandler = Arc<dyn Fn(String, Measurement) + Send + Sync + 'static>;

#[derive(Debug)]
pub enum CaptureError {
    Io(io::Error),
    Http(hyper::Error),
    Tls(ErrorStack),
    Handshake(openssl::ssl::Error),
    HandshakeTimeout(Duration),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "{}", e),
            Self::Http(e) => write!(f, "{}", e),
            Self::Tls(e) => write!(f, "{}", e),
            Self::Handshake(e) => write!(f, "TLS handshake failed: {}", e),
            Self::HandshakeTimeout(d) => write!(f, "TLS handshake not completed within {:?}", d),
        }
    }
}

impl error::Error for CaptureError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Http(e) => Some(e),
            Self::Tls(e) => Some(e),
            Self::Handshake(e) => Some(e),
            Self::HandshakeTimeout(_) => None,
        }
    }
}

/// How long a client may take before it is disconnected.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionTimeouts {
    /// Time allowed to complete the TLS handshake after connecting.
    pub handshake: Duration,
    /// Time allowed to send complete request headers.
    pub header_read: Duration,
}

impl Default for ConnectionTimeouts {
    fn default() -> Self {
        ConnectionTimeouts {
            handshake: DEFAULT_HANDSHAKE_TIMEOUT,
            header_read: DEFAULT_HEADER_READ_TIMEOUT,
        }
    }
}

/// Negotiated TLS version of the connection a request arrived on.
#[derive(Debug, Clone)]
pub struct TlsSession {
    pub version: &'static str,
}

struct CaptureContext {
    handler: SubmissionHandler,
}

/// Build a router for the submission endpoint that hands every accepted submission to `handler`.
pub fn submission_router(handler: SubmissionHandler) -> Router {
    Router::new()
        .route(SUBMISSION_PATH, any(submission))
        .with_state(Arc::new(CaptureContext { handler }))
        .layer(TraceLayer::new_for_http())
}

async fn submission(
    State(context): State<Arc<CaptureContext>>,
    remote: Option<ConnectInfo<SocketAddr>>,
    tls: Option<Extension<TlsSession>>,
    version: Version,
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
) -> Response {
    let query = match query {
        Ok(Query(pairs)) => SubmissionQuery::from_pairs(pairs),
        Err(e) => {
            tracing::debug!(message = "rejecting submission with malformed query", error = %e);
            return bad_request();
        }
    };

    let station_id = match (&query.action, &query.id, &query.password) {
        (Some(action), Some(id), Some(_)) if action == SUBMISSION_ACTION => id.clone(),
        _ => {
            tracing::debug!(
                message = "rejecting submission missing required parameters",
                action = ?query.action,
                has_id = query.id.is_some(),
                has_password = query.password.is_some(),
            );
            return bad_request();
        }
    };

    let proto = match tls {
        Some(Extension(session)) => format!("{:?} {}", version, session.version),
        None => format!("{:?}", version),
    };
    let station_addr = remote
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_default();

    tracing::info!(
        message = "received weather data from station",
        station_id = %station_id,
        station_addr = %station_addr,
        proto = %proto,
    );

    let measurement = match Measurement::from_query(&query) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!(
                message = "rejecting submission that could not be decoded",
                station_id = %station_id,
                error = %e,
            );
            return bad_request();
        }
    };

    // The station gets its response without waiting for metrics to be updated.
    let handler = Arc::clone(&context.handler);
    tokio::spawn(async move { handler(station_id, measurement) });

    (StatusCode::OK, SUCCESS_BODY).into_response()
}

fn bad_request() -> Response {
    (StatusCode::BAD_REQUEST, BAD_REQUEST_BODY).into_response()
}

/// Serve `router` over plain HTTP on `listener` until `signal` completes.
///
/// Open connections are closed gracefully once `signal` completes.
pub async fn serve_http_with_shutdown<F>(
    listener: TcpListener,
    router: Router,
    timeouts: ConnectionTimeouts,
    signal: F,
) -> Result<(), CaptureError>
where
    F: Future<Output = ()>,
{
    let listener = listener.into_std().map_err(CaptureError::Io)?;
    axum::Server::from_tcp(listener)
        .map_err(CaptureError::Http)?
        .http1_header_read_timeout(timeouts.header_read)
        .serve(router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(signal)
        .await
        .map_err(CaptureError::Http)
}

/// Serve `router` over TLS on `listener` until `signal` completes.
///
/// Each connection is handshaken and served in its own task. A failed or slow
/// handshake or a broken connection only affects that connection. Accept errors
/// are logged and retried. Once `signal` completes, open connections are closed
/// gracefully and waited for.
pub async fn serve_https_with_shutdown<F>(
    listener: TcpListener,
    router: Router,
    context: SslContext,
    timeouts: ConnectionTimeouts,
    signal: F,
) -> Result<(), CaptureError>
where
    F: Future<Output = ()>,
{
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut connections = JoinSet::new();
    tokio::pin!(signal);

    loop {
        let (stream, remote) = tokio::select! {
            _ = &mut signal => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => continue,
            res = listener.accept() => match res {
                Ok(accepted) => accepted,
                Err(e) if is_connection_error(&e) => {
                    tracing::debug!(message = "TLS listener connection error", error = %e);
                    continue;
                }
                Err(e) => {
                    tracing::error!(
                        message = "TLS listener accept error, backing off",
                        error = %e,
                        backoff = ?ACCEPT_ERROR_BACKOFF,
                    );
                    tokio::select! {
                        _ = &mut signal => break,
                        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => continue,
                    }
                }
            },
        };

        let context = context.clone();
        let router = router.clone();
        let stop = stop_rx.clone();

        connections.spawn(async move {
            if let Err(e) = serve_tls_connection(stream, remote, &context, router, timeouts, stop).await {
                tracing::debug!(message = "TLS connection ended with error", remote = %remote, error = %e);
            }
        });
    }

    stop_tx.send_replace(true);
    while connections.join_next().await.is_some() {}
    Ok(())
}

/// Errors that only concern a single incoming connection, not the listener.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
    )
}

async fn serve_tls_connection(
    stream: TcpStream,
    remote: SocketAddr,
    context: &SslContext,
    router: Router,
    timeouts: ConnectionTimeouts,
    mut stop: watch::Receiver<bool>,
) -> Result<(), CaptureError> {
    let ssl = Ssl::new(context).map_err(CaptureError::Tls)?;
    let mut stream = SslStream::new(ssl, stream).map_err(CaptureError::Tls)?;

    tokio::select! {
        res = tokio::time::timeout(timeouts.handshake, Pin::new(&mut stream).accept()) => match res {
            Ok(accepted) => accepted.map_err(CaptureError::Handshake)?,
            Err(_) => return Err(CaptureError::HandshakeTimeout(timeouts.handshake)),
        },
        _ = stop.changed() => return Ok(()),
    }

    let session = TlsSession {
        version: stream.ssl().version_str(),
    };
    let service = router.layer(Extension(ConnectInfo(remote))).layer(Extension(session));

    let conn = Http::new()
        .http1_header_read_timeout(timeouts.header_read)
        .serve_connection(stream, service);
    tokio::pin!(conn);

    tokio::select! {
        res = conn.as_mut() => return res.map_err(CaptureError::Http),
        _ = stop.changed() => {}
    }

    conn.as_mut().graceful_shutdown();
    conn.await.map_err(CaptureError::Http)
}

#[cfg(test)]
mod tests {
    use super::{
        serve_http_with_shutdown, serve_https_with_shutdown, submission_router, ConnectionTimeouts, SubmissionHandler,
        SUBMISSION_PATH,
    };
    use crate::measurement::Measurement;
    use crate::tls::TlsIdentity;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use openssl::ssl::{Ssl, SslConnector, SslMethod, SslVerifyMode, SslVersion};
    use std::net::SocketAddr;
    use std::pin::Pin;
    use std::sync::{mpsc, Arc, Mutex};
    use std::time::Duration;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::{mpsc as async_mpsc, oneshot};
    use tokio::task::JoinHandle;
    use tokio_openssl::SslStream;
    use tower::ServiceExt;

    const VENDOR: &str = "weatherstation.wunderground.com";

    const GOOD_QUERY: &str = "ID=test&PASSWORD=testtest&action=updateraww&realtime=1&rtfreq=5&dateutc=now\
        &baromin=29.65&tempf=63.5&dewptf=51.2&humidity=64&windspeedmph=4.4&windgustmph=4.9&winddir=270\
        &rainin=0.0&dailyrainin=0.0&indoortempf=73.5&indoorhumidity=44";

    fn channel_handler() -> (SubmissionHandler, async_mpsc::UnboundedReceiver<(String, Measurement)>) {
        let (tx, rx) = async_mpsc::unbounded_channel();
        let handler: SubmissionHandler = Arc::new(move |id, m| {
            let _ = tx.send((id, m));
        });
        (handler, rx)
    }

    async fn get(handler: SubmissionHandler, query: &str) -> (StatusCode, String) {
        let req = Request::builder()
            .uri(format!("{}?{}", SUBMISSION_PATH, query))
            .body(Body::empty())
            .unwrap();
        let res = submission_router(handler).oneshot(req).await.unwrap();
        let status = res.status();
        let body = hyper::body::to_bytes(res.into_body()).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    async fn assert_not_called(rx: &mut async_mpsc::UnboundedReceiver<(String, Measurement)>) {
        let res = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(res.is_err(), "handler should not have been called");
    }

    #[tokio::test]
    async fn test_submission_success() {
        let (handler, mut rx) = channel_handler();
        let (status, body) = get(handler, GOOD_QUERY).await;

        assert_eq!(StatusCode::OK, status);
        assert_eq!("success\n", body);

        let (id, m) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!("test", id);
        assert!((m.temperature - 17.5).abs() < 1e-6);
        assert!(m.realtime);
    }

    #[tokio::test]
    async fn test_submission_empty_request() {
        let (handler, mut rx) = channel_handler();
        let (status, body) = get(handler, "").await;

        assert_eq!(StatusCode::BAD_REQUEST, status);
        assert_eq!("Bad Request\n", body);
        assert_not_called(&mut rx).await;
    }

    #[tokio::test]
    async fn test_submission_missing_required() {
        for query in [
            "ID=test&PASSWORD=testtest&tempf=63.5",
            "action=updateraww&PASSWORD=testtest&tempf=63.5",
            "action=updateraww&ID=test&tempf=63.5",
            "action=update&ID=test&PASSWORD=testtest&tempf=63.5",
        ] {
            let (handler, mut rx) = channel_handler();
            let (status, _) = get(handler, query).await;

            assert_eq!(StatusCode::BAD_REQUEST, status, "query {}", query);
            assert_not_called(&mut rx).await;
        }
    }

    #[tokio::test]
    async fn test_submission_malformed_date() {
        let (handler, mut rx) = channel_handler();
        let (status, _) = get(
            handler,
            "action=updateraww&ID=test&PASSWORD=testtest&dateutc=2024-13-45+99:00:00",
        )
        .await;

        assert_eq!(StatusCode::BAD_REQUEST, status);
        assert_not_called(&mut rx).await;
    }

    #[tokio::test]
    async fn test_submission_lenient_numbers() {
        let (handler, mut rx) = channel_handler();
        let (status, _) = get(handler, "action=updateraww&ID=test&PASSWORD=x&tempf=hot&humidity=50").await;

        assert_eq!(StatusCode::OK, status);
        let (_, m) = rx.recv().await.unwrap();
        assert_eq!(0.0, m.temperature);
        assert_eq!(50.0, m.humidity);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_submission_responds_before_handler_completes() {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (done_tx, mut done_rx) = async_mpsc::unbounded_channel();
        let release_rx = Mutex::new(release_rx);

        let handler: SubmissionHandler = Arc::new(move |id, _| {
            let _ = release_rx.lock().unwrap().recv();
            let _ = done_tx.send(id);
        });

        let (status, _) = get(handler, GOOD_QUERY).await;
        assert_eq!(StatusCode::OK, status);
        assert!(done_rx.try_recv().is_err());

        release_tx.send(()).unwrap();
        let id = tokio::time::timeout(Duration::from_secs(5), done_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!("test", id);
    }

    #[tokio::test]
    async fn test_serve_http() {
        let (handler, mut rx) = channel_handler();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let server = tokio::spawn(serve_http_with_shutdown(
            listener,
            submission_router(handler),
            ConnectionTimeouts::default(),
            async move {
                let _ = stop_rx.await;
            },
        ));

        let res = reqwest::get(format!("http://{}{}?{}", addr, SUBMISSION_PATH, GOOD_QUERY))
            .await
            .unwrap();
        assert_eq!(200, res.status().as_u16());
        assert_eq!("success\n", res.text().await.unwrap());
        assert_eq!("test", rx.recv().await.unwrap().0);

        stop_tx.send(()).unwrap();
        assert!(server.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_serve_https() {
        let (handler, mut rx) = channel_handler();
        let (addr, stop_tx, server) = spawn_https(handler, ConnectionTimeouts::default()).await;

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap();

        let res = client
            .get(format!("https://{}{}?{}", addr, SUBMISSION_PATH, GOOD_QUERY))
            .send()
            .await
            .unwrap();
        assert_eq!(200, res.status().as_u16());
        assert_eq!("success\n", res.text().await.unwrap());
        assert_eq!("test", rx.recv().await.unwrap().0);

        let res = client
            .get(format!("https://{}{}", addr, SUBMISSION_PATH))
            .send()
            .await
            .unwrap();
        assert_eq!(400, res.status().as_u16());

        stop_tx.send(()).unwrap();
        assert!(server.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_submission_repeated_parameter_uses_first() {
        let (handler, mut rx) = channel_handler();
        let (status, _) = get(
            handler,
            "action=updateraww&ID=test&PASSWORD=x&tempf=50&tempf=60&ID=other",
        )
        .await;

        assert_eq!(StatusCode::OK, status);
        let (id, m) = rx.recv().await.unwrap();
        assert_eq!("test", id);
        assert!((m.temperature - 10.0).abs() < 1e-6);
    }

    async fn spawn_https(
        handler: SubmissionHandler,
        timeouts: ConnectionTimeouts,
    ) -> (SocketAddr, oneshot::Sender<()>, JoinHandle<Result<(), super::CaptureError>>) {
        let identity = TlsIdentity::generate(&[VENDOR]).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let server = tokio::spawn(serve_https_with_shutdown(
            listener,
            submission_router(handler),
            identity.server_context().unwrap(),
            timeouts,
            async move {
                let _ = stop_rx.await;
            },
        ));

        (addr, stop_tx, server)
    }

    /// Connect to `addr` as an old station would: TLS 1.0 only, no certificate validation.
    async fn connect_tls1(addr: SocketAddr) -> SslStream<TcpStream> {
        let mut builder = SslConnector::builder(SslMethod::tls()).unwrap();
        builder.set_verify(SslVerifyMode::NONE);
        builder.set_min_proto_version(Some(SslVersion::TLS1)).unwrap();
        builder.set_max_proto_version(Some(SslVersion::TLS1)).unwrap();
        builder.set_cipher_list("DEFAULT:@SECLEVEL=0").unwrap();
        let ssl: Ssl = builder.build().configure().unwrap().into_ssl(VENDOR).unwrap();

        let tcp = TcpStream::connect(addr).await.unwrap();
        let mut stream = SslStream::new(ssl, tcp).unwrap();
        Pin::new(&mut stream).connect().await.unwrap();
        stream
    }

    /// Wait for the peer to close `stream`, returning false if it's still open after `wait`.
    async fn closed_by_peer<S: AsyncRead + Unpin>(stream: &mut S, wait: Duration) -> bool {
        let mut buf = [0u8; 1024];
        let closed = async {
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => continue,
                }
            }
        };
        tokio::time::timeout(wait, closed).await.is_ok()
    }

    #[tokio::test]
    async fn test_serve_https_tls1_station() {
        let (handler, mut rx) = channel_handler();
        let (addr, stop_tx, server) = spawn_https(handler, ConnectionTimeouts::default()).await;

        let mut stream = connect_tls1(addr).await;
        assert_eq!("TLSv1", stream.ssl().version_str());

        let req = format!(
            "GET {}?{} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            SUBMISSION_PATH, GOOD_QUERY, VENDOR
        );
        stream.write_all(req.as_bytes()).await.unwrap();

        let mut res = Vec::new();
        let mut buf = [0u8; 1024];
        while !String::from_utf8_lossy(&res).ends_with("success\n") {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => res.extend_from_slice(&buf[..n]),
            }
        }

        let res = String::from_utf8_lossy(&res);
        assert!(res.starts_with("HTTP/1.1 200 OK"), "unexpected response {:?}", res);
        assert!(res.ends_with("success\n"));
        assert_eq!("test", rx.recv().await.unwrap().0);

        stop_tx.send(()).unwrap();
        assert!(server.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_serve_https_handshake_timeout() {
        let (handler, mut rx) = channel_handler();
        let timeouts = ConnectionTimeouts {
            handshake: Duration::from_millis(200),
            ..Default::default()
        };
        let (addr, stop_tx, server) = spawn_https(handler, timeouts).await;

        // Connected but never sends a ClientHello.
        let mut idle = TcpStream::connect(addr).await.unwrap();
        assert!(closed_by_peer(&mut idle, Duration::from_secs(5)).await);
        assert_not_called(&mut rx).await;

        // Other stations are unaffected.
        let mut stream = connect_tls1(addr).await;
        assert_eq!("TLSv1", stream.ssl().version_str());
        stream.shutdown().await.ok();

        stop_tx.send(()).unwrap();
        assert!(server.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_serve_https_shutdown_closes_connections() {
        let (handler, _rx) = channel_handler();
        let (addr, stop_tx, server) = spawn_https(handler, ConnectionTimeouts::default()).await;

        let mut handshaken = connect_tls1(addr).await;
        let mut pending = TcpStream::connect(addr).await.unwrap();

        stop_tx.send(()).unwrap();
        let stopped = tokio::time::timeout(Duration::from_secs(2), server).await;
        assert!(stopped.unwrap().unwrap().is_ok());

        assert!(closed_by_peer(&mut handshaken, Duration::from_secs(2)).await);
        assert!(closed_by_peer(&mut pending, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_serve_http_header_read_timeout() {
        let (handler, mut rx) = channel_handler();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let timeouts = ConnectionTimeouts {
            header_read: Duration::from_millis(200),
            ..Default::default()
        };

        let server = tokio::spawn(serve_http_with_shutdown(
            listener,
            submission_router(handler),
            timeouts,
            async move {
                let _ = stop_rx.await;
            },
        ));

        // Starts a request and never finishes the headers.
        let mut slow = TcpStream::connect(addr).await.unwrap();
        slow.write_all(format!("GET {}?{} HTTP/1.1\r\n", SUBMISSION_PATH, GOOD_QUERY).as_bytes())
            .await
            .unwrap();
        assert!(closed_by_peer(&mut slow, Duration::from_secs(5)).await);
        assert_not_called(&mut rx).await;

        stop_tx.send(()).unwrap();
        assert!(server.await.unwrap().is_ok());
    }
}
