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

//! Runs the DNS responder and the submission endpoints together.

use crate::capture::{self, CaptureError, ConnectionTimeouts, SubmissionHandler};
use crate::dns::{DnsConfig, DnsError, DnsResponder, UpstreamResolver};
use crate::metrics::StationMetrics;
use crate::tls::{TlsError, TlsIdentity};
use prometheus_client::registry::Registry;
use std::collections::HashMap;
use std::error;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Domains stations submit data to. Queries for these are answered with the
/// exporter address and the TLS certificate is issued for all of them.
pub const DEFAULT_VENDOR_DOMAINS: [&str; 2] = [
    "weatherstation.wunderground.com", // Standard submission API
    "rtupdate.wunderground.com",       // RapidFire (real-time) submission API
];

/// Domains stations need to resolve to work (time sync), forwarded upstream.
pub const DEFAULT_FORWARD_DOMAINS: [&str; 5] = [
    "time.nist.gov.",
    "time-nw.nist.gov.",
    "time-a.nist.gov.",
    "time-b.nist.gov.",
    "time.windows.com.",
];

pub const DEFAULT_UPSTREAM_RESOLVER: ([u8; 4], u16) = ([8, 8, 8, 8], 53);
pub const DEFAULT_DNS_LISTEN: ([u8; 4], u16) = ([0, 0, 0, 0], 53);
pub const DEFAULT_HTTP_LISTEN: ([u8; 4], u16) = ([0, 0, 0, 0], 80);
pub const DEFAULT_HTTPS_LISTEN: ([u8; 4], u16) = ([0, 0, 0, 0], 443);
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(2);

/// How long `Exporter::close` waits for the listeners to stop.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// Address used to find the outbound interface. Nothing is actually sent to it.
const PROBE_ADDR: ([u8; 4], u16) = ([8, 8, 8, 8], 80);

#[derive(Debug)]
pub enum ExporterError {
    AlreadyRunning,
    AddressProbe(io::Error),
    NotIpv4(IpAddr),
    Tls(TlsError),
    Bind(&'static str, SocketAddr, io::Error),
    Dns(DnsError),
    Capture(&'static str, CaptureError),
    Task(tokio::task::JoinError),
    ShutdownTimeout(Duration),
}

impl fmt::Display for ExporterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRunning => write!(f, "already running"),
            Self::AddressProbe(e) => write!(f, "could not determine exporter IP address: {}", e),
            Self::NotIpv4(ip) => write!(f, "exporter IP address {} is not an IPv4 address", ip),
            Self::Tls(e) => write!(f, "generate self signed certificate: {}", e),
            Self::Bind(name, addr, e) => write!(f, "unable to bind {} listener to {}: {}", name, addr, e),
            Self::Dns(e) => write!(f, "DNS server: {}", e),
            Self::Capture(name, e) => write!(f, "{} server: {}", name, e),
            Self::Task(e) => write!(f, "listener task failed: {}", e),
            Self::ShutdownTimeout(d) => write!(f, "listeners did not stop within {:?}", d),
        }
    }
}

impl error::Error for ExporterError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::AddressProbe(e) => Some(e),
            Self::Tls(e) => Some(e),
            Self::Bind(_, _, e) => Some(e),
            Self::Dns(e) => Some(e),
            Self::Capture(_, e) => Some(e),
            Self::Task(e) => Some(e),
            _ => None,
        }
    }
}

/// Everything the exporter needs to know to start its listeners.
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    /// Address DNS answers point stations at. Probed when not set.
    pub exporter_ip: Option<Ipv4Addr>,
    pub upstream_resolver: SocketAddr,
    pub upstream_timeout: Duration,
    /// DNS listener, disabled when `None`.
    pub dns_listen: Option<SocketAddr>,
    pub http_listen: SocketAddr,
    /// TLS listener, disabled when `None`.
    pub https_listen: Option<SocketAddr>,
    /// Vendor submission domains, without a trailing dot.
    pub vendor_domains: Vec<String>,
    /// Fully-qualified domains (with a trailing dot) forwarded upstream.
    pub forward_domains: Vec<String>,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        ExporterConfig {
            exporter_ip: None,
            upstream_resolver: DEFAULT_UPSTREAM_RESOLVER.into(),
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
            dns_listen: Some(DEFAULT_DNS_LISTEN.into()),
            http_listen: DEFAULT_HTTP_LISTEN.into(),
            https_listen: Some(DEFAULT_HTTPS_LISTEN.into()),
            vendor_domains: DEFAULT_VENDOR_DOMAINS.iter().map(|d| d.to_string()).collect(),
            forward_domains: DEFAULT_FORWARD_DOMAINS.iter().map(|d| d.to_string()).collect(),
        }
    }
}

/// Find the local address used for outbound traffic by "connecting" a UDP socket.
///
/// Connecting a UDP socket only selects a route, no packets are sent.
pub async fn outbound_ip() -> Result<IpAddr, ExporterError> {
    let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0)))
        .await
        .map_err(ExporterError::AddressProbe)?;
    socket
        .connect(SocketAddr::from(PROBE_ADDR))
        .await
        .map_err(ExporterError::AddressProbe)?;
    Ok(socket.local_addr().map_err(ExporterError::AddressProbe)?.ip())
}

/// Build the DNS record table: every vendor domain points at `ip`.
fn record_table(vendor_domains: &[String], ip: Ipv4Addr) -> HashMap<String, Ipv4Addr> {
    vendor_domains
        .iter()
        .map(|d| {
            let fqdn = if d.ends_with('.') { d.clone() } else { format!("{}.", d) };
            (fqdn, ip)
        })
        .collect()
}

/// Intercepts weather station submissions and turns them into metrics.
pub struct Exporter {
    config: ExporterConfig,
    exporter_ip: Ipv4Addr,
    metrics: Arc<StationMetrics>,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    serving: watch::Sender<bool>,
}

impl Exporter {
    /// Create a new exporter, registering its metrics with `registry`.
    ///
    /// If the config has no exporter address, the address of the interface used
    /// for outbound traffic is used instead.
    pub async fn new(config: ExporterConfig, registry: &mut Registry) -> Result<Self, ExporterError> {
        let exporter_ip = match config.exporter_ip {
            Some(ip) => ip,
            None => match outbound_ip().await? {
                IpAddr::V4(ip) => ip,
                other => return Err(ExporterError::NotIpv4(other)),
            },
        };

        let (shutdown, _) = watch::channel(false);
        let (serving, _) = watch::channel(false);

        Ok(Exporter {
            config,
            exporter_ip,
            metrics: Arc::new(StationMetrics::new(registry)),
            running: AtomicBool::new(false),
            shutdown,
            serving,
        })
    }

    pub fn exporter_ip(&self) -> Ipv4Addr {
        self.exporter_ip
    }

    /// Bind all listeners and serve until `close` is called or a listener fails.
    pub async fn listen_and_serve(&self) -> Result<(), ExporterError> {
        self.bind().await?.serve().await
    }

    /// Bind all enabled listeners without serving anything yet.
    ///
    /// The TLS identity is generated and the DNS record table is built before
    /// any listener is bound. Fails with `AlreadyRunning` if the exporter has
    /// already been started and not yet stopped.
    pub async fn bind(&self) -> Result<Listeners<'_>, ExporterError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ExporterError::AlreadyRunning);
        }

        let guard = RunningGuard { exporter: self };
        self.serving.send_replace(true);

        let tls = match self.config.https_listen {
            Some(addr) => {
                tracing::debug!(message = "generating temporary self-signed TLS certificate");
                let identity =
                    TlsIdentity::generate(self.config.vendor_domains.as_slice()).map_err(ExporterError::Tls)?;
                let context = identity.server_context().map_err(ExporterError::Tls)?;
                tracing::debug!(message = "generated self-signed TLS certificate", identity = ?identity);

                let listener = TcpListener::bind(addr)
                    .await
                    .map_err(|e| ExporterError::Bind("HTTPS", addr, e))?;
                Some((listener, context))
            }
            None => None,
        };

        let dns = match self.config.dns_listen {
            Some(addr) => {
                let responder = DnsResponder::new(DnsConfig {
                    upstream: UpstreamResolver::new(self.config.upstream_resolver, self.config.upstream_timeout),
                    records: record_table(&self.config.vendor_domains, self.exporter_ip),
                    forward_domains: self.config.forward_domains.clone(),
                });

                let socket = UdpSocket::bind(addr)
                    .await
                    .map_err(|e| ExporterError::Bind("DNS", addr, e))?;
                Some((socket, responder))
            }
            None => None,
        };

        let http = TcpListener::bind(self.config.http_listen)
            .await
            .map_err(|e| ExporterError::Bind("HTTP", self.config.http_listen, e))?;

        Ok(Listeners {
            guard,
            dns,
            http,
            tls,
        })
    }

    /// Stop all listeners, waiting at most `SHUTDOWN_TIMEOUT` for them to finish.
    ///
    /// Does nothing if the exporter isn't running.
    pub async fn close(&self) -> Result<(), ExporterError> {
        let mut serving = self.serving.subscribe();

        // Shutdown is only requested while running and is cleared by the running guard.
        let requested = self.shutdown.send_if_modified(|stop| {
            if self.running.load(Ordering::Acquire) {
                *stop = true;
                true
            } else {
                false
            }
        });

        if !requested {
            return Ok(());
        }

        tracing::info!(message = "stopping exporter listeners");
        let stopped = async {
            while *serving.borrow_and_update() || self.running.load(Ordering::Acquire) {
                if serving.changed().await.is_err() {
                    break;
                }
            }
        };

        tokio::time::timeout(SHUTDOWN_TIMEOUT, stopped)
            .await
            .map_err(|_| ExporterError::ShutdownTimeout(SHUTDOWN_TIMEOUT))
    }

    fn submission_handler(&self) -> SubmissionHandler {
        let metrics = Arc::clone(&self.metrics);
        Arc::new(move |station_id, measurement| metrics.observe(&station_id, &measurement))
    }

    fn shutdown_signal(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.shutdown.subscribe();
        async move {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
    }
}

impl fmt::Debug for Exporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exporter")
            .field("config", &self.config)
            .field("exporter_ip", &self.exporter_ip)
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}

/// Clears any shutdown request and releases the running flag (waking up `close`)
/// once serving has ended.
struct RunningGuard<'a> {
    exporter: &'a Exporter,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        let exporter = self.exporter;
        exporter.shutdown.send_modify(|stop| {
            *stop = false;
            exporter.running.store(false, Ordering::Release);
        });
        exporter.serving.send_replace(false);
    }
}

/// Bound, but not yet serving, listeners of an `Exporter`.
pub struct Listeners<'a> {
    guard: RunningGuard<'a>,
    dns: Option<(UdpSocket, DnsResponder)>,
    http: TcpListener,
    tls: Option<(TcpListener, openssl::ssl::SslContext)>,
}

impl Listeners<'_> {
    pub fn dns_addr(&self) -> Option<SocketAddr> {
        self.dns.as_ref().and_then(|(s, _)| s.local_addr().ok())
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http.local_addr().ok()
    }

    pub fn https_addr(&self) -> Option<SocketAddr> {
        self.tls.as_ref().and_then(|(l, _)| l.local_addr().ok())
    }

    /// Serve on every listener, each in its own task, until shutdown is requested.
    ///
    /// The first listener to fail causes shutdown of all the others and its error
    /// is returned.
    pub async fn serve(self) -> Result<(), ExporterError> {
        let exporter = self.guard.exporter;
        let router = capture::submission_router(exporter.submission_handler());
        let mut tasks = JoinSet::new();

        if let Some((socket, responder)) = self.dns {
            tracing::info!(message = "DNS server listening", address = ?socket.local_addr().ok());
            let signal = exporter.shutdown_signal();
            tasks.spawn(async move {
                Arc::new(responder)
                    .serve_with_shutdown(socket, signal)
                    .await
                    .map_err(ExporterError::Dns)
            });
        }

        if let Some((listener, context)) = self.tls {
            tracing::info!(message = "WU API TLS server listening", address = ?listener.local_addr().ok());
            let signal = exporter.shutdown_signal();
            let router = router.clone();
            tasks.spawn(async move {
                capture::serve_https_with_shutdown(listener, router, context, ConnectionTimeouts::default(), signal)
                    .await
                    .map_err(|e| ExporterError::Capture("HTTPS", e))
            });
        }

        tracing::info!(message = "WU API server listening", address = ?self.http.local_addr().ok());
        let signal = exporter.shutdown_signal();
        let http = self.http;
        tasks.spawn(async move {
            capture::serve_http_with_shutdown(http, router, ConnectionTimeouts::default(), signal)
                .await
                .map_err(|e| ExporterError::Capture("HTTP", e))
        });

        let mut result = Ok(());
        while let Some(res) = tasks.join_next().await {
            let err = match res {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(e) => ExporterError::Task(e),
            };

            tracing::error!(message = "listener failed, stopping all listeners", error = %err);
            exporter.shutdown.send_replace(true);
            tasks.shutdown().await;
            result = Err(err);
            break;
        }

        tracing::info!(message = "exporter listeners stopped");
        drop(self.guard);
        result
    }
}
