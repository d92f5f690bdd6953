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

use clap::Parser;
use prometheus_client::registry::Registry;
use pws_exporter::exporter::{
    Exporter, ExporterConfig, DEFAULT_DNS_LISTEN, DEFAULT_FORWARD_DOMAINS, DEFAULT_HTTPS_LISTEN, DEFAULT_HTTP_LISTEN,
    DEFAULT_UPSTREAM_RESOLVER, DEFAULT_VENDOR_DOMAINS,
};
use pws_exporter::http::{metrics_router, RequestContext};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{self, SignalKind};
use tracing::Level;

const DEFAULT_LOG_LEVEL: Level = Level::INFO;
const DEFAULT_BIND_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 9452);
const DEFAULT_UPSTREAM_TIMEOUT_MILLIS: u64 = 2000;

#[derive(Debug, Parser)]
#[clap(name = "pws_exporter", version = clap::crate_version!())]
struct PwsExporterApplication {
    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[clap(long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,

    /// Address to bind to for exposing metrics. By default, pws_exporter will bind to public
    /// address since the purpose is to expose metrics to an external system (Prometheus or
    /// another agent for ingestion)
    #[clap(long, default_value_t = DEFAULT_BIND_ADDR.into())]
    bind: SocketAddr,

    /// IPv4 address of this host that weather stations should send data to. By default, the
    /// address of the interface used for outbound traffic is used.
    #[clap(long)]
    exporter_ip: Option<Ipv4Addr>,

    /// DNS server to forward time server queries to.
    #[clap(long, default_value_t = DEFAULT_UPSTREAM_RESOLVER.into())]
    resolver: SocketAddr,

    /// Timeout for forwarding a single query to the DNS server, in milliseconds.
    #[clap(long, default_value_t = DEFAULT_UPSTREAM_TIMEOUT_MILLIS)]
    upstream_timeout_millis: u64,

    /// Address to bind to for answering DNS queries from weather stations.
    #[clap(long, default_value_t = DEFAULT_DNS_LISTEN.into())]
    dns_listen: SocketAddr,

    /// Don't run a DNS server. Useful when weather station domains are already overridden
    /// by some other DNS server on your network.
    #[clap(long)]
    disable_dns: bool,

    /// Address to bind to for accepting weather station data over HTTP.
    #[clap(long, default_value_t = DEFAULT_HTTP_LISTEN.into())]
    http_listen: SocketAddr,

    /// Address to bind to for accepting weather station data over HTTPS.
    #[clap(long, default_value_t = DEFAULT_HTTPS_LISTEN.into())]
    https_listen: SocketAddr,

    /// Don't accept weather station data over HTTPS.
    #[clap(long)]
    disable_https: bool,

    /// Domain weather stations submit data to. May be repeated. Defaults to the Weather
    /// Underground upload domains.
    #[clap(long = "vendor-domain")]
    vendor_domains: Vec<String>,

    /// Fully qualified domain (with trailing '.') to forward to the upstream DNS server. May
    /// be repeated. Defaults to time servers used by common weather stations.
    #[clap(long = "forward-domain")]
    forward_domains: Vec<String>,
}

impl PwsExporterApplication {
    fn exporter_config(&self) -> ExporterConfig {
        let vendor_domains = if self.vendor_domains.is_empty() {
            DEFAULT_VENDOR_DOMAINS.iter().map(|d| d.to_string()).collect()
        } else {
            self.vendor_domains.clone()
        };

        let forward_domains = if self.forward_domains.is_empty() {
            DEFAULT_FORWARD_DOMAINS.iter().map(|d| d.to_string()).collect()
        } else {
            self.forward_domains.clone()
        };

        ExporterConfig {
            exporter_ip: self.exporter_ip,
            upstream_resolver: self.resolver,
            upstream_timeout: Duration::from_millis(self.upstream_timeout_millis),
            dns_listen: if self.disable_dns { None } else { Some(self.dns_listen) },
            http_listen: self.http_listen,
            https_listen: if self.disable_https { None } else { Some(self.https_listen) },
            vendor_domains,
            forward_domains,
        }
    }
}

#[tokio::main]
async fn main() {
    let opts = PwsExporterApplication::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(opts.log_level)
            .finish(),
    )
    .expect("failed to set tracing subscriber");

    let mut registry = Registry::default();
    let exporter = Exporter::new(opts.exporter_config(), &mut registry)
        .await
        .unwrap_or_else(|e| {
            tracing::error!(message = "unable to initialize exporter", error = %e);
            process::exit(1)
        });

    tracing::info!(message = "weather stations will be sent to", exporter_ip = %exporter.exporter_ip());

    let context = Arc::new(RequestContext::new(registry));
    let server = axum::Server::try_bind(&opts.bind)
        .unwrap_or_else(|e| {
            tracing::error!(message = "error binding to address", address = %opts.bind, error = %e);
            process::exit(1)
        })
        .serve(metrics_router(context).into_make_service());

    tracing::info!(message = "metrics server started", address = %server.local_addr());

    let exporter = Arc::new(exporter);
    let serving = Arc::clone(&exporter);
    let mut listeners = tokio::spawn(async move { serving.listen_and_serve().await });

    let mut failed = tokio::select! {
        _ = sigterm() => false,
        _ = sigint() => false,
        res = &mut listeners => match res {
            Ok(Ok(())) => false,
            Ok(Err(e)) => {
                tracing::error!(message = "exporter failed", error = %e);
                true
            }
            Err(e) => {
                tracing::error!(message = "exporter task failed", error = %e);
                true
            }
        },
        res = server => {
            if let Err(e) = res {
                tracing::error!(message = "metrics server failed", error = %e);
            }
            true
        }
    };

    if let Err(e) = exporter.close().await {
        tracing::error!(message = "error stopping exporter", error = %e);
        failed = true;
    }

    tracing::info!("server shutdown");
    if failed {
        process::exit(1);
    }
}

/// Return after the first SIGTERM signal received by this process
async fn sigterm() -> io::Result<()> {
    unix::signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

/// Return after the first SIGINT signal received by this process
async fn sigint() -> io::Result<()> {
    unix::signal(SignalKind::interrupt())?.recv().await;
    Ok(())
}
