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

//! Prometheus metrics exporter for personal weather stations
//!
//! ## Features
//!
//! `pws_exporter` captures data that personal weather stations send to the Weather Underground
//! upload API and emits it as Prometheus metrics. To do this, it acts as the DNS server for your
//! weather station: queries for the Weather Underground upload domains are answered with the
//! address of the exporter, queries for the time servers stations need are forwarded to a real
//! resolver, and everything else is refused with `NXDOMAIN`. Submissions are accepted over both
//! HTTP and HTTPS (TLS 1.0 and up, using a temporary self-signed certificate). The following
//! metrics are emitted for each station.
//!
//! * `weather_station_barometric_pressure_hpa{station_id=$ID}` - Barometric pressure, in hectopascals.
//! * `weather_station_dew_point_celsius{station_id=$ID}` - Dew point, in degrees celsius.
//! * `weather_station_humidity_percent{station_id=$ID}` - Outdoor humidity (0-1).
//! * `weather_station_indoor_humidity_percent{station_id=$ID}` - Indoor humidity (0-1).
//! * `weather_station_indoor_temperature_celsius{station_id=$ID}` - Indoor temperature, in degrees celsius.
//! * `weather_station_rain_past_hour_mm{station_id=$ID}` - Rain over the past hour, in millimeters.
//! * `weather_station_rain_mm_total{station_id=$ID}` - Rain since the station's daily reset, in millimeters.
//! * `weather_station_temperature_celsius{station_id=$ID}` - Temperature, in degrees celsius.
//! * `weather_station_wind_direction_degrees{station_id=$ID}` - Wind direction, in degrees.
//! * `weather_station_wind_gust_speed_kph{station_id=$ID}` - Wind gust speed, in km/h.
//! * `weather_station_wind_speed_kph{station_id=$ID}` - Wind speed, in km/h.
//!
//! Submissions are only captured, they are not relayed to Weather Underground.
//!
//! ## Build
//!
//! `pws_exporter` is a Rust program and must be built from source using a [Rust toolchain](https://rustup.rs/).
//! OpenSSL development headers are required since OpenSSL is used for TLS.
//!
//! ```text
//! cargo build --release
//! ```
//!
//! ## Usage
//!
//! ### Run
//!
//! `pws_exporter` binds the DNS (53), HTTP (80), and HTTPS (443) ports by default so it will usually
//! need to run as root or with `CAP_NET_BIND_SERVICE`. The address DNS answers point at is detected
//! from the interface used for outbound traffic. Set it explicitly if that's not the address your
//! weather station can reach.
//!
//! ```text
//! sudo ./pws_exporter --exporter-ip 192.168.1.10
//! ```
//!
//! Then configure your weather station (or your DHCP server) to use the host running `pws_exporter`
//! as its DNS server.
//!
//! ### Prometheus
//!
//! Prometheus metrics are exposed on port `9452` at `/metrics`. Once `pws_exporter`
//! is running, configure scrapes of it by your Prometheus server. Add the host running
//! `pws_exporter` as a target under the Prometheus `scrape_configs` section as described by
//! the example below.
//!
//! ```yaml
//! # Sample config for Prometheus.
//!
//! global:
//!   scrape_interval:     15s
//!   evaluation_interval: 15s
//!   external_labels:
//!     monitor: 'my_prom'
//!
//! scrape_configs:
//! - job_name: pws_exporter
//!   static_configs:
//!   - targets: ['example:9452']
//! ```
//!

pub mod capture;
pub mod dns;
pub mod exporter;
pub mod http;
pub mod measurement;
pub mod metrics;
pub mod tls;
