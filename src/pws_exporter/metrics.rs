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

use crate::measurement::Measurement;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, PoisonError};

const NAMESPACE: &str = "weather";
const SUBSYSTEM: &str = "station";

type GaugeFamily = Family<StationLabels, Gauge<f64, AtomicU64>>;
type CounterFamily = Family<StationLabels, Counter<f64, AtomicU64>>;

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StationLabels {
    pub station_id: String,
}

impl StationLabels {
    pub fn new<S: Into<String>>(station_id: S) -> Self {
        StationLabels {
            station_id: station_id.into(),
        }
    }
}

/// Holder for metrics that can be set from a decoded `Measurement`.
///
/// All metrics are created and registered upon call to `StationMetrics::new()`. Metrics
/// all share the prefix "weather_station_" and have a "station_id" label that is set to
/// the ID the station submitted with (e.g. `{station_id="KMAWOBUR12"}`).
#[derive(Debug, Default)]
pub struct StationMetrics {
    barometric_pressure: GaugeFamily,
    dew_point: GaugeFamily,
    humidity: GaugeFamily,
    indoor_humidity: GaugeFamily,
    indoor_temperature: GaugeFamily,
    rain_past_hour: GaugeFamily,
    rain: CounterFamily,
    temperature: GaugeFamily,
    wind_direction: GaugeFamily,
    wind_gust_speed: GaugeFamily,
    wind_speed: GaugeFamily,
    station_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl StationMetrics {
    /// Create a new `StationMetrics` and register each metric with the provided `Registry`.
    pub fn new(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        let sub = reg.sub_registry_with_prefix(NAMESPACE).sub_registry_with_prefix(SUBSYSTEM);

        sub.register(
            "barometric_pressure_hpa",
            "Barometric pressure in hectopascals",
            metrics.barometric_pressure.clone(),
        );
        sub.register("dew_point_celsius", "Dew point in celsius", metrics.dew_point.clone());
        sub.register("humidity_percent", "Humidity percentage (0-1)", metrics.humidity.clone());
        sub.register(
            "indoor_humidity_percent",
            "Indoor humidity percentage (0-1)",
            metrics.indoor_humidity.clone(),
        );
        sub.register(
            "indoor_temperature_celsius",
            "Indoor temperature in celsius",
            metrics.indoor_temperature.clone(),
        );
        sub.register(
            "rain_past_hour_mm",
            "Amount of rain over the past hour in millimeters",
            metrics.rain_past_hour.clone(),
        );
        sub.register("rain_mm", "Rain in millimeters", metrics.rain.clone());
        sub.register("temperature_celsius", "Temperature in celsius", metrics.temperature.clone());
        sub.register(
            "wind_direction_degrees",
            "Wind direction in degrees",
            metrics.wind_direction.clone(),
        );
        sub.register("wind_gust_speed_kph", "Wind gust speed in km/h", metrics.wind_gust_speed.clone());
        sub.register("wind_speed_kph", "Wind speed in km/h", metrics.wind_speed.clone());

        metrics
    }

    /// Set all metrics for a station from the provided measurement.
    ///
    /// Gauges are overwritten. The rain counter is reset and then incremented by the
    /// station's own running total since the station's own reset point, so that
    /// we never accumulate the station's cumulative value on top of itself.
    pub fn observe(&self, station_id: &str, m: &Measurement) {
        let lock = self.station_lock(station_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let labels = StationLabels::new(station_id);

        self.set(&self.barometric_pressure, &labels, m.barometric);
        self.set(&self.dew_point, &labels, m.dew_point);
        self.set(&self.humidity, &labels, m.humidity / 100.0);
        self.set(&self.indoor_humidity, &labels, m.indoor_humidity / 100.0);
        self.set(&self.indoor_temperature, &labels, m.indoor_temperature);
        self.set(&self.rain_past_hour, &labels, m.rain_past_hour);
        self.set(&self.temperature, &labels, m.temperature);
        self.set(&self.wind_direction, &labels, m.wind_direction);
        self.set(&self.wind_gust_speed, &labels, m.wind_gust);
        self.set(&self.wind_speed, &labels, m.wind_speed);

        // Counter state lives on the station, not here.
        self.rain.remove(&labels);
        let rain = self.rain.get_or_create(&labels);
        if m.rain_today >= 0.0 {
            rain.inc_by(m.rain_today);
        } else {
            tracing::warn!(
                message = "ignoring negative cumulative rain",
                station_id = %station_id,
                rain_mm = m.rain_today,
            );
        }
    }

    fn set(&self, gauge: &GaugeFamily, labels: &StationLabels, value: f64) {
        gauge.get_or_create(labels).set(value);
    }

    /// Lock that serializes updates for a single station without blocking any other station.
    fn station_lock(&self, station_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.station_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(station_id.to_owned()).or_default())
    }
}
