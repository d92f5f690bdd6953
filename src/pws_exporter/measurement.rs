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

//! Decoding of the Weather Underground "PWS Upload Protocol".
//!
//! Stations submit readings as query parameters in imperial units. Everything
//! is converted to metric units as soon as it is decoded.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::error;
use std::fmt;

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const DATE_NOW: &str = "now";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    MalformedField(&'static str, String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedField(field, value) => write!(f, "malformed field {}: {:?}", field, value),
        }
    }
}

impl error::Error for DecodeError {}

/// Raw query parameters of a submission, exactly as sent by a station.
///
/// Every parameter is optional here: validation of the required parameters
/// happens in the capture endpoint, and decoding of the rest is lenient.
#[derive(Debug, Default, Clone)]
pub struct SubmissionQuery {
    pub action: Option<String>,
    pub id: Option<String>,
    pub password: Option<String>,
    pub date_utc: Option<String>,
    pub realtime: Option<String>,
    pub realtime_freq: Option<String>,
    pub wind_dir: Option<String>,
    pub wind_speed_mph: Option<String>,
    pub wind_gust_mph: Option<String>,
    pub humidity: Option<String>,
    pub dew_point_f: Option<String>,
    pub temp_f: Option<String>,
    pub rain_in: Option<String>,
    pub daily_rain_in: Option<String>,
    pub barom_in: Option<String>,
    pub indoor_temp_f: Option<String>,
    pub indoor_humidity: Option<String>,
}

impl SubmissionQuery {
    /// Collect known parameters from decoded query string pairs.
    ///
    /// When a parameter is repeated the first value is used. Unknown parameters
    /// are ignored.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut q = Self::default();

        for (k, v) in pairs {
            let field = match k.as_ref() {
                "action" => &mut q.action,
                "ID" => &mut q.id,
                "PASSWORD" => &mut q.password,
                "dateutc" => &mut q.date_utc,
                "realtime" => &mut q.realtime,
                "rtfreq" => &mut q.realtime_freq,
                "winddir" => &mut q.wind_dir,
                "windspeedmph" => &mut q.wind_speed_mph,
                "windgustmph" => &mut q.wind_gust_mph,
                "humidity" => &mut q.humidity,
                "dewptf" => &mut q.dew_point_f,
                "tempf" => &mut q.temp_f,
                "rainin" => &mut q.rain_in,
                "dailyrainin" => &mut q.daily_rain_in,
                "baromin" => &mut q.barom_in,
                "indoortempf" => &mut q.indoor_temp_f,
                "indoorhumidity" => &mut q.indoor_humidity,
                _ => continue,
            };

            if field.is_none() {
                *field = Some(v.into());
            }
        }

        q
    }
}

/// One decoded submission, in metric units.
///
/// Fields that were missing or unparsable in the submission are left at zero.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// Time of the submission
    pub date_utc: DateTime<Utc>,
    /// Whether the station is sending real-time (RapidFire) updates
    pub realtime: bool,
    /// Frequency of real-time updates, in seconds
    pub realtime_freq: f64,
    /// Wind direction, 0-360 degrees
    pub wind_direction: f64,
    /// Wind speed, km/h
    pub wind_speed: f64,
    /// Wind gust, km/h
    pub wind_gust: f64,
    /// Outdoor humidity, 0-100 percent
    pub humidity: f64,
    /// Dew point, celsius
    pub dew_point: f64,
    /// Outdoor temperature, celsius
    pub temperature: f64,
    /// Rain over the past hour, millimeters
    pub rain_past_hour: f64,
    /// Rain since the station's own reference point (usually midnight), millimeters
    pub rain_today: f64,
    /// Barometric pressure, hectopascals
    pub barometric: f64,
    /// Indoor temperature, celsius
    pub indoor_temperature: f64,
    /// Indoor humidity, 0-100 percent
    pub indoor_humidity: f64,
}

impl Measurement {
    fn empty(date_utc: DateTime<Utc>) -> Self {
        Measurement {
            date_utc,
            realtime: false,
            realtime_freq: 0.0,
            wind_direction: 0.0,
            wind_speed: 0.0,
            wind_gust: 0.0,
            humidity: 0.0,
            dew_point: 0.0,
            temperature: 0.0,
            rain_past_hour: 0.0,
            rain_today: 0.0,
            barometric: 0.0,
            indoor_temperature: 0.0,
            indoor_humidity: 0.0,
        }
    }

    /// Decode a measurement from submission query parameters.
    ///
    /// The only field that can cause decoding to fail is `dateutc`: any value
    /// other than "now" must be a `YYYY-MM-DD HH:MM:SS` UTC timestamp. All
    /// numeric fields that can't be parsed are treated as if they were absent.
    pub fn from_query(q: &SubmissionQuery) -> Result<Self, DecodeError> {
        let date_utc = match q.date_utc.as_deref() {
            None | Some("") | Some(DATE_NOW) => Utc::now(),
            Some(v) => NaiveDateTime::parse_from_str(v, DATE_FORMAT)
                .map(|d| d.and_utc())
                .map_err(|_| DecodeError::MalformedField("dateutc", v.to_owned()))?,
        };

        let mut m = Self::empty(date_utc);
        m.realtime = q.realtime.as_deref() == Some("1");

        if let Some(v) = parse_float(&q.realtime_freq) {
            m.realtime_freq = v;
        }
        if let Some(v) = parse_float(&q.wind_dir) {
            m.wind_direction = v;
        }
        if let Some(v) = parse_float(&q.wind_speed_mph) {
            m.wind_speed = mph_to_kph(v);
        }
        if let Some(v) = parse_float(&q.wind_gust_mph) {
            m.wind_gust = mph_to_kph(v);
        }
        if let Some(v) = parse_float(&q.humidity) {
            m.humidity = v;
        }
        if let Some(v) = parse_float(&q.dew_point_f) {
            m.dew_point = f_to_c(v);
        }
        if let Some(v) = parse_float(&q.temp_f) {
            m.temperature = f_to_c(v);
        }
        if let Some(v) = parse_float(&q.rain_in) {
            m.rain_past_hour = in_to_mm(v);
        }
        if let Some(v) = parse_float(&q.daily_rain_in) {
            m.rain_today = in_to_mm(v);
        }
        if let Some(v) = parse_float(&q.barom_in) {
            m.barometric = in_hg_to_hpa(v);
        }
        if let Some(v) = parse_float(&q.indoor_temp_f) {
            m.indoor_temperature = f_to_c(v);
        }
        if let Some(v) = parse_float(&q.indoor_humidity) {
            m.indoor_humidity = v;
        }

        Ok(m)
    }
}

fn parse_float(v: &Option<String>) -> Option<f64> {
    v.as_deref().and_then(|s| s.trim().parse::<f64>().ok()).filter(|f| f.is_finite())
}

/// Convert Fahrenheit to Celsius.
pub fn f_to_c(f: f64) -> f64 {
    (f - 32.0) / 1.8
}

/// Convert inches to millimeters.
pub fn in_to_mm(inches: f64) -> f64 {
    inches * 25.4
}

/// Convert miles per hour to kilometers per hour.
pub fn mph_to_kph(mph: f64) -> f64 {
    mph * 1.609344
}

/// Convert inches of mercury to hectopascals (1 inHg = 33.8639 hPa).
pub fn in_hg_to_hpa(in_hg: f64) -> f64 {
    in_hg * 33.8639
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    fn assert_close(actual: f64, expected: f64, places: i32) {
        let tolerance = 10f64.powi(-places);
        assert!(
            (actual - expected).abs() < tolerance,
            "got {}, expected {} (within {})",
            actual,
            expected,
            tolerance
        );
    }

    fn query(pairs: &[(&str, &str)]) -> SubmissionQuery {
        SubmissionQuery::from_pairs(pairs.iter().copied())
    }

    #[test]
    fn test_f_to_c() {
        assert_eq!(0.0, f_to_c(32.0));
        assert_eq!(100.0, f_to_c(212.0));
        assert_close(f_to_c(0.0), -17.7778, 4);
        assert_close(f_to_c(98.6), 37.0, 4);
        assert_close(f_to_c(63.5), 17.5, 6);
    }

    #[test]
    fn test_in_to_mm() {
        assert_eq!(0.0, in_to_mm(0.0));
        assert_close(in_to_mm(1.0), 25.4, 6);
        assert_close(in_to_mm(2.5), 63.5, 6);
        assert_close(in_to_mm(10.0), 254.0, 6);
    }

    #[test]
    fn test_mph_to_kph() {
        assert_eq!(0.0, mph_to_kph(0.0));
        assert_close(mph_to_kph(1.0), 1.609344, 9);
        assert_close(mph_to_kph(45.0), 72.42048, 6);
        assert_close(mph_to_kph(60.0), 96.56064, 6);
    }

    #[test]
    fn test_in_hg_to_hpa() {
        assert_eq!(0.0, in_hg_to_hpa(0.0));
        assert_close(in_hg_to_hpa(1.0), 33.8639, 6);
        assert_close(in_hg_to_hpa(5.0), 169.3195, 6);
        assert_close(in_hg_to_hpa(29.92), 1013.25, 2);
    }

    #[test]
    fn test_from_query_converts_units() {
        let q = query(&[
            ("dateutc", "now"),
            ("realtime", "1"),
            ("rtfreq", "5"),
            ("winddir", "270"),
            ("windspeedmph", "60"),
            ("tempf", "63.5"),
            ("humidity", "64"),
            ("dailyrainin", "1.0"),
            ("baromin", "29.92"),
        ]);
        let m = Measurement::from_query(&q).unwrap();

        assert!(m.realtime);
        assert_close(m.realtime_freq, 5.0, 6);
        assert_close(m.wind_direction, 270.0, 6);
        assert_close(m.wind_speed, 96.56064, 6);
        assert_close(m.temperature, 17.5, 6);
        assert_close(m.humidity, 64.0, 6);
        assert_close(m.rain_today, 25.4, 6);
        assert_close(m.barometric, 1013.25, 2);
        assert_eq!(0.0, m.indoor_temperature);
    }

    #[test]
    fn test_from_query_parses_timestamp() {
        let m = Measurement::from_query(&query(&[("dateutc", "2024-03-09 17:45:01")])).unwrap();
        assert_eq!(2024, m.date_utc.year());
        assert_eq!(3, m.date_utc.month());
        assert_eq!(9, m.date_utc.day());
        assert_eq!(17, m.date_utc.hour());
        assert_eq!(45, m.date_utc.minute());
        assert_eq!(1, m.date_utc.second());
    }

    #[test]
    fn test_from_query_missing_timestamp_is_now() {
        let before = Utc::now();
        let m = Measurement::from_query(&SubmissionQuery::default()).unwrap();
        assert!(m.date_utc >= before);
        assert!(!m.realtime);
    }

    #[test]
    fn test_from_query_malformed_timestamp() {
        let res = Measurement::from_query(&query(&[("dateutc", "yesterday")]));
        assert_eq!(
            Err(DecodeError::MalformedField("dateutc", "yesterday".to_owned())),
            res
        );
    }

    #[test]
    fn test_from_query_unparsable_numbers_are_zero() {
        let q = query(&[("tempf", "warm"), ("humidity", ""), ("baromin", "NaN"), ("realtime", "yes")]);
        let m = Measurement::from_query(&q).unwrap();
        assert_eq!(0.0, m.temperature);
        assert_eq!(0.0, m.humidity);
        assert_eq!(0.0, m.barometric);
        assert!(!m.realtime);
    }

    #[test]
    fn test_from_pairs_first_value_wins() {
        let q = query(&[
            ("ID", "KTEST1"),
            ("tempf", "50"),
            ("tempf", "60"),
            ("ID", "KTEST2"),
            ("unknown", "1"),
        ]);

        assert_eq!(Some("KTEST1"), q.id.as_deref());
        assert_eq!(Some("50"), q.temp_f.as_deref());
        assert_close(Measurement::from_query(&q).unwrap().temperature, 10.0, 6);
    }

    #[test]
    fn test_from_pairs_parameter_names() {
        let q = query(&[
            ("action", "updateraww"),
            ("PASSWORD", "secret"),
            ("windgustmph", "10"),
            ("dewptf", "41"),
            ("rainin", "0.5"),
            ("indoortempf", "68"),
            ("indoorhumidity", "40"),
            ("id", "lowercase is not ID"),
        ]);

        assert_eq!(Some("updateraww"), q.action.as_deref());
        assert_eq!(Some("secret"), q.password.as_deref());
        assert_eq!(None, q.id);

        let m = Measurement::from_query(&q).unwrap();
        assert_close(m.wind_gust, 16.09344, 6);
        assert_close(m.dew_point, 5.0, 6);
        assert_close(m.rain_past_hour, 12.7, 6);
        assert_close(m.indoor_temperature, 20.0, 6);
        assert_close(m.indoor_humidity, 40.0, 6);
    }
}
