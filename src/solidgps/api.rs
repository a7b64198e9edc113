//! Client for the SolidGPS dashboard API.
//!
//! One authenticated GET per poll. The dashboard backend answers with a
//! JSON envelope keyed by IMEI; each device carries a list of GPS fixes
//! and a list of cell-tower approximations, newest first. Numbers arrive
//! as JSON strings more often than not, so parsing is tolerant of both.
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Duration;

/// The dashboard request endpoint.
pub const API_URL: &str =
    "https://www.solidgps.com/custom/dashboardConfig/dashboard.9/request.php";

const API_TIMEOUT: Duration = Duration::from_secs(30);

/// Below this speed the reported course is meaningless jitter, so it is
/// dropped from the record.
pub const STATIONARY_SPEED_KMH: f64 = 1.0;

/// The credentials required to query a single tracker.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    /// Hardware identifier of the tracker.
    pub imei: String,

    /// Vendor-issued authentication code, rotated on reauth.
    pub auth_code: String,

    /// Vendor-issued tracking code, rotated on reauth.
    pub tracking_code: String,
}

/// An error talking to the SolidGPS API.
#[derive(Error, Debug)]
pub enum Error {
    /// The vendor rejected the credentials. Distinct from the transient
    /// errors because it must trigger a reauthentication.
    #[error("credentials rejected: {0}")]
    Auth(String),

    /// The response was received but no usable location could be
    /// extracted from it.
    #[error("no usable location: {0}")]
    Data(String),

    /// The request failed at the transport level.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server answered with an unexpected HTTP status.
    #[error("server returned HTTP {0}")]
    Status(reqwest::StatusCode),

    /// The vendor envelope carried a non-success status code.
    #[error("vendor returned status {0}")]
    Vendor(u16),
}

/// Where a location came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationSource {
    /// A real GPS fix.
    Gps,

    /// A cell-tower approximation, used when no GPS fix is available.
    Cell,
}

impl LocationSource {
    /// The attribute value used for this source.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gps => "gps",
            Self::Cell => "cell",
        }
    }
}

/// A normalised tracker position, recreated on every poll.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationRecord {
    /// Latitude in degrees.
    pub latitude: f64,

    /// Longitude in degrees.
    pub longitude: f64,

    /// Speed over ground in km/h, never negative.
    pub speed: f64,

    /// Course over ground in degrees, in `[0, 360)`. `None` when the
    /// tracker is stationary, the field is missing, or the position is a
    /// cell-tower approximation.
    pub course: Option<f64>,

    /// Vendor signal-quality label, e.g. "Okay" or "Great".
    pub gps_quality: Option<String>,

    /// Where the position came from.
    pub source: LocationSource,

    /// Timestamp of the fix as reported by the tracker.
    pub last_gps_update: Option<DateTime<Utc>>,
}

impl LocationRecord {
    /// Is the tracker currently moving?
    #[must_use]
    pub fn is_moving(&self) -> bool {
        self.speed > 0.0
    }
}

/// The vendor emits numbers both as JSON numbers and as strings,
/// with `"-"` standing in for "not available".
#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum RawNumber {
    Number(f64),
    Text(String),
}

impl RawNumber {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            Self::Text(text) => {
                let text = text.trim();
                if text.is_empty() || text == "-" {
                    None
                } else {
                    text.parse().ok()
                }
            }
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn as_epoch_seconds(&self) -> Option<i64> {
        match self {
            Self::Number(value) if value.is_finite() => Some(value.round() as i64),
            Self::Number(_) => None,
            Self::Text(text) => text.trim().parse().ok(),
        }
    }
}

#[derive(Deserialize, Debug)]
struct Entry {
    latitude: Option<RawNumber>,
    longitude: Option<RawNumber>,
    #[serde(rename = "sog")]
    speed: Option<RawNumber>,
    #[serde(rename = "cog")]
    course: Option<RawNumber>,
    #[serde(rename = "UTC")]
    utc: Option<RawNumber>,
    quality: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct DeviceData {
    #[serde(default)]
    gps_data: Vec<Entry>,
    #[serde(default)]
    cell_data: Vec<Entry>,
}

#[derive(Deserialize, Debug)]
struct Response {
    status: u16,
    #[serde(rename = "Results", default)]
    results: HashMap<String, DeviceData>,
}

/// Anything that can fetch the current position of a tracker.
#[async_trait]
pub trait LocationClient {
    /// Fetch the latest position for the given credentials.
    async fn fetch(&self, credentials: &Credentials) -> Result<LocationRecord, Error>;
}

/// The real HTTP client for the SolidGPS API.
pub struct Api {
    client: reqwest::Client,
}

impl Api {
    /// Create a new API client.
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for Api {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocationClient for Api {
    async fn fetch(&self, credentials: &Credentials) -> Result<LocationRecord, Error> {
        let response = self
            .client
            .get(API_URL)
            .header("accept", "application/json")
            // The dashboard backend refuses requests without this.
            .header("X-Requested-With", "XMLHttpRequest")
            .query(&[
                ("IMEI", credentials.imei.as_str()),
                ("auth_code", credentials.auth_code.as_str()),
                ("tracking_code", credentials.tracking_code.as_str()),
                ("startEpoch", ""),
                ("endEpoch", ""),
            ])
            .timeout(API_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(Error::Auth(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(Error::Status(status));
        }

        let body: Response = response
            .json()
            .await
            .map_err(|err| Error::Data(format!("malformed body: {err}")))?;

        location_from_response(&body, &credentials.imei)
    }
}

/// Extract the latest position for `imei` from an API response.
///
/// Prefers GPS fixes over cell-tower approximations.
fn location_from_response(response: &Response, imei: &str) -> Result<LocationRecord, Error> {
    match response.status {
        200 => {}
        401 => return Err(Error::Auth("vendor status 401".to_string())),
        status => return Err(Error::Vendor(status)),
    }

    let device = response
        .results
        .get(imei)
        .ok_or_else(|| Error::Data(format!("IMEI {imei} not in response")))?;

    let (entry, source) = if let Some(entry) = device.gps_data.first() {
        (entry, LocationSource::Gps)
    } else if let Some(entry) = device.cell_data.first() {
        (entry, LocationSource::Cell)
    } else {
        return Err(Error::Data(format!("no GPS or cell data for IMEI {imei}")));
    };

    let latitude = entry
        .latitude
        .as_ref()
        .and_then(RawNumber::as_f64)
        .ok_or_else(|| Error::Data(format!("unparseable latitude for IMEI {imei}")))?;
    let longitude = entry
        .longitude
        .as_ref()
        .and_then(RawNumber::as_f64)
        .ok_or_else(|| Error::Data(format!("unparseable longitude for IMEI {imei}")))?;

    let speed = entry
        .speed
        .as_ref()
        .and_then(RawNumber::as_f64)
        .map_or(0.0, |speed| speed.max(0.0));

    // Cell positions have no heading, and a stationary tracker reports
    // jitter, never a stale previous value.
    let course = match source {
        LocationSource::Cell => None,
        LocationSource::Gps if speed < STATIONARY_SPEED_KMH => None,
        LocationSource::Gps => entry
            .course
            .as_ref()
            .and_then(RawNumber::as_f64)
            .map(normalize_course),
    };

    let last_gps_update = entry
        .utc
        .as_ref()
        .and_then(RawNumber::as_epoch_seconds)
        .and_then(|utc| DateTime::from_timestamp(utc, 0));

    Ok(LocationRecord {
        latitude,
        longitude,
        speed,
        course,
        gps_quality: entry.quality.clone(),
        source,
        last_gps_update,
    })
}

fn normalize_course(course: f64) -> f64 {
    let course = course % 360.0;
    if course < 0.0 {
        course + 360.0
    } else {
        course
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use float_cmp::assert_approx_eq;
    use serde_json::json;

    fn response(value: serde_json::Value) -> Response {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_raw_number() {
        let data = [
            (json!(12.5), Some(12.5)),
            (json!("12.5"), Some(12.5)),
            (json!("  7 "), Some(7.0)),
            (json!("-"), None),
            (json!(""), None),
            (json!("north"), None),
        ];

        for (value, expected) in data {
            let raw: RawNumber = serde_json::from_value(value.clone()).unwrap();
            assert_eq!(raw.as_f64(), expected, "parsing {value}");
        }
    }

    #[test]
    fn test_normalize_course() {
        assert_approx_eq!(f64, normalize_course(0.0), 0.0);
        assert_approx_eq!(f64, normalize_course(359.9), 359.9);
        assert_approx_eq!(f64, normalize_course(360.0), 0.0);
        assert_approx_eq!(f64, normalize_course(725.0), 5.0);
        assert_approx_eq!(f64, normalize_course(-90.0), 270.0);
    }

    #[test]
    fn test_gps_fix() {
        let response = response(json!({
            "status": 200,
            "Results": {
                "123456789012345": {
                    "gps_data": [{
                        "latitude": "40.7",
                        "longitude": "-74.0",
                        "sog": "12.5",
                        "cog": "88",
                        "UTC": "1700000000",
                        "quality": "Great",
                    }],
                    "cell_data": [],
                }
            }
        }));

        let record = location_from_response(&response, "123456789012345").unwrap();
        assert_approx_eq!(f64, record.latitude, 40.7);
        assert_approx_eq!(f64, record.longitude, -74.0);
        assert_approx_eq!(f64, record.speed, 12.5);
        assert_approx_eq!(f64, record.course.unwrap(), 88.0);
        assert_eq!(record.gps_quality.as_deref(), Some("Great"));
        assert_eq!(record.source, LocationSource::Gps);
        assert_eq!(
            record.last_gps_update.unwrap().timestamp(),
            1_700_000_000
        );
    }

    #[test]
    fn test_stationary_has_no_course() {
        let response = response(json!({
            "status": 200,
            "Results": {
                "1": {
                    "gps_data": [{
                        "latitude": 40.7,
                        "longitude": -74.0,
                        "sog": 0,
                        "cog": "123",
                        "quality": "Great",
                    }],
                }
            }
        }));

        let record = location_from_response(&response, "1").unwrap();
        assert_approx_eq!(f64, record.speed, 0.0);
        assert_eq!(record.course, None);
        assert!(!record.is_moving());
    }

    #[test]
    fn test_missing_course_placeholder() {
        let response = response(json!({
            "status": 200,
            "Results": {
                "1": {
                    "gps_data": [{
                        "latitude": 40.7,
                        "longitude": -74.0,
                        "sog": 30,
                        "cog": "-",
                    }],
                }
            }
        }));

        let record = location_from_response(&response, "1").unwrap();
        assert_eq!(record.course, None);
    }

    #[test]
    fn test_cell_fallback() {
        let response = response(json!({
            "status": 200,
            "Results": {
                "1": {
                    "gps_data": [],
                    "cell_data": [{
                        "latitude": "40.71",
                        "longitude": "-74.01",
                        "sog": "55",
                        "cog": "90",
                    }],
                }
            }
        }));

        let record = location_from_response(&response, "1").unwrap();
        assert_eq!(record.source, LocationSource::Cell);
        assert_approx_eq!(f64, record.latitude, 40.71);
        assert_approx_eq!(f64, record.longitude, -74.01);
        // Never a heading for a tower approximation, whatever the payload says.
        assert_eq!(record.course, None);
    }

    #[test]
    fn test_no_data_at_all() {
        let response = response(json!({
            "status": 200,
            "Results": {
                "1": { "gps_data": [], "cell_data": [] }
            }
        }));

        assert!(matches!(
            location_from_response(&response, "1"),
            Err(Error::Data(_))
        ));
    }

    #[test]
    fn test_unknown_imei() {
        let response = response(json!({ "status": 200, "Results": {} }));

        assert!(matches!(
            location_from_response(&response, "1"),
            Err(Error::Data(_))
        ));
    }

    #[test]
    fn test_unparseable_coordinates() {
        let response = response(json!({
            "status": 200,
            "Results": {
                "1": {
                    "gps_data": [{ "latitude": "-", "longitude": "-74.0" }],
                }
            }
        }));

        assert!(matches!(
            location_from_response(&response, "1"),
            Err(Error::Data(_))
        ));
    }

    #[test]
    fn test_vendor_auth_status() {
        let response = response(json!({ "status": 401 }));

        assert!(matches!(
            location_from_response(&response, "1"),
            Err(Error::Auth(_))
        ));
    }

    #[test]
    fn test_vendor_error_status() {
        let response = response(json!({ "status": 500 }));

        assert!(matches!(
            location_from_response(&response, "1"),
            Err(Error::Vendor(500))
        ));
    }

    #[test]
    fn test_newest_entry_wins() {
        let response = response(json!({
            "status": 200,
            "Results": {
                "1": {
                    "gps_data": [
                        { "latitude": 1.0, "longitude": 2.0, "sog": 10, "cog": 45 },
                        { "latitude": 9.0, "longitude": 9.0, "sog": 99, "cog": 99 },
                    ],
                }
            }
        }));

        let record = location_from_response(&response, "1").unwrap();
        assert_approx_eq!(f64, record.latitude, 1.0);
        assert_approx_eq!(f64, record.longitude, 2.0);
    }

    #[test]
    fn test_negative_speed_is_clamped() {
        let response = response(json!({
            "status": 200,
            "Results": {
                "1": {
                    "gps_data": [{ "latitude": 1.0, "longitude": 2.0, "sog": "-3" }],
                }
            }
        }));

        let record = location_from_response(&response, "1").unwrap();
        assert_approx_eq!(f64, record.speed, 0.0);
    }
}
