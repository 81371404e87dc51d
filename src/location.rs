//! Resolved location: either read from the cache or decoded from a server
//! response (spec.md §3).

use heapless::Vec;

/// Maximum downlink application-data payload carried alongside a location.
pub const MAX_DL_APP_DATA: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Unknown,
    Hybrid,
    Cell,
    Wifi,
    Gnss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationStatus {
    Success,
    Unspecified,
    BadPartner,
    Decode,
    ApiServer,
    /// Not a failure: the caller must resubmit (TBR registration round-trip).
    AuthRetry,
}

impl LocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationStatus::Success => "success",
            LocationStatus::Unspecified => "unspecified",
            LocationStatus::BadPartner => "bad partner id",
            LocationStatus::Decode => "decode error",
            LocationStatus::ApiServer => "server error",
            LocationStatus::AuthRetry => "auth retry required",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, LocationStatus::Success)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    pub lat: f32,
    pub lon: f32,
    /// Horizontal positioning error, meters.
    pub hpe: f32,
    pub source: Source,
    pub status: LocationStatus,
    pub dl_app_data: Vec<u8, MAX_DL_APP_DATA>,
}

impl Location {
    pub fn unknown() -> Self {
        Location {
            lat: f32::NAN,
            lon: f32::NAN,
            hpe: 0.0,
            source: Source::Unknown,
            status: LocationStatus::Unspecified,
            dl_app_data: Vec::new(),
        }
    }
}
