//! On-device GNSS fix, optionally attached to a request context.

/// A single GNSS fix as reported by the host (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gnss {
    pub lat: f32,
    pub lon: f32,
    /// Horizontal positioning error, meters.
    pub hpe: u32,
    pub alt: f32,
    /// Vertical positioning error, meters.
    pub vpe: u32,
    pub speed: f32,
    pub bearing: f32,
    pub nsat: u32,
    /// Age in seconds, or [`crate::beacon::TIME_UNAVAILABLE`].
    pub age: u32,
}

impl Gnss {
    /// The "no fix present" sentinel: `lat` is NaN.
    pub fn unknown() -> Self {
        Gnss {
            lat: f32::NAN,
            lon: f32::NAN,
            hpe: 0,
            alt: 0.0,
            vpe: 0,
            speed: 0.0,
            bearing: 0.0,
            nsat: 0,
            age: crate::beacon::TIME_UNAVAILABLE,
        }
    }

    pub fn is_present(&self) -> bool {
        self.lat.is_finite() && self.lon.is_finite()
    }
}

impl Default for Gnss {
    fn default() -> Self {
        Gnss::unknown()
    }
}
