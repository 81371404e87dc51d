//! Dynamic, server-tunable configuration (spec.md §3 "Dynamic config").
//!
//! Follows the `examples/rust-iot-rust-lpwan` `mac/config.rs` `CoreConfig`
//! pattern (plain struct + `Default`), with defaults taken from
//! `examples/original_source/libel/config.h`. Overrides pushed by the
//! server are range-checked by [`Config::apply_override`]; anything out of
//! range is silently dropped and the previous value is kept, per spec.md
//! §3/§8.

use crate::beacon::{MAX_AP_BEACONS_BOUND, MAX_TOTAL_BEACONS, MAX_VAP_PER_AP_BOUND};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
    /// Time (Unix seconds) the last server override was applied, or `0`.
    pub last_config_time: u32,
    /// Max beacons (AP + cell) per request.
    pub total_beacons: u32,
    /// Max AP beacons per request.
    pub max_ap_beacons: u32,
    /// Cache match percentage required when every beacon in the context must appear (cells).
    pub cache_match_all_threshold: u32,
    /// Cache match percentage required for the Wi-Fi Jaccard ratio.
    pub cache_match_used_threshold: u32,
    /// Below this many beacons in a scan, cache matching requires 100% instead
    /// of the percentage threshold above (`CACHE_BEACON_THRESHOLD`, supplemented
    /// from the original source; see SPEC_FULL.md §3).
    pub cache_beacon_threshold: u32,
    /// Cacheline max age before it is expired, in hours.
    pub cache_age_threshold: u32,
    /// Below this (negative) RSSI, an AP is a "weak outlier" candidate for eviction.
    pub cache_neg_rssi_threshold: i32,
    /// Max virtual-group patches per AP.
    pub max_vap_per_ap: u32,
    /// Max virtual-group patches per request.
    pub max_vap_per_rq: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            last_config_time: 0,
            total_beacons: 11,
            max_ap_beacons: 10,
            cache_match_all_threshold: 70,
            cache_match_used_threshold: 70,
            cache_beacon_threshold: 3,
            cache_age_threshold: 24,
            cache_neg_rssi_threshold: -90,
            max_vap_per_ap: 16,
            max_vap_per_rq: 16,
        }
    }
}

/// One field of a server-pushed config override. `set_option`/a decoded
/// response each apply a batch of these.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Override {
    TotalBeacons(u32),
    MaxApBeacons(u32),
    CacheMatchAllThreshold(u32),
    CacheMatchUsedThreshold(u32),
    CacheBeaconThreshold(u32),
    CacheAgeThreshold(u32),
    CacheNegRssiThreshold(i32),
    MaxVapPerAp(u32),
    MaxVapPerRq(u32),
}

/// Selects a single field for `get_option` (spec.md §6 "set_option /
/// get_option on the dynamic config").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionField {
    TotalBeacons,
    MaxApBeacons,
    CacheMatchAllThreshold,
    CacheMatchUsedThreshold,
    CacheBeaconThreshold,
    CacheAgeThreshold,
    CacheNegRssiThreshold,
    MaxVapPerAp,
    MaxVapPerRq,
}

impl Config {
    /// Apply one override, range-checked. Returns `true` if it was applied,
    /// `false` if it was out of range and silently dropped.
    pub fn apply_override(&mut self, over: Override) -> bool {
        let ok = match over {
            Override::TotalBeacons(v) => {
                let valid = v > 0 && (v as usize) <= MAX_TOTAL_BEACONS;
                if valid {
                    self.total_beacons = v;
                }
                valid
            }
            Override::MaxApBeacons(v) => {
                let valid = v > 0 && (v as usize) <= MAX_AP_BEACONS_BOUND && v <= self.total_beacons;
                if valid {
                    self.max_ap_beacons = v;
                }
                valid
            }
            Override::CacheMatchAllThreshold(v) => {
                let valid = (1..=100).contains(&v);
                if valid {
                    self.cache_match_all_threshold = v;
                }
                valid
            }
            Override::CacheMatchUsedThreshold(v) => {
                let valid = (1..=100).contains(&v);
                if valid {
                    self.cache_match_used_threshold = v;
                }
                valid
            }
            Override::CacheBeaconThreshold(v) => {
                let valid = (v as usize) <= MAX_TOTAL_BEACONS;
                if valid {
                    self.cache_beacon_threshold = v;
                }
                valid
            }
            Override::CacheAgeThreshold(v) => {
                let valid = v > 0 && v <= 24 * 30;
                if valid {
                    self.cache_age_threshold = v;
                }
                valid
            }
            Override::CacheNegRssiThreshold(v) => {
                let valid = (-128..=0).contains(&v);
                if valid {
                    self.cache_neg_rssi_threshold = v;
                }
                valid
            }
            Override::MaxVapPerAp(v) => {
                let valid = (v as usize) <= MAX_VAP_PER_AP_BOUND;
                if valid {
                    self.max_vap_per_ap = v;
                }
                valid
            }
            Override::MaxVapPerRq(v) => {
                let valid = (v as usize) <= MAX_VAP_PER_AP_BOUND * MAX_AP_BEACONS_BOUND;
                if valid {
                    self.max_vap_per_rq = v;
                }
                valid
            }
        };
        ok
    }

    /// Read back a single field (spec.md §6 `get_option`), widened to `i64`
    /// so the one signed field (`cache_neg_rssi_threshold`) and the eight
    /// unsigned ones share a return type.
    pub fn get(&self, field: OptionField) -> i64 {
        match field {
            OptionField::TotalBeacons => self.total_beacons as i64,
            OptionField::MaxApBeacons => self.max_ap_beacons as i64,
            OptionField::CacheMatchAllThreshold => self.cache_match_all_threshold as i64,
            OptionField::CacheMatchUsedThreshold => self.cache_match_used_threshold as i64,
            OptionField::CacheBeaconThreshold => self.cache_beacon_threshold as i64,
            OptionField::CacheAgeThreshold => self.cache_age_threshold as i64,
            OptionField::CacheNegRssiThreshold => self.cache_neg_rssi_threshold as i64,
            OptionField::MaxVapPerAp => self.max_vap_per_ap as i64,
            OptionField::MaxVapPerRq => self.max_vap_per_rq as i64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_override_is_dropped() {
        let mut c = Config::default();
        let before = c;
        assert!(!c.apply_override(Override::CacheMatchAllThreshold(0)));
        assert_eq!(c, before);
        assert!(!c.apply_override(Override::CacheMatchAllThreshold(101)));
        assert_eq!(c, before);
    }

    #[test]
    fn in_range_override_is_applied() {
        let mut c = Config::default();
        assert!(c.apply_override(Override::CacheMatchAllThreshold(55)));
        assert_eq!(c.cache_match_all_threshold, 55);
    }

    #[test]
    fn max_ap_beacons_cannot_exceed_total() {
        let mut c = Config::default();
        c.total_beacons = 5;
        assert!(!c.apply_override(Override::MaxApBeacons(6)));
        assert!(c.apply_override(Override::MaxApBeacons(5)));
    }

    #[test]
    fn get_reflects_an_applied_override() {
        let mut c = Config::default();
        assert!(c.apply_override(Override::CacheNegRssiThreshold(-80)));
        assert_eq!(c.get(OptionField::CacheNegRssiThreshold), -80);
    }
}
