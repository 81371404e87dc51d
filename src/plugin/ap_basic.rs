//! Basic Wi-Fi policy: MAC equality, the shared comparator cascade, and an
//! RSSI-distribution eviction ladder with no virtual-group handling.
//!
//! Grounded in `examples/original_source/plugins/ap_plugin_basic.c`
//! (`equal`, `remove_worst_ap_by_rssi`, `match`, `to_cache`). The original's
//! `remove_virtual_ap`/`remove_worst_ap_by_age` steps are folded entirely
//! into the premium plugin's virtual-group compression pass (spec.md §4.2
//! "remove_worst (Wi-Fi, premium)"); this plugin keeps only the
//! RSSI-distribution ladder spec.md assigns to the basic case.

use core::cmp::Ordering;

use super::{Kind, MatchScore, Outcome, Plugin};
use crate::beacon::{compare_cascade, Beacon, BeaconVec, Property};
use crate::cache::Cacheline;
use crate::config::Config;

fn ap_mac_eq(a: &Beacon, b: &Beacon) -> bool {
    match (a.as_ap(), b.as_ap()) {
        (Some(a), Some(b)) => a.mac == b.mac,
        _ => false,
    }
}

/// Visit indices bisecting outward from `mid` (mid, mid-1, mid+1, mid-2, ...)
/// until one satisfies `pred`, mirroring the original's middle-out search.
fn bisect_search(mid: usize, len: usize, pred: impl Fn(usize) -> bool) -> Option<usize> {
    let mut jump: i32 = 0;
    let mut up_down: i32 = -1;
    let mut i: i32 = mid as i32;
    while i >= 0 && (i as usize) < len {
        if pred(i as usize) {
            return Some(i as usize);
        }
        jump += 1;
        i += up_down * jump;
        up_down = -up_down;
    }
    None
}

/// Basic Wi-Fi handling: no virtual-group compression.
#[derive(Debug, Clone, Copy)]
pub struct ApBasic;

impl Plugin for ApBasic {
    fn name(&self) -> &'static str {
        "ap_basic"
    }

    fn equal(&self, existing: &Beacon, candidate: &Beacon, prop: &mut Property) -> Outcome<()> {
        let (a, b) = match (existing.as_ap(), candidate.as_ap()) {
            (Some(a), Some(b)) => (a, b),
            _ => return Outcome::Unhandled,
        };
        if a.mac == b.mac {
            if b.property.contains(Property::IN_CACHE) {
                prop.insert(Property::IN_CACHE);
            }
            Outcome::Done(())
        } else {
            Outcome::Declined
        }
    }

    fn compare(&self, a: &Beacon, b: &Beacon) -> Outcome<Ordering> {
        if !a.is_ap() || !b.is_ap() {
            return Outcome::Unhandled;
        }
        Outcome::Done(compare_cascade(a, b))
    }

    fn remove_worst(&self, kind: Kind, beacons: &mut BeaconVec, num_ap: &mut usize, config: &Config) -> Outcome<()> {
        if kind != Kind::Ap {
            return Outcome::Unhandled;
        }
        let n = *num_ap;
        if n == 0 || n <= config.max_ap_beacons as usize {
            return Outcome::Declined;
        }
        if !beacons[..n].iter().all(Beacon::is_ap) {
            return Outcome::Unhandled;
        }

        let effective = |b: &Beacon| b.header().effective_rssi();
        let strongest = effective(&beacons[0]);
        let weakest = effective(&beacons[n - 1]);
        let band_range = (strongest - weakest) as f32 / (n as f32 - 1.0);

        let in_cache = |beacons: &BeaconVec, i: usize| beacons[i].as_ap().unwrap().property.contains(Property::IN_CACHE);
        let connected = |beacons: &BeaconVec, i: usize| beacons[i].header().connected;

        let reject = if band_range < 0.5 {
            let mid = n / 2;
            bisect_search(mid, n, |i| !in_cache(beacons, i) && !connected(beacons, i))
                .or_else(|| bisect_search(mid, n, |i| !in_cache(beacons, i)))
                .unwrap_or(mid)
        } else if weakest < config.cache_neg_rssi_threshold as i16 {
            (1..n)
                .rev()
                .find(|&i| effective(&beacons[i]) < config.cache_neg_rssi_threshold as i16 && !connected(beacons, i) && !in_cache(beacons, i))
                .or_else(|| (1..n).rev().find(|&i| effective(&beacons[i]) < config.cache_neg_rssi_threshold as i16 && !in_cache(beacons, i)))
                .unwrap_or(n - 1)
        } else {
            let ideal = |i: usize| strongest as f32 - (i as f32 * band_range);
            let poorest = |skip_cached: bool| {
                let mut reject = None;
                let mut worst = 0.0f32;
                for i in 1..n - 1 {
                    let diff = (effective(&beacons[i]) as f32 - ideal(i)).abs();
                    let eligible = if skip_cached { !in_cache(beacons, i) && !connected(beacons, i) } else { !connected(beacons, i) };
                    if eligible && diff >= worst {
                        worst = diff;
                        reject = Some(i);
                    }
                }
                reject
            };
            poorest(true).or_else(|| poorest(false)).unwrap_or_else(|| {
                if !in_cache(beacons, n - 1) {
                    n - 1
                } else if !in_cache(beacons, 0) {
                    0
                } else {
                    n / 2
                }
            })
        };

        beacons.remove(reject);
        *num_ap -= 1;
        Outcome::Done(())
    }

    fn cache_match(&self, beacons: &[Beacon], num_ap: usize, line: &Cacheline, config: &Config) -> Outcome<MatchScore> {
        if num_ap == 0 {
            return Outcome::Unhandled;
        }
        let ctx_aps = &beacons[..num_ap];
        let line_aps = line.aps();
        let score = ctx_aps.iter().filter(|c| line_aps.iter().any(|l| ap_mac_eq(c, l))).count();
        let union = ctx_aps.len() + line_aps.len() - score;
        let ratio = if union == 0 { 0.0 } else { score as f32 / union as f32 };
        let hit = ratio * 100.0 > config.cache_match_used_threshold as f32;
        Outcome::Done(MatchScore { ratio, hit })
    }

    fn add_to_cache(&self, beacons: &[Beacon], num_ap: usize, line: &mut Cacheline) -> Outcome<()> {
        line.beacons.clear();
        for (i, b) in beacons.iter().enumerate() {
            let mut copy = b.clone();
            if i < num_ap {
                if let Beacon::Ap(ap) = &mut copy {
                    ap.property.insert(Property::IN_CACHE);
                }
            }
            let _ = line.beacons.push(copy);
        }
        line.num_ap = num_ap;
        Outcome::Done(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::{Ap, Header};

    fn ap(mac: [u8; 6], rssi: i16, in_cache: bool, connected: bool) -> Beacon {
        let mut a = Ap::new(Header::new(0, rssi, connected), mac, 2412);
        if in_cache {
            a.property.insert(Property::IN_CACHE);
        }
        Beacon::Ap(a)
    }

    #[test]
    fn equal_matches_on_mac_and_merges_in_cache() {
        let plugin = ApBasic;
        let mac = [1, 2, 3, 4, 5, 6];
        let existing = ap(mac, -50, false, false);
        let candidate = ap(mac, -60, true, false);
        let mut prop = Property::empty();
        assert_eq!(plugin.equal(&existing, &candidate, &mut prop), Outcome::Done(()));
        assert!(prop.contains(Property::IN_CACHE));
    }

    #[test]
    fn weak_outlier_removed_when_budget_exceeded() {
        let plugin = ApBasic;
        let mut config = Config::default();
        config.max_ap_beacons = 4;
        let mut beacons: BeaconVec = BeaconVec::new();
        // Strong spread (band_range >= 0.5) with a very weak tail beacon.
        for (i, rssi) in [-30i16, -45, -60, -75, -95].into_iter().enumerate() {
            beacons.push(ap([0, 0, 0, 0, 0, i as u8], rssi, false, false)).unwrap();
        }
        let mut num_ap = 5;
        let before = beacons.len();
        let outcome = plugin.remove_worst(Kind::Ap, &mut beacons, &mut num_ap, &config);
        assert_eq!(outcome, Outcome::Done(()));
        assert_eq!(beacons.len(), before - 1);
        assert_eq!(num_ap, 4);
    }

    #[test]
    fn no_removal_below_budget() {
        let plugin = ApBasic;
        let config = Config::default();
        let mut beacons: BeaconVec = BeaconVec::new();
        beacons.push(ap([0, 0, 0, 0, 0, 1], -50, false, false)).unwrap();
        let mut num_ap = 1;
        assert_eq!(plugin.remove_worst(Kind::Ap, &mut beacons, &mut num_ap, &config), Outcome::Declined);
    }

    #[test]
    fn cache_match_jaccard_ratio() {
        let plugin = ApBasic;
        let config = Config::default();
        let mut line = Cacheline::empty();
        line.num_ap = 2;
        line.beacons.push(ap([0, 0, 0, 0, 0, 1], -50, false, false)).unwrap();
        line.beacons.push(ap([0, 0, 0, 0, 0, 2], -50, false, false)).unwrap();
        let beacons = [ap([0, 0, 0, 0, 0, 1], -50, false, false), ap([0, 0, 0, 0, 0, 3], -50, false, false)];
        let score = match plugin.cache_match(&beacons, 2, &line, &config) {
            Outcome::Done(s) => s,
            _ => panic!("expected Done"),
        };
        // intersection = 1, union = 2 + 2 - 1 = 3
        assert!((score.ratio - (1.0 / 3.0)).abs() < 1e-6);
    }
}
