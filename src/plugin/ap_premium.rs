//! Premium Wi-Fi policy: adds virtual-group (VAP) compression ahead of the
//! basic RSSI-distribution eviction ladder, and treats VAP membership as
//! equivalence for both `equal` and cache scoring.
//!
//! Grounded in `examples/original_source/plugins/premium_ap_plugin.c`
//! (`add_child_to_VirtualGroup`, `ap_beacon_in_vg`, `beacon_score`).

use core::cmp::Ordering;

use super::ap_basic::ApBasic;
use super::{Kind, MatchScore, Outcome, Plugin};
use crate::beacon::{compare_cascade_with_priority, Ap, Beacon, BeaconVec, Property, VapPatch, MAC_SIZE, RSSI_UNKNOWN};
use crate::cache::Cacheline;
use crate::config::Config;

/// Apply one virtual-group patch to a parent MAC to recover the child's MAC.
fn apply_patch(mac: [u8; MAC_SIZE], patch: &VapPatch) -> [u8; MAC_SIZE] {
    let mut m = mac;
    let byte = (patch.nibble_idx / 2) as usize;
    if patch.nibble_idx % 2 == 0 {
        m[byte] = (m[byte] & 0x0f) | (patch.value << 4);
    } else {
        m[byte] = (m[byte] & 0xf0) | (patch.value & 0x0f);
    }
    m
}

/// Does `ap`'s virtual group (itself or any patch-derived child) include `mac`?
fn group_contains(ap: &Ap, mac: &[u8; MAC_SIZE]) -> bool {
    &ap.mac == mac || ap.vg.iter().any(|p| apply_patch(ap.mac, p) == *mac)
}

fn vg_equivalent(a: &Beacon, b: &Beacon) -> bool {
    match (a.as_ap(), b.as_ap()) {
        (Some(a), Some(b)) => group_contains(a, &b.mac) || group_contains(b, &a.mac),
        _ => false,
    }
}

/// Priority bias for ordering: bigger virtual groups and cache residency
/// nudge an AP ahead of an otherwise-tied peer (spec.md §4.2 point 1).
fn priority(b: &Beacon) -> f32 {
    match b.as_ap() {
        Some(ap) => {
            let group_bonus = (ap.group_size() as f32 - 1.0).max(0.0);
            let cache_bonus = if ap.property.contains(Property::IN_CACHE) { 0.5 } else { 0.0 };
            group_bonus + cache_bonus
        }
        None => 0.0,
    }
}

/// Fold `child` into `parent`'s virtual group. Returns `false` (no room) if
/// the patch is new and the group is already at `max_vap_per_ap`.
fn merge_into_parent(parent: &mut Ap, child: &Ap, patch: VapPatch, max_vap_per_ap: usize) -> bool {
    let dup = parent.vg.iter().any(|p| *p == patch);
    if !dup && parent.vg.len() >= max_vap_per_ap {
        return false;
    }

    if child.header.rssi != RSSI_UNKNOWN {
        if parent.header.rssi == RSSI_UNKNOWN {
            parent.header.rssi = child.header.rssi;
        } else {
            let (ps, cs) = (parent.group_size() as f32, child.group_size() as f32);
            let avg = (parent.header.effective_rssi() as f32 * ps + child.header.effective_rssi() as f32 * cs) / (ps + cs);
            parent.header.rssi = avg.round() as i16;
        }
    }

    if !dup {
        let _ = parent.vg.push(patch);
        let _ = parent.vg_property.push(child.property);
    }

    for (i, cp) in child.vg.iter().enumerate() {
        if parent.vg.iter().any(|p| p == cp) {
            continue;
        }
        if parent.vg.len() >= max_vap_per_ap {
            break;
        }
        let _ = parent.vg.push(*cp);
        let _ = parent.vg_property.push(child.vg_property[i]);
    }
    true
}

/// Find the first pair of similar APs among `beacons[..n]`, parent first
/// (the numerically lower MAC is always the parent).
fn find_similar_pair(beacons: &BeaconVec, n: usize) -> Option<(usize, usize, VapPatch)> {
    for i in 0..n {
        for j in (i + 1)..n {
            let a = beacons[i].as_ap()?;
            let b = beacons[j].as_ap()?;
            if a.mac <= b.mac {
                if let Some(patch) = a.similar_to(b) {
                    return Some((i, j, patch));
                }
            } else if let Some(patch) = b.similar_to(a) {
                return Some((j, i, patch));
            }
        }
    }
    None
}

fn compress_once(beacons: &mut BeaconVec, num_ap: &mut usize, config: &Config) -> bool {
    let (pi, ci, patch) = match find_similar_pair(beacons, *num_ap) {
        Some(v) => v,
        None => return false,
    };
    let child = beacons[ci].as_ap().unwrap().clone();
    let merged = match beacons[pi].as_ap_mut() {
        Some(parent) => merge_into_parent(parent, &child, patch, config.max_vap_per_ap as usize),
        None => false,
    };
    if !merged {
        return false;
    }
    beacons.remove(ci);
    *num_ap -= 1;
    beacons[..*num_ap].sort_unstable_by(|x, y| y.header().effective_rssi().cmp(&x.header().effective_rssi()));
    true
}

/// Wi-Fi handling with virtual-group (VAP) compression.
#[derive(Debug, Clone, Copy)]
pub struct ApPremium;

impl Plugin for ApPremium {
    fn name(&self) -> &'static str {
        "ap_premium"
    }

    fn equal(&self, existing: &Beacon, candidate: &Beacon, prop: &mut Property) -> Outcome<()> {
        if !existing.is_ap() || !candidate.is_ap() {
            return Outcome::Unhandled;
        }
        if vg_equivalent(existing, candidate) {
            if candidate.as_ap().unwrap().property.contains(Property::IN_CACHE) {
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
        Outcome::Done(compare_cascade_with_priority(a, b, priority(a), priority(b)))
    }

    fn remove_worst(&self, kind: Kind, beacons: &mut BeaconVec, num_ap: &mut usize, config: &Config) -> Outcome<()> {
        if kind != Kind::Ap {
            return Outcome::Unhandled;
        }
        let n = *num_ap;
        if n == 0 || n <= config.max_ap_beacons as usize {
            return Outcome::Declined;
        }
        if compress_once(beacons, num_ap, config) {
            return Outcome::Done(());
        }
        ApBasic.remove_worst(kind, beacons, num_ap, config)
    }

    fn cache_match(&self, beacons: &[Beacon], num_ap: usize, line: &Cacheline, config: &Config) -> Outcome<MatchScore> {
        if num_ap == 0 {
            return Outcome::Unhandled;
        }
        let ctx_aps = &beacons[..num_ap];
        let line_aps = line.aps();
        let score = ctx_aps.iter().filter(|c| line_aps.iter().any(|l| vg_equivalent(c, l))).count();
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
    use crate::beacon::Header;

    fn ap(mac: [u8; 6], rssi: i16) -> Beacon {
        Beacon::Ap(Ap::new(Header::new(0, rssi, false), mac, 2412))
    }

    #[test]
    fn similar_pair_folds_into_parent_and_averages_rssi() {
        let config = Config::default();
        let mut beacons: BeaconVec = BeaconVec::new();
        beacons.push(ap([0, 0, 0, 0, 0, 0x10], -40)).unwrap();
        beacons.push(ap([0, 0, 0, 0, 0, 0x1f], -60)).unwrap();
        let mut num_ap = 2;
        assert!(compress_once(&mut beacons, &mut num_ap, &config));
        assert_eq!(num_ap, 1);
        assert_eq!(beacons.len(), 1);
        let parent = beacons[0].as_ap().unwrap();
        assert_eq!(parent.vg.len(), 1);
        assert_eq!(parent.header.rssi, -50);
    }

    #[test]
    fn vg_membership_counts_as_cache_match() {
        let plugin = ApPremium;
        let config = Config::default();
        let mut parent = Ap::new(Header::new(0, -40, false), [0, 0, 0, 0, 0, 0x10], 2412);
        parent.vg.push(VapPatch { nibble_idx: 11, value: 0x0f }).unwrap();
        let mut line = Cacheline::empty();
        line.num_ap = 1;
        line.beacons.push(Beacon::Ap(parent)).unwrap();

        let child = ap([0, 0, 0, 0, 0, 0x1f], -55);
        let score = match plugin.cache_match(&[child], 1, &line, &config) {
            Outcome::Done(s) => s,
            _ => panic!("expected Done"),
        };
        assert_eq!(score.ratio, 1.0);
    }

    #[test]
    fn no_room_in_group_declines_compression() {
        let mut config = Config::default();
        config.max_vap_per_ap = 0;
        let mut beacons: BeaconVec = BeaconVec::new();
        beacons.push(ap([0, 0, 0, 0, 0, 0x10], -40)).unwrap();
        beacons.push(ap([0, 0, 0, 0, 0, 0x1f], -60)).unwrap();
        let mut num_ap = 2;
        assert!(!compress_once(&mut beacons, &mut num_ap, &config));
        assert_eq!(num_ap, 2);
    }
}
