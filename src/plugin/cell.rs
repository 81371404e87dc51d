//! Cellular beacon policy: per-kind equality, priority-biased ordering,
//! tail-eviction, and all-or-nothing cache matching.
//!
//! Grounded in `examples/original_source/plugins/cell_plugin_basic.c`
//! (`equal`/`compare`/`remove_worst`/`match`/`get_priority`).

use core::cmp::Ordering;

use super::{Kind, MatchScore, Outcome, Plugin};
use crate::beacon::{compare_cascade_with_priority, Beacon, BeaconType, BeaconVec, Property};
use crate::cache::Cacheline;
use crate::config::Config;

/// Priority bonus for a cell the device is currently attached to.
const CONNECTED: f32 = 0x200 as f32;
/// Priority bonus for a cell with a full (non-neighbor-measurement-report) identity.
const NON_NMR: f32 = 0x100 as f32;

/// `get_priority` from the original: attached and fully-identified cells
/// sort ahead of neighbor measurement reports of the same age/RSSI.
fn priority(b: &Beacon) -> f32 {
    let h = b.header();
    let mut score = 0.0;
    if h.connected {
        score += CONNECTED;
    }
    if let Beacon::Cell(c) = b {
        if !c.is_nmr() {
            score += NON_NMR;
        }
    }
    score
}

/// Are `a` and `b` the same physical cell? Only defined for two cells of
/// the same kind; the exact id fields compared depend on the radio family.
pub fn cell_equal(a: &Beacon, b: &Beacon) -> bool {
    let (a, b) = match (a, b) {
        (Beacon::Cell(a), Beacon::Cell(b)) => (a, b),
        _ => return false,
    };
    if a.kind != b.kind {
        return false;
    }
    match a.kind {
        BeaconType::Cdma => {
            a.id2 == b.id2
                && a.id3 == b.id3
                && a.id4 == b.id4
                && a.id2.is_some()
                && a.id3.is_some()
                && a.id4.is_some()
        }
        BeaconType::Gsm => {
            a.id1 == b.id1
                && a.id2 == b.id2
                && a.id3 == b.id3
                && a.id4 == b.id4
                && a.id1.is_some()
                && a.id2.is_some()
                && a.id3.is_some()
                && a.id4.is_some()
        }
        BeaconType::Lte | BeaconType::NbIot | BeaconType::Umts | BeaconType::Nr => {
            if !(a.id1 == b.id1 && a.id2 == b.id2 && a.id4 == b.id4) {
                return false;
            }
            if a.id1.is_none() || a.id2.is_none() || a.id4.is_none() {
                // Neighbor measurement report: fall back to frequency + id5.
                a.id5 == b.id5 && a.freq == b.freq && a.id5.is_some() && a.freq.is_some()
            } else {
                true
            }
        }
        BeaconType::Ap | BeaconType::Ble => false,
    }
}

/// Cell handling: one plugin covers every cellular radio family.
#[derive(Debug, Clone, Copy)]
pub struct CellBasic;

impl Plugin for CellBasic {
    fn name(&self) -> &'static str {
        "cell_basic"
    }

    fn equal(&self, existing: &Beacon, candidate: &Beacon, _prop: &mut Property) -> Outcome<()> {
        if !existing.is_cell() || !candidate.is_cell() {
            return Outcome::Unhandled;
        }
        if cell_equal(existing, candidate) {
            Outcome::Done(())
        } else {
            Outcome::Declined
        }
    }

    fn compare(&self, a: &Beacon, b: &Beacon) -> Outcome<Ordering> {
        if !a.is_cell() || !b.is_cell() {
            return Outcome::Unhandled;
        }
        Outcome::Done(compare_cascade_with_priority(a, b, priority(a), priority(b)))
    }

    fn remove_worst(&self, kind: Kind, beacons: &mut BeaconVec, num_ap: &mut usize, config: &Config) -> Outcome<()> {
        if kind != Kind::Cell {
            return Outcome::Unhandled;
        }
        let num_cells = beacons.len() - *num_ap;
        let cell_budget = (config.total_beacons - config.max_ap_beacons) as usize;
        if num_cells <= cell_budget {
            return Outcome::Declined;
        }
        // Cells are kept in priority order: the victim is simply the tail.
        let last = beacons.len() - 1;
        if !beacons[last].is_cell() {
            return Outcome::Unhandled;
        }
        beacons.remove(last);
        Outcome::Done(())
    }

    fn cache_match(&self, beacons: &[Beacon], num_ap: usize, line: &Cacheline, config: &Config) -> Outcome<MatchScore> {
        let ctx_cells = &beacons[num_ap..];
        if ctx_cells.is_empty() {
            return Outcome::Unhandled;
        }
        let line_cells = line.cells();
        let score = ctx_cells.iter().filter(|c| line_cells.iter().any(|lc| cell_equal(c, lc))).count();
        let ratio = if score == ctx_cells.len() { 1.0 } else { 0.0 };
        let hit = ratio * 100.0 > config.cache_match_all_threshold as f32;
        Outcome::Done(MatchScore { ratio, hit })
    }

    fn add_to_cache(&self, _beacons: &[Beacon], _num_ap: usize, _line: &mut Cacheline) -> Outcome<()> {
        // The original's cell plugin table leaves `add_to_cache` unset: the
        // AP plugin's whole-context copy covers cells too.
        Outcome::Unhandled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::Header;

    fn gsm(id1: i64, id2: i64, id3: i64, id4: i64, connected: bool) -> Beacon {
        Beacon::Cell(crate::beacon::Cell {
            header: Header::new(0, -70, connected),
            kind: BeaconType::Gsm,
            id1: Some(id1),
            id2: Some(id2),
            id3: Some(id3),
            id4: Some(id4),
            id5: None,
            freq: None,
            ta: None,
        })
    }

    #[test]
    fn gsm_equal_requires_all_four_ids() {
        let a = gsm(1, 2, 3, 4, false);
        let b = gsm(1, 2, 3, 4, false);
        assert!(cell_equal(&a, &b));
        let c = gsm(1, 2, 3, 5, false);
        assert!(!cell_equal(&a, &c));
    }

    #[test]
    fn lte_nmr_falls_back_to_freq_and_id5() {
        let mut a = crate::beacon::Cell {
            header: Header::new(0, -70, false),
            kind: BeaconType::Lte,
            id1: None,
            id2: None,
            id3: None,
            id4: None,
            id5: Some(99),
            freq: Some(1800),
            ta: None,
        };
        let mut b = a.clone();
        assert!(cell_equal(&Beacon::Cell(a.clone()), &Beacon::Cell(b.clone())));
        b.freq = Some(1900);
        assert!(!cell_equal(&Beacon::Cell(a.clone()), &Beacon::Cell(b.clone())));
        a.id5 = None;
        assert!(!cell_equal(&Beacon::Cell(a), &Beacon::Cell(b)));
    }

    #[test]
    fn connected_cell_outranks_unconnected_at_equal_age_and_rssi() {
        let connected = gsm(1, 2, 3, 4, true);
        let idle = gsm(5, 6, 7, 8, false);
        let plugin = CellBasic;
        assert_eq!(plugin.compare(&connected, &idle), Outcome::Done(Ordering::Greater));
    }

    #[test]
    fn cache_match_requires_every_context_cell_present() {
        let plugin = CellBasic;
        let config = Config::default();
        let mut line = Cacheline::empty();
        line.num_ap = 0;
        line.beacons.push(gsm(1, 2, 3, 4, false)).unwrap();
        let beacons = [gsm(1, 2, 3, 4, false)];
        let score = match plugin.cache_match(&beacons, 0, &line, &config) {
            Outcome::Done(s) => s,
            _ => panic!("expected Done"),
        };
        assert_eq!(score.ratio, 1.0);
        assert!(score.hit);
    }
}
