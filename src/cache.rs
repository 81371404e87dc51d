//! Cacheline store: a fixed-size array of prior (scan, location) pairs with
//! similarity-based lookup (spec.md §4.5).
//!
//! Grounded in `examples/original_source/libel/beacons.h`'s
//! `sky_cacheline`/`CACHE_SIZE`/`CACHE_EMPTY` and the matching pass in
//! `examples/original_source/plugins/{ap,cell}_plugin_basic.c`'s `match()`.
//! Fixed-size array indexing, no list or tree, exactly as the teacher keeps
//! `Core::rx_buffer`/`tx_buffer` as plain fields rather than a queue.

use crate::beacon::{Beacon, BeaconVec};
use crate::gnss::Gnss;
use crate::location::Location;

/// Sentinel cacheline timestamp meaning "empty, never written".
pub const CACHE_EMPTY: u32 = 0;

/// One slot in the on-device cache.
#[derive(Debug, Clone, PartialEq)]
pub struct Cacheline {
    pub num_ap: usize,
    pub beacons: BeaconVec,
    pub time: u32,
    pub gnss: Option<Gnss>,
    pub loc: Location,
}

impl Cacheline {
    pub fn empty() -> Self {
        Cacheline { num_ap: 0, beacons: BeaconVec::new(), time: CACHE_EMPTY, gnss: None, loc: Location::unknown() }
    }

    pub fn is_empty(&self) -> bool {
        self.time == CACHE_EMPTY
    }

    pub fn clear(&mut self) {
        *self = Cacheline::empty();
    }

    pub fn num_beacons(&self) -> usize {
        self.beacons.len()
    }

    pub fn aps(&self) -> &[Beacon] {
        &self.beacons[..self.num_ap]
    }

    pub fn cells(&self) -> &[Beacon] {
        &self.beacons[self.num_ap..]
    }
}

/// Result of scoring the cache against the in-progress request context.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchOutcome {
    /// Index to serve a location from, if the match ratio cleared the threshold.
    pub get_from: Option<usize>,
    /// Index (or none, meaning "append to the oldest") to write the new scan into.
    pub save_to: Option<usize>,
    pub hit: bool,
}

/// A fixed-capacity array of cachelines, owned by the session.
#[derive(Debug, Clone)]
pub struct CacheStore<const N: usize> {
    pub lines: [Cacheline; N],
    /// Index most recently written, for diagnostics (supplements spec.md,
    /// see SPEC_FULL.md §3).
    pub newest: Option<usize>,
    /// Count of cache hits served, for diagnostics.
    pub hits: u32,
}

impl<const N: usize> CacheStore<N> {
    pub fn new() -> Self {
        CacheStore { lines: core::array::from_fn(|_| Cacheline::empty()), newest: None, hits: 0 }
    }

    /// Zero out any cacheline older than `age_threshold_hours`.
    pub fn expire(&mut self, now: u32, age_threshold_hours: u32) {
        if now == 0 {
            // No usable wall clock: skip expiry entirely (spec.md §4.7).
            return;
        }
        let max_age_s = age_threshold_hours.saturating_mul(3600);
        for line in self.lines.iter_mut() {
            if line.is_empty() {
                continue;
            }
            let age = now.saturating_sub(line.time);
            if age > max_age_s {
                line.clear();
            }
        }
    }

    pub fn oldest_index(&self) -> usize {
        self.lines
            .iter()
            .enumerate()
            .min_by_key(|(_, l)| if l.is_empty() { 0 } else { l.time })
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    /// Insert a newly-decoded (scan, location) pair. Writes to `save_to` if
    /// given, otherwise to the oldest slot. A non-successful location clears
    /// the target slot instead of caching a failure (spec.md §4.5).
    pub fn insert(&mut self, save_to: Option<usize>, scan: Cacheline) {
        let idx = save_to.unwrap_or_else(|| self.oldest_index());
        if scan.loc.status.is_success() {
            self.lines[idx] = scan;
            self.newest = Some(idx);
        } else {
            self.lines[idx].clear();
        }
    }
}

impl<const N: usize> Default for CacheStore<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// spec.md §4.4: a cacheline's GNSS fix is worse than the context's iff
/// both are present and the context's HPE is strictly better (lower).
pub fn gnss_worse(ctx_gnss: Option<&Gnss>, ctx_hpe: u32, line_gnss: Option<&Gnss>, line_hpe: u32) -> bool {
    match (ctx_gnss, line_gnss) {
        (Some(a), Some(b)) if a.is_present() && b.is_present() => ctx_hpe < line_hpe,
        _ => false,
    }
}

/// spec.md §4.5 "Cell-change gate": true (skip this cacheline) iff both have
/// at least one cell and no connected cell in the context appears in the
/// cacheline.
pub fn cell_change_gate(ctx_cells: &[Beacon], line_cells: &[Beacon]) -> bool {
    if ctx_cells.is_empty() || line_cells.is_empty() {
        return false;
    }
    let connected = ctx_cells.iter().find(|b| b.header().connected);
    let connected = match connected {
        Some(c) => c,
        None => return false,
    };
    let found = line_cells.iter().any(|lc| crate::plugin::cell::cell_equal(connected, lc));
    !found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cacheline_never_matches_time_zero() {
        let c = Cacheline::empty();
        assert!(c.is_empty());
        assert_eq!(c.time, CACHE_EMPTY);
    }

    #[test]
    fn expiry_clears_stale_lines() {
        let mut store: CacheStore<2> = CacheStore::new();
        store.lines[0].time = 1000;
        store.expire(1000 + 25 * 3600, 24);
        assert!(store.lines[0].is_empty());
    }

    #[test]
    fn expiry_keeps_fresh_lines() {
        let mut store: CacheStore<2> = CacheStore::new();
        store.lines[0].time = 1000;
        store.expire(1000 + 23 * 3600, 24);
        assert!(!store.lines[0].is_empty());
    }

    #[test]
    fn expiry_skipped_without_clock() {
        let mut store: CacheStore<2> = CacheStore::new();
        store.lines[0].time = 1000;
        store.expire(0, 24);
        assert!(!store.lines[0].is_empty());
    }

    #[test]
    fn gnss_gate_fires_only_when_context_strictly_better() {
        let mut a = Gnss::unknown();
        a.lat = 1.0;
        a.lon = 1.0;
        let mut b = a;
        assert!(!gnss_worse(Some(&a), 50, Some(&b), 50));
        assert!(gnss_worse(Some(&a), 10, Some(&b), 50));
        b.lat = f32::NAN;
        assert!(!gnss_worse(Some(&a), 10, Some(&b), 50));
    }

    #[test]
    fn failed_location_clears_slot_instead_of_caching() {
        let mut store: CacheStore<2> = CacheStore::new();
        store.lines[0].time = 500;
        let mut scan = Cacheline::empty();
        scan.time = 999;
        scan.loc.status = crate::location::LocationStatus::ApiServer;
        store.insert(Some(0), scan);
        assert!(store.lines[0].is_empty());
    }
}
