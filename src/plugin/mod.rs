//! Plugin dispatch: a chain-of-responsibility over pluggable ordering /
//! eviction / cache-match / cache-insert policies (spec.md §4.3).
//!
//! Grounded in `examples/rust-iot-rust-lpwan`'s generic `Mode` parameter on
//! `Core<R, T, B, M>` (`mac/csma.rs`'s `CsmaMode` swapped in for the no-op
//! `()` mode) — here the chain is a small `heapless::Vec` of statically
//! known plugin kinds instead of a single type parameter, because spec.md
//! requires *multiple* plugins to be tried in sequence (AP, then cell) and
//! to be swappable independently (basic vs. premium Wi-Fi).
//!
//! The original C plugin table (`examples/original_source/plugins/
//! plugin.h`) walks an `extern Sky_plugin_op_t` function-pointer array and
//! a validating `magic`; safe Rust's type system already rules out a
//! corrupt op table, so the magic check has no counterpart here.

pub mod ap_basic;
pub mod ap_premium;
pub mod cell;
pub mod chain;

use core::cmp::Ordering;

use crate::beacon::{Beacon, BeaconVec, Property};
use crate::cache::Cacheline;
use crate::config::Config;

/// Which side of the beacon vector an operation concerns. Lets a single
/// `remove_worst`/`cache_match` dispatch carry enough context for each
/// plugin to decide whether it applies, mirroring the original's
/// `is_ap_type`/`is_cell_type` guards at the top of every plugin function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Ap,
    Cell,
}

/// Result of scoring a request context against one cacheline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchScore {
    /// 0.0..=1.0 Jaccard-style match ratio.
    pub ratio: f32,
    /// Did `ratio` clear this plugin's configured threshold?
    pub hit: bool,
}

/// Outcome of one plugin's attempt to answer an operation (spec.md §4.3):
/// `Done` is SUCCESS ("I answered, stop"), `Declined` is FAILURE ("I
/// answered no, stop polling"), `Unhandled` is ERROR ("not my beacon type,
/// try the next plugin").
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome<T> {
    Done(T),
    Declined,
    Unhandled,
}

impl<T> Outcome<T> {
    pub fn is_unhandled(&self) -> bool {
        matches!(self, Outcome::Unhandled)
    }
}

/// A single policy: ordering, eviction, cache scoring, and cache insertion
/// for one class of beacon.
pub trait Plugin {
    fn name(&self) -> &'static str;

    /// Does `candidate` refer to the same physical beacon as `existing`
    /// (including virtual-group membership for Wi-Fi)? On a match, merges
    /// properties into `prop` (the winning retained beacon adopts
    /// `in_cache`/`used` if either side has it).
    fn equal(&self, existing: &Beacon, candidate: &Beacon, prop: &mut Property) -> Outcome<()>;

    /// Ordering comparator: `Greater` means `a` outranks `b`.
    fn compare(&self, a: &Beacon, b: &Beacon) -> Outcome<Ordering>;

    /// Evict one beacon of this plugin's `kind` from `beacons`. `num_ap` is
    /// updated in place if an AP was removed (including virtual-group
    /// compression, which can reduce the AP count without any removal by
    /// folding a child into an existing parent's virtual group).
    fn remove_worst(&self, kind: Kind, beacons: &mut BeaconVec, num_ap: &mut usize, config: &Config) -> Outcome<()>;

    /// Score the in-progress request (`beacons[..num_ap]` are APs,
    /// `beacons[num_ap..]` are cells) against `line`.
    fn cache_match(&self, beacons: &[Beacon], num_ap: usize, line: &Cacheline, config: &Config) -> Outcome<MatchScore>;

    /// Write this plugin's beacons into `line` (marking `in_cache`/`used`
    /// as appropriate) after a successful decode.
    fn add_to_cache(&self, beacons: &[Beacon], num_ap: usize, line: &mut Cacheline) -> Outcome<()>;
}
