//! The registered plugin chain, tried in order for every op.

use core::cmp::Ordering;

use super::ap_basic::ApBasic;
use super::ap_premium::ApPremium;
use super::cell::CellBasic;
use super::{Kind, MatchScore, Outcome, Plugin};
use crate::beacon::{Beacon, BeaconVec, Property};
use crate::cache::Cacheline;
use crate::config::Config;
use crate::error::{Error, Result};

/// Max number of plugins in a chain (AP + cell, with room to grow).
pub const MAX_PLUGINS: usize = 4;

/// Statically known plugin implementations. An enum rather than `dyn
/// Plugin` trait objects: no heap, no vtable, and the full plugin set is
/// known at compile time (spec.md's "Ownership": plugin tables are
/// statically allocated).
#[derive(Debug, Clone, Copy)]
pub enum PluginKind {
    ApBasic(ApBasic),
    ApPremium(ApPremium),
    Cell(CellBasic),
}

impl Plugin for PluginKind {
    fn name(&self) -> &'static str {
        match self {
            PluginKind::ApBasic(p) => p.name(),
            PluginKind::ApPremium(p) => p.name(),
            PluginKind::Cell(p) => p.name(),
        }
    }

    fn equal(&self, existing: &Beacon, candidate: &Beacon, prop: &mut Property) -> Outcome<()> {
        match self {
            PluginKind::ApBasic(p) => p.equal(existing, candidate, prop),
            PluginKind::ApPremium(p) => p.equal(existing, candidate, prop),
            PluginKind::Cell(p) => p.equal(existing, candidate, prop),
        }
    }

    fn compare(&self, a: &Beacon, b: &Beacon) -> Outcome<Ordering> {
        match self {
            PluginKind::ApBasic(p) => p.compare(a, b),
            PluginKind::ApPremium(p) => p.compare(a, b),
            PluginKind::Cell(p) => p.compare(a, b),
        }
    }

    fn remove_worst(&self, kind: Kind, beacons: &mut BeaconVec, num_ap: &mut usize, config: &Config) -> Outcome<()> {
        match self {
            PluginKind::ApBasic(p) => p.remove_worst(kind, beacons, num_ap, config),
            PluginKind::ApPremium(p) => p.remove_worst(kind, beacons, num_ap, config),
            PluginKind::Cell(p) => p.remove_worst(kind, beacons, num_ap, config),
        }
    }

    fn cache_match(&self, beacons: &[Beacon], num_ap: usize, line: &Cacheline, config: &Config) -> Outcome<MatchScore> {
        match self {
            PluginKind::ApBasic(p) => p.cache_match(beacons, num_ap, line, config),
            PluginKind::ApPremium(p) => p.cache_match(beacons, num_ap, line, config),
            PluginKind::Cell(p) => p.cache_match(beacons, num_ap, line, config),
        }
    }

    fn add_to_cache(&self, beacons: &[Beacon], num_ap: usize, line: &mut Cacheline) -> Outcome<()> {
        match self {
            PluginKind::ApBasic(p) => p.add_to_cache(beacons, num_ap, line),
            PluginKind::ApPremium(p) => p.add_to_cache(beacons, num_ap, line),
            PluginKind::Cell(p) => p.add_to_cache(beacons, num_ap, line),
        }
    }
}

/// An ordered, deduplicated-by-name list of plugins, polled in registration
/// order for every op.
#[derive(Debug, Clone)]
pub struct PluginChain {
    plugins: heapless::Vec<PluginKind, MAX_PLUGINS>,
}

impl PluginChain {
    pub fn new() -> Self {
        PluginChain { plugins: heapless::Vec::new() }
    }

    /// The stock chain: basic Wi-Fi handling + cell handling.
    pub fn basic() -> Self {
        let mut chain = PluginChain::new();
        chain.register(PluginKind::ApBasic(ApBasic)).unwrap();
        chain.register(PluginKind::Cell(CellBasic)).unwrap();
        chain
    }

    /// The premium chain: virtual-group-aware Wi-Fi handling + cell handling.
    pub fn premium() -> Self {
        let mut chain = PluginChain::new();
        chain.register(PluginKind::ApPremium(ApPremium)).unwrap();
        chain.register(PluginKind::Cell(CellBasic)).unwrap();
        chain
    }

    /// Register a plugin. Re-registering a plugin with the same name is a
    /// silent success. Fails only if the chain is already full.
    pub fn register(&mut self, plugin: PluginKind) -> Result<()> {
        if self.plugins.iter().any(|p| p.name() == plugin.name()) {
            return Ok(());
        }
        self.plugins.push(plugin).map_err(|_| Error::ResourceUnavailable)
    }

    pub fn equal(&self, existing: &Beacon, candidate: &Beacon, prop: &mut Property) -> Result<bool> {
        for p in self.plugins.iter() {
            match p.equal(existing, candidate, prop) {
                Outcome::Done(()) => return Ok(true),
                Outcome::Declined => return Ok(false),
                Outcome::Unhandled => continue,
            }
        }
        Err(Error::NoPlugin)
    }

    pub fn compare(&self, a: &Beacon, b: &Beacon) -> Result<Ordering> {
        for p in self.plugins.iter() {
            match p.compare(a, b) {
                Outcome::Done(ord) => return Ok(ord),
                Outcome::Declined => return Ok(Ordering::Equal),
                Outcome::Unhandled => continue,
            }
        }
        Err(Error::NoPlugin)
    }

    pub fn remove_worst(&self, kind: Kind, beacons: &mut BeaconVec, num_ap: &mut usize, config: &Config) -> Result<()> {
        for p in self.plugins.iter() {
            match p.remove_worst(kind, beacons, num_ap, config) {
                Outcome::Done(()) => return Ok(()),
                Outcome::Declined => return Err(Error::TooMany),
                Outcome::Unhandled => continue,
            }
        }
        Err(Error::NoPlugin)
    }

    pub fn cache_match(&self, beacons: &[Beacon], num_ap: usize, line: &Cacheline, config: &Config) -> Result<MatchScore> {
        for p in self.plugins.iter() {
            match p.cache_match(beacons, num_ap, line, config) {
                Outcome::Done(score) => return Ok(score),
                Outcome::Declined => return Ok(MatchScore { ratio: 0.0, hit: false }),
                Outcome::Unhandled => continue,
            }
        }
        Err(Error::NoPlugin)
    }

    pub fn add_to_cache(&self, beacons: &[Beacon], num_ap: usize, line: &mut Cacheline) -> Result<()> {
        for p in self.plugins.iter() {
            match p.add_to_cache(beacons, num_ap, line) {
                Outcome::Done(()) => return Ok(()),
                Outcome::Declined => return Ok(()),
                Outcome::Unhandled => continue,
            }
        }
        Err(Error::NoPlugin)
    }
}

impl Default for PluginChain {
    fn default() -> Self {
        Self::basic()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_registration_is_silent_success() {
        let mut chain = PluginChain::basic();
        assert!(chain.register(PluginKind::ApBasic(ApBasic)).is_ok());
        assert_eq!(chain.plugins.len(), 2);
    }

    #[test]
    fn swapping_ap_plugin_keeps_cell_plugin() {
        let chain = PluginChain::premium();
        assert!(chain.plugins.iter().any(|p| matches!(p, PluginKind::ApPremium(_))));
        assert!(chain.plugins.iter().any(|p| matches!(p, PluginKind::Cell(_))));
    }
}
