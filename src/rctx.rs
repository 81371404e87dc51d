//! Request-context builder (RCTX): accepts one scan's worth of beacons,
//! keeps them ordered and deduplicated, and turns the finished scan into
//! either a cached location or a wire request (spec.md §4.2).
//!
//! Grounded in `examples/original_source/libel/libel.c`'s
//! `sky_new_request`/`sky_add_*_beacon`/`sky_add_gnss`/`sky_finalize_request`/
//! `sky_decode_response` for field validation and clamping, and in spec.md
//! §4.2's own "Insertion algorithm" text for the merge/insert/evict sequence
//! (which takes precedence over `beacons.c`'s older, non-plugin insertion
//! path per the design notes in spec.md §9).

use crate::beacon::{
    Ap, Beacon, BeaconVec, Cell, Header, TIME_UNAVAILABLE,
};
use crate::cache::{gnss_worse, Cacheline};
use crate::config::Config;
use crate::error::{Error, Finalize, Result};
use crate::gnss::Gnss;
use crate::location::Location;
use crate::plugin::Kind;
use crate::rand::RandomSource;
use crate::session::{AuthState, Session};
use crate::timer::Clock;
use log::{debug, trace, warn};

/// A scan was captured before March 1st 2019 is not a meaningful timestamp
/// (`TIMESTAMP_2019_03_01` in the original source).
pub const TIMESTAMP_2019_03_01: u32 = 1_551_398_400;

/// Max bytes of opaque uplink application data a request can carry.
pub const MAX_UL_APP_DATA: usize = 32;

/// Per-kind valid RSSI range, `examples/original_source/libel/libel.c`'s
/// `sky_add_cell_*_beacon`/`sky_add_ap_beacon` clamps.
fn age_from_timestamp(header_time: u32, timestamp: Option<u32>) -> u32 {
    match timestamp {
        Some(t) if header_time > t && t > TIMESTAMP_2019_03_01 => header_time - t,
        _ => TIME_UNAVAILABLE,
    }
}

fn clamp_rssi(rssi: Option<i16>, lo: i16, hi: i16) -> i16 {
    match rssi {
        Some(v) if v >= lo && v <= hi => v,
        _ => crate::beacon::RSSI_UNKNOWN,
    }
}

/// One AP observation as presented by the host.
pub struct ApScan {
    pub mac: [u8; 6],
    pub timestamp: Option<u32>,
    pub rssi: Option<i16>,
    pub frequency_mhz: Option<u32>,
    pub connected: bool,
}

/// One cellular observation as presented by the host. `id2`/etc follow
/// spec.md §3: `None` marks the id unknown (an NMR when `id2` is `None`).
pub struct CellScan {
    pub kind: crate::beacon::BeaconType,
    pub id1: Option<i64>,
    pub id2: Option<i64>,
    pub id3: Option<i64>,
    pub id4: Option<i64>,
    pub id5: Option<i64>,
    pub freq: Option<i32>,
    pub ta: Option<i32>,
    pub timestamp: Option<u32>,
    pub rssi: Option<i16>,
    pub connected: bool,
}

/// The per-kind RSSI band (min, max) dBm used to sanitize a raw reading to
/// [`crate::beacon::RSSI_UNKNOWN`] when out of range.
pub fn rssi_band(kind: crate::beacon::BeaconType) -> (i16, i16) {
    use crate::beacon::BeaconType::*;
    match kind {
        Ap | Ble => (-127, -10),
        Gsm => (-128, -32),
        Umts => (-120, -20),
        Cdma => (-140, -49),
        Lte => (-140, -40),
        NbIot => (-156, -44),
        Nr => (-140, -40),
    }
}

/// A fixed-size workspace being built up from one scan.
pub struct Rctx<'s> {
    session: &'s mut Session,
    pub beacons: BeaconVec,
    pub num_ap: usize,
    pub gnss: Option<Gnss>,
    pub time: u32,
    pub auth_state: AuthState,
    /// Host-supplied uplink application payload, carried opaquely alongside
    /// the location request (spec.md §4.6 "Carry ... `ul_app_data`").
    pub(crate) ul_app_data: heapless::Vec<u8, MAX_UL_APP_DATA>,
    /// Cacheline index to write into after a successful decode, set by
    /// [`Rctx::finalize_request`]'s cache scoring pass (spec.md §4.5
    /// "Best-put selection").
    pending_save_to: Option<usize>,
}

impl<'s> Rctx<'s> {
    /// spec.md §4.2 `new_request`: zero beacon counts, set GNSS unknown,
    /// stamp the open time, derive the auth state snapshot from the
    /// session. Fails `SERVICE_DENIED` if TBR backoff demands a usable
    /// clock and none is available (spec.md §4.6 `REGISTERED` backoff).
    pub fn new_request(session: &'s mut Session, clock: &dyn Clock) -> Result<Self> {
        let now = clock.now();
        if session.auth_state != AuthState::Disabled && now == 0 && session.needs_time_backoff {
            warn!("new_request: no clock available while TBR backoff is pending, denying");
            return Err(Error::ServiceDenied);
        }
        trace!("new_request at time={}", now);
        Ok(Rctx {
            time: now,
            auth_state: session.auth_state,
            beacons: BeaconVec::new(),
            num_ap: 0,
            gnss: None,
            ul_app_data: heapless::Vec::new(),
            session,
            pending_save_to: None,
        })
    }

    /// Read-only access to the owning session, for [`crate::codec`].
    pub(crate) fn session(&self) -> &Session {
        self.session
    }

    /// Worst-case byte length `finalize_request` can write to `buf`
    /// (`sizeof_request_buf`, spec.md §6), so the host can size its request
    /// buffer before ever calling `finalize_request`.
    pub fn sizeof_request_buf() -> usize {
        crate::codec::MAX_REQUEST_LEN
    }

    /// Attach an opaque uplink application payload to this request
    /// (spec.md §4.6). Fails if `data` exceeds [`MAX_UL_APP_DATA`].
    pub fn set_ul_app_data(&mut self, data: &[u8]) -> Result<()> {
        self.ul_app_data.clear();
        self.ul_app_data.extend_from_slice(data).map_err(|_| Error::BadParameters)
    }

    fn cell_budget(&self) -> usize {
        (self.session.config.total_beacons - self.session.config.max_ap_beacons) as usize
    }

    /// spec.md §4.2 "Insertion algorithm (add_beacon)".
    fn add_beacon(&mut self, candidate: Beacon) -> Result<()> {
        if candidate.is_cell() {
            let num_cells = self.beacons.len() - self.num_ap;
            if num_cells > self.cell_budget() {
                return Err(Error::TooMany);
            }
        }

        let mut merge_prop = crate::beacon::Property::empty();
        let mut merge_idx = None;
        for (i, existing) in self.beacons.iter().enumerate() {
            if self.session.plugins.equal(existing, &candidate, &mut merge_prop)? {
                merge_idx = Some(i);
                break;
            }
        }
        if let Some(i) = merge_idx {
            let existing = &mut self.beacons[i];
            existing.header_mut().priority = candidate.header().priority.max(existing.header().priority);
            if candidate.header().age < existing.header().age {
                existing.header_mut().age = candidate.header().age;
            }
            if let Beacon::Ap(ap) = existing {
                ap.property.insert(merge_prop);
            }
            return Ok(());
        }

        // Locate the insertion index among beacons of the same family
        // (APs before cells; ordered within each family by `compare`).
        let is_ap = candidate.is_ap();
        let (start, end) = if is_ap { (0, self.num_ap) } else { (self.num_ap, self.beacons.len()) };
        let mut idx = end;
        for i in start..end {
            if self.session.plugins.compare(&candidate, &self.beacons[i])? == core::cmp::Ordering::Greater {
                idx = i;
                break;
            }
        }
        self.beacons.insert(idx, candidate).map_err(|_| Error::TooMany)?;
        if is_ap {
            self.num_ap += 1;
        }

        let kind = if is_ap { Kind::Ap } else { Kind::Cell };
        let over = |beacons: &BeaconVec, num_ap: usize| -> bool {
            if is_ap {
                num_ap > self.session.config.max_ap_beacons as usize
            } else {
                beacons.len() - num_ap > self.cell_budget()
            }
        };
        while over(&self.beacons, self.num_ap) {
            if self
                .session
                .plugins
                .remove_worst(kind, &mut self.beacons, &mut self.num_ap, &self.session.config)
                .is_err()
            {
                // Undo the insert that triggered this and surface TOO_MANY
                // (spec.md §4.2 point 4 / §9 "cell remove_worst cannot
                // remove anything").
                self.beacons.remove(idx);
                if is_ap {
                    self.num_ap -= 1;
                }
                debug!("add_beacon: remove_worst could not free room for a new {:?}", kind);
                return Err(Error::TooMany);
            }
        }
        Ok(())
    }

    pub fn add_ap_beacon(&mut self, scan: ApScan) -> Result<()> {
        if !Ap::is_valid_mac(&scan.mac) {
            return Err(Error::BadParameters);
        }
        let (lo, hi) = rssi_band(crate::beacon::BeaconType::Ap);
        let rssi = clamp_rssi(scan.rssi, lo, hi);
        let freq = match scan.frequency_mhz {
            Some(f) if (2400..=6000).contains(&f) => f,
            _ => 0,
        };
        let age = age_from_timestamp(self.time, scan.timestamp);
        let header = Header::new(age, rssi, scan.connected);
        self.add_beacon(Beacon::Ap(Ap::new(header, scan.mac, freq)))
    }

    pub fn add_cell_beacon(&mut self, scan: CellScan) -> Result<()> {
        let (lo, hi) = rssi_band(scan.kind);
        let rssi = clamp_rssi(scan.rssi, lo, hi);
        let age = age_from_timestamp(self.time, scan.timestamp);
        let header = Header::new(age, rssi, scan.connected);
        let cell = Cell {
            header,
            kind: scan.kind,
            id1: scan.id1,
            id2: scan.id2,
            id3: scan.id3,
            id4: scan.id4,
            id5: scan.id5,
            freq: scan.freq,
            ta: scan.ta,
        };
        self.add_beacon(Beacon::Cell(cell))
    }

    pub fn add_gnss(
        &mut self,
        lat: f32,
        lon: f32,
        hpe: u32,
        alt: f32,
        vpe: u32,
        speed: f32,
        bearing: f32,
        nsat: u32,
        timestamp: Option<u32>,
    ) {
        self.gnss = Some(Gnss {
            lat,
            lon,
            hpe,
            alt,
            vpe,
            speed,
            bearing,
            nsat,
            age: age_from_timestamp(self.time, timestamp),
        });
    }

    fn context_hpe(&self) -> u32 {
        self.gnss.as_ref().map(|g| g.hpe).unwrap_or(u32::MAX)
    }

    /// spec.md §4.5: expire stale cachelines, then score every remaining one
    /// through the plugin chain, applying the cell-change and GNSS gates
    /// first. Returns the best `(get_from, save_to, hit)` triple.
    fn score_cache(&mut self) -> Result<crate::cache::MatchOutcome> {
        self.session.cache.expire(self.time, self.session.config.cache_age_threshold);

        let ctx_cells = &self.beacons[self.num_ap..];
        let mut best_get: Option<(usize, f32)> = None;
        let mut best_put: Option<usize> = None;
        // A GNSS-only scan (no beacons at all) has nothing for the AP/cell
        // plugins to compare against cached beacons — every plugin would
        // decline, leaving no plugin to answer. Score it as an unconditional
        // miss instead of asking the chain.
        let beaconless = self.beacons.is_empty();

        for i in 0..self.session.cache.lines.len() {
            let line = &self.session.cache.lines[i];
            if line.is_empty() {
                if best_put.is_none() {
                    best_put = Some(i);
                }
                continue;
            }
            if gnss_worse(self.gnss.as_ref(), self.context_hpe(), line.gnss.as_ref(), line.loc.hpe as u32) {
                continue;
            }
            if crate::cache::cell_change_gate(ctx_cells, line.cells()) {
                continue;
            }

            let line = &self.session.cache.lines[i];
            let score = if beaconless {
                crate::plugin::MatchScore { ratio: 0.0, hit: false }
            } else {
                self.session.plugins.cache_match(&self.beacons, self.num_ap, line, &self.session.config)?
            };
            if best_put.is_none() {
                best_put = Some(i);
            } else if let Some(p) = best_put {
                let prev = &self.session.cache.lines[p];
                if !prev.is_empty() {
                    let prev_score = if beaconless {
                        crate::plugin::MatchScore { ratio: 0.0, hit: false }
                    } else {
                        self.session.plugins.cache_match(&self.beacons, self.num_ap, prev, &self.session.config)?
                    };
                    if score.ratio > prev_score.ratio {
                        best_put = Some(i);
                    }
                }
            }
            if score.hit {
                if best_get.map(|(_, r)| score.ratio > r).unwrap_or(true) {
                    best_get = Some((i, score.ratio));
                }
            }
        }

        // spec.md §3 cache_beacon_threshold: below this many beacons, a get
        // requires an exact (100%) ratio rather than the percentage threshold.
        let total = self.beacons.len();
        if total <= self.session.config.cache_beacon_threshold as usize {
            if let Some((idx, ratio)) = best_get {
                if ratio < 1.0 {
                    best_get = None;
                    let _ = idx;
                }
            }
        }

        Ok(crate::cache::MatchOutcome {
            get_from: best_get.map(|(i, _)| i),
            save_to: best_put,
            hit: best_get.is_some(),
        })
    }

    /// spec.md §4.2 `finalize_request`. `rand` supplies the per-message AES
    /// IV; only consulted when a request actually needs to go on the wire.
    pub fn finalize_request(&mut self, rand: &mut dyn RandomSource, buf: &mut [u8]) -> Result<(Finalize, Location, usize)> {
        if self.beacons.is_empty() && self.gnss.is_none() {
            return Err(Error::NoBeacons);
        }

        let outcome = self.score_cache()?;
        self.pending_save_to = outcome.save_to;
        if outcome.hit {
            let idx = outcome.get_from.unwrap();
            self.session.cache.hits += 1;
            debug!("finalize_request: served from cacheline {}", idx);
            return Ok((Finalize::Location, self.session.cache.lines[idx].loc.clone(), 0));
        }

        let written = crate::codec::encode_request(self, rand, buf)?;
        debug!("finalize_request: cache miss, encoded {} bytes for the wire", written);
        Ok((Finalize::Request, Location::unknown(), written))
    }

    /// spec.md §4.2 `decode_response`.
    pub fn decode_response(&mut self, buf: &mut [u8]) -> Result<Location> {
        let decoded = crate::codec::decode_response(self.session, buf)?;

        for over in decoded.overrides.iter() {
            self.session.config.apply_override(*over);
        }
        self.session.config.last_config_time = self.time;

        for (i, used) in decoded.used_aps.iter().enumerate().take(self.num_ap) {
            if *used {
                if let Beacon::Ap(ap) = &mut self.beacons[i] {
                    ap.property.insert(crate::beacon::Property::USED);
                }
            }
        }

        let mut line = Cacheline {
            num_ap: self.num_ap,
            beacons: BeaconVec::new(),
            time: self.time,
            gnss: self.gnss,
            loc: decoded.loc.clone(),
        };
        self.session.plugins.add_to_cache(&self.beacons, self.num_ap, &mut line)?;
        self.session.cache.insert(self.pending_save_to, line);
        trace!("decode_response: cached into line {:?}", self.pending_save_to);

        Ok(decoded.loc)
    }
}
