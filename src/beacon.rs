//! Beacon model: the tagged union of observable radios (spec.md §3), the
//! comparator cascade used to order and evict them, and MAC-nibble virtual
//! group similarity used by the premium Wi-Fi plugin.
//!
//! Grounded in `examples/original_source/libel/beacons.h` (`struct header`,
//! `struct ap`, `struct cell`, `struct ble`, the `COMPARE_*`/`EFFECTIVE_RSSI`
//! macros) and expressed the teacher's way: a sum type instead of a tagged
//! C union (`examples/rust-iot-rust-lpwan` design notes apply the same move
//! for `FrameContent`).

use core::cmp::Ordering;

/// MAC address length in bytes.
pub const MAC_SIZE: usize = 6;
/// BLE UUID length in bytes.
pub const UUID_SIZE: usize = 16;
/// Compile-time upper bound on virtual-group patches per AP (runtime
/// `max_vap_per_ap` is clamped to this by [`crate::config`]).
pub const MAX_VAP_PER_AP_BOUND: usize = 16;

/// Hard compile-time ceiling on the number of beacons a request context or
/// cacheline can hold (`TOTAL_BEACONS` in the original); runtime
/// `Config::total_beacons` is clamped to this.
pub const MAX_TOTAL_BEACONS: usize = 16;
/// Hard compile-time ceiling on the number of AP beacons (`MAX_AP_BEACONS`);
/// runtime `Config::max_ap_beacons` is clamped to this.
pub const MAX_AP_BEACONS_BOUND: usize = 16;

/// Fixed-capacity, ordered collection of beacons shared by the request
/// context and every cacheline.
pub type BeaconVec = heapless::Vec<Beacon, MAX_TOTAL_BEACONS>;

/// Sentinel meaning "age could not be determined".
pub const TIME_UNAVAILABLE: u32 = u32::MAX;
/// RSSI sentinel meaning "unknown".
pub const RSSI_UNKNOWN: i16 = -1;
/// Effective RSSI substituted for [`RSSI_UNKNOWN`] in every numeric comparison.
pub const RSSI_UNKNOWN_EFFECTIVE: i16 = -127;

/// Beacon type tag. Discriminant order IS comparator rank order (lower
/// wins): AP < BLE < NR < LTE < UMTS < NBIOT < CDMA < GSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum BeaconType {
    Ap = 1,
    Ble = 2,
    Nr = 3,
    Lte = 4,
    Umts = 5,
    NbIot = 6,
    Cdma = 7,
    Gsm = 8,
}

/// Fields common to every beacon variant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Header {
    /// Age of the observation in seconds relative to the request-context's
    /// open time, or [`TIME_UNAVAILABLE`].
    pub age: u32,
    /// Raw RSSI in dBm, or [`RSSI_UNKNOWN`].
    pub rssi: i16,
    /// Is the device currently attached to this beacon.
    pub connected: bool,
    /// Ordering priority; higher is better. Recomputed by the active plugin.
    pub priority: f32,
}

impl Header {
    pub fn new(age: u32, rssi: i16, connected: bool) -> Self {
        Header { age, rssi, connected, priority: 0.0 }
    }

    /// RSSI with the `-1` ("unknown") sentinel normalized to `-127`.
    pub fn effective_rssi(&self) -> i16 {
        if self.rssi == RSSI_UNKNOWN { RSSI_UNKNOWN_EFFECTIVE } else { self.rssi }
    }
}

bitflags::bitflags! {
    /// Per-beacon properties saved across cache round-trips.
    #[derive(Default)]
    pub struct Property: u8 {
        /// This beacon was present in the winning cacheline.
        const IN_CACHE = 0b01;
        /// The server reported this beacon contributed to the fix.
        const USED     = 0b10;
    }
}

/// One virtual-group patch: replace one nibble of the parent MAC to recover
/// a child MAC. `nibble_idx` is in `0..12` (12 nibbles in a 6-byte MAC).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VapPatch {
    pub nibble_idx: u8,
    pub value: u8,
}

/// Access point beacon.
#[derive(Debug, Clone, PartialEq)]
pub struct Ap {
    pub header: Header,
    pub mac: [u8; MAC_SIZE],
    /// Channel center frequency in MHz.
    pub freq_mhz: u32,
    pub property: Property,
    /// Virtual-group patches describing children folded into this parent.
    pub vg: heapless::Vec<VapPatch, MAX_VAP_PER_AP_BOUND>,
    /// Per-child properties, parallel to `vg`.
    pub vg_property: heapless::Vec<Property, MAX_VAP_PER_AP_BOUND>,
}

impl Ap {
    pub fn new(header: Header, mac: [u8; MAC_SIZE], freq_mhz: u32) -> Self {
        Ap {
            header,
            mac,
            freq_mhz,
            property: Property::empty(),
            vg: heapless::Vec::new(),
            vg_property: heapless::Vec::new(),
        }
    }

    /// Is `mac` not all-zero, not broadcast (`ff:ff:ff:ff:ff:ff`), and not multicast (LSB of
    /// first octet set)?
    pub fn is_valid_mac(mac: &[u8; MAC_SIZE]) -> bool {
        if mac.iter().all(|&b| b == 0) || mac.iter().all(|&b| b == 0xff) {
            return false;
        }
        mac[0] & 0x01 == 0
    }

    /// Number of nibbles (0..12) at which `a` and `b` differ, with the first
    /// differing nibble index. `None` if more than one differs, or if the
    /// locally-administered bit disagrees.
    fn nibble_diff(a: &[u8; MAC_SIZE], b: &[u8; MAC_SIZE]) -> Option<u8> {
        if (a[0] & 0x02) != (b[0] & 0x02) {
            return None;
        }
        let mut diff_idx = None;
        for byte in 0..MAC_SIZE {
            let (ah, al) = (a[byte] >> 4, a[byte] & 0x0f);
            let (bh, bl) = (b[byte] >> 4, b[byte] & 0x0f);
            if ah != bh {
                if diff_idx.is_some() {
                    return None;
                }
                diff_idx = Some((byte * 2) as u8);
            }
            if al != bl {
                if diff_idx.is_some() {
                    return None;
                }
                diff_idx = Some((byte * 2 + 1) as u8);
            }
        }
        diff_idx
    }

    /// Are `self` and `other` virtual-group siblings: differ by exactly one
    /// MAC nibble, agree on the locally-administered bit, and share a
    /// frequency? Returns the nibble index and value to turn `self` into
    /// `other` if so (used when `self` is the parent).
    pub fn similar_to(&self, other: &Ap) -> Option<VapPatch> {
        if self.freq_mhz != other.freq_mhz {
            return None;
        }
        let idx = Self::nibble_diff(&self.mac, &other.mac)?;
        let byte = (idx / 2) as usize;
        let value = if idx % 2 == 0 { other.mac[byte] >> 4 } else { other.mac[byte] & 0x0f };
        Some(VapPatch { nibble_idx: idx, value })
    }

    /// Number of beacons folded into this AP, including itself.
    pub fn group_size(&self) -> usize {
        1 + self.vg.len()
    }
}

/// Cell beacon. Field meaning of `id1..id5` depends on `kind`; see
/// spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cell {
    pub header: Header,
    pub kind: BeaconType,
    pub id1: Option<i64>,
    pub id2: Option<i64>,
    pub id3: Option<i64>,
    pub id4: Option<i64>,
    pub id5: Option<i64>,
    pub freq: Option<i32>,
    pub ta: Option<i32>,
}

impl Cell {
    /// A cell with `id2` unknown is a neighbor measurement report: it was
    /// observed but not fully identified.
    pub fn is_nmr(&self) -> bool {
        self.id2.is_none()
    }
}

/// Bluetooth LE beacon.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ble {
    pub header: Header,
    pub mac: [u8; MAC_SIZE],
    pub uuid: [u8; UUID_SIZE],
    pub major: u16,
    pub minor: u16,
}

/// The beacon union: Wi-Fi access point, cellular cell, or Bluetooth LE.
#[derive(Debug, Clone, PartialEq)]
pub enum Beacon {
    Ap(Ap),
    Ble(Ble),
    Cell(Cell),
}

impl Beacon {
    pub fn header(&self) -> &Header {
        match self {
            Beacon::Ap(b) => &b.header,
            Beacon::Ble(b) => &b.header,
            Beacon::Cell(b) => &b.header,
        }
    }

    pub fn header_mut(&mut self) -> &mut Header {
        match self {
            Beacon::Ap(b) => &mut b.header,
            Beacon::Ble(b) => &mut b.header,
            Beacon::Cell(b) => &mut b.header,
        }
    }

    pub fn beacon_type(&self) -> BeaconType {
        match self {
            Beacon::Ap(_) => BeaconType::Ap,
            Beacon::Ble(_) => BeaconType::Ble,
            Beacon::Cell(c) => c.kind,
        }
    }

    pub fn is_ap(&self) -> bool {
        matches!(self, Beacon::Ap(_))
    }

    pub fn is_cell(&self) -> bool {
        matches!(self, Beacon::Cell(_))
    }

    pub fn as_ap(&self) -> Option<&Ap> {
        match self {
            Beacon::Ap(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_ap_mut(&mut self) -> Option<&mut Ap> {
        match self {
            Beacon::Ap(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_cell(&self) -> Option<&Cell> {
        match self {
            Beacon::Cell(c) => Some(c),
            _ => None,
        }
    }
}

/// The fixed comparator cascade shared by both plugin families (spec.md §4.2
/// "Comparator discipline"). Plugins may pre-bias priority before calling
/// this (e.g. the cell plugin's `CONNECTED`/`NON_NMR` bits, the premium
/// Wi-Fi plugin's virtual-group/cache-residency bias) via
/// [`compare_cascade_with_priority`]; this function uses `header.priority`
/// as-is (left at `0.0` by AP/BLE beacons, which do not bias it).
///
/// Returns `Greater` when `a` outranks `b` (i.e. `a` should sort first).
pub fn compare_cascade(a: &Beacon, b: &Beacon) -> Ordering {
    compare_cascade_with_priority(a, b, a.header().priority, b.header().priority)
}

/// Same cascade as [`compare_cascade`], but with the priority key supplied
/// by the caller instead of read from `header.priority` — lets a plugin
/// compute a transient priority (e.g. the cell plugin's lazy
/// `CONNECTED`/`NON_NMR` score) without needing `&mut Beacon` to cache it.
pub fn compare_cascade_with_priority(a: &Beacon, b: &Beacon, pa: f32, pb: f32) -> Ordering {
    // 1. priority, higher wins
    match pa.partial_cmp(&pb) {
        Some(Ordering::Equal) | None => {}
        Some(ord) => return ord,
    }

    let (ha, hb) = (a.header(), b.header());

    // 2. age, younger (lower) wins
    match ha.age.cmp(&hb.age) {
        Ordering::Equal => {}
        // lower age is better, so invert: a wins (Greater) when a's age is lower
        ord => return ord.reverse(),
    }

    // 3. type rank, lower tag wins
    match b.beacon_type().cmp(&a.beacon_type()) {
        Ordering::Equal => {}
        ord => return ord,
    }

    // 4. effective RSSI, stronger (higher) wins
    match ha.effective_rssi().cmp(&hb.effective_rssi()) {
        Ordering::Equal => {}
        ord => return ord,
    }

    // 5. connected, true wins
    match ha.connected.cmp(&hb.connected) {
        Ordering::Equal => {}
        ord => return ord,
    }

    // 6. deterministic tiebreak: MAC (AP) or id4 (cell), lower wins
    match (a, b) {
        (Beacon::Ap(x), Beacon::Ap(y)) => y.mac.cmp(&x.mac),
        (Beacon::Cell(x), Beacon::Cell(y)) => y.id4.cmp(&x.id4),
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ap(mac: [u8; 6], rssi: i16, age: u32) -> Beacon {
        Beacon::Ap(Ap::new(Header::new(age, rssi, false), mac, 2412))
    }

    #[test]
    fn effective_rssi_normalizes_unknown() {
        let h = Header::new(0, RSSI_UNKNOWN, false);
        assert_eq!(h.effective_rssi(), RSSI_UNKNOWN_EFFECTIVE);
        let h2 = Header::new(0, -40, false);
        assert_eq!(h2.effective_rssi(), -40);
    }

    #[test]
    fn stronger_rssi_outranks_weaker_at_equal_priority_and_age() {
        let strong = ap([1, 2, 3, 4, 5, 6], -30, 0);
        let weak = ap([1, 2, 3, 4, 5, 7], -80, 0);
        assert_eq!(compare_cascade(&strong, &weak), Ordering::Greater);
    }

    #[test]
    fn younger_outranks_older() {
        let young = ap([1, 2, 3, 4, 5, 6], -50, 1);
        let old = ap([1, 2, 3, 4, 5, 6], -50, 100);
        assert_eq!(compare_cascade(&young, &old), Ordering::Greater);
    }

    #[test]
    fn mac_is_final_tiebreak() {
        let a = ap([0, 0, 0, 0, 0, 1], -50, 0);
        let b = ap([0, 0, 0, 0, 0, 2], -50, 0);
        assert_eq!(compare_cascade(&a, &b), Ordering::Greater);
    }

    #[test]
    fn similar_macs_differ_by_one_nibble() {
        let a = Ap::new(Header::new(0, -50, false), [0, 0, 0, 0, 0, 0x10], 2412);
        let b = Ap::new(Header::new(0, -50, false), [0, 0, 0, 0, 0, 0x1f], 2412);
        let patch = a.similar_to(&b).expect("should be similar");
        assert_eq!(patch.nibble_idx, 11);
        assert_eq!(patch.value, 0x0f);
    }

    #[test]
    fn local_admin_bit_mismatch_breaks_similarity() {
        let a = Ap::new(Header::new(0, -50, false), [0x00, 0, 0, 0, 0, 0x10], 2412);
        let b = Ap::new(Header::new(0, -50, false), [0x02, 0, 0, 0, 0, 0x10], 2412);
        assert!(a.similar_to(&b).is_none());
    }

    #[test]
    fn different_frequency_breaks_similarity() {
        let a = Ap::new(Header::new(0, -50, false), [0, 0, 0, 0, 0, 0x10], 2412);
        let b = Ap::new(Header::new(0, -50, false), [0, 0, 0, 0, 0, 0x1f], 2437);
        assert!(a.similar_to(&b).is_none());
    }

    #[test]
    fn broadcast_and_zero_mac_rejected() {
        assert!(!Ap::is_valid_mac(&[0, 0, 0, 0, 0, 0]));
        assert!(!Ap::is_valid_mac(&[0xff; 6]));
        assert!(Ap::is_valid_mac(&[0, 1, 2, 3, 4, 5]));
    }
}
