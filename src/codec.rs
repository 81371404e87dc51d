//! Wire codec: frames a finalized request context into the
//! `H | RqHeader | CryptoInfo | AES-CBC(Rq)` byte layout and parses the
//! matching response frame (spec.md §4.6, §6).
//!
//! The original links nanopb and drives it with field-tag callbacks
//! (`examples/original_source/libel/protocol/proto.c`); per spec.md §9
//! design notes ("replace with a pure function ... the callback is simply a
//! pattern-match on the field tag inside the encoder") this is rewritten as
//! plain tag/varint writers over the caller's buffer. Field numbers below
//! are this crate's own wire schema — internally consistent, not a literal
//! transcription of the upstream `.proto` — but the wire *rules*
//! (common-value optimization, `id_plus_1` sentinel collapsing, negated
//! RSSI, integer-scaled GNSS) match `proto.c` exactly.

use crate::beacon::{Beacon, RSSI_UNKNOWN};
use crate::config::Override;
use crate::crypto::{cbc_decrypt, cbc_encrypt, IV_LEN};
use crate::error::{Error, Result};
use crate::location::{Location, LocationStatus, Source};
use crate::rand::RandomSource;
use crate::rctx::Rctx;
use crate::session::{AuthState, Session};
use log::{debug, warn};

/// Software version sent in every request header (`SW_VERSION` upstream).
pub const SW_VERSION: u32 = 1;

/// Worst-case wire length [`encode_request`] can produce (`sizeof_request_buf`,
/// spec.md §6): 1-byte `H`, the header and crypto-info (each bounded by their
/// own 64-byte scratch `heapless::Vec`), and the body (bounded by its 512-byte
/// scratch `heapless::Vec`, already a multiple of 16 so AES padding never
/// pushes it past that cap).
pub const MAX_REQUEST_LEN: usize = 1 + 64 + 64 + 512;

// --- protobuf-style varint/tag primitives -----------------------------

fn write_varint(out: &mut heapless::Vec<u8, 512>, mut v: u64) -> Result<()> {
    loop {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        out.push(byte).map_err(|_| Error::EncodeError)?;
        if v == 0 {
            break;
        }
    }
    Ok(())
}

fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

fn write_tag(out: &mut heapless::Vec<u8, 512>, field: u32, wire_type: u8) -> Result<()> {
    write_varint(out, ((field as u64) << 3) | wire_type as u64)
}

fn write_varint_field(out: &mut heapless::Vec<u8, 512>, field: u32, v: u64) -> Result<()> {
    if v == 0 {
        return Ok(()); // proto3-style: zero is the default, omit
    }
    write_tag(out, field, 0)?;
    write_varint(out, v)
}

fn write_svarint_field(out: &mut heapless::Vec<u8, 512>, field: u32, v: i64) -> Result<()> {
    if v == 0 {
        return Ok(());
    }
    write_tag(out, field, 0)?;
    write_varint(out, zigzag(v))
}

fn write_bytes_field(out: &mut heapless::Vec<u8, 512>, field: u32, bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        return Ok(());
    }
    write_tag(out, field, 2)?;
    write_varint(out, bytes.len() as u64)?;
    out.extend_from_slice(bytes).map_err(|_| Error::EncodeError)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn done(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn read_varint(&mut self) -> Result<u64> {
        let mut v = 0u64;
        let mut shift = 0;
        loop {
            let byte = *self.buf.get(self.pos).ok_or(Error::DecodeError)?;
            self.pos += 1;
            v |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift >= 64 {
                return Err(Error::DecodeError);
            }
        }
        Ok(v)
    }

    fn read_tag(&mut self) -> Result<(u32, u8)> {
        let tag = self.read_varint()?;
        Ok(((tag >> 3) as u32, (tag & 0x7) as u8))
    }

    fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_varint()? as usize;
        let end = self.pos.checked_add(len).ok_or(Error::DecodeError)?;
        let slice = self.buf.get(self.pos..end).ok_or(Error::DecodeError)?;
        self.pos = end;
        Ok(slice)
    }

    /// Skip a field's value given its wire type, for forward compatibility
    /// with fields this decoder doesn't recognize.
    fn skip(&mut self, wire_type: u8) -> Result<()> {
        match wire_type {
            0 => {
                self.read_varint()?;
            }
            2 => {
                self.read_bytes()?;
            }
            _ => return Err(Error::DecodeError),
        }
        Ok(())
    }
}

// --- field numbers -----------------------------------------------------

mod tag {
    // RqHeader
    pub const RQH_PARTNER_ID: u32 = 1;
    pub const RQH_CRYPTO_INFO_LEN: u32 = 2;
    pub const RQH_RQ_LEN: u32 = 3;
    pub const RQH_SW_VERSION: u32 = 4;
    pub const RQH_CLIENT_CONF: u32 = 5;

    // CryptoInfo
    pub const CI_IV: u32 = 1;
    pub const CI_PAD_LEN: u32 = 2;

    // Rq
    pub const RQ_TOKEN_ID: u32 = 1;
    pub const RQ_APS: u32 = 2;
    pub const RQ_CELLS: u32 = 3;
    pub const RQ_GNSS: u32 = 4;
    pub const RQ_TBR: u32 = 5;
    pub const RQ_UL_APP_DATA: u32 = 6;
    pub const RQ_MAX_DL_APP_DATA: u32 = 7;
    pub const RQ_DEVICE_ID: u32 = 8;

    // Aps
    pub const APS_MAC: u32 = 1;
    pub const APS_FREQ: u32 = 2;
    pub const APS_COMMON_FREQ_PLUS_1: u32 = 3;
    pub const APS_NEG_RSSI: u32 = 4;
    pub const APS_COMMON_NEG_RSSI_PLUS_1: u32 = 5;
    pub const APS_AGE: u32 = 6;
    pub const APS_COMMON_AGE_PLUS_1: u32 = 7;
    pub const APS_CONNECTED_IDX_PLUS_1: u32 = 8;
    pub const APS_VAPS: u32 = 9;

    // Cell
    pub const CELL_TYPE: u32 = 1;
    pub const CELL_ID1_PLUS_1: u32 = 2;
    pub const CELL_ID2_PLUS_1: u32 = 3;
    pub const CELL_ID3_PLUS_1: u32 = 4;
    pub const CELL_ID4_PLUS_1: u32 = 5;
    pub const CELL_ID5_PLUS_1: u32 = 6;
    pub const CELL_FREQ_PLUS_1: u32 = 7;
    pub const CELL_TA_PLUS_1: u32 = 8;
    pub const CELL_NEG_RSSI: u32 = 9;
    pub const CELL_AGE: u32 = 10;
    pub const CELL_CONNECTED: u32 = 11;

    // Gnss
    pub const GNSS_LAT_SCALED: u32 = 1;
    pub const GNSS_LON_SCALED: u32 = 2;
    pub const GNSS_HPE: u32 = 3;
    pub const GNSS_ALT_SCALED: u32 = 4;
    pub const GNSS_VPE: u32 = 5;
    pub const GNSS_SPEED_SCALED: u32 = 6;
    pub const GNSS_BEARING_SCALED: u32 = 7;
    pub const GNSS_NSAT: u32 = 8;
    pub const GNSS_AGE: u32 = 9;

    // Tbr
    pub const TBR_SKU: u32 = 1;
    pub const TBR_CC: u32 = 2;

    // RsHeader
    pub const RSH_CRYPTO_INFO_LEN: u32 = 1;
    pub const RSH_RS_LEN: u32 = 2;
    pub const RSH_STATUS: u32 = 3;

    // Rs
    pub const RS_LAT_SCALED: u32 = 1;
    pub const RS_LON_SCALED: u32 = 2;
    pub const RS_HPE: u32 = 3;
    pub const RS_SOURCE: u32 = 4;
    pub const RS_USED_APS: u32 = 5;
    pub const RS_TOKEN_ID: u32 = 6;
    pub const RS_DL_APP_DATA: u32 = 7;
    pub const RS_OVERRIDE: u32 = 8;

    // ConfigOverride
    pub const OV_FIELD_ID: u32 = 1;
    pub const OV_VALUE: u32 = 2;
}

/// `RsHeader.status` (and the TBR-specific `AUTH_ERROR`/`AUTH_NEEDS_TIME`
/// backoff signals folded into the same enum, per
/// `examples/original_source/libel/protocol/proto.c`'s `RsHeader_Status`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RsStatus {
    Success = 0,
    Unspecified = 1,
    BadPartner = 2,
    DecodeError = 3,
    ApiServerError = 4,
    AuthError = 5,
    AuthNeedsTime = 6,
}

impl RsStatus {
    fn from_u64(v: u64) -> Self {
        match v {
            0 => RsStatus::Success,
            2 => RsStatus::BadPartner,
            3 => RsStatus::DecodeError,
            4 => RsStatus::ApiServerError,
            5 => RsStatus::AuthError,
            6 => RsStatus::AuthNeedsTime,
            _ => RsStatus::Unspecified,
        }
    }
}

/// A config field id as carried in `ConfigOverride.field_id`, mirroring
/// `examples/original_source/libel/protocol/proto.c`'s `apply_config_overrides`.
fn override_from_wire(field_id: u64, value: u64) -> Option<Override> {
    match field_id {
        1 => Some(Override::TotalBeacons(value as u32)),
        2 => Some(Override::MaxApBeacons(value as u32)),
        3 => Some(Override::CacheMatchAllThreshold(value as u32)),
        4 => Some(Override::CacheMatchUsedThreshold(value as u32)),
        5 => Some(Override::CacheAgeThreshold(value as u32)),
        6 => Some(Override::CacheBeaconThreshold(value as u32)),
        // wire carries the positive magnitude (spec.md §6); negate at use.
        7 => Some(Override::CacheNegRssiThreshold(-(value as i32))),
        8 => Some(Override::MaxVapPerAp(value as u32)),
        9 => Some(Override::MaxVapPerRq(value as u32)),
        _ => None,
    }
}

/// Encode the plaintext `Rq` body (spec.md §4.6 "Rq encoding responsibilities").
fn encode_rq_body(rctx: &Rctx, session: &Session) -> Result<heapless::Vec<u8, 512>> {
    let mut body: heapless::Vec<u8, 512> = heapless::Vec::new();

    let registration = session.auth_state == AuthState::Unregistered;

    // Carried in every auth state (spec.md §4.6 "DISABLED"/"UNREGISTERED"),
    // per `examples/original_source/libel/protocol/proto.c`'s `rq.device_id`
    // assignment in both the legacy and TBR registration paths.
    write_bytes_field(&mut body, tag::RQ_DEVICE_ID, &session.credentials.device_id)?;

    if !registration {
        if let Some(token) = session.token_id {
            write_varint_field(&mut body, tag::RQ_TOKEN_ID, token as u64)?;
        }

        if rctx.num_ap > 0 {
            let mut aps: heapless::Vec<u8, 512> = heapless::Vec::new();
            encode_aps(&mut aps, rctx)?;
            write_bytes_field(&mut body, tag::RQ_APS, &aps)?;
        }

        for cell in rctx.beacons[rctx.num_ap..].iter() {
            let mut c: heapless::Vec<u8, 512> = heapless::Vec::new();
            encode_cell(&mut c, cell)?;
            write_bytes_field(&mut body, tag::RQ_CELLS, &c)?;
        }

        if let Some(gnss) = rctx.gnss.as_ref().filter(|g| g.is_present()) {
            let mut g: heapless::Vec<u8, 512> = heapless::Vec::new();
            write_svarint_field(&mut g, tag::GNSS_LAT_SCALED, (gnss.lat as f64 * 1e6) as i64)?;
            write_svarint_field(&mut g, tag::GNSS_LON_SCALED, (gnss.lon as f64 * 1e6) as i64)?;
            write_varint_field(&mut g, tag::GNSS_HPE, gnss.hpe as u64)?;
            write_svarint_field(&mut g, tag::GNSS_ALT_SCALED, (gnss.alt * 10.0) as i64)?;
            write_varint_field(&mut g, tag::GNSS_VPE, gnss.vpe as u64)?;
            write_svarint_field(&mut g, tag::GNSS_SPEED_SCALED, (gnss.speed * 10.0) as i64)?;
            write_svarint_field(&mut g, tag::GNSS_BEARING_SCALED, (gnss.bearing * 10.0) as i64)?;
            write_varint_field(&mut g, tag::GNSS_NSAT, gnss.nsat as u64)?;
            write_varint_field(&mut g, tag::GNSS_AGE, gnss.age as u64)?;
            write_bytes_field(&mut body, tag::RQ_GNSS, &g)?;
        }

        write_varint_field(&mut body, tag::RQ_MAX_DL_APP_DATA, crate::location::MAX_DL_APP_DATA as u64)?;
        write_bytes_field(&mut body, tag::RQ_UL_APP_DATA, &rctx.ul_app_data)?;
    }

    if session.auth_state != AuthState::Disabled {
        if let Some(sku) = session.credentials.sku.as_ref() {
            let mut tbr: heapless::Vec<u8, 512> = heapless::Vec::new();
            write_bytes_field(&mut tbr, tag::TBR_SKU, sku.as_bytes())?;
            if let Some(cc) = session.credentials.country_code {
                write_varint_field(&mut tbr, tag::TBR_CC, cc as u64)?;
            }
            write_bytes_field(&mut body, tag::RQ_TBR, &tbr)?;
        }
    }

    Ok(body)
}

fn encode_aps(out: &mut heapless::Vec<u8, 512>, rctx: &Rctx) -> Result<()> {
    let aps = &rctx.beacons[..rctx.num_ap];

    for b in aps.iter() {
        if let Beacon::Ap(ap) = b {
            write_bytes_field(out, tag::APS_MAC, &ap.mac)?;
        }
    }

    let freqs: heapless::Vec<u32, 16> = aps.iter().filter_map(|b| b.as_ap().map(|a| a.freq_mhz)).collect();
    write_common_or_repeated(out, &freqs, tag::APS_FREQ, tag::APS_COMMON_FREQ_PLUS_1)?;

    let neg_rssi: heapless::Vec<u32, 16> = aps
        .iter()
        .map(|b| {
            let r = b.header().rssi;
            if r == RSSI_UNKNOWN { 0 } else { (-r) as u32 }
        })
        .collect();
    write_common_or_repeated(out, &neg_rssi, tag::APS_NEG_RSSI, tag::APS_COMMON_NEG_RSSI_PLUS_1)?;

    let ages: heapless::Vec<u32, 16> = aps.iter().map(|b| b.header().age).collect();
    write_common_or_repeated(out, &ages, tag::APS_AGE, tag::APS_COMMON_AGE_PLUS_1)?;

    if let Some(idx) = aps.iter().position(|b| b.header().connected) {
        write_varint_field(out, tag::APS_CONNECTED_IDX_PLUS_1, (idx + 1) as u64)?;
    }

    let mut vaps: heapless::Vec<u8, 512> = heapless::Vec::new();
    for (parent_idx, b) in aps.iter().enumerate() {
        if let Beacon::Ap(ap) = b {
            if ap.vg.is_empty() {
                continue;
            }
            let len = 1 + ap.vg.len();
            vaps.push(len as u8).map_err(|_| Error::EncodeError)?;
            vaps.push(parent_idx as u8).map_err(|_| Error::EncodeError)?;
            for patch in ap.vg.iter() {
                vaps.push(patch.nibble_idx).map_err(|_| Error::EncodeError)?;
                vaps.push(patch.value).map_err(|_| Error::EncodeError)?;
            }
        }
    }
    write_bytes_field(out, tag::APS_VAPS, &vaps)?;
    Ok(())
}

/// Emit either `common_field_plus_1` (all entries share one value) or the
/// packed-repeated field, per spec.md §4.6.
fn write_common_or_repeated(out: &mut heapless::Vec<u8, 512>, values: &[u32], repeated_field: u32, common_field: u32) -> Result<()> {
    if values.is_empty() {
        return Ok(());
    }
    if values.iter().all(|v| *v == values[0]) {
        write_varint_field(out, common_field, values[0] as u64 + 1)
    } else {
        let mut packed: heapless::Vec<u8, 512> = heapless::Vec::new();
        for v in values {
            write_varint(&mut packed, *v as u64)?;
        }
        write_bytes_field(out, repeated_field, &packed)
    }
}

fn encode_cell(out: &mut heapless::Vec<u8, 512>, b: &Beacon) -> Result<()> {
    let c = b.as_cell().ok_or(Error::EncodeError)?;
    write_varint_field(out, tag::CELL_TYPE, c.kind as u64)?;
    if let Some(v) = c.id1 {
        write_varint_field(out, tag::CELL_ID1_PLUS_1, v as u64 + 1)?;
    }
    if let Some(v) = c.id2 {
        write_varint_field(out, tag::CELL_ID2_PLUS_1, v as u64 + 1)?;
    }
    if let Some(v) = c.id3 {
        write_varint_field(out, tag::CELL_ID3_PLUS_1, v as u64 + 1)?;
    }
    if let Some(v) = c.id4 {
        write_varint_field(out, tag::CELL_ID4_PLUS_1, v as u64 + 1)?;
    }
    if let Some(v) = c.id5 {
        write_varint_field(out, tag::CELL_ID5_PLUS_1, v as u64 + 1)?;
    }
    if let Some(v) = c.freq {
        write_varint_field(out, tag::CELL_FREQ_PLUS_1, v as u64 + 1)?;
    }
    if let Some(v) = c.ta {
        write_varint_field(out, tag::CELL_TA_PLUS_1, v as u64 + 1)?;
    }
    let r = c.header.rssi;
    if r != RSSI_UNKNOWN {
        write_varint_field(out, tag::CELL_NEG_RSSI, (-r) as u64)?;
    }
    write_varint_field(out, tag::CELL_AGE, c.header.age as u64)?;
    if c.header.connected {
        write_varint_field(out, tag::CELL_CONNECTED, 1)?;
    }
    Ok(())
}

/// spec.md §4.6 "Rq framing": compute sizes, write the length-delimited
/// header/crypto-info, zero-pad the plaintext to a 16-byte boundary, then
/// encrypt in place with a freshly randomized IV. If `buf` is too small, the
/// required size is returned without writing anything.
pub fn encode_request(rctx: &Rctx, rand: &mut dyn RandomSource, buf: &mut [u8]) -> Result<usize> {
    let session = rctx.session();

    let body = encode_rq_body(rctx, session)?;
    let pad = (16 - body.len() % 16) % 16;
    let body_len = body.len() + pad;

    let mut crypto_info: heapless::Vec<u8, 64> = heapless::Vec::new();
    let mut iv = [0u8; IV_LEN];
    rand.fill(&mut iv)?;
    write_bytes_field(&mut crypto_info, tag::CI_IV, &iv)?;
    write_varint_field(&mut crypto_info, tag::CI_PAD_LEN, pad as u64)?;

    let mut header: heapless::Vec<u8, 64> = heapless::Vec::new();
    write_varint_field(&mut header, tag::RQH_PARTNER_ID, session.credentials.partner_id as u64)?;
    write_varint_field(&mut header, tag::RQH_CRYPTO_INFO_LEN, crypto_info.len() as u64)?;
    write_varint_field(&mut header, tag::RQH_RQ_LEN, body_len as u64)?;
    write_varint_field(&mut header, tag::RQH_SW_VERSION, SW_VERSION as u64)?;
    // Ask the server to resend the full dynamic config on the first request
    // a session ever makes (`last_config_time == 0`), mirroring
    // `examples/original_source/libel/protocol/proto.c`'s `request_config`.
    if session.config.last_config_time == 0 {
        write_varint_field(&mut header, tag::RQH_CLIENT_CONF, 1)?;
    }

    let total = 1 + header.len() + crypto_info.len() + body_len;
    if buf.len() < total {
        return Err(Error::EncodeError);
    }
    if header.len() > u8::MAX as usize {
        return Err(Error::EncodeError);
    }

    buf[0] = header.len() as u8;
    let mut off = 1;
    buf[off..off + header.len()].copy_from_slice(&header);
    off += header.len();
    buf[off..off + crypto_info.len()].copy_from_slice(&crypto_info);
    off += crypto_info.len();
    buf[off..off + body.len()].copy_from_slice(&body);
    for b in buf[off + body.len()..off + body_len].iter_mut() {
        *b = 0;
    }

    cbc_encrypt(&session.credentials.aes_key, &iv, &mut buf[off..off + body_len])?;
    Ok(total)
}

/// The decoded contents of a server response, before being folded back into
/// the request context and cache (spec.md §4.2 `decode_response`).
pub struct DecodedResponse {
    pub loc: Location,
    pub overrides: heapless::Vec<Override, 9>,
    pub used_aps: heapless::Vec<bool, 16>,
}

/// spec.md §4.6: decrypt, parse the `RsHeader`/`CryptoInfo`/`Rs` frame, and
/// drive the TBR auth state machine.
pub fn decode_response(session: &mut Session, buf: &mut [u8]) -> Result<DecodedResponse> {
    if buf.is_empty() {
        return Err(Error::DecodeError);
    }
    let h_len = buf[0] as usize;
    if buf.len() < 1 + h_len {
        return Err(Error::DecodeError);
    }
    let mut header = Reader::new(&buf[1..1 + h_len]);
    let mut crypto_info_len = 0usize;
    let mut rs_len = 0usize;
    let mut status = RsStatus::Success;
    while !header.done() {
        let (field, wt) = header.read_tag()?;
        match field {
            tag::RSH_CRYPTO_INFO_LEN if wt == 0 => crypto_info_len = header.read_varint()? as usize,
            tag::RSH_RS_LEN if wt == 0 => rs_len = header.read_varint()? as usize,
            tag::RSH_STATUS if wt == 0 => status = RsStatus::from_u64(header.read_varint()?),
            _ => header.skip(wt)?,
        }
    }

    let ci_start = 1 + h_len;
    if buf.len() < ci_start + crypto_info_len {
        return Err(Error::DecodeError);
    }
    let mut iv = [0u8; IV_LEN];
    let mut pad = 0usize;
    {
        let mut ci = Reader::new(&buf[ci_start..ci_start + crypto_info_len]);
        while !ci.done() {
            let (field, wt) = ci.read_tag()?;
            match field {
                tag::CI_IV if wt == 2 => iv.copy_from_slice(ci.read_bytes()?),
                tag::CI_PAD_LEN if wt == 0 => pad = ci.read_varint()? as usize,
                _ => ci.skip(wt)?,
            }
        }
    }

    let body_start = ci_start + crypto_info_len;
    if buf.len() < body_start + rs_len || rs_len < pad {
        return Err(Error::DecodeError);
    }
    let body = &mut buf[body_start..body_start + rs_len];
    cbc_decrypt(&session.credentials.aes_key, &iv, body)?;
    let plain_len = rs_len - pad;

    match status {
        RsStatus::AuthNeedsTime => {
            warn!("decode_response: server requested AUTH_NEEDS_TIME, backing off");
            session.needs_time_backoff = true;
            return Err(Error::ServiceDenied);
        }
        RsStatus::AuthError => {
            debug!("decode_response: AUTH_ERROR, resetting to unregistered");
            session.token_id = None;
            session.auth_state = AuthState::Unregistered;
            return Ok(DecodedResponse {
                loc: Location { status: LocationStatus::AuthRetry, ..Location::unknown() },
                overrides: heapless::Vec::new(),
                used_aps: heapless::Vec::new(),
            });
        }
        RsStatus::BadPartner => return Err(Error::BadParameters),
        RsStatus::DecodeError => return Err(Error::DecodeError),
        RsStatus::ApiServerError => return Err(Error::ServerError),
        RsStatus::Success | RsStatus::Unspecified => {}
    }

    let mut lat_scaled = 0i64;
    let mut lon_scaled = 0i64;
    let mut hpe = 0u64;
    let mut source = 0u64;
    let mut used_aps_bytes: &[u8] = &[];
    let mut token_id = None;
    let mut dl_app_data: heapless::Vec<u8, 32> = heapless::Vec::new();
    let mut overrides: heapless::Vec<Override, 9> = heapless::Vec::new();

    let mut rs = Reader::new(&body[..plain_len]);
    while !rs.done() {
        let (field, wt) = rs.read_tag()?;
        match field {
            tag::RS_LAT_SCALED if wt == 0 => lat_scaled = unzigzag(rs.read_varint()?),
            tag::RS_LON_SCALED if wt == 0 => lon_scaled = unzigzag(rs.read_varint()?),
            tag::RS_HPE if wt == 0 => hpe = rs.read_varint()?,
            tag::RS_SOURCE if wt == 0 => source = rs.read_varint()?,
            tag::RS_USED_APS if wt == 2 => used_aps_bytes = rs.read_bytes()?,
            tag::RS_TOKEN_ID if wt == 0 => token_id = Some(rs.read_varint()? as u32),
            tag::RS_DL_APP_DATA if wt == 2 => {
                let _ = dl_app_data.extend_from_slice(rs.read_bytes()?);
            }
            tag::RS_OVERRIDE if wt == 2 => {
                let bytes = rs.read_bytes()?;
                let mut o = Reader::new(bytes);
                let mut field_id = 0u64;
                let mut value = 0u64;
                while !o.done() {
                    let (f, wt2) = o.read_tag()?;
                    match f {
                        tag::OV_FIELD_ID if wt2 == 0 => field_id = o.read_varint()?,
                        tag::OV_VALUE if wt2 == 0 => value = o.read_varint()?,
                        _ => o.skip(wt2)?,
                    }
                }
                if let Some(ov) = override_from_wire(field_id, value) {
                    let _ = overrides.push(ov);
                }
            }
            _ => rs.skip(wt)?,
        }
    }

    if let Some(t) = token_id {
        if session.auth_state == AuthState::Unregistered {
            debug!("decode_response: registration token acquired, now registered");
            session.token_id = Some(t);
            session.auth_state = AuthState::Registered;
            return Ok(DecodedResponse {
                loc: Location { status: LocationStatus::AuthRetry, ..Location::unknown() },
                overrides,
                used_aps: heapless::Vec::new(),
            });
        }
        session.token_id = Some(t);
    }

    let mut used_aps: heapless::Vec<bool, 16> = heapless::Vec::new();
    'bits: for byte in used_aps_bytes.iter() {
        for bit in 0u8..8 {
            if used_aps.push(byte & (1 << bit) != 0).is_err() {
                break 'bits;
            }
        }
    }

    let loc = Location {
        lat: lat_scaled as f32 / 1e6,
        lon: lon_scaled as f32 / 1e6,
        hpe: hpe as f32,
        source: match source {
            1 => Source::Hybrid,
            2 => Source::Cell,
            3 => Source::Wifi,
            4 => Source::Gnss,
            _ => Source::Unknown,
        },
        status: LocationStatus::Success,
        dl_app_data,
    };

    Ok(DecodedResponse { loc, overrides, used_aps })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_round_trips() {
        let mut out: heapless::Vec<u8, 512> = heapless::Vec::new();
        write_varint(&mut out, 300).unwrap();
        let mut r = Reader::new(&out);
        assert_eq!(r.read_varint().unwrap(), 300);
    }

    #[test]
    fn zigzag_round_trips_negative_numbers() {
        assert_eq!(unzigzag(zigzag(-42)), -42);
        assert_eq!(unzigzag(zigzag(42)), 42);
    }

    #[test]
    fn common_value_optimization_collapses_identical_frequencies() {
        let mut out: heapless::Vec<u8, 512> = heapless::Vec::new();
        write_common_or_repeated(&mut out, &[2412, 2412, 2412], tag::APS_FREQ, tag::APS_COMMON_FREQ_PLUS_1).unwrap();
        let mut r = Reader::new(&out);
        let (field, _) = r.read_tag().unwrap();
        assert_eq!(field, tag::APS_COMMON_FREQ_PLUS_1);
        assert_eq!(r.read_varint().unwrap(), 2413);
    }

    fn creds() -> crate::session::Credentials {
        let mut device_id = heapless::Vec::new();
        device_id.extend_from_slice(&[1, 2, 3, 4, 5, 6]).unwrap();
        crate::session::Credentials {
            partner_id: 2,
            aes_key_id: 1,
            aes_key: [0x42; 16],
            device_id,
            sku: None,
            country_code: None,
        }
    }

    /// Build a minimal, well-formed `Rs` frame (no overrides, one used AP,
    /// a fixed lat/lon) encrypted under `key`.
    fn build_rs_frame(key: &[u8; 16]) -> heapless::Vec<u8, 256> {
        let mut rs: heapless::Vec<u8, 512> = heapless::Vec::new();
        write_svarint_field(&mut rs, tag::RS_LAT_SCALED, 45_500_000).unwrap();
        write_svarint_field(&mut rs, tag::RS_LON_SCALED, -73_600_000).unwrap();
        write_varint_field(&mut rs, tag::RS_HPE, 25).unwrap();
        write_varint_field(&mut rs, tag::RS_SOURCE, 3).unwrap();
        write_bytes_field(&mut rs, tag::RS_USED_APS, &[0b0000_0001]).unwrap();

        let pad = (16 - rs.len() % 16) % 16;
        for _ in 0..pad {
            rs.push(0).unwrap();
        }

        let mut crypto_info: heapless::Vec<u8, 64> = heapless::Vec::new();
        let iv = [7u8; IV_LEN];
        write_bytes_field(&mut crypto_info, tag::CI_IV, &iv).unwrap();
        write_varint_field(&mut crypto_info, tag::CI_PAD_LEN, pad as u64).unwrap();

        let mut header: heapless::Vec<u8, 64> = heapless::Vec::new();
        write_varint_field(&mut header, tag::RSH_CRYPTO_INFO_LEN, crypto_info.len() as u64).unwrap();
        write_varint_field(&mut header, tag::RSH_RS_LEN, rs.len() as u64).unwrap();

        let mut frame: heapless::Vec<u8, 256> = heapless::Vec::new();
        frame.push(header.len() as u8).unwrap();
        frame.extend_from_slice(&header).unwrap();
        frame.extend_from_slice(&crypto_info).unwrap();
        frame.extend_from_slice(&rs).unwrap();

        let body_start = 1 + header.len() + crypto_info.len();
        cbc_encrypt(key, &iv, &mut frame[body_start..]).unwrap();
        frame
    }

    #[test]
    fn decode_response_parses_location_and_used_aps() {
        let mut session = Session::open(None, creds(), None).unwrap();
        let mut frame = build_rs_frame(&session.credentials.aes_key);
        let decoded = decode_response(&mut session, &mut frame).unwrap();
        assert!((decoded.loc.lat - 45.5).abs() < 1e-3);
        assert!((decoded.loc.lon - (-73.6)).abs() < 1e-3);
        assert_eq!(decoded.loc.source, Source::Wifi);
        assert_eq!(decoded.used_aps[0], true);
        assert!(decoded.overrides.is_empty());
    }

    #[test]
    fn decode_response_auth_error_resets_to_unregistered() {
        let mut sku_creds = creds();
        sku_creds.sku = Some(heapless::String::try_from("sku-x").unwrap());
        let mut session = Session::open(None, sku_creds, None).unwrap();
        session.token_id = Some(7);
        session.auth_state = AuthState::Registered;

        let mut header: heapless::Vec<u8, 16> = heapless::Vec::new();
        write_varint_field(&mut header, tag::RSH_CRYPTO_INFO_LEN, 0).unwrap();
        write_varint_field(&mut header, tag::RSH_RS_LEN, 0).unwrap();
        write_varint_field(&mut header, tag::RSH_STATUS, RsStatus::AuthError as u64).unwrap();
        let mut frame: heapless::Vec<u8, 32> = heapless::Vec::new();
        frame.push(header.len() as u8).unwrap();
        frame.extend_from_slice(&header).unwrap();

        let decoded = decode_response(&mut session, &mut frame).unwrap();
        assert_eq!(decoded.loc.status, LocationStatus::AuthRetry);
        assert_eq!(session.auth_state, AuthState::Unregistered);
        assert!(session.token_id.is_none());
    }

    #[test]
    fn encode_request_reports_required_size_when_buffer_too_small() {
        let mut session = Session::open(None, creds(), None).unwrap();
        let clock = crate::timer::mock::MockClock::new(TIMESTAMP_2019_03_01_PLUS_ONE_DAY);
        let mut rctx = Rctx::new_request(&mut session, &clock).unwrap();
        rctx.add_ap_beacon(crate::rctx::ApScan {
            mac: [2, 2, 2, 2, 2, 2],
            timestamp: None,
            rssi: Some(-50),
            frequency_mhz: Some(2412),
            connected: true,
        })
        .unwrap();

        let mut rand = crate::rand::mock::PatternRandom::new(&[0xAB]);
        let mut tiny = [0u8; 1];
        assert_eq!(encode_request(&rctx, &mut rand, &mut tiny).unwrap_err(), Error::EncodeError);
    }

    const TIMESTAMP_2019_03_01_PLUS_ONE_DAY: u32 = crate::rctx::TIMESTAMP_2019_03_01 + 86_400;
}
