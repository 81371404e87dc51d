//! CRC-32 header checksum.
//!
//! spec.md treats the CRC-32 algorithm as an external primitive; this crate
//! links in `crc32fast` (already used elsewhere in this pack, e.g. for
//! storage-engine page checksums) rather than hand-rolling the polynomial.
//! The original C source computes the same IEEE 802.3 CRC-32
//! (`0xEDB88320` reversed polynomial), so results are wire-compatible.

/// CRC-32 (IEEE 802.3) over `bytes`.
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}
