//! AES-128-CBC body encryption.
//!
//! spec.md treats AES-CBC as an external primitive; this crate links in the
//! RustCrypto `aes`/`cbc` crates (the same family `codyps-lorawan` uses for
//! its session-key AES primitive) rather than hand-rolling the cipher.
//!
//! The wire format pads the plaintext to a 16-byte boundary with zero bytes
//! (see [`crate::codec`]), not PKCS#7, so encryption/decryption here use
//! [`NoPadding`] over an already block-aligned buffer.

use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes128;

use crate::error::{Error, Result};

pub const KEY_LEN: usize = 16;
pub const IV_LEN: usize = 16;

type Enc = cbc::Encryptor<Aes128>;
type Dec = cbc::Decryptor<Aes128>;

/// Encrypt `buf` in place. `buf.len()` must be a multiple of 16.
pub fn cbc_encrypt(key: &[u8; KEY_LEN], iv: &[u8; IV_LEN], buf: &mut [u8]) -> Result<()> {
    if buf.len() % 16 != 0 {
        return Err(Error::EncodeError);
    }
    let enc = Enc::new(key.into(), iv.into());
    enc.encrypt_padded_mut::<NoPadding>(buf, buf.len())
        .map_err(|_| Error::EncodeError)?;
    Ok(())
}

/// Decrypt `buf` in place. `buf.len()` must be a multiple of 16.
pub fn cbc_decrypt(key: &[u8; KEY_LEN], iv: &[u8; IV_LEN], buf: &mut [u8]) -> Result<()> {
    if buf.len() % 16 != 0 {
        return Err(Error::DecodeError);
    }
    let dec = Dec::new(key.into(), iv.into());
    dec.decrypt_padded_mut::<NoPadding>(buf)
        .map_err(|_| Error::DecodeError)?;
    Ok(())
}
