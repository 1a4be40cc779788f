//! Thin, named wrappers over the RustCrypto-family crates. No
//! cryptographic primitive is hand-rolled here: AES, HMAC, SHA, HKDF, and
//! X25519 all come from their respective crates, and XEdDSA is built on
//! `curve25519-dalek`'s scalar arithmetic and Edwards/Montgomery birational
//! map, the same conversion machinery this codebase otherwise uses for
//! identity-key reuse between the two curve models.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use curve25519_dalek::constants::ED25519_BASEPOINT_TABLE;
use curve25519_dalek::edwards::EdwardsPoint;
use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::scalar::Scalar;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{RatchetError, Result};

pub const PUBLIC_KEY_LEN: usize = 33;
pub const PUBLIC_KEY_PREFIX: u8 = 0x05;

type HmacSha256 = Hmac<sha2::Sha256>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// 33-byte public key: a 0x05 prefix over the 32-byte Montgomery-u value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(pub [u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    pub fn from_raw(raw: &[u8; 32]) -> Self {
        let mut out = [0u8; PUBLIC_KEY_LEN];
        out[0] = PUBLIC_KEY_PREFIX;
        out[1..].copy_from_slice(raw);
        PublicKey(out)
    }

    pub fn from_prefixed(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PUBLIC_KEY_LEN {
            return Err(RatchetError::InvalidArgument(format!(
                "public key must be {PUBLIC_KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut out = [0u8; PUBLIC_KEY_LEN];
        out.copy_from_slice(bytes);
        Ok(PublicKey(out))
    }

    pub fn raw(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.0[1..]);
        out
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    fn x25519(&self) -> X25519Public {
        X25519Public::from(self.raw())
    }
}

/// 32-byte X25519 private scalar. Zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct PrivateKey([u8; 32]);

impl PrivateKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PrivateKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn static_secret(&self) -> StaticSecret {
        StaticSecret::from(self.0)
    }
}

#[derive(Clone)]
pub struct KeyPair {
    pub public: PublicKey,
    pub private: PrivateKey,
}

/// SHA-512. Errors on empty input: an empty message is treated as a
/// caller bug, not a degenerate hash.
pub fn hash(data: &[u8]) -> Result<[u8; 64]> {
    if data.is_empty() {
        return Err(RatchetError::InvalidArgument("hash: empty input".into()));
    }
    let digest = Sha512::digest(data);
    let mut out = [0u8; 64];
    out.copy_from_slice(&digest);
    Ok(out)
}

/// HMAC-SHA256.
pub fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// PKCS#7-padded AES-256-CBC encryption.
pub fn aes_cbc_encrypt(key: &[u8; 32], data: &[u8], iv: &[u8; 16]) -> Vec<u8> {
    Aes256CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<aes::cipher::block_padding::Pkcs7>(data)
}

/// PKCS#7-padded AES-256-CBC decryption. Fails on bad padding.
pub fn aes_cbc_decrypt(key: &[u8; 32], ct: &[u8], iv: &[u8; 16]) -> Result<Vec<u8>> {
    Aes256CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<aes::cipher::block_padding::Pkcs7>(ct)
        .map_err(|_| RatchetError::session("AES-CBC decrypt: bad padding"))
}

/// Verify a MAC: recompute HMAC-SHA256 over `data`, truncate to `len` bytes,
/// constant-time compare against `mac`.
pub fn verify_mac(data: &[u8], key: &[u8], mac: &[u8], len: usize) -> Result<()> {
    if mac.len() != len {
        return Err(RatchetError::BadMacLength {
            expected: len,
            actual: mac.len(),
        });
    }
    let computed = hmac(key, data);
    if computed[..len].ct_eq(mac).unwrap_u8() == 1 {
        Ok(())
    } else {
        Err(RatchetError::BadMac)
    }
}

/// RFC 5869 HKDF (extract-then-expand), producing `chunks` 32-byte outputs
/// from one contiguous expand call.
pub fn hkdf(input: &[u8], salt: &[u8; 32], info: &[u8], chunks: u8) -> Result<Vec<[u8; 32]>> {
    if !(1..=3).contains(&chunks) {
        return Err(RatchetError::InvalidArgument(format!(
            "hkdf: chunks must be 1..=3, got {chunks}"
        )));
    }
    let hk = Hkdf::<sha2::Sha256>::new(Some(salt), input);
    let mut okm = vec![0u8; chunks as usize * 32];
    hk.expand(info, &mut okm)
        .map_err(|e| RatchetError::session(format!("hkdf expand failed: {e}")))?;
    let out = okm
        .chunks_exact(32)
        .map(|c| {
            let mut arr = [0u8; 32];
            arr.copy_from_slice(c);
            arr
        })
        .collect();
    okm.zeroize();
    Ok(out)
}

/// Generate a fresh X25519 key pair via `OsRng`.
pub fn x25519_keypair() -> KeyPair {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = X25519Public::from(&secret);
    KeyPair {
        public: PublicKey::from_raw(public.as_bytes()),
        private: PrivateKey::from_bytes(secret.to_bytes()),
    }
}

/// X25519 Diffie-Hellman. `their_pub` carries the 0x05 prefix; it is
/// stripped before the agreement.
pub fn x25519_agree(their_pub: &PublicKey, our_priv: &PrivateKey) -> [u8; 32] {
    our_priv.static_secret().diffie_hellman(&their_pub.x25519()).to_bytes()
}

// ── XEdDSA ────────────────────────────────────────────────────────────────
//
// Signs/verifies with an X25519 key pair via the Edwards birational map:
// derive the Edwards point A = kB for private scalar k, flip k's sign if
// A's sign bit is set (so the stored public key is sign-bit-independent,
// matching the Montgomery u-coordinate), then run an Ed25519-shaped
// sign/verify with the sign bit folded into the top bit of `s`.

fn reduce_wide(bytes: &[u8]) -> Scalar {
    let digest = Sha512::digest(bytes);
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&digest);
    Scalar::from_bytes_mod_order_wide(&wide)
}

/// `random` must be fresh cryptographic randomness per signature (64 bytes).
pub fn xeddsa_sign(priv_key: &[u8; 32], msg: &[u8], random: &[u8; 64]) -> [u8; 64] {
    let mut k = Scalar::from_bytes_mod_order(*priv_key);
    let a_point = &k * &ED25519_BASEPOINT_TABLE;
    let mut a_bytes = a_point.compress().to_bytes();
    let sign_bit = a_bytes[31] >> 7;
    if sign_bit == 1 {
        k = -k;
        a_bytes = (&k * &ED25519_BASEPOINT_TABLE).compress().to_bytes();
        a_bytes[31] &= 0x7f;
    }

    let mut nonce_input = Vec::with_capacity(32 + priv_key.len() + msg.len() + random.len());
    nonce_input.extend_from_slice(&[0xffu8; 32]);
    nonce_input.extend_from_slice(&k.to_bytes());
    nonce_input.extend_from_slice(msg);
    nonce_input.extend_from_slice(random);
    let r = reduce_wide(&nonce_input);
    nonce_input.zeroize();

    let r_point = (&r * &ED25519_BASEPOINT_TABLE).compress().to_bytes();

    let mut h_input = Vec::with_capacity(32 + 32 + msg.len());
    h_input.extend_from_slice(&r_point);
    h_input.extend_from_slice(&a_bytes);
    h_input.extend_from_slice(msg);
    let h = reduce_wide(&h_input);

    let mut s = r + h * k;
    let mut s_bytes = s.to_bytes();
    s_bytes[31] |= sign_bit << 7;
    s.zeroize();
    k.zeroize();

    let mut sig = [0u8; 64];
    sig[..32].copy_from_slice(&r_point);
    sig[32..].copy_from_slice(&s_bytes);
    sig
}

pub fn xeddsa_verify(pub_key: &PublicKey, msg: &[u8], sig: &[u8; 64]) -> bool {
    let Some(a_point) = montgomery_to_edwards(&pub_key.raw(), sig[63] >> 7) else {
        return false;
    };
    let mut s_bytes = [0u8; 32];
    s_bytes.copy_from_slice(&sig[32..]);
    s_bytes[31] &= 0x7f;
    let Some(s) = Option::<Scalar>::from(Scalar::from_canonical_bytes(s_bytes)) else {
        return false;
    };

    let mut h_input = Vec::with_capacity(64 + msg.len());
    h_input.extend_from_slice(&sig[..32]);
    h_input.extend_from_slice(&a_point.compress().to_bytes());
    h_input.extend_from_slice(msg);
    let h = reduce_wide(&h_input);

    let check = (&s * &ED25519_BASEPOINT_TABLE) - h * a_point;
    check.compress().to_bytes() == sig[..32]
}

/// Recover the Edwards point for a Montgomery u-coordinate and a chosen
/// sign bit, via the same birational map `curve25519-dalek` exposes for
/// Signal-style key reuse between the two curve models.
fn montgomery_to_edwards(u_bytes: &[u8; 32], sign_bit: u8) -> Option<EdwardsPoint> {
    MontgomeryPoint(*u_bytes).to_edwards(sign_bit)
}

/// 14-bit registration id: `u16_le(random_bytes(2)) & 0x3FFF`.
pub fn generate_registration_id() -> u32 {
    let mut bytes = [0u8; 2];
    OsRng.fill_bytes(&mut bytes);
    (u16::from_le_bytes(bytes) & 0x3FFF) as u32
}
