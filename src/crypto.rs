//! Cryptographic primitives: hashes, MACs, AES-CBC, ECDSA and secp256k1
//! point arithmetic.
//!
//! Everything here is a thin, typed wrapper over the RustCrypto hash crates
//! and `secp256k1`. Higher layers never touch curve types directly; keys
//! cross module boundaries as compressed 33-byte public keys and 32-byte
//! private scalars.

use hmac::{Hmac, Mac};
use ripemd::Ripemd160;
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Scalar, SecretKey, SECP256K1};
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

use crate::util::SecureBytes;

/// AES block size; also the CBC IV length.
pub const AES_BLOCK_SIZE: usize = 16;

/// AES-256 key length.
pub const AES_KEY_SIZE: usize = 32;

/// Compressed secp256k1 public key length.
pub const COMPRESSED_PUBKEY_LEN: usize = 33;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid private key scalar")]
    InvalidPrivateKey,

    #[error("invalid curve point")]
    InvalidPoint,

    #[error("scalar out of range")]
    InvalidScalar,

    #[error("signature verification failed")]
    BadSignature,

    #[error("malformed DER signature")]
    MalformedSignature,

    #[error("cipher failure: {0}")]
    Cipher(String),
}

// ----------------------------- Hashes -----------------------------

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Double SHA-256, Bitcoin's standard message digest.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

/// SHA-256 followed by RIPEMD-160.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    Ripemd160::digest(Sha256::digest(data)).into()
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

pub fn hmac_sha512(key: &[u8], data: &[u8]) -> [u8; 64] {
    let mut mac =
        Hmac::<Sha512>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

// ----------------------------- AES-256-CBC -----------------------------

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES-256-CBC with PKCS7 padding.
pub fn aes_cbc_encrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};

    let enc = Aes256CbcEnc::new_from_slices(key, iv)
        .map_err(|e| CryptoError::Cipher(e.to_string()))?;
    Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(data))
}

pub fn aes_cbc_decrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};

    let dec = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|e| CryptoError::Cipher(e.to_string()))?;
    dec.decrypt_padded_vec_mut::<Pkcs7>(data)
        .map_err(|_| CryptoError::Cipher("bad padding".to_string()))
}

// ----------------------------- ECDSA -----------------------------

fn secret_key(priv_key: &[u8]) -> Result<SecretKey, CryptoError> {
    SecretKey::from_slice(priv_key).map_err(|_| CryptoError::InvalidPrivateKey)
}

fn public_key(pub_key: &[u8]) -> Result<PublicKey, CryptoError> {
    PublicKey::from_slice(pub_key).map_err(|_| CryptoError::InvalidPoint)
}

fn scalar(bytes: &[u8]) -> Result<Scalar, CryptoError> {
    let arr: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidScalar)?;
    Scalar::from_be_bytes(arr).map_err(|_| CryptoError::InvalidScalar)
}

/// True when the 32 bytes form a valid secp256k1 private key.
pub fn check_private_key(priv_key: &[u8]) -> bool {
    priv_key.len() == 32 && SecretKey::from_slice(priv_key).is_ok()
}

/// Compressed public key for a private scalar.
pub fn compute_pubkey(priv_key: &[u8]) -> Result<[u8; 33], CryptoError> {
    let sk = secret_key(priv_key)?;
    Ok(PublicKey::from_secret_key(SECP256K1, &sk).serialize())
}

/// Re-encode any valid point as its compressed form.
pub fn compress_point(pub_key: &[u8]) -> Result<[u8; 33], CryptoError> {
    Ok(public_key(pub_key)?.serialize())
}

/// Sign a 32-byte digest; the DER output is low-S normalized.
pub fn ecdsa_sign(digest: &[u8; 32], priv_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let sk = secret_key(priv_key)?;
    let msg = Message::from_digest(*digest);
    let mut sig = SECP256K1.sign_ecdsa(&msg, &sk);
    sig.normalize_s();
    Ok(sig.serialize_der().to_vec())
}

/// Verify a DER signature over a 32-byte digest.
pub fn ecdsa_verify(digest: &[u8; 32], der_sig: &[u8], pub_key: &[u8]) -> Result<(), CryptoError> {
    let pk = public_key(pub_key)?;
    let mut sig =
        Signature::from_der(der_sig).map_err(|_| CryptoError::MalformedSignature)?;
    sig.normalize_s();
    let msg = Message::from_digest(*digest);
    SECP256K1
        .verify_ecdsa(&msg, &sig, &pk)
        .map_err(|_| CryptoError::BadSignature)
}

// ----------------------------- Point arithmetic -----------------------------

/// ECDH leg: `scalar · P`, compressed.
pub fn pubkey_scalar_multiply(pub_key: &[u8], k: &[u8]) -> Result<[u8; 33], CryptoError> {
    let pk = public_key(pub_key)?;
    let s = scalar(k)?;
    let out = pk
        .mul_tweak(SECP256K1, &s)
        .map_err(|_| CryptoError::InvalidPoint)?;
    Ok(out.serialize())
}

/// `P + tweak·G`, the public half of a BIP32 non-hardened step.
pub fn pubkey_add_tweak(pub_key: &[u8], tweak: &[u8]) -> Result<[u8; 33], CryptoError> {
    let pk = public_key(pub_key)?;
    let s = scalar(tweak)?;
    let out = pk
        .add_exp_tweak(SECP256K1, &s)
        .map_err(|_| CryptoError::InvalidPoint)?;
    Ok(out.serialize())
}

/// Point addition `P + Q`, used by the ECDH derivation scheme.
pub fn pubkey_add_point(pub_key: &[u8], other: &[u8]) -> Result<[u8; 33], CryptoError> {
    let p = public_key(pub_key)?;
    let q = public_key(other)?;
    let out = p.combine(&q).map_err(|_| CryptoError::InvalidPoint)?;
    Ok(out.serialize())
}

/// `(a + tweak) mod n`, the private half of a BIP32 non-hardened step.
pub fn privkey_add_tweak(priv_key: &[u8], tweak: &[u8]) -> Result<SecureBytes, CryptoError> {
    let sk = secret_key(priv_key)?;
    let s = scalar(tweak)?;
    let out = sk.add_tweak(&s).map_err(|_| CryptoError::InvalidPrivateKey)?;
    Ok(SecureBytes::from(out.secret_bytes()))
}

/// `(a · m) mod n`, the private half of a legacy chain-code step.
pub fn privkey_mul(priv_key: &[u8], m: &[u8]) -> Result<SecureBytes, CryptoError> {
    let sk = secret_key(priv_key)?;
    let s = scalar(m)?;
    let out = sk.mul_tweak(&s).map_err(|_| CryptoError::InvalidPrivateKey)?;
    Ok(SecureBytes::from(out.secret_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash160_length_and_determinism() {
        let a = hash160(b"hdvault");
        let b = hash160(b"hdvault");
        assert_eq!(a, b);
        assert_eq!(a.len(), 20);
    }

    #[test]
    fn aes_cbc_round_trip() {
        let key = [0x11u8; 32];
        let iv = [0x22u8; 16];
        let plain = b"attack at dawn, bring change addresses";
        let ct = aes_cbc_encrypt(&key, &iv, plain).unwrap();
        assert_ne!(&ct[..plain.len().min(ct.len())], plain.as_slice());
        assert_eq!(ct.len() % AES_BLOCK_SIZE, 0);
        let pt = aes_cbc_decrypt(&key, &iv, &ct).unwrap();
        assert_eq!(pt, plain);
    }

    #[test]
    fn aes_cbc_rejects_wrong_key() {
        let key = [0x11u8; 32];
        let wrong = [0x12u8; 32];
        let iv = [0x22u8; 16];
        let ct = aes_cbc_encrypt(&key, &iv, b"secret").unwrap();
        // Either the padding breaks or the plaintext differs.
        match aes_cbc_decrypt(&wrong, &iv, &ct) {
            Ok(pt) => assert_ne!(pt, b"secret"),
            Err(_) => {}
        }
    }

    #[test]
    fn sign_verify_round_trip() {
        let priv_key = [0x33u8; 32];
        let digest = sha256(b"spend 1 btc");
        let sig = ecdsa_sign(&digest, &priv_key).unwrap();
        let pubkey = compute_pubkey(&priv_key).unwrap();
        ecdsa_verify(&digest, &sig, &pubkey).unwrap();

        let other = sha256(b"spend 2 btc");
        assert!(ecdsa_verify(&other, &sig, &pubkey).is_err());
    }

    #[test]
    fn tweak_consistency_between_halves() {
        // priv + t on the private side must match pub + t*G on the public side
        let priv_key = [0x44u8; 32];
        let tweak = sha256(b"tweak");
        let pub_key = compute_pubkey(&priv_key).unwrap();

        let priv_child = privkey_add_tweak(&priv_key, &tweak).unwrap();
        let pub_from_priv = compute_pubkey(priv_child.as_slice()).unwrap();
        let pub_child = pubkey_add_tweak(&pub_key, &tweak).unwrap();
        assert_eq!(pub_from_priv, pub_child);
    }

    #[test]
    fn multiply_consistency_between_halves() {
        let priv_key = [0x55u8; 32];
        let m = sha256(b"multiplier");
        let pub_key = compute_pubkey(&priv_key).unwrap();

        let priv_child = privkey_mul(&priv_key, &m).unwrap();
        let pub_from_priv = compute_pubkey(priv_child.as_slice()).unwrap();
        let pub_child = pubkey_scalar_multiply(&pub_key, &m).unwrap();
        assert_eq!(pub_from_priv, pub_child);
    }
}
