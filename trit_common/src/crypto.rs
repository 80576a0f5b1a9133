// trit_common is the main trit library implementing the transfer core shared logic.
// Copyright (C) 2025  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use crate::CryptoError;

use chacha20::XChaCha20;
use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::stream::{DecryptorBE32, EncryptorBE32};
use chacha20poly1305::aead::{Aead, OsRng};
use chacha20poly1305::consts::U19;
use chacha20poly1305::{AeadCore, ChaChaPoly1305, Key as CipherKey, KeyInit, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use subtle::ConstantTimeEq;

/// The size of an Argon2id salt in bytes.
pub const SALT_SIZE: usize = 16;
/// The size of a derived encryption key in bytes.
pub const KEY_SIZE: usize = 32;
/// The size of the handshake nonce in bytes (XChaCha20-Poly1305).
pub const NONCE_SIZE: usize = 24;
/// The size of the stream header installed by [`Encryptor::new`] in bytes.
pub const HEADER_SIZE: usize = 19;
/// The number of bytes the streaming cipher adds to every chunk (Poly1305 tag).
pub const ABYTES: usize = 16;
/// The number of bytes the one-shot AEAD adds to the handshake tag.
pub const MACBYTES: usize = 16;

/// The fixed plaintext sealed during the handshake to prove that both sides
/// derived the same key from the same password.
pub const HANDSHAKE_TAG: &[u8; 12] = b"trit_bonjour";
/// The size of the sealed handshake tag on the wire.
pub const HANDSHAKE_CIPHERTEXT_SIZE: usize = HANDSHAKE_TAG.len() + MACBYTES;

// libsodium "moderate" cost: 3 passes over 256 MiB with a single lane.
const ARGON2_T_COST: u32 = 3;
const ARGON2_M_COST_KIB: u32 = 262_144;
const ARGON2_LANES: u32 = 1;

/// A random salt for password-based key derivation,
/// transmitted in the clear ahead of the handshake.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Salt([u8; SALT_SIZE]);

impl Salt {
    /// Generates a uniformly random salt.
    pub fn random() -> Self {
        let mut bytes = [0; SALT_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; SALT_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SALT_SIZE] {
        &self.0
    }
}

/// A random nonce for the one-shot handshake AEAD.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Generates a uniformly random nonce.
    pub fn random() -> Self {
        let mut bytes = [0; NONCE_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

/// The stream header produced by the encrypting side's initialization and
/// required to initialize the decrypting side.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Header([u8; HEADER_SIZE]);

impl Header {
    pub fn from_bytes(bytes: [u8; HEADER_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HEADER_SIZE] {
        &self.0
    }
}

/// A secret key derived from the transfer password.
#[derive(Clone)]
pub struct Key([u8; KEY_SIZE]);

impl Key {
    /// Derives the shared key from `password` and `salt` using Argon2id.
    /// Deterministic for equal inputs.
    pub fn derive(password: &str, salt: &Salt) -> Result<Self, CryptoError> {
        let params = argon2::Params::new(ARGON2_M_COST_KIB, ARGON2_T_COST, ARGON2_LANES, Some(KEY_SIZE))
            .map_err(CryptoError::Kdf)?;

        let mut okm = [0; KEY_SIZE];
        argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::default(), params)
            .hash_password_into(password.as_bytes(), salt.as_bytes(), &mut okm)
            .map_err(CryptoError::Kdf)?;

        Ok(Self(okm))
    }

    /// Wraps raw key material. Mainly useful for tests and tooling;
    /// production keys come from [`Key::derive`].
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }
}

/// Streaming encryptor for chunk payloads.
///
/// The 19 byte stream nonce doubles as the wire header. The cipher lives in
/// an `Option` so that `encrypt_last` can consume it through a mutable
/// reference when the final chunk comes through.
pub struct Encryptor {
    cipher: Option<EncryptorBE32<XChaCha20Poly1305>>,
    header: Header,
}

impl Encryptor {
    /// Initializes a fresh encryption stream under `key`,
    /// generating the random header the peer needs for decryption.
    pub fn new(key: &Key) -> Self {
        let nonce = ChaChaPoly1305::<XChaCha20, U19>::generate_nonce(&mut OsRng);
        let cipher = EncryptorBE32::new(CipherKey::from_slice(&key.0), &nonce);

        let mut header = [0; HEADER_SIZE];
        header.copy_from_slice(&nonce);

        Self {
            cipher: Some(cipher),
            header: Header(header),
        }
    }

    /// Returns the stream header to transmit ahead of any chunk.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Encrypts one chunk payload. `is_final` must be set on exactly the last
    /// chunk of the stream; the choice is bound into the authentication tag.
    pub fn encrypt(&mut self, plain: &[u8], is_final: bool) -> Result<Vec<u8>, CryptoError> {
        let cipher = if is_final {
            self.cipher
                .take()
                .ok_or(CryptoError::Finalized)?
                .encrypt_last(plain)
        } else {
            self.cipher
                .as_mut()
                .ok_or(CryptoError::Finalized)?
                .encrypt_next(plain)
        }
        .map_err(|_| CryptoError::Stream)?;

        if cipher.len() != plain.len() + ABYTES {
            return Err(CryptoError::LengthMismatch {
                expected: plain.len() + ABYTES,
                actual: cipher.len(),
            });
        }

        Ok(cipher)
    }
}

/// Streaming decryptor for chunk payloads, initialized from the key and the
/// header received during the handshake.
pub struct Decryptor {
    cipher: Option<DecryptorBE32<XChaCha20Poly1305>>,
}

impl Decryptor {
    pub fn new(key: &Key, header: &Header) -> Self {
        let nonce = GenericArray::from_slice(&header.0);

        Self {
            cipher: Some(DecryptorBE32::new(CipherKey::from_slice(&key.0), nonce)),
        }
    }

    /// Decrypts one chunk payload. The stream binds chunk order and the final
    /// flag: tampering, a wrong key, reordering or an `is_final` value the
    /// sender did not use all fail with [`CryptoError::Auth`].
    pub fn decrypt(&mut self, cipher: &[u8], is_final: bool) -> Result<Vec<u8>, CryptoError> {
        if cipher.len() < ABYTES {
            return Err(CryptoError::LengthMismatch {
                expected: ABYTES,
                actual: cipher.len(),
            });
        }

        let plain = if is_final {
            self.cipher
                .take()
                .ok_or(CryptoError::Finalized)?
                .decrypt_last(cipher)
        } else {
            self.cipher
                .as_mut()
                .ok_or(CryptoError::Finalized)?
                .decrypt_next(cipher)
        }
        .map_err(|_| CryptoError::Auth)?;

        if plain.len() != cipher.len() - ABYTES {
            return Err(CryptoError::LengthMismatch {
                expected: cipher.len() - ABYTES,
                actual: plain.len(),
            });
        }

        Ok(plain)
    }
}

/// Seals the fixed handshake tag under `key` with a fresh random nonce.
pub fn seal_handshake(key: &Key) -> Result<(Nonce, [u8; HANDSHAKE_CIPHERTEXT_SIZE]), CryptoError> {
    let nonce = Nonce::random();

    let cipher = XChaCha20Poly1305::new(CipherKey::from_slice(&key.0))
        .encrypt(XNonce::from_slice(nonce.as_bytes()), HANDSHAKE_TAG.as_slice())
        .map_err(|_| CryptoError::Stream)?;

    let mut out = [0; HANDSHAKE_CIPHERTEXT_SIZE];
    out.copy_from_slice(&cipher);

    Ok((nonce, out))
}

/// Reports whether `ciphertext` opens under `key` and `nonce` to the expected
/// handshake tag. A wrong password, tampering or a stray nonce all yield false.
pub fn open_handshake(key: &Key, nonce: &Nonce, ciphertext: &[u8; HANDSHAKE_CIPHERTEXT_SIZE]) -> bool {
    match XChaCha20Poly1305::new(CipherKey::from_slice(&key.0))
        .decrypt(XNonce::from_slice(nonce.as_bytes()), ciphertext.as_slice())
    {
        Ok(plain) => plain.ct_eq(HANDSHAKE_TAG.as_slice()).into(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> Key {
        Key::from_bytes([0x42; KEY_SIZE])
    }

    #[test]
    fn stream_roundtrip_in_order() {
        let key = test_key();
        let mut encryptor = Encryptor::new(&key);
        let header = encryptor.header().clone();

        let chunks: [&[u8]; 3] = [b"first", b"second", b"third"];
        let mut sealed = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            sealed.push(encryptor.encrypt(chunk, i == chunks.len() - 1).unwrap());
        }

        let mut decryptor = Decryptor::new(&key, &header);
        for (i, cipher) in sealed.iter().enumerate() {
            assert_eq!(cipher.len(), chunks[i].len() + ABYTES);
            let plain = decryptor.decrypt(cipher, i == chunks.len() - 1).unwrap();
            assert_eq!(plain, chunks[i]);
        }
    }

    #[test]
    fn encrypt_after_final_fails() {
        let key = test_key();
        let mut encryptor = Encryptor::new(&key);
        encryptor.encrypt(b"only", true).unwrap();

        assert!(matches!(
            encryptor.encrypt(b"extra", false),
            Err(CryptoError::Finalized)
        ));
    }

    #[test]
    fn tampered_chunk_fails_authentication() {
        let key = test_key();
        let mut encryptor = Encryptor::new(&key);
        let header = encryptor.header().clone();
        let mut cipher = encryptor.encrypt(b"payload", true).unwrap();
        cipher[3] ^= 0x01;

        let mut decryptor = Decryptor::new(&key, &header);
        assert!(matches!(
            decryptor.decrypt(&cipher, true),
            Err(CryptoError::Auth)
        ));
    }

    #[test]
    fn final_flag_mismatch_fails_authentication() {
        let key = test_key();
        let mut encryptor = Encryptor::new(&key);
        let header = encryptor.header().clone();
        let cipher = encryptor.encrypt(b"payload", false).unwrap();

        let mut decryptor = Decryptor::new(&key, &header);
        assert!(matches!(
            decryptor.decrypt(&cipher, true),
            Err(CryptoError::Auth)
        ));
    }

    #[test]
    fn out_of_order_chunks_fail_authentication() {
        let key = test_key();
        let mut encryptor = Encryptor::new(&key);
        let header = encryptor.header().clone();
        let _first = encryptor.encrypt(b"first", false).unwrap();
        let second = encryptor.encrypt(b"second", false).unwrap();

        let mut decryptor = Decryptor::new(&key, &header);
        assert!(matches!(
            decryptor.decrypt(&second, false),
            Err(CryptoError::Auth)
        ));
    }

    #[test]
    fn short_ciphertext_is_length_mismatch() {
        let key = test_key();
        let header = Encryptor::new(&key).header().clone();
        let mut decryptor = Decryptor::new(&key, &header);

        assert!(matches!(
            decryptor.decrypt(&[0; ABYTES - 1], false),
            Err(CryptoError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn handshake_roundtrip_and_rejections() {
        let key = test_key();
        let (nonce, cipher) = seal_handshake(&key).unwrap();
        assert!(open_handshake(&key, &nonce, &cipher));

        let wrong_key = Key::from_bytes([0x43; KEY_SIZE]);
        assert!(!open_handshake(&wrong_key, &nonce, &cipher));

        let mut tampered = cipher;
        tampered[0] ^= 0x80;
        assert!(!open_handshake(&key, &nonce, &tampered));

        let stray_nonce = Nonce::random();
        assert!(!open_handshake(&key, &stray_nonce, &cipher));
    }

    // Argon2id at moderate cost; one deliberate slow test.
    #[test]
    fn key_derivation_is_deterministic_per_salt() {
        let salt = Salt::from_bytes([7; SALT_SIZE]);
        let other_salt = Salt::from_bytes([8; SALT_SIZE]);

        let a = Key::derive("hunter2", &salt).unwrap();
        let b = Key::derive("hunter2", &salt).unwrap();
        let c = Key::derive("hunter2", &other_salt).unwrap();

        assert_eq!(a.0, b.0);
        assert_ne!(a.0, c.0);
    }
}
