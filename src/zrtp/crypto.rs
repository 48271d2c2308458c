//! ZRTP cryptographic primitives
//!
//! Hash chain, message MACs, the ZRTP key derivation function, both key
//! agreements (finite-field DH-3072 and X25519), s0 derivation and the
//! Confirm encryption.

use aes::cipher::{AsyncStreamCipher, KeyIvInit};
use aes::Aes128;
use crc::{Crc, CRC_32_ISCSI};
use hmac::{Hmac, Mac};
use num_bigint::{BigUint, RandBigInt};
use rand::Rng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::Error;
use crate::Result;

use super::packet::{ZrtpKeyAgreement, ZRTP_MAC_SIZE};

type HmacSha256 = Hmac<Sha256>;
type Aes128CfbEnc = cfb_mode::Encryptor<Aes128>;
type Aes128CfbDec = cfb_mode::Decryptor<Aes128>;

const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// RFC 3526 group 15: the 3072-bit MODP prime, generator 2
const MODP_3072_PRIME: &str = "\
FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D04507A33\
A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7\
ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6BF12FFA06D98A0864\
D87602733EC86A64521F2B18177B200CBBE117577A615D6C770988C0BAD946E2\
08E24FA074E5AB3143DB5BFCE0FD108E4B82D120A93AD2CAFFFFFFFFFFFFFFFF";

/// Octet length of the DH-3072 public value
pub const DH3K_PUBLIC_SIZE: usize = 384;

/// Octet length of the X25519 public value
pub const X255_PUBLIC_SIZE: usize = 32;

/// CRC-32C as used for the ZRTP packet footer
pub fn crc32c(data: &[u8]) -> u32 {
    CRC32C.checksum(data)
}

/// SHA-256 digest
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// HMAC-SHA256
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::Generic(format!("HMAC init: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// Truncated HMAC carried in the MAC field of key-exchange messages.
/// Computed over the message with its trailing MAC excluded.
pub fn message_mac(key: &[u8], message: &[u8]) -> Result<[u8; ZRTP_MAC_SIZE]> {
    let covered = &message[..message.len() - ZRTP_MAC_SIZE];
    let full = hmac_sha256(key, covered)?;
    let mut mac = [0u8; ZRTP_MAC_SIZE];
    mac.copy_from_slice(&full[..ZRTP_MAC_SIZE]);
    Ok(mac)
}

/// Verify the trailing MAC of a raw message against `key`
pub fn verify_message_mac(key: &[u8], message: &[u8]) -> Result<()> {
    if message.len() < ZRTP_MAC_SIZE {
        return Err(Error::InvalidPacket("message shorter than its MAC".to_string()));
    }
    let expected = message_mac(key, message)?;
    if expected[..] != message[message.len() - ZRTP_MAC_SIZE..] {
        return Err(Error::AuthFailure("message MAC mismatch".to_string()));
    }
    Ok(())
}

/// ZRTP KDF per RFC 6189 §4.5.1:
/// `KDF(KI, Label, Context, L) = HMAC(KI, 1 || Label || 0x00 || Context || L)`
pub fn zrtp_kdf(ki: &[u8], label: &str, context: &[u8], length: usize) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(4 + label.len() + 1 + context.len() + 4);
    data.extend_from_slice(&1u32.to_be_bytes());
    data.extend_from_slice(label.as_bytes());
    data.push(0);
    data.extend_from_slice(context);
    data.extend_from_slice(&((length * 8) as u32).to_be_bytes());

    let block = hmac_sha256(ki, &data)?;
    Ok(block[..length.min(32)].to_vec())
}

/// Rolling hash chain H0..H3 (RFC 6189 §9): H0 is random, each link is
/// the SHA-256 of the one below it
#[derive(Debug, Clone)]
pub struct HashChain {
    pub h0: [u8; 32],
    pub h1: [u8; 32],
    pub h2: [u8; 32],
    pub h3: [u8; 32],
}

impl HashChain {
    /// Generate a fresh chain from a random H0
    pub fn generate() -> Self {
        let h0: [u8; 32] = rand::thread_rng().gen();
        Self::from_h0(h0)
    }

    /// Rebuild the chain from a known H0
    pub fn from_h0(h0: [u8; 32]) -> Self {
        let h1 = sha256(&h0);
        let h2 = sha256(&h1);
        let h3 = sha256(&h2);
        Self { h0, h1, h2, h3 }
    }
}

/// One side's key-agreement state
pub enum DhKeyPair {
    /// Finite-field DH over the 3072-bit MODP group
    Dh3k { secret: BigUint, public: Vec<u8> },

    /// X25519
    X255 {
        secret: StaticSecret,
        public: [u8; 32],
    },
}

impl DhKeyPair {
    /// Generate a key pair for the negotiated agreement
    pub fn generate(alg: ZrtpKeyAgreement) -> Self {
        match alg {
            ZrtpKeyAgreement::Dh3k => {
                let prime = modp_3072();
                let secret = rand::thread_rng().gen_biguint(512);
                let public = BigUint::from(2u32).modpow(&secret, &prime);
                DhKeyPair::Dh3k {
                    secret,
                    public: pad_be(&public, DH3K_PUBLIC_SIZE),
                }
            }
            ZrtpKeyAgreement::X255 => {
                let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
                let public = *PublicKey::from(&secret).as_bytes();
                DhKeyPair::X255 { secret, public }
            }
        }
    }

    /// The algorithm this pair belongs to
    pub fn algorithm(&self) -> ZrtpKeyAgreement {
        match self {
            DhKeyPair::Dh3k { .. } => ZrtpKeyAgreement::Dh3k,
            DhKeyPair::X255 { .. } => ZrtpKeyAgreement::X255,
        }
    }

    /// Public value as sent in DHPart messages
    pub fn public_value(&self) -> Vec<u8> {
        match self {
            DhKeyPair::Dh3k { public, .. } => public.clone(),
            DhKeyPair::X255 { public, .. } => public.to_vec(),
        }
    }

    /// Compute the shared secret from the peer's public value
    pub fn shared_secret(&self, peer: &[u8]) -> Result<Vec<u8>> {
        match self {
            DhKeyPair::Dh3k { secret, .. } => {
                if peer.len() != DH3K_PUBLIC_SIZE {
                    return Err(Error::InvalidPacket(format!(
                        "DH-3072 public value of {} octets, expected {}",
                        peer.len(),
                        DH3K_PUBLIC_SIZE
                    )));
                }
                let prime = modp_3072();
                let peer_value = BigUint::from_bytes_be(peer);
                // Reject degenerate values that force a known secret
                if peer_value <= BigUint::from(1u32) || peer_value >= &prime - 1u32 {
                    return Err(Error::AuthFailure(
                        "degenerate DH public value".to_string(),
                    ));
                }
                let shared = peer_value.modpow(secret, &prime);
                Ok(pad_be(&shared, DH3K_PUBLIC_SIZE))
            }
            DhKeyPair::X255 { secret, .. } => {
                let bytes: [u8; 32] = peer.try_into().map_err(|_| {
                    Error::InvalidPacket(format!(
                        "X25519 public value of {} octets, expected 32",
                        peer.len()
                    ))
                })?;
                let shared = secret.diffie_hellman(&PublicKey::from(bytes));
                Ok(shared.as_bytes().to_vec())
            }
        }
    }
}

fn modp_3072() -> BigUint {
    BigUint::parse_bytes(MODP_3072_PRIME.as_bytes(), 16)
        .expect("MODP-3072 prime constant parses")
}

fn pad_be(value: &BigUint, len: usize) -> Vec<u8> {
    let bytes = value.to_bytes_be();
    let mut out = vec![0u8; len.saturating_sub(bytes.len())];
    out.extend_from_slice(&bytes);
    out
}

/// s0 derivation per RFC 6189 §4.4.1.4, with no retained secrets:
/// `s0 = hash(1 || DHResult || "ZRTP-HMAC-KDF" || ZIDi || ZIDr ||
/// total_hash || 0 || 0 || 0)`
pub fn derive_s0(
    dh_result: &[u8],
    zid_i: &[u8; 12],
    zid_r: &[u8; 12],
    total_hash: &[u8; 32],
) -> [u8; 32] {
    let mut data = Vec::with_capacity(4 + dh_result.len() + 13 + 24 + 32 + 12);
    data.extend_from_slice(&1u32.to_be_bytes());
    data.extend_from_slice(dh_result);
    data.extend_from_slice(b"ZRTP-HMAC-KDF");
    data.extend_from_slice(zid_i);
    data.extend_from_slice(zid_r);
    data.extend_from_slice(total_hash);
    data.extend_from_slice(&0u32.to_be_bytes());
    data.extend_from_slice(&0u32.to_be_bytes());
    data.extend_from_slice(&0u32.to_be_bytes());
    sha256(&data)
}

/// The key block derived from s0 (RFC 6189 §4.5.3)
#[derive(Clone)]
pub struct ZrtpKeys {
    pub srtp_key_i: Vec<u8>,
    pub srtp_salt_i: Vec<u8>,
    pub srtp_key_r: Vec<u8>,
    pub srtp_salt_r: Vec<u8>,
    pub mac_key_i: Vec<u8>,
    pub mac_key_r: Vec<u8>,
    pub zrtp_key_i: [u8; 16],
    pub zrtp_key_r: [u8; 16],
    pub sas: String,
}

impl std::fmt::Debug for ZrtpKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZrtpKeys").field("sas", &self.sas).finish()
    }
}

/// Derive the full key block from s0
pub fn derive_keys(
    s0: &[u8; 32],
    zid_i: &[u8; 12],
    zid_r: &[u8; 12],
    total_hash: &[u8; 32],
) -> Result<ZrtpKeys> {
    let mut context = Vec::with_capacity(12 + 12 + 32);
    context.extend_from_slice(zid_i);
    context.extend_from_slice(zid_r);
    context.extend_from_slice(total_hash);

    let kdf = |label: &str, len: usize| zrtp_kdf(s0, label, &context, len);

    let zrtp_key_i: [u8; 16] = kdf("Initiator ZRTP key", 16)?
        .try_into()
        .map_err(|_| Error::Generic("KDF output length".to_string()))?;
    let zrtp_key_r: [u8; 16] = kdf("Responder ZRTP key", 16)?
        .try_into()
        .map_err(|_| Error::Generic("KDF output length".to_string()))?;

    let sashash = kdf("SAS", 32)?;

    Ok(ZrtpKeys {
        srtp_key_i: kdf("Initiator SRTP master key", 16)?,
        srtp_salt_i: kdf("Initiator SRTP master salt", 14)?,
        srtp_key_r: kdf("Responder SRTP master key", 16)?,
        srtp_salt_r: kdf("Responder SRTP master salt", 14)?,
        mac_key_i: kdf("Initiator HMAC key", 32)?,
        mac_key_r: kdf("Responder HMAC key", 32)?,
        zrtp_key_i,
        zrtp_key_r,
        sas: sas_b32(&sashash),
    })
}

/// z-base-32 alphabet used for the short authentication string
const SAS_ALPHABET: &[u8; 32] = b"ybndrfg8ejkmcpqxot1uwisza345h769";

/// Render the top 20 bits of the SAS hash as four z-base-32 characters
pub fn sas_b32(sashash: &[u8]) -> String {
    let word = u32::from_be_bytes([sashash[0], sashash[1], sashash[2], sashash[3]]);
    (0..4)
        .map(|i| {
            let index = ((word >> (32 - 5 * (i + 1))) & 0x1F) as usize;
            SAS_ALPHABET[index] as char
        })
        .collect()
}

/// Encrypt the Confirm region in place (AES-128-CFB)
pub fn confirm_encrypt(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) {
    Aes128CfbEnc::new(key.into(), iv.into()).encrypt(data);
}

/// Decrypt the Confirm region in place (AES-128-CFB)
pub fn confirm_decrypt(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) {
    Aes128CfbDec::new(key.into(), iv.into()).decrypt(data);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32c_check_value() {
        // Castagnoli check value from the polynomial's reference vectors
        assert_eq!(crc32c(b"123456789"), 0xE306_9283);
    }

    #[test]
    fn test_hash_chain_links() {
        let chain = HashChain::generate();
        assert_eq!(chain.h1, sha256(&chain.h0));
        assert_eq!(chain.h2, sha256(&chain.h1));
        assert_eq!(chain.h3, sha256(&chain.h2));

        let rebuilt = HashChain::from_h0(chain.h0);
        assert_eq!(rebuilt.h3, chain.h3);
    }

    #[test]
    fn test_kdf_deterministic_and_label_sensitive() {
        let ki = [0x42u8; 32];
        let ctx = b"context bytes";

        let a = zrtp_kdf(&ki, "Initiator ZRTP key", ctx, 16).unwrap();
        let b = zrtp_kdf(&ki, "Initiator ZRTP key", ctx, 16).unwrap();
        let c = zrtp_kdf(&ki, "Responder ZRTP key", ctx, 16).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_dh3k_agreement() {
        let alice = DhKeyPair::generate(ZrtpKeyAgreement::Dh3k);
        let bob = DhKeyPair::generate(ZrtpKeyAgreement::Dh3k);

        assert_eq!(alice.public_value().len(), DH3K_PUBLIC_SIZE);

        let s1 = alice.shared_secret(&bob.public_value()).unwrap();
        let s2 = bob.shared_secret(&alice.public_value()).unwrap();
        assert_eq!(s1, s2);
        assert_eq!(s1.len(), DH3K_PUBLIC_SIZE);
    }

    #[test]
    fn test_dh3k_rejects_degenerate_values() {
        let pair = DhKeyPair::generate(ZrtpKeyAgreement::Dh3k);

        let one = pad_be(&BigUint::from(1u32), DH3K_PUBLIC_SIZE);
        assert!(matches!(
            pair.shared_secret(&one),
            Err(Error::AuthFailure(_))
        ));
    }

    #[test]
    fn test_x255_agreement() {
        let alice = DhKeyPair::generate(ZrtpKeyAgreement::X255);
        let bob = DhKeyPair::generate(ZrtpKeyAgreement::X255);

        let s1 = alice.shared_secret(&bob.public_value()).unwrap();
        let s2 = bob.shared_secret(&alice.public_value()).unwrap();
        assert_eq!(s1, s2);
        assert_eq!(s1.len(), X255_PUBLIC_SIZE);
    }

    #[test]
    fn test_confirm_encryption_roundtrip() {
        let key = [0x11u8; 16];
        let iv = [0x22u8; 16];
        let plaintext = [0x33u8; 40];

        let mut data = plaintext;
        confirm_encrypt(&key, &iv, &mut data);
        assert_ne!(data, plaintext);

        confirm_decrypt(&key, &iv, &mut data);
        assert_eq!(data, plaintext);
    }

    #[test]
    fn test_message_mac_roundtrip() {
        let key = [0x55u8; 32];
        let mut message = vec![0u8; 48];

        let mac = message_mac(&key, &message).unwrap();
        let len = message.len();
        message[len - ZRTP_MAC_SIZE..].copy_from_slice(&mac);

        verify_message_mac(&key, &message).unwrap();

        message[0] ^= 1;
        assert!(matches!(
            verify_message_mac(&key, &message),
            Err(Error::AuthFailure(_))
        ));
    }

    #[test]
    fn test_key_derivation_role_separation() {
        let s0 = [0x77u8; 32];
        let zid_i = [1u8; 12];
        let zid_r = [2u8; 12];
        let total_hash = [3u8; 32];

        let keys = derive_keys(&s0, &zid_i, &zid_r, &total_hash).unwrap();
        assert_ne!(keys.srtp_key_i, keys.srtp_key_r);
        assert_ne!(keys.mac_key_i, keys.mac_key_r);
        assert_eq!(keys.srtp_salt_i.len(), 14);
        assert_eq!(keys.sas.len(), 4);
        assert!(keys
            .sas
            .bytes()
            .all(|c| SAS_ALPHABET.contains(&c)));
    }

    #[test]
    fn test_s0_depends_on_inputs() {
        let a = derive_s0(&[1; 32], &[1; 12], &[2; 12], &[3; 32]);
        let b = derive_s0(&[2; 32], &[1; 12], &[2; 12], &[3; 32]);
        assert_ne!(a, b);
    }
}
