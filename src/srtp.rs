//! SRTP crypto suites and key material
//!
//! The ZRTP exchange produces per-direction master keys and salts for the
//! SRTP layer. The data path consumes them once media protection is wired
//! in; until then this module is the typed hand-off point.

/// SRTP encryption algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrtpEncryptionAlgorithm {
    /// AES Counter Mode (default in SRTP)
    AesCm,

    /// Null encryption (for debugging/testing only)
    Null,
}

/// SRTP authentication algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrtpAuthenticationAlgorithm {
    /// HMAC-SHA1 truncated to 80 bits (default in SRTP)
    HmacSha1_80,

    /// HMAC-SHA1 truncated to 32 bits
    HmacSha1_32,

    /// Null authentication (for debugging/testing only)
    Null,
}

/// SRTP crypto suite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrtpCryptoSuite {
    /// Encryption algorithm
    pub encryption: SrtpEncryptionAlgorithm,

    /// Authentication algorithm
    pub authentication: SrtpAuthenticationAlgorithm,

    /// Master key length in bytes
    pub key_length: usize,

    /// Master salt length in bytes
    pub salt_length: usize,

    /// Authentication tag length in bytes
    pub tag_length: usize,
}

/// Default SRTP crypto suite: AES-CM-128 + HMAC-SHA1-80
pub const SRTP_AES128_CM_SHA1_80: SrtpCryptoSuite = SrtpCryptoSuite {
    encryption: SrtpEncryptionAlgorithm::AesCm,
    authentication: SrtpAuthenticationAlgorithm::HmacSha1_80,
    key_length: 16,
    salt_length: 14,
    tag_length: 10,
};

/// Smaller tag SRTP crypto suite: AES-CM-128 + HMAC-SHA1-32
pub const SRTP_AES128_CM_SHA1_32: SrtpCryptoSuite = SrtpCryptoSuite {
    encryption: SrtpEncryptionAlgorithm::AesCm,
    authentication: SrtpAuthenticationAlgorithm::HmacSha1_32,
    key_length: 16,
    salt_length: 14,
    tag_length: 4,
};

/// Per-direction master keys and salts negotiated by ZRTP
#[derive(Clone, PartialEq, Eq)]
pub struct SrtpKeyMaterial {
    /// Suite the keys are sized for
    pub suite: SrtpCryptoSuite,

    /// Master key for packets we send
    pub local_key: Vec<u8>,

    /// Master salt for packets we send
    pub local_salt: Vec<u8>,

    /// Master key for packets we receive
    pub remote_key: Vec<u8>,

    /// Master salt for packets we receive
    pub remote_salt: Vec<u8>,
}

impl std::fmt::Debug for SrtpKeyMaterial {
    // Key bytes stay out of logs
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SrtpKeyMaterial")
            .field("suite", &self.suite)
            .field("local_key_len", &self.local_key.len())
            .field("remote_key_len", &self.remote_key.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suite_dimensions() {
        assert_eq!(SRTP_AES128_CM_SHA1_80.key_length, 16);
        assert_eq!(SRTP_AES128_CM_SHA1_80.salt_length, 14);
        assert_eq!(SRTP_AES128_CM_SHA1_80.tag_length, 10);
        assert_eq!(SRTP_AES128_CM_SHA1_32.tag_length, 4);
    }

    #[test]
    fn test_debug_hides_key_bytes() {
        let material = SrtpKeyMaterial {
            suite: SRTP_AES128_CM_SHA1_80,
            local_key: vec![0xAA; 16],
            local_salt: vec![0xBB; 14],
            remote_key: vec![0xCC; 16],
            remote_salt: vec![0xDD; 14],
        };

        let rendered = format!("{:?}", material);
        assert!(!rendered.contains("aa"));
        assert!(!rendered.contains("170"));
    }
}
