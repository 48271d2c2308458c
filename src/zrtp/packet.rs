//! ZRTP wire format per RFC 6189 §5
//!
//! ZRTP packets ride on the RTP port with an RTP-like 12-octet header
//! carrying the magic cookie `ZRTP` instead of a timestamp, one message,
//! and a CRC-32C footer. Messages open with the 0x505a preamble, their
//! length in 32-bit words and an 8-octet type block.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::Error;
use crate::Result;

use super::crypto::crc32c;

/// Magic cookie in place of the RTP timestamp field ("ZRTP")
pub const ZRTP_MAGIC: u32 = 0x5a52_5450;

/// Message preamble
pub const ZRTP_PREAMBLE: u16 = 0x505a;

/// Protocol version announced in Hello
pub const ZRTP_VERSION: &[u8; 4] = b"1.10";

/// Length of the MAC field carried by key-exchange messages
pub const ZRTP_MAC_SIZE: usize = 8;

/// Fixed packet header size (before the message)
const PACKET_HEADER_SIZE: usize = 12;

/// CRC footer size
const CRC_SIZE: usize = 4;

macro_rules! zrtp_alg {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident => $code:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            /// Four-octet code on the wire
            pub fn code(&self) -> [u8; 4] {
                match self {
                    $(Self::$variant => *$code),+
                }
            }

            /// Decode from the wire code
            pub fn from_code(code: &[u8]) -> Result<Self> {
                match code {
                    $(c if c == &$code[..] => Ok(Self::$variant),)+
                    _ => Err(Error::InvalidPacket(format!(
                        "Unknown {} code {:?}",
                        stringify!($name),
                        code
                    ))),
                }
            }
        }
    };
}

zrtp_alg!(
    /// Hash algorithms
    ZrtpHashAlg {
        /// SHA-256
        S256 => b"S256",
    }
);

zrtp_alg!(
    /// Block ciphers for the Confirm exchange and SRTP
    ZrtpCipher {
        /// AES-128
        Aes1 => b"AES1",
    }
);

zrtp_alg!(
    /// SRTP authentication tag lengths
    ZrtpAuthTag {
        /// HMAC-SHA1, 32-bit tag
        HS32 => b"HS32",
        /// HMAC-SHA1, 80-bit tag
        HS80 => b"HS80",
    }
);

zrtp_alg!(
    /// Key agreement schemes
    ZrtpKeyAgreement {
        /// Finite-field DH-3072 (RFC 3526 group 15)
        Dh3k => b"DH3k",
        /// X25519
        X255 => b"X255",
    }
);

zrtp_alg!(
    /// Short-authentication-string renderings
    ZrtpSasType {
        /// Four z-base-32 characters
        B32 => b"B32 ",
    }
);

/// ZRTP message types with their 8-octet type blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZrtpMessageType {
    Hello,
    HelloAck,
    Commit,
    DhPart1,
    DhPart2,
    Confirm1,
    Confirm2,
    Conf2Ack,
    Error,
    ErrorAck,
    GoClear,
    ClearAck,
}

impl ZrtpMessageType {
    /// Type block on the wire
    pub fn block(&self) -> &'static [u8; 8] {
        match self {
            Self::Hello => b"Hello   ",
            Self::HelloAck => b"HelloACK",
            Self::Commit => b"Commit  ",
            Self::DhPart1 => b"DHPart1 ",
            Self::DhPart2 => b"DHPart2 ",
            Self::Confirm1 => b"Confirm1",
            Self::Confirm2 => b"Confirm2",
            Self::Conf2Ack => b"Conf2ACK",
            Self::Error => b"Error   ",
            Self::ErrorAck => b"ErrorACK",
            Self::GoClear => b"GoClear ",
            Self::ClearAck => b"ClearACK",
        }
    }

    fn from_block(block: &[u8]) -> Result<Self> {
        match block {
            b"Hello   " => Ok(Self::Hello),
            b"HelloACK" => Ok(Self::HelloAck),
            b"Commit  " => Ok(Self::Commit),
            b"DHPart1 " => Ok(Self::DhPart1),
            b"DHPart2 " => Ok(Self::DhPart2),
            b"Confirm1" => Ok(Self::Confirm1),
            b"Confirm2" => Ok(Self::Confirm2),
            b"Conf2ACK" => Ok(Self::Conf2Ack),
            b"Error   " => Ok(Self::Error),
            b"ErrorACK" => Ok(Self::ErrorAck),
            b"GoClear " => Ok(Self::GoClear),
            b"ClearACK" => Ok(Self::ClearAck),
            _ => Err(Error::InvalidPacket(format!(
                "Unknown ZRTP message type {:?}",
                String::from_utf8_lossy(block)
            ))),
        }
    }
}

/// Hello: endpoint announcement with supported algorithm lists
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloMessage {
    pub version: [u8; 4],
    pub client_id: [u8; 16],
    pub h3: [u8; 32],
    pub zid: [u8; 12],
    pub hashes: Vec<ZrtpHashAlg>,
    pub ciphers: Vec<ZrtpCipher>,
    pub auth_tags: Vec<ZrtpAuthTag>,
    pub key_agreements: Vec<ZrtpKeyAgreement>,
    pub sas_types: Vec<ZrtpSasType>,
    pub mac: [u8; ZRTP_MAC_SIZE],
}

/// Commit: the initiator's algorithm selection plus its hvi
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitMessage {
    pub h2: [u8; 32],
    pub zid: [u8; 12],
    pub hash: ZrtpHashAlg,
    pub cipher: ZrtpCipher,
    pub auth_tag: ZrtpAuthTag,
    pub key_agreement: ZrtpKeyAgreement,
    pub sas_type: ZrtpSasType,
    pub hvi: [u8; 32],
    pub mac: [u8; ZRTP_MAC_SIZE],
}

/// DHPart1/DHPart2: a public value plus hashed retained-secret IDs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhPartMessage {
    pub h1: [u8; 32],
    pub rs1_id: [u8; 8],
    pub rs2_id: [u8; 8],
    pub aux_id: [u8; 8],
    pub pbx_id: [u8; 8],
    /// Public value, 384 octets for DH-3072 or 32 for X25519
    pub pk: Bytes,
    pub mac: [u8; ZRTP_MAC_SIZE],
}

/// Confirm1/Confirm2: the hash-chain head under the derived ZRTP key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmMessage {
    /// HMAC over the encrypted region
    pub confirm_mac: [u8; ZRTP_MAC_SIZE],

    /// AES-CFB initialization vector
    pub iv: [u8; 16],

    /// Encrypted region: H0, flags word, cache expiry (40 octets)
    pub encrypted: [u8; 40],
}

/// Error: a protocol failure code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorMessage {
    pub code: u32,
}

/// GoClear: request to drop back to cleartext
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoClearMessage {
    pub mac: [u8; ZRTP_MAC_SIZE],
}

/// Message body variants
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZrtpMessage {
    Hello(HelloMessage),
    HelloAck,
    Commit(CommitMessage),
    DhPart1(DhPartMessage),
    DhPart2(DhPartMessage),
    Confirm1(ConfirmMessage),
    Confirm2(ConfirmMessage),
    Conf2Ack,
    Error(ErrorMessage),
    ErrorAck,
    GoClear(GoClearMessage),
    ClearAck,
}

impl ZrtpMessage {
    /// The type tag of this message
    pub fn message_type(&self) -> ZrtpMessageType {
        match self {
            ZrtpMessage::Hello(_) => ZrtpMessageType::Hello,
            ZrtpMessage::HelloAck => ZrtpMessageType::HelloAck,
            ZrtpMessage::Commit(_) => ZrtpMessageType::Commit,
            ZrtpMessage::DhPart1(_) => ZrtpMessageType::DhPart1,
            ZrtpMessage::DhPart2(_) => ZrtpMessageType::DhPart2,
            ZrtpMessage::Confirm1(_) => ZrtpMessageType::Confirm1,
            ZrtpMessage::Confirm2(_) => ZrtpMessageType::Confirm2,
            ZrtpMessage::Conf2Ack => ZrtpMessageType::Conf2Ack,
            ZrtpMessage::Error(_) => ZrtpMessageType::Error,
            ZrtpMessage::ErrorAck => ZrtpMessageType::ErrorAck,
            ZrtpMessage::GoClear(_) => ZrtpMessageType::GoClear,
            ZrtpMessage::ClearAck => ZrtpMessageType::ClearAck,
        }
    }

    /// Serialize the message: preamble, length, type block, fields
    pub fn serialize(&self) -> Result<Bytes> {
        let mut body = BytesMut::new();

        match self {
            ZrtpMessage::Hello(hello) => {
                body.put_slice(&hello.version);
                body.put_slice(&hello.client_id);
                body.put_slice(&hello.h3);
                body.put_slice(&hello.zid);

                let counts = [
                    hello.hashes.len(),
                    hello.ciphers.len(),
                    hello.auth_tags.len(),
                    hello.key_agreements.len(),
                    hello.sas_types.len(),
                ];
                if counts.iter().any(|&c| c > 15) {
                    return Err(Error::InvalidValue(
                        "algorithm list longer than the 4-bit count field".to_string(),
                    ));
                }

                body.put_u8(0); // S/M/P flags unused
                body.put_u8(counts[0] as u8);
                body.put_u8(((counts[1] as u8) << 4) | counts[2] as u8);
                body.put_u8(((counts[3] as u8) << 4) | counts[4] as u8);

                for alg in &hello.hashes {
                    body.put_slice(&alg.code());
                }
                for alg in &hello.ciphers {
                    body.put_slice(&alg.code());
                }
                for alg in &hello.auth_tags {
                    body.put_slice(&alg.code());
                }
                for alg in &hello.key_agreements {
                    body.put_slice(&alg.code());
                }
                for alg in &hello.sas_types {
                    body.put_slice(&alg.code());
                }

                body.put_slice(&hello.mac);
            }
            ZrtpMessage::Commit(commit) => {
                body.put_slice(&commit.h2);
                body.put_slice(&commit.zid);
                body.put_slice(&commit.hash.code());
                body.put_slice(&commit.cipher.code());
                body.put_slice(&commit.auth_tag.code());
                body.put_slice(&commit.key_agreement.code());
                body.put_slice(&commit.sas_type.code());
                body.put_slice(&commit.hvi);
                body.put_slice(&commit.mac);
            }
            ZrtpMessage::DhPart1(dh) | ZrtpMessage::DhPart2(dh) => {
                if dh.pk.len() % 4 != 0 {
                    return Err(Error::InvalidValue(format!(
                        "public value of {} octets is not 32-bit aligned",
                        dh.pk.len()
                    )));
                }
                body.put_slice(&dh.h1);
                body.put_slice(&dh.rs1_id);
                body.put_slice(&dh.rs2_id);
                body.put_slice(&dh.aux_id);
                body.put_slice(&dh.pbx_id);
                body.put_slice(&dh.pk);
                body.put_slice(&dh.mac);
            }
            ZrtpMessage::Confirm1(confirm) | ZrtpMessage::Confirm2(confirm) => {
                body.put_slice(&confirm.confirm_mac);
                body.put_slice(&confirm.iv);
                body.put_slice(&confirm.encrypted);
            }
            ZrtpMessage::Error(err) => {
                body.put_u32(err.code);
            }
            ZrtpMessage::GoClear(clear) => {
                body.put_slice(&clear.mac);
            }
            ZrtpMessage::HelloAck
            | ZrtpMessage::Conf2Ack
            | ZrtpMessage::ErrorAck
            | ZrtpMessage::ClearAck => {}
        }

        let total = 12 + body.len();
        debug_assert_eq!(total % 4, 0);

        let mut buf = BytesMut::with_capacity(total);
        buf.put_u16(ZRTP_PREAMBLE);
        buf.put_u16((total / 4) as u16);
        buf.put_slice(self.message_type().block());
        buf.put_slice(&body);

        Ok(buf.freeze())
    }

    /// Parse a message from its serialized bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut buf = Bytes::copy_from_slice(data);
        if buf.remaining() < 12 {
            return Err(Error::BufferTooSmall {
                required: 12,
                available: buf.remaining(),
            });
        }

        let preamble = buf.get_u16();
        if preamble != ZRTP_PREAMBLE {
            return Err(Error::InvalidPacket(format!(
                "Bad ZRTP message preamble: {:04x}",
                preamble
            )));
        }

        let words = buf.get_u16() as usize;
        if words * 4 != data.len() {
            return Err(Error::InvalidPacket(format!(
                "ZRTP message length {} words does not match {} bytes",
                words,
                data.len()
            )));
        }

        let mut block = [0u8; 8];
        buf.copy_to_slice(&mut block);
        let message_type = ZrtpMessageType::from_block(&block)?;

        match message_type {
            ZrtpMessageType::Hello => parse_hello(&mut buf).map(ZrtpMessage::Hello),
            ZrtpMessageType::HelloAck => Ok(ZrtpMessage::HelloAck),
            ZrtpMessageType::Commit => parse_commit(&mut buf).map(ZrtpMessage::Commit),
            ZrtpMessageType::DhPart1 => parse_dh_part(&mut buf).map(ZrtpMessage::DhPart1),
            ZrtpMessageType::DhPart2 => parse_dh_part(&mut buf).map(ZrtpMessage::DhPart2),
            ZrtpMessageType::Confirm1 => parse_confirm(&mut buf).map(ZrtpMessage::Confirm1),
            ZrtpMessageType::Confirm2 => parse_confirm(&mut buf).map(ZrtpMessage::Confirm2),
            ZrtpMessageType::Conf2Ack => Ok(ZrtpMessage::Conf2Ack),
            ZrtpMessageType::Error => {
                if buf.remaining() < 4 {
                    return Err(Error::BufferTooSmall {
                        required: 4,
                        available: buf.remaining(),
                    });
                }
                Ok(ZrtpMessage::Error(ErrorMessage { code: buf.get_u32() }))
            }
            ZrtpMessageType::ErrorAck => Ok(ZrtpMessage::ErrorAck),
            ZrtpMessageType::GoClear => {
                if buf.remaining() < ZRTP_MAC_SIZE {
                    return Err(Error::BufferTooSmall {
                        required: ZRTP_MAC_SIZE,
                        available: buf.remaining(),
                    });
                }
                let mut mac = [0u8; ZRTP_MAC_SIZE];
                buf.copy_to_slice(&mut mac);
                Ok(ZrtpMessage::GoClear(GoClearMessage { mac }))
            }
            ZrtpMessageType::ClearAck => Ok(ZrtpMessage::ClearAck),
        }
    }
}

fn take<const N: usize>(buf: &mut Bytes) -> Result<[u8; N]> {
    if buf.remaining() < N {
        return Err(Error::BufferTooSmall {
            required: N,
            available: buf.remaining(),
        });
    }
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn parse_alg_list<T, F>(buf: &mut Bytes, count: usize, decode: F) -> Result<Vec<T>>
where
    F: Fn(&[u8]) -> Result<T>,
{
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let code: [u8; 4] = take(buf)?;
        out.push(decode(&code)?);
    }
    Ok(out)
}

fn parse_hello(buf: &mut Bytes) -> Result<HelloMessage> {
    let version: [u8; 4] = take(buf)?;
    let client_id: [u8; 16] = take(buf)?;
    let h3: [u8; 32] = take(buf)?;
    let zid: [u8; 12] = take(buf)?;

    let counts: [u8; 4] = take(buf)?;
    let hc = (counts[1] & 0x0F) as usize;
    let cc = (counts[2] >> 4) as usize;
    let ac = (counts[2] & 0x0F) as usize;
    let kc = (counts[3] >> 4) as usize;
    let sc = (counts[3] & 0x0F) as usize;

    let hashes = parse_alg_list(buf, hc, ZrtpHashAlg::from_code)?;
    let ciphers = parse_alg_list(buf, cc, ZrtpCipher::from_code)?;
    let auth_tags = parse_alg_list(buf, ac, ZrtpAuthTag::from_code)?;
    let key_agreements = parse_alg_list(buf, kc, ZrtpKeyAgreement::from_code)?;
    let sas_types = parse_alg_list(buf, sc, ZrtpSasType::from_code)?;

    let mac: [u8; ZRTP_MAC_SIZE] = take(buf)?;

    Ok(HelloMessage {
        version,
        client_id,
        h3,
        zid,
        hashes,
        ciphers,
        auth_tags,
        key_agreements,
        sas_types,
        mac,
    })
}

fn parse_commit(buf: &mut Bytes) -> Result<CommitMessage> {
    let h2: [u8; 32] = take(buf)?;
    let zid: [u8; 12] = take(buf)?;

    let hash_code: [u8; 4] = take(buf)?;
    let cipher_code: [u8; 4] = take(buf)?;
    let auth_code: [u8; 4] = take(buf)?;
    let keyagr_code: [u8; 4] = take(buf)?;
    let sas_code: [u8; 4] = take(buf)?;

    let hvi: [u8; 32] = take(buf)?;
    let mac: [u8; ZRTP_MAC_SIZE] = take(buf)?;

    Ok(CommitMessage {
        h2,
        zid,
        hash: ZrtpHashAlg::from_code(&hash_code)?,
        cipher: ZrtpCipher::from_code(&cipher_code)?,
        auth_tag: ZrtpAuthTag::from_code(&auth_code)?,
        key_agreement: ZrtpKeyAgreement::from_code(&keyagr_code)?,
        sas_type: ZrtpSasType::from_code(&sas_code)?,
        hvi,
        mac,
    })
}

fn parse_dh_part(buf: &mut Bytes) -> Result<DhPartMessage> {
    let h1: [u8; 32] = take(buf)?;
    let rs1_id: [u8; 8] = take(buf)?;
    let rs2_id: [u8; 8] = take(buf)?;
    let aux_id: [u8; 8] = take(buf)?;
    let pbx_id: [u8; 8] = take(buf)?;

    if buf.remaining() < ZRTP_MAC_SIZE {
        return Err(Error::BufferTooSmall {
            required: ZRTP_MAC_SIZE,
            available: buf.remaining(),
        });
    }
    let pk = buf.copy_to_bytes(buf.remaining() - ZRTP_MAC_SIZE);
    let mac: [u8; ZRTP_MAC_SIZE] = take(buf)?;

    Ok(DhPartMessage {
        h1,
        rs1_id,
        rs2_id,
        aux_id,
        pbx_id,
        pk,
        mac,
    })
}

fn parse_confirm(buf: &mut Bytes) -> Result<ConfirmMessage> {
    let confirm_mac: [u8; ZRTP_MAC_SIZE] = take(buf)?;
    let iv: [u8; 16] = take(buf)?;
    let encrypted: [u8; 40] = take(buf)?;

    Ok(ConfirmMessage {
        confirm_mac,
        iv,
        encrypted,
    })
}

/// One ZRTP packet: header, message, CRC footer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZrtpPacket {
    /// Monotonic packet sequence number
    pub sequence: u16,

    /// Source identifier, shared with the RTP stream
    pub ssrc: u32,

    /// The carried message
    pub message: ZrtpMessage,

    /// Raw serialized message bytes, kept for MAC checks and the total
    /// hash over the exchange
    pub raw_message: Bytes,
}

impl ZrtpPacket {
    /// Wrap a message for the wire
    pub fn new(sequence: u16, ssrc: u32, message: ZrtpMessage) -> Result<Self> {
        let raw_message = message.serialize()?;
        Ok(Self {
            sequence,
            ssrc,
            message,
            raw_message,
        })
    }

    /// Serialize with header and CRC-32C footer
    pub fn serialize(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(PACKET_HEADER_SIZE + self.raw_message.len() + CRC_SIZE);

        buf.put_u8(0x10);
        buf.put_u8(0x00);
        buf.put_u16(self.sequence);
        buf.put_u32(ZRTP_MAGIC);
        buf.put_u32(self.ssrc);
        buf.put_slice(&self.raw_message);

        let crc = crc32c(&buf);
        buf.put_u32(crc);

        buf.freeze()
    }

    /// Parse and validate a packet: magic cookie, CRC, message schema
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < PACKET_HEADER_SIZE + 12 + CRC_SIZE {
            return Err(Error::BufferTooSmall {
                required: PACKET_HEADER_SIZE + 12 + CRC_SIZE,
                available: data.len(),
            });
        }

        let magic = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if magic != ZRTP_MAGIC {
            return Err(Error::InvalidPacket(format!(
                "Bad ZRTP magic cookie: {:08x}",
                magic
            )));
        }

        let crc_offset = data.len() - CRC_SIZE;
        let expected = u32::from_be_bytes([
            data[crc_offset],
            data[crc_offset + 1],
            data[crc_offset + 2],
            data[crc_offset + 3],
        ]);
        if crc32c(&data[..crc_offset]) != expected {
            return Err(Error::InvalidPacket("ZRTP CRC mismatch".to_string()));
        }

        let sequence = u16::from_be_bytes([data[2], data[3]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let raw_message = Bytes::copy_from_slice(&data[PACKET_HEADER_SIZE..crc_offset]);
        let message = ZrtpMessage::parse(&raw_message)?;

        Ok(Self {
            sequence,
            ssrc,
            message,
            raw_message,
        })
    }

    /// Whether a datagram looks like ZRTP (magic cookie in the timestamp
    /// position), used to demultiplex it from RTP on a shared socket
    pub fn looks_like_zrtp(data: &[u8]) -> bool {
        data.len() >= PACKET_HEADER_SIZE
            && data[0] == 0x10
            && u32::from_be_bytes([data[4], data[5], data[6], data[7]]) == ZRTP_MAGIC
    }
}
