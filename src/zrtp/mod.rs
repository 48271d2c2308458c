//! ZRTP key agreement (RFC 6189)
//!
//! A five-phase state machine driven by one message pair per phase:
//! Hello/HelloACK discovery, Commit, DHPart1/DHPart2, Confirm1/Confirm2,
//! Conf2ACK. Retransmission runs on an exponential backoff with per-phase
//! budgets; MAC or hash-chain failures terminate the exchange with an
//! Error message. The negotiated secrets are exported as SRTP key
//! material.

pub mod crypto;
pub mod packet;

pub use crypto::ZrtpKeys;
pub use packet::{
    ZrtpAuthTag, ZrtpCipher, ZrtpHashAlg, ZrtpKeyAgreement, ZrtpMessage, ZrtpMessageType,
    ZrtpPacket, ZrtpSasType,
};

use bytes::Bytes;
use rand::Rng;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::srtp::{SrtpKeyMaterial, SRTP_AES128_CM_SHA1_32, SRTP_AES128_CM_SHA1_80};
use crate::transport::{DatagramTransport, UdpTransport};
use crate::Result;

use packet::{CommitMessage, ConfirmMessage, DhPartMessage, ErrorMessage, HelloMessage};

/// Initial retransmission interval
const RETRANSMIT_T1: Duration = Duration::from_millis(50);

/// Backoff ceiling for Hello
const HELLO_CAP: Duration = Duration::from_millis(200);

/// Total Hello phase budget
const HELLO_BUDGET: Duration = Duration::from_secs(3);

/// Backoff ceiling for every later message
const EXCHANGE_CAP: Duration = Duration::from_millis(1200);

/// Total budget for each later phase
const EXCHANGE_BUDGET: Duration = Duration::from_secs(10);

/// Protocol error code sent when authentication fails
const ERROR_AUTH: u32 = 0x70;

/// Protocol error code sent when no algorithm overlap exists
const ERROR_ALGORITHM: u32 = 0x51;

/// Negotiation role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZrtpRole {
    /// Sends Commit after discovery
    Initiator,

    /// Waits for the peer's Commit
    Responder,
}

/// Exchange progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZrtpState {
    /// Exchanging Hello/HelloACK
    Discovery,

    /// Responder waiting for Commit
    WaitCommit,

    /// Initiator sent Commit, waiting for DHPart1
    WaitDhPart1,

    /// Responder sent DHPart1, waiting for DHPart2
    WaitDhPart2,

    /// Initiator sent DHPart2, waiting for Confirm1
    WaitConfirm1,

    /// Responder sent Confirm1, waiting for Confirm2
    WaitConfirm2,

    /// Initiator sent Confirm2, waiting for Conf2ACK
    WaitConf2Ack,

    /// Keys agreed and confirmed
    Secured,

    /// Keys dropped after GoClear
    Cleared,

    /// Terminated by error or timeout
    Failed,
}

/// Endpoint configuration for the exchange
#[derive(Debug, Clone)]
pub struct ZrtpConfig {
    /// Free-text client identifier carried in Hello (16 octets on the wire)
    pub client_id: String,

    /// 12-octet endpoint identifier
    pub zid: [u8; 12],

    /// Starting role preference; a commit race may demote an initiator
    pub role: ZrtpRole,

    pub hashes: Vec<ZrtpHashAlg>,
    pub ciphers: Vec<ZrtpCipher>,
    pub auth_tags: Vec<ZrtpAuthTag>,
    pub key_agreements: Vec<ZrtpKeyAgreement>,
    pub sas_types: Vec<ZrtpSasType>,
}

impl Default for ZrtpConfig {
    fn default() -> Self {
        Self {
            client_id: "rtp-stream".to_string(),
            zid: rand::thread_rng().gen(),
            role: ZrtpRole::Initiator,
            hashes: vec![ZrtpHashAlg::S256],
            ciphers: vec![ZrtpCipher::Aes1],
            auth_tags: vec![ZrtpAuthTag::HS80, ZrtpAuthTag::HS32],
            key_agreements: vec![ZrtpKeyAgreement::Dh3k, ZrtpKeyAgreement::X255],
            sas_types: vec![ZrtpSasType::B32],
        }
    }
}

/// The agreed secrets handed to the SRTP layer
#[derive(Debug, Clone)]
pub struct ZrtpSecrets {
    /// Per-direction master keys and salts
    pub srtp: SrtpKeyMaterial,

    /// Short authentication string for out-of-band comparison
    pub sas: String,
}

/// Retransmission bookkeeping for the in-flight message
struct Retransmit {
    message: ZrtpMessage,
    interval: Duration,
    cap: Duration,
    next: Instant,
    deadline: Instant,
}

/// The ZRTP state machine for one stream
pub struct Zrtp {
    config: ZrtpConfig,
    role: ZrtpRole,
    state: ZrtpState,
    ssrc: u32,
    seq: u16,

    chain: crypto::HashChain,
    dh: Option<crypto::DhKeyPair>,

    // Negotiated algorithms, fixed once a Commit is accepted
    cipher: Option<ZrtpCipher>,
    auth_tag: Option<ZrtpAuthTag>,
    key_agreement: Option<ZrtpKeyAgreement>,

    our_hello_raw: Bytes,
    peer_hello: Option<HelloMessage>,
    peer_hello_raw: Option<Bytes>,
    hello_acked: bool,

    our_commit: Option<CommitMessage>,
    our_commit_raw: Option<Bytes>,
    peer_commit: Option<CommitMessage>,
    peer_commit_raw: Option<Bytes>,

    our_dhpart: Option<ZrtpMessage>,
    our_dhpart_raw: Option<Bytes>,
    peer_dhpart: Option<DhPartMessage>,

    keys: Option<ZrtpKeys>,
    retransmit: Option<Retransmit>,
}

impl Zrtp {
    /// Create the state machine. `ssrc` ties the signalling to the media
    /// stream it protects.
    pub fn new(config: ZrtpConfig, ssrc: u32) -> Result<Self> {
        if config.hashes.is_empty()
            || config.ciphers.is_empty()
            || config.auth_tags.is_empty()
            || config.key_agreements.is_empty()
            || config.sas_types.is_empty()
        {
            return Err(Error::InvalidValue(
                "every ZRTP algorithm list needs at least one entry".to_string(),
            ));
        }

        let chain = crypto::HashChain::generate();
        let role = config.role;

        let mut zrtp = Self {
            config,
            role,
            state: ZrtpState::Discovery,
            ssrc,
            seq: 0,
            chain,
            dh: None,
            cipher: None,
            auth_tag: None,
            key_agreement: None,
            our_hello_raw: Bytes::new(),
            peer_hello: None,
            peer_hello_raw: None,
            hello_acked: false,
            our_commit: None,
            our_commit_raw: None,
            peer_commit: None,
            peer_commit_raw: None,
            our_dhpart: None,
            our_dhpart_raw: None,
            peer_dhpart: None,
            keys: None,
            retransmit: None,
        };

        let (_, raw) = zrtp.build_hello()?;
        zrtp.our_hello_raw = raw;
        Ok(zrtp)
    }

    /// Current state
    pub fn state(&self) -> ZrtpState {
        self.state
    }

    /// Current role (a commit race may have changed the preference)
    pub fn role(&self) -> ZrtpRole {
        self.role
    }

    /// Whether the exchange finished successfully
    pub fn is_complete(&self) -> bool {
        self.state == ZrtpState::Secured
    }

    /// The agreed secrets, available once secured
    pub fn secrets(&self) -> Option<ZrtpSecrets> {
        if self.state != ZrtpState::Secured {
            return None;
        }
        let keys = self.keys.as_ref()?;

        let suite = match self.auth_tag? {
            ZrtpAuthTag::HS80 => SRTP_AES128_CM_SHA1_80,
            ZrtpAuthTag::HS32 => SRTP_AES128_CM_SHA1_32,
        };

        // The initiator sends under the initiator keys, receives under the
        // responder keys; the responder is mirrored
        let srtp = match self.role {
            ZrtpRole::Initiator => SrtpKeyMaterial {
                suite,
                local_key: keys.srtp_key_i.clone(),
                local_salt: keys.srtp_salt_i.clone(),
                remote_key: keys.srtp_key_r.clone(),
                remote_salt: keys.srtp_salt_r.clone(),
            },
            ZrtpRole::Responder => SrtpKeyMaterial {
                suite,
                local_key: keys.srtp_key_r.clone(),
                local_salt: keys.srtp_salt_r.clone(),
                remote_key: keys.srtp_key_i.clone(),
                remote_salt: keys.srtp_salt_i.clone(),
            },
        };

        Some(ZrtpSecrets {
            srtp,
            sas: keys.sas.clone(),
        })
    }

    /// Begin discovery: returns the first Hello packet and arms its
    /// retransmission timer
    pub fn start(&mut self, now: Instant) -> Result<Bytes> {
        let message = ZrtpMessage::parse(&self.our_hello_raw)?;
        self.arm(message.clone(), now, HELLO_CAP, HELLO_BUDGET);
        self.wrap(message)
    }

    /// Earliest instant `poll` should be called at
    pub fn next_wakeup(&self) -> Option<Instant> {
        self.retransmit
            .as_ref()
            .map(|rt| rt.next.min(rt.deadline))
    }

    /// Drive retransmission. Returns a packet to resend, nothing, or
    /// `Timeout` when the phase budget is exhausted.
    pub fn poll(&mut self, now: Instant) -> Result<Option<Bytes>> {
        if matches!(
            self.state,
            ZrtpState::Secured | ZrtpState::Cleared | ZrtpState::Failed
        ) {
            return Ok(None);
        }

        let (message, due) = match &mut self.retransmit {
            None => return Ok(None),
            Some(rt) => {
                if now >= rt.deadline {
                    self.state = ZrtpState::Failed;
                    return Err(Error::Timeout(
                        "ZRTP retransmission budget exhausted".to_string(),
                    ));
                }
                if now < rt.next {
                    return Ok(None);
                }
                rt.interval = (rt.interval * 2).min(rt.cap);
                rt.next = now + rt.interval;
                (rt.message.clone(), true)
            }
        };

        if due {
            trace!("Retransmitting {:?}", message.message_type());
            return self.wrap(message).map(Some);
        }
        Ok(None)
    }

    /// Process one inbound datagram; returns the packets to send back
    pub fn process(&mut self, data: &[u8], now: Instant) -> Result<Vec<Bytes>> {
        let packet = ZrtpPacket::parse(data)?;
        trace!(
            "ZRTP {:?} in state {:?}",
            packet.message.message_type(),
            self.state
        );

        match packet.message.clone() {
            ZrtpMessage::Hello(hello) => self.on_hello(hello, packet.raw_message, now),
            ZrtpMessage::HelloAck => self.on_hello_ack(now),
            ZrtpMessage::Commit(commit) => self.on_commit(commit, packet.raw_message, now),
            ZrtpMessage::DhPart1(dh) => self.on_dh_part1(dh, packet.raw_message, now),
            ZrtpMessage::DhPart2(dh) => self.on_dh_part2(dh, packet.raw_message, now),
            ZrtpMessage::Confirm1(confirm) => self.on_confirm1(confirm, now),
            ZrtpMessage::Confirm2(confirm) => self.on_confirm2(confirm),
            ZrtpMessage::Conf2Ack => self.on_conf2_ack(),
            ZrtpMessage::Error(err) => {
                warn!("Peer reported ZRTP error {:#x}", err.code);
                self.state = ZrtpState::Failed;
                self.retransmit = None;
                // Acknowledge; the caller observes the failure via state()
                Ok(vec![self.wrap(ZrtpMessage::ErrorAck)?])
            }
            ZrtpMessage::ErrorAck => Ok(Vec::new()),
            ZrtpMessage::GoClear(_) => self.on_go_clear(),
            ZrtpMessage::ClearAck => Ok(Vec::new()),
        }
    }

    // ---- message handlers -------------------------------------------------

    fn on_hello(
        &mut self,
        hello: HelloMessage,
        raw: Bytes,
        now: Instant,
    ) -> Result<Vec<Bytes>> {
        if &hello.version != packet::ZRTP_VERSION {
            return self.fail(ERROR_ALGORITHM, "unsupported protocol version");
        }

        if self.peer_hello.is_none() {
            debug!(
                "Peer hello from zid={:02x?}, client {:?}",
                &hello.zid[..4],
                String::from_utf8_lossy(&hello.client_id)
            );
            self.peer_hello = Some(hello);
            self.peer_hello_raw = Some(raw);
        }

        let mut out = vec![self.wrap(ZrtpMessage::HelloAck)?];
        out.extend(self.maybe_commit(now)?);
        Ok(out)
    }

    fn on_hello_ack(&mut self, now: Instant) -> Result<Vec<Bytes>> {
        if !self.hello_acked {
            self.hello_acked = true;
            // Hello no longer needs retransmission
            if let Some(rt) = &self.retransmit {
                if rt.message.message_type() == ZrtpMessageType::Hello {
                    self.retransmit = None;
                }
            }
        }
        self.maybe_commit(now)
    }

    /// Once discovery is done on both sides, the initiator commits
    fn maybe_commit(&mut self, now: Instant) -> Result<Vec<Bytes>> {
        if self.state != ZrtpState::Discovery || !self.hello_acked || self.peer_hello.is_none() {
            return Ok(Vec::new());
        }

        if self.negotiate().is_err() {
            return self.fail(ERROR_ALGORITHM, "no algorithm overlap with peer");
        }

        if self.role == ZrtpRole::Responder {
            self.state = ZrtpState::WaitCommit;
            return Ok(Vec::new());
        }

        let commit = self.build_commit()?;
        self.state = ZrtpState::WaitDhPart1;
        self.arm(commit.clone(), now, EXCHANGE_CAP, EXCHANGE_BUDGET);
        Ok(vec![self.wrap(commit)?])
    }

    fn on_commit(
        &mut self,
        commit: CommitMessage,
        raw: Bytes,
        now: Instant,
    ) -> Result<Vec<Bytes>> {
        match self.state {
            ZrtpState::WaitCommit => self.accept_commit(commit, raw, now),

            // The peer may commit before its HelloACK reached us
            ZrtpState::Discovery if self.peer_hello.is_some() => {
                self.hello_acked = true;
                self.accept_commit(commit, raw, now)
            }

            // Simultaneous commit: the lower hvi (lower ZID on a tie)
            // becomes the responder
            ZrtpState::WaitDhPart1 => {
                let our_hvi = match &self.our_commit {
                    Some(ours) => ours.hvi,
                    None => return Ok(Vec::new()),
                };
                let yield_initiator = match our_hvi.cmp(&commit.hvi) {
                    std::cmp::Ordering::Less => true,
                    std::cmp::Ordering::Greater => false,
                    std::cmp::Ordering::Equal => self.config.zid < commit.zid,
                };

                if yield_initiator {
                    debug!("Lost the commit race, continuing as responder");
                    self.role = ZrtpRole::Responder;
                    self.our_commit = None;
                    self.our_commit_raw = None;
                    self.retransmit = None;
                    self.accept_commit(commit, raw, now)
                } else {
                    // The peer will yield; keep waiting for DHPart1
                    Ok(Vec::new())
                }
            }

            // Duplicate Commit while our DHPart1 is in flight
            ZrtpState::WaitDhPart2 => {
                let message = self.our_dhpart.clone();
                match message {
                    Some(message) => Ok(vec![self.wrap(message)?]),
                    None => Ok(Vec::new()),
                }
            }

            _ => Ok(Vec::new()),
        }
    }

    /// Responder path: validate the Commit and answer with DHPart1
    fn accept_commit(
        &mut self,
        commit: CommitMessage,
        raw: Bytes,
        now: Instant,
    ) -> Result<Vec<Bytes>> {
        let peer_hello_raw = match &self.peer_hello_raw {
            Some(raw) => raw.clone(),
            None => return self.fail(ERROR_AUTH, "commit without prior hello"),
        };
        let peer_h3 = self.peer_hello.as_ref().map(|h| h.h3).unwrap_or_default();

        // h2 must hash to the h3 announced in Hello, and it keys the
        // deferred Hello MAC
        if crypto::sha256(&commit.h2) != peer_h3 {
            return self.fail(ERROR_AUTH, "commit hash chain does not match hello");
        }
        if crypto::verify_message_mac(&commit.h2, &peer_hello_raw).is_err() {
            return self.fail(ERROR_AUTH, "hello MAC verification failed");
        }

        // Adopt the initiator's selection, provided we support it
        if !self.config.ciphers.contains(&commit.cipher)
            || !self.config.auth_tags.contains(&commit.auth_tag)
            || !self.config.key_agreements.contains(&commit.key_agreement)
            || !self.config.hashes.contains(&commit.hash)
            || !self.config.sas_types.contains(&commit.sas_type)
        {
            return self.fail(ERROR_ALGORITHM, "commit selected unsupported algorithms");
        }
        self.cipher = Some(commit.cipher);
        self.auth_tag = Some(commit.auth_tag);
        self.key_agreement = Some(commit.key_agreement);

        self.role = ZrtpRole::Responder;
        self.ensure_dh(commit.key_agreement);

        let dh_part1 = self.build_dh_part(false)?;
        let raw_part1 = dh_part1.serialize()?;

        self.peer_commit = Some(commit);
        self.peer_commit_raw = Some(raw);
        self.our_dhpart = Some(dh_part1.clone());
        self.our_dhpart_raw = Some(raw_part1);

        self.state = ZrtpState::WaitDhPart2;
        self.arm(dh_part1.clone(), now, EXCHANGE_CAP, EXCHANGE_BUDGET);
        Ok(vec![self.wrap(dh_part1)?])
    }

    fn on_dh_part1(
        &mut self,
        dh: DhPartMessage,
        raw: Bytes,
        now: Instant,
    ) -> Result<Vec<Bytes>> {
        match self.state {
            ZrtpState::WaitDhPart1 => {}
            // Retransmitted DHPart1 while our DHPart2 is in flight
            ZrtpState::WaitConfirm1 => {
                let message = self.our_dhpart.clone();
                return match message {
                    Some(message) => Ok(vec![self.wrap(message)?]),
                    None => Ok(Vec::new()),
                };
            }
            _ => return Ok(Vec::new()),
        }

        let peer_h3 = self.peer_hello.as_ref().map(|h| h.h3).unwrap_or_default();
        if crypto::sha256(&crypto::sha256(&dh.h1)) != peer_h3 {
            return self.fail(ERROR_AUTH, "DHPart1 hash chain does not match hello");
        }

        let dh_pair = match &self.dh {
            Some(pair) => pair,
            None => return self.fail(ERROR_AUTH, "no local key pair"),
        };
        let dh_result = match dh_pair.shared_secret(&dh.pk) {
            Ok(result) => result,
            Err(_) => return self.fail(ERROR_AUTH, "bad DH public value"),
        };

        // total_hash binds the responder Hello, Commit and both DH parts
        let peer_hello_raw = self.peer_hello_raw.clone().unwrap_or_default();
        let commit_raw = self.our_commit_raw.clone().unwrap_or_default();
        let dhpart2_raw = self.our_dhpart_raw.clone().unwrap_or_default();
        let total_hash = total_hash(&peer_hello_raw, &commit_raw, &raw, &dhpart2_raw);

        let zid_i = self.config.zid;
        let zid_r = self.peer_hello.as_ref().map(|h| h.zid).unwrap_or_default();
        let s0 = crypto::derive_s0(&dh_result, &zid_i, &zid_r, &total_hash);
        self.keys = Some(crypto::derive_keys(&s0, &zid_i, &zid_r, &total_hash)?);
        self.peer_dhpart = Some(dh);

        let dh_part2 = match &self.our_dhpart {
            Some(message) => message.clone(),
            None => return self.fail(ERROR_AUTH, "missing prepared DHPart2"),
        };

        self.state = ZrtpState::WaitConfirm1;
        self.arm(dh_part2.clone(), now, EXCHANGE_CAP, EXCHANGE_BUDGET);
        Ok(vec![self.wrap(dh_part2)?])
    }

    fn on_dh_part2(
        &mut self,
        dh: DhPartMessage,
        raw: Bytes,
        now: Instant,
    ) -> Result<Vec<Bytes>> {
        match self.state {
            ZrtpState::WaitDhPart2 => {}
            // Retransmitted DHPart2 while our Confirm1 is in flight
            ZrtpState::WaitConfirm2 => {
                let message = self.retransmit.as_ref().map(|rt| rt.message.clone());
                return match message {
                    Some(message) => Ok(vec![self.wrap(message)?]),
                    None => Ok(Vec::new()),
                };
            }
            _ => return Ok(Vec::new()),
        }

        let commit = match &self.peer_commit {
            Some(commit) => commit.clone(),
            None => return self.fail(ERROR_AUTH, "DHPart2 without commit"),
        };

        // h1 keys the deferred Commit MAC and must chain up to its h2
        if crypto::sha256(&dh.h1) != commit.h2 {
            return self.fail(ERROR_AUTH, "DHPart2 hash chain does not match commit");
        }
        let peer_commit_raw = self.peer_commit_raw.clone().unwrap_or_default();
        if crypto::verify_message_mac(&dh.h1, &peer_commit_raw).is_err() {
            return self.fail(ERROR_AUTH, "commit MAC verification failed");
        }

        // The hvi promised in Commit must match the DHPart2 actually sent
        let hvi = crypto::sha256(&[raw.as_ref(), self.our_hello_raw.as_ref()].concat());
        if hvi != commit.hvi {
            return self.fail(ERROR_AUTH, "hvi mismatch");
        }

        let dh_pair = match &self.dh {
            Some(pair) => pair,
            None => return self.fail(ERROR_AUTH, "no local key pair"),
        };
        let dh_result = match dh_pair.shared_secret(&dh.pk) {
            Ok(result) => result,
            Err(_) => return self.fail(ERROR_AUTH, "bad DH public value"),
        };

        let our_hello_raw = self.our_hello_raw.clone();
        let dhpart1_raw = self.our_dhpart_raw.clone().unwrap_or_default();
        let total_hash = total_hash(&our_hello_raw, &peer_commit_raw, &dhpart1_raw, &raw);

        let zid_i = commit.zid;
        let zid_r = self.config.zid;
        let s0 = crypto::derive_s0(&dh_result, &zid_i, &zid_r, &total_hash);
        self.keys = Some(crypto::derive_keys(&s0, &zid_i, &zid_r, &total_hash)?);
        self.peer_dhpart = Some(dh);

        let confirm1 = self.build_confirm(false)?;
        self.state = ZrtpState::WaitConfirm2;
        self.arm(confirm1.clone(), now, EXCHANGE_CAP, EXCHANGE_BUDGET);
        Ok(vec![self.wrap(confirm1)?])
    }

    fn on_confirm1(&mut self, confirm: ConfirmMessage, now: Instant) -> Result<Vec<Bytes>> {
        match self.state {
            ZrtpState::WaitConfirm1 => {}
            // Retransmitted Confirm1 while our Confirm2 is in flight
            ZrtpState::WaitConf2Ack => {
                let message = self.retransmit.as_ref().map(|rt| rt.message.clone());
                return match message {
                    Some(message) => Ok(vec![self.wrap(message)?]),
                    None => Ok(Vec::new()),
                };
            }
            _ => return Ok(Vec::new()),
        }

        let h0 = match self.open_confirm(&confirm, false) {
            Ok(h0) => h0,
            Err(_) => return self.fail(ERROR_AUTH, "Confirm1 verification failed"),
        };

        // The revealed h0 must be the head of the chain below DHPart1's h1
        let peer_h1 = self.peer_dhpart.as_ref().map(|d| d.h1).unwrap_or_default();
        if crypto::sha256(&h0) != peer_h1 {
            return self.fail(ERROR_AUTH, "Confirm1 hash chain mismatch");
        }

        let confirm2 = self.build_confirm(true)?;
        self.state = ZrtpState::WaitConf2Ack;
        self.arm(confirm2.clone(), now, EXCHANGE_CAP, EXCHANGE_BUDGET);
        Ok(vec![self.wrap(confirm2)?])
    }

    fn on_confirm2(&mut self, confirm: ConfirmMessage) -> Result<Vec<Bytes>> {
        match self.state {
            ZrtpState::WaitConfirm2 => {}
            // Our Conf2ACK was lost; repeat it
            ZrtpState::Secured if self.role == ZrtpRole::Responder => {
                return Ok(vec![self.wrap(ZrtpMessage::Conf2Ack)?]);
            }
            _ => return Ok(Vec::new()),
        }

        let h0 = match self.open_confirm(&confirm, true) {
            Ok(h0) => h0,
            Err(_) => return self.fail(ERROR_AUTH, "Confirm2 verification failed"),
        };

        let peer_h1 = self.peer_dhpart.as_ref().map(|d| d.h1).unwrap_or_default();
        if crypto::sha256(&h0) != peer_h1 {
            return self.fail(ERROR_AUTH, "Confirm2 hash chain mismatch");
        }

        self.state = ZrtpState::Secured;
        self.retransmit = None;
        debug!("ZRTP secured as responder, SAS {:?}", self.keys.as_ref().map(|k| &k.sas));
        Ok(vec![self.wrap(ZrtpMessage::Conf2Ack)?])
    }

    fn on_conf2_ack(&mut self) -> Result<Vec<Bytes>> {
        if self.state == ZrtpState::WaitConf2Ack {
            self.state = ZrtpState::Secured;
            self.retransmit = None;
            debug!(
                "ZRTP secured as initiator, SAS {:?}",
                self.keys.as_ref().map(|k| &k.sas)
            );
        }
        Ok(Vec::new())
    }

    fn on_go_clear(&mut self) -> Result<Vec<Bytes>> {
        if self.state == ZrtpState::Secured {
            debug!("GoClear received, dropping keys");
            self.keys = None;
            self.state = ZrtpState::Cleared;
        }
        Ok(vec![self.wrap(ZrtpMessage::ClearAck)?])
    }

    // ---- builders ---------------------------------------------------------

    fn build_hello(&mut self) -> Result<(ZrtpMessage, Bytes)> {
        let mut client_id = [0u8; 16];
        let id_bytes = self.config.client_id.as_bytes();
        let len = id_bytes.len().min(16);
        client_id[..len].copy_from_slice(&id_bytes[..len]);

        let mut message = ZrtpMessage::Hello(HelloMessage {
            version: *packet::ZRTP_VERSION,
            client_id,
            h3: self.chain.h3,
            zid: self.config.zid,
            hashes: self.config.hashes.clone(),
            ciphers: self.config.ciphers.clone(),
            auth_tags: self.config.auth_tags.clone(),
            key_agreements: self.config.key_agreements.clone(),
            sas_types: self.config.sas_types.clone(),
            mac: [0u8; packet::ZRTP_MAC_SIZE],
        });

        // Hello is MACed with h2, revealed later by Commit
        let raw = finalize_mac(&mut message, &self.chain.h2)?;
        Ok((message, raw))
    }

    fn build_commit(&mut self) -> Result<ZrtpMessage> {
        let key_agreement = self.key_agreement.ok_or(Error::NotReady)?;
        let cipher = self.cipher.ok_or(Error::NotReady)?;
        let auth_tag = self.auth_tag.ok_or(Error::NotReady)?;
        self.ensure_dh(key_agreement);

        // DHPart2 must exist first: its hash binds the commitment
        let mut dh_part2 = self.build_dh_part(true)?;
        let dh_part2_raw = finalize_mac(&mut dh_part2, &self.chain.h0)?;

        let peer_hello_raw = self.peer_hello_raw.clone().unwrap_or_default();
        let hvi = crypto::sha256(&[dh_part2_raw.as_ref(), peer_hello_raw.as_ref()].concat());

        self.our_dhpart = Some(dh_part2);
        self.our_dhpart_raw = Some(dh_part2_raw);

        let mut message = ZrtpMessage::Commit(CommitMessage {
            h2: self.chain.h2,
            zid: self.config.zid,
            hash: self.config.hashes[0],
            cipher,
            auth_tag,
            key_agreement,
            sas_type: self.config.sas_types[0],
            hvi,
            mac: [0u8; packet::ZRTP_MAC_SIZE],
        });

        let raw = finalize_mac(&mut message, &self.chain.h1)?;
        if let ZrtpMessage::Commit(commit) = &message {
            self.our_commit = Some(commit.clone());
        }
        self.our_commit_raw = Some(raw);
        Ok(message)
    }

    /// Build DHPart1 (responder) or DHPart2 (initiator). The MAC is keyed
    /// with h0 and finalized here for DHPart1; `build_commit` finalizes
    /// DHPart2 itself since it needs the raw bytes for the hvi.
    fn build_dh_part(&mut self, initiator: bool) -> Result<ZrtpMessage> {
        let dh_pair = self
            .dh
            .as_ref()
            .ok_or_else(|| Error::NotReady)?;

        let body = DhPartMessage {
            h1: self.chain.h1,
            rs1_id: rand::thread_rng().gen(),
            rs2_id: rand::thread_rng().gen(),
            aux_id: rand::thread_rng().gen(),
            pbx_id: rand::thread_rng().gen(),
            pk: Bytes::from(dh_pair.public_value()),
            mac: [0u8; packet::ZRTP_MAC_SIZE],
        };

        let mut message = if initiator {
            ZrtpMessage::DhPart2(body)
        } else {
            ZrtpMessage::DhPart1(body)
        };

        if !initiator {
            finalize_mac(&mut message, &self.chain.h0)?;
        }
        Ok(message)
    }

    /// Build Confirm1 (responder keys) or Confirm2 (initiator keys)
    fn build_confirm(&mut self, initiator: bool) -> Result<ZrtpMessage> {
        let keys = self.keys.as_ref().ok_or(Error::NotReady)?;
        let (zrtp_key, mac_key) = if initiator {
            (&keys.zrtp_key_i, keys.mac_key_i.clone())
        } else {
            (&keys.zrtp_key_r, keys.mac_key_r.clone())
        };

        let iv: [u8; 16] = rand::thread_rng().gen();

        let mut region = [0u8; 40];
        region[..32].copy_from_slice(&self.chain.h0);
        // Flags word and cache expiry stay zero in unsigned mode
        crypto::confirm_encrypt(zrtp_key, &iv, &mut region);

        let full_mac = crypto::hmac_sha256(&mac_key, &region)?;
        let mut confirm_mac = [0u8; packet::ZRTP_MAC_SIZE];
        confirm_mac.copy_from_slice(&full_mac[..packet::ZRTP_MAC_SIZE]);

        let body = ConfirmMessage {
            confirm_mac,
            iv,
            encrypted: region,
        };

        Ok(if initiator {
            ZrtpMessage::Confirm2(body)
        } else {
            ZrtpMessage::Confirm1(body)
        })
    }

    /// Verify and decrypt a Confirm message, returning the revealed h0.
    /// `from_initiator` selects which key half protects it.
    fn open_confirm(&self, confirm: &ConfirmMessage, from_initiator: bool) -> Result<[u8; 32]> {
        let keys = self.keys.as_ref().ok_or(Error::NotReady)?;
        let (zrtp_key, mac_key) = if from_initiator {
            (&keys.zrtp_key_i, &keys.mac_key_i)
        } else {
            (&keys.zrtp_key_r, &keys.mac_key_r)
        };

        let full_mac = crypto::hmac_sha256(mac_key, &confirm.encrypted)?;
        if full_mac[..packet::ZRTP_MAC_SIZE] != confirm.confirm_mac {
            return Err(Error::AuthFailure("confirm MAC mismatch".to_string()));
        }

        let mut region = confirm.encrypted;
        crypto::confirm_decrypt(zrtp_key, &confirm.iv, &mut region);

        let mut h0 = [0u8; 32];
        h0.copy_from_slice(&region[..32]);
        Ok(h0)
    }

    // ---- helpers ----------------------------------------------------------

    /// Pick one algorithm per list: our preference order, restricted to
    /// what the peer announced
    fn negotiate(&mut self) -> Result<()> {
        let peer = self.peer_hello.as_ref().ok_or(Error::NotReady)?;

        let cipher = self
            .config
            .ciphers
            .iter()
            .find(|c| peer.ciphers.contains(c))
            .copied();
        let auth_tag = self
            .config
            .auth_tags
            .iter()
            .find(|a| peer.auth_tags.contains(a))
            .copied();
        let key_agreement = self
            .config
            .key_agreements
            .iter()
            .find(|k| peer.key_agreements.contains(k))
            .copied();
        let hash_ok = self.config.hashes.iter().any(|h| peer.hashes.contains(h));
        let sas_ok = self
            .config
            .sas_types
            .iter()
            .any(|s| peer.sas_types.contains(s));

        match (cipher, auth_tag, key_agreement, hash_ok, sas_ok) {
            (Some(cipher), Some(auth_tag), Some(key_agreement), true, true) => {
                self.cipher = Some(cipher);
                self.auth_tag = Some(auth_tag);
                self.key_agreement = Some(key_agreement);
                Ok(())
            }
            _ => Err(Error::AuthFailure("no algorithm overlap".to_string())),
        }
    }

    fn ensure_dh(&mut self, alg: ZrtpKeyAgreement) {
        let matches = self
            .dh
            .as_ref()
            .map_or(false, |pair| pair.algorithm() == alg);
        if !matches {
            self.dh = Some(crypto::DhKeyPair::generate(alg));
        }
    }

    /// Terminate with an Error message on the wire and a local failure
    fn fail(&mut self, code: u32, reason: &str) -> Result<Vec<Bytes>> {
        warn!("ZRTP failure: {} (code {:#x})", reason, code);
        self.state = ZrtpState::Failed;
        self.retransmit = None;
        let error = self.wrap(ZrtpMessage::Error(ErrorMessage { code }))?;
        // The error packet still goes out; the caller sees the failure
        // through the state and the subsequent poll
        Ok(vec![error])
    }

    fn arm(&mut self, message: ZrtpMessage, now: Instant, cap: Duration, budget: Duration) {
        self.retransmit = Some(Retransmit {
            message,
            interval: RETRANSMIT_T1,
            cap,
            next: now + RETRANSMIT_T1,
            deadline: now + budget,
        });
    }

    fn wrap(&mut self, message: ZrtpMessage) -> Result<Bytes> {
        self.seq = self.seq.wrapping_add(1);
        Ok(ZrtpPacket::new(self.seq, self.ssrc, message)?.serialize())
    }
}

/// Hash binding the four key-exchange messages (responder's Hello,
/// Commit, DHPart1, DHPart2)
fn total_hash(hello_r: &[u8], commit: &[u8], dhpart1: &[u8], dhpart2: &[u8]) -> [u8; 32] {
    crypto::sha256(&[hello_r, commit, dhpart1, dhpart2].concat())
}

/// Set the trailing MAC of a key-exchange message and return the final
/// serialized bytes
fn finalize_mac(message: &mut ZrtpMessage, key: &[u8]) -> Result<Bytes> {
    let raw = message.serialize()?;
    let mac = crypto::message_mac(key, &raw)?;
    match message {
        ZrtpMessage::Hello(m) => m.mac = mac,
        ZrtpMessage::Commit(m) => m.mac = mac,
        ZrtpMessage::DhPart1(m) | ZrtpMessage::DhPart2(m) => m.mac = mac,
        _ => {}
    }
    message.serialize()
}

/// Drive a negotiation to completion over a datagram transport. Runs in
/// its own task during stream initialization and hands the secrets back
/// once confirmed.
pub async fn run(mut zrtp: Zrtp, transport: &UdpTransport) -> Result<ZrtpSecrets> {
    let mut buf = vec![0u8; 2048];

    let first = zrtp.start(Instant::now())?;
    transport.send(&first).await?;

    loop {
        if zrtp.is_complete() {
            return zrtp
                .secrets()
                .ok_or_else(|| Error::Generic("secured without secrets".to_string()));
        }
        if zrtp.state() == ZrtpState::Failed {
            return Err(Error::AuthFailure("ZRTP exchange failed".to_string()));
        }

        let wakeup = zrtp
            .next_wakeup()
            .unwrap_or_else(|| Instant::now() + Duration::from_millis(250));

        tokio::select! {
            recv = transport.recv_from(&mut buf) => {
                let (len, _) = recv?;
                if !ZrtpPacket::looks_like_zrtp(&buf[..len]) {
                    continue;
                }
                match zrtp.process(&buf[..len], Instant::now()) {
                    Ok(replies) => {
                        for reply in replies {
                            transport.send(&reply).await?;
                        }
                    }
                    Err(Error::AuthFailure(e)) => {
                        return Err(Error::AuthFailure(e));
                    }
                    Err(e) => {
                        debug!("Ignoring bad ZRTP datagram: {}", e);
                    }
                }
            }

            _ = sleep_until(wakeup) => {
                if let Some(resend) = zrtp.poll(Instant::now())? {
                    transport.send(&resend).await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(role: ZrtpRole, zid_byte: u8) -> ZrtpConfig {
        ZrtpConfig {
            client_id: "rtp-stream test".to_string(),
            zid: [zid_byte; 12],
            role,
            ..ZrtpConfig::default()
        }
    }

    fn x255_config(role: ZrtpRole, zid_byte: u8) -> ZrtpConfig {
        ZrtpConfig {
            key_agreements: vec![ZrtpKeyAgreement::X255],
            ..config(role, zid_byte)
        }
    }

    /// Shuttle packets between two machines until both settle
    fn pump(a: &mut Zrtp, b: &mut Zrtp) {
        let now = Instant::now();
        let mut to_b = vec![a.start(now).unwrap()];
        let mut to_a = vec![b.start(now).unwrap()];

        for _ in 0..32 {
            if a.is_complete() && b.is_complete() {
                break;
            }

            let batch: Vec<_> = to_b.drain(..).collect();
            for wire in batch {
                to_a.extend(b.process(&wire, now).unwrap());
            }

            let batch: Vec<_> = to_a.drain(..).collect();
            for wire in batch {
                to_b.extend(a.process(&wire, now).unwrap());
            }
        }
    }

    #[test]
    fn test_full_handshake_dh3k() {
        let mut initiator = Zrtp::new(config(ZrtpRole::Initiator, 1), 0x1111).unwrap();
        let mut responder = Zrtp::new(config(ZrtpRole::Responder, 2), 0x2222).unwrap();

        pump(&mut initiator, &mut responder);

        assert!(initiator.is_complete());
        assert!(responder.is_complete());

        let a = initiator.secrets().unwrap();
        let b = responder.secrets().unwrap();

        // Each side's send keys are the other side's receive keys
        assert_eq!(a.srtp.local_key, b.srtp.remote_key);
        assert_eq!(a.srtp.remote_key, b.srtp.local_key);
        assert_eq!(a.srtp.local_salt, b.srtp.remote_salt);
        assert_eq!(a.sas, b.sas);
        assert_eq!(a.sas.len(), 4);
    }

    #[test]
    fn test_full_handshake_x255() {
        let mut initiator = Zrtp::new(x255_config(ZrtpRole::Initiator, 3), 0x3333).unwrap();
        let mut responder = Zrtp::new(x255_config(ZrtpRole::Responder, 4), 0x4444).unwrap();

        pump(&mut initiator, &mut responder);

        assert!(initiator.is_complete());
        assert!(responder.is_complete());
        assert_eq!(
            initiator.secrets().unwrap().srtp.local_key,
            responder.secrets().unwrap().srtp.remote_key
        );
    }

    #[test]
    fn test_commit_race_resolves() {
        // Both prefer to initiate; the hvi comparison must demote exactly
        // one of them
        let mut a = Zrtp::new(config(ZrtpRole::Initiator, 5), 0x5555).unwrap();
        let mut b = Zrtp::new(config(ZrtpRole::Initiator, 6), 0x6666).unwrap();

        pump(&mut a, &mut b);

        assert!(a.is_complete());
        assert!(b.is_complete());
        assert_ne!(a.role(), b.role());
        assert_eq!(a.secrets().unwrap().sas, b.secrets().unwrap().sas);
    }

    #[test]
    fn test_hello_retransmission_backoff() {
        let mut zrtp = Zrtp::new(config(ZrtpRole::Initiator, 7), 0x7777).unwrap();
        let t0 = Instant::now();
        zrtp.start(t0).unwrap();

        // Nothing due before T1
        assert!(zrtp.poll(t0 + Duration::from_millis(10)).unwrap().is_none());

        // Due after T1, then again after the doubled interval
        assert!(zrtp.poll(t0 + Duration::from_millis(60)).unwrap().is_some());
        let wake = zrtp.next_wakeup().unwrap();
        assert!(wake > t0 + Duration::from_millis(100));
    }

    #[test]
    fn test_hello_phase_timeout() {
        let mut zrtp = Zrtp::new(config(ZrtpRole::Initiator, 8), 0x8888).unwrap();
        let t0 = Instant::now();
        zrtp.start(t0).unwrap();

        let result = zrtp.poll(t0 + Duration::from_secs(4));
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(zrtp.state(), ZrtpState::Failed);
    }

    #[test]
    fn test_secrets_unavailable_before_completion() {
        let zrtp = Zrtp::new(config(ZrtpRole::Initiator, 9), 0x9999).unwrap();
        assert!(zrtp.secrets().is_none());
        assert!(!zrtp.is_complete());
    }

    #[test]
    fn test_empty_algorithm_list_rejected() {
        let bad = ZrtpConfig {
            ciphers: Vec::new(),
            ..ZrtpConfig::default()
        };
        assert!(matches!(
            Zrtp::new(bad, 1),
            Err(Error::InvalidValue(_))
        ));
    }

    #[tokio::test]
    async fn test_negotiation_over_udp() {
        let placeholder: std::net::SocketAddr = "127.0.0.1:9".parse().unwrap();
        let a_transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), placeholder)
            .await
            .unwrap();
        let b_transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), placeholder)
            .await
            .unwrap();
        a_transport.set_remote(b_transport.local_addr().unwrap());
        b_transport.set_remote(a_transport.local_addr().unwrap());

        let a = Zrtp::new(x255_config(ZrtpRole::Initiator, 10), 0xAAAA).unwrap();
        let b = Zrtp::new(x255_config(ZrtpRole::Responder, 11), 0xBBBB).unwrap();

        let (ra, rb) = tokio::time::timeout(
            Duration::from_secs(10),
            async { tokio::join!(run(a, &a_transport), run(b, &b_transport)) },
        )
        .await
        .expect("negotiation did not finish in time");

        let sa = ra.unwrap();
        let sb = rb.unwrap();
        assert_eq!(sa.sas, sb.sas);
        assert_eq!(sa.srtp.local_key, sb.srtp.remote_key);
    }
}
