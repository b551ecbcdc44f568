//! Signed node records.
//!
//! Records follow the EIP-778 layout with the "v4" identity scheme: an RLP list
//! `[signature, seq, k1, v1, k2, v2, ...]` with keys sorted and unique, signed with
//! secp256k1 over the keccak-256 hash of `[seq, k1, v1, ...]`. The discovery tree
//! only needs to parse, identify and re-encode records, so the builder covers the
//! common endpoint keys and nothing more.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rlp::{Rlp, RlpStream};
use sha3::{Digest, Keccak256};

/// Maximum encoded size of a record.
pub const MAX_RECORD_SIZE: usize = 300;

const ID_KEY: &[u8] = b"id";
const SCHEME_V4: &[u8] = b"v4";
const PUBKEY_KEY: &[u8] = b"secp256k1";
const IP_KEY: &[u8] = b"ip";
const UDP_KEY: &[u8] = b"udp";
const TCP_KEY: &[u8] = b"tcp";

/// Reasons a record is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    /// Encoded record is larger than [`MAX_RECORD_SIZE`].
    #[error("record bigger than {MAX_RECORD_SIZE} bytes")]
    TooBig,
    /// RLP structure is invalid.
    #[error("rlp: {0}")]
    Rlp(String),
    /// Key/value list has an odd number of items.
    #[error("odd number of key/value items")]
    IncompletePair,
    /// Keys are not sorted or contain duplicates.
    #[error("record key/value pairs are not sorted by key")]
    NotSorted,
    /// The identity scheme is missing or unsupported.
    #[error("unknown or unspecified identity scheme")]
    UnknownScheme,
    /// The secp256k1 public key is missing or malformed.
    #[error("invalid public key")]
    InvalidPublicKey,
    /// The signature does not verify.
    #[error("invalid signature on node record")]
    InvalidSignature,
    /// The private key could not sign.
    #[error("signing failed: {0}")]
    Signing(String),
}

impl From<rlp::DecoderError> for RecordError {
    fn from(err: rlp::DecoderError) -> Self {
        Self::Rlp(err.to_string())
    }
}

/// Node identity: keccak-256 of the uncompressed public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    /// Derive the identity of a public key.
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        let point = key.to_encoded_point(false);
        Self(Keccak256::digest(&point.as_bytes()[1..]).into())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", &hex::encode(self.0)[..16])
    }
}

/// A verified node record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    seq: u64,
    pairs: BTreeMap<Vec<u8>, Vec<u8>>,
    signature: Vec<u8>,
    public_key: VerifyingKey,
    id: NodeId,
    raw: Vec<u8>,
}

impl NodeRecord {
    /// Start building a record.
    pub fn builder() -> RecordBuilder {
        RecordBuilder::default()
    }

    /// Decode and verify a record from its RLP bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        if bytes.len() > MAX_RECORD_SIZE {
            return Err(RecordError::TooBig);
        }
        let rlp = Rlp::new(bytes);
        if !rlp.is_list() {
            return Err(RecordError::Rlp("expected list".into()));
        }
        if rlp.payload_info()?.total() != bytes.len() {
            return Err(RecordError::Rlp("trailing bytes after record".into()));
        }
        let count = rlp.item_count()?;
        if count < 2 {
            return Err(RecordError::Rlp("record too short".into()));
        }
        if count % 2 != 0 {
            return Err(RecordError::IncompletePair);
        }

        let signature: Vec<u8> = rlp.val_at(0)?;
        let seq: u64 = rlp.val_at(1)?;
        let mut pairs = BTreeMap::new();
        let mut prev: Option<Vec<u8>> = None;
        for i in (2..count).step_by(2) {
            let key: Vec<u8> = rlp.val_at(i)?;
            if prev.as_ref().is_some_and(|p| p >= &key) {
                return Err(RecordError::NotSorted);
            }
            let value = rlp.at(i + 1)?.as_raw().to_vec();
            prev = Some(key.clone());
            pairs.insert(key, value);
        }

        let public_key = verify_v4(seq, &pairs, &signature)?;
        Ok(Self {
            seq,
            pairs,
            signature,
            id: NodeId::from_public_key(&public_key),
            public_key,
            raw: bytes.to_vec(),
        })
    }

    /// Parse the `enr:`-less base64 text form.
    pub fn from_base64(text: &str) -> Result<Self, RecordError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(text)
            .map_err(|e| RecordError::Rlp(format!("base64: {e}")))?;
        Self::decode(&bytes)
    }

    /// Node identity.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Record sequence number.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Raw signature bytes.
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Signer's public key.
    pub fn public_key(&self) -> &VerifyingKey {
        &self.public_key
    }

    /// IPv4 address, if present.
    pub fn ip4(&self) -> Option<Ipv4Addr> {
        let bytes: Vec<u8> = self.value(IP_KEY)?;
        let octets: [u8; 4] = bytes.try_into().ok()?;
        Some(Ipv4Addr::from(octets))
    }

    /// UDP port, if present.
    pub fn udp(&self) -> Option<u16> {
        self.value(UDP_KEY)
    }

    /// TCP port, if present.
    pub fn tcp(&self) -> Option<u16> {
        self.value(TCP_KEY)
    }

    /// Raw RLP value stored under `key`.
    pub fn get_raw(&self, key: &[u8]) -> Option<&[u8]> {
        self.pairs.get(key).map(Vec::as_slice)
    }

    /// Encoded record bytes, exactly as signed.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// URL-safe unpadded base64 of the encoded record.
    pub fn to_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.raw)
    }

    fn value<T: rlp::Decodable>(&self, key: &[u8]) -> Option<T> {
        let raw = self.pairs.get(key)?;
        rlp::decode(raw).ok()
    }
}

fn content_rlp(seq: u64, pairs: &BTreeMap<Vec<u8>, Vec<u8>>) -> Vec<u8> {
    let mut s = RlpStream::new_list(1 + pairs.len() * 2);
    s.append(&seq);
    for (k, v) in pairs {
        s.append(k);
        s.append_raw(v, 1);
    }
    s.out().to_vec()
}

fn verify_v4(
    seq: u64,
    pairs: &BTreeMap<Vec<u8>, Vec<u8>>,
    signature: &[u8],
) -> Result<VerifyingKey, RecordError> {
    let scheme: Vec<u8> = pairs
        .get(ID_KEY)
        .and_then(|raw| rlp::decode(raw).ok())
        .ok_or(RecordError::UnknownScheme)?;
    if scheme != SCHEME_V4 {
        return Err(RecordError::UnknownScheme);
    }
    let key_bytes: Vec<u8> = pairs
        .get(PUBKEY_KEY)
        .and_then(|raw| rlp::decode(raw).ok())
        .ok_or(RecordError::InvalidPublicKey)?;
    if key_bytes.len() != 33 {
        return Err(RecordError::InvalidPublicKey);
    }
    let key =
        VerifyingKey::from_sec1_bytes(&key_bytes).map_err(|_| RecordError::InvalidPublicKey)?;

    let sig = Signature::from_slice(signature).map_err(|_| RecordError::InvalidSignature)?;
    let hash = Keccak256::digest(content_rlp(seq, pairs));
    key.verify_prehash(&hash, &sig)
        .map_err(|_| RecordError::InvalidSignature)?;
    Ok(key)
}

/// Builder for signed v4 records.
#[derive(Debug, Clone, Default)]
pub struct RecordBuilder {
    seq: u64,
    pairs: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl RecordBuilder {
    /// Set the sequence number. Default: 0.
    pub fn seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    /// Set the IPv4 address.
    pub fn ip4(mut self, ip: Ipv4Addr) -> Self {
        self.pairs
            .insert(IP_KEY.to_vec(), rlp::encode(&ip.octets().to_vec()).to_vec());
        self
    }

    /// Set the UDP port.
    pub fn udp(mut self, port: u16) -> Self {
        self.pairs.insert(UDP_KEY.to_vec(), rlp::encode(&port).to_vec());
        self
    }

    /// Set the TCP port.
    pub fn tcp(mut self, port: u16) -> Self {
        self.pairs.insert(TCP_KEY.to_vec(), rlp::encode(&port).to_vec());
        self
    }

    /// Sign with `key` and produce the record.
    pub fn sign(mut self, key: &SigningKey) -> Result<NodeRecord, RecordError> {
        let public_key = *key.verifying_key();
        let compressed = public_key.to_encoded_point(true);
        self.pairs
            .insert(ID_KEY.to_vec(), rlp::encode(&SCHEME_V4.to_vec()).to_vec());
        self.pairs.insert(
            PUBKEY_KEY.to_vec(),
            rlp::encode(&compressed.as_bytes().to_vec()).to_vec(),
        );

        let hash = Keccak256::digest(content_rlp(self.seq, &self.pairs));
        let sig: Signature = key
            .sign_prehash(&hash)
            .map_err(|e| RecordError::Signing(e.to_string()))?;
        let signature = sig.to_bytes().to_vec();

        let mut s = RlpStream::new_list(2 + self.pairs.len() * 2);
        s.append(&signature);
        s.append(&self.seq);
        for (k, v) in &self.pairs {
            s.append(k);
            s.append_raw(v, 1);
        }
        let raw = s.out().to_vec();
        if raw.len() > MAX_RECORD_SIZE {
            return Err(RecordError::TooBig);
        }

        Ok(NodeRecord {
            seq: self.seq,
            pairs: self.pairs,
            signature,
            id: NodeId::from_public_key(&public_key),
            public_key,
            raw,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> SigningKey {
        SigningKey::from_slice(&[byte; 32]).unwrap()
    }

    #[test]
    fn signed_record_decodes_to_same_identity() {
        let record = NodeRecord::builder()
            .seq(7)
            .ip4(Ipv4Addr::new(10, 0, 0, 1))
            .udp(30303)
            .tcp(30303)
            .sign(&key(1))
            .unwrap();

        let decoded = NodeRecord::decode(record.as_bytes()).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.seq(), 7);
        assert_eq!(decoded.ip4(), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(decoded.udp(), Some(30303));
        assert_eq!(decoded.id(), NodeId::from_public_key(key(1).verifying_key()));
    }

    #[test]
    fn tampered_record_fails_verification() {
        let record = NodeRecord::builder().seq(1).udp(1).sign(&key(2)).unwrap();
        let mut bytes = record.as_bytes().to_vec();
        // The udp port value is the last byte of the list.
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert_eq!(
            NodeRecord::decode(&bytes),
            Err(RecordError::InvalidSignature)
        );
    }

    #[test]
    fn rejects_non_list() {
        let bytes = rlp::encode(&vec![1u8, 2, 3]).to_vec();
        assert!(matches!(NodeRecord::decode(&bytes), Err(RecordError::Rlp(_))));
    }

    #[test]
    fn distinct_keys_give_distinct_ids() {
        let a = NodeRecord::builder().sign(&key(3)).unwrap();
        let b = NodeRecord::builder().sign(&key(4)).unwrap();
        assert_ne!(a.id(), b.id());
    }
}
