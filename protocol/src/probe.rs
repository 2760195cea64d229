// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Encoding and decoding of link discovery probes.
//!
//! A probe is a single Ethernet frame addressed to the nearest-bridge group
//! address, so it is consumed by the switch at the far end of the link and
//! never forwarded further.  The payload layout, all fields big-endian, is:
//!
//! ```text
//!  tag (1) | id len (2) | device id (id len) | port (4) | nonce (8)
//!      | sequence (4) | crc (4)
//! ```
//!
//! The crc is the IEEE CRC-32 of every payload byte that precedes it.
//! Anything after the crc is link-layer padding.

use thiserror::Error;

use crate::macaddr::MacAddr;
use crate::types::ConnectPoint;
use crate::types::DeviceId;
use crate::types::PortNumber;

pub const ETHER_VLAN: u16 = 0x8100;
/// IEEE 802 local experimental ethertype, used as our payload type.
pub const ETHER_LINK_PROBE: u16 = 0x88b5;
pub const ETHER_LEN: usize = 14;
pub const VLAN_LEN: usize = 4;
pub const PROBE_TAG: u8 = 0x4c;

const CRC_LEN: usize = 4;
// tag + id len + port + nonce + sequence + crc
const PAYLOAD_FIXED_LEN: usize = 1 + 2 + 4 + 8 + 4 + CRC_LEN;

/// Error type describing why a frame could not be turned into a probe
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// The frame claims to be a probe but its length or crc is wrong
    #[error("malformed discovery frame: {0}")]
    MalformedFrame(String),
    /// The frame belongs to some other protocol
    #[error("not a discovery frame")]
    NotADiscoveryFrame,
    /// The caller asked us to encode something that can't be represented
    #[error("invalid probe: {0}")]
    Invalid(String),
}

pub type ProbeResult<T> = Result<T, ProbeError>;

/// Utility function to generate a MalformedFrame error
fn malformed(message: impl ToString) -> ProbeError {
    ProbeError::MalformedFrame(message.to_string())
}

/// The contents of a single discovery probe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveryProbe {
    /// Device that transmitted the probe
    pub device: DeviceId,
    /// Port on that device the probe was sent from
    pub port: PortNumber,
    /// Random value chosen when the sending agent started
    pub nonce: u64,
    /// Per-port transmit counter
    pub sequence: u32,
}

impl DiscoveryProbe {
    /// The far end of the link this probe arrived on.
    pub fn source(&self) -> ConnectPoint {
        ConnectPoint::new(self.device.clone(), self.port)
    }
}

/// Check that a device identity can be carried in a probe.
pub fn check_identity(device: &DeviceId) -> ProbeResult<u16> {
    let id = device.as_bytes();
    if id.is_empty() {
        return Err(ProbeError::Invalid("empty device identity".into()));
    }
    u16::try_from(id.len()).map_err(|_| {
        ProbeError::Invalid(format!(
            "device identity exceeds {} octets",
            u16::MAX
        ))
    })
}

/// Build the on-wire frame for a probe.
pub fn encode(
    device: &DeviceId,
    port: PortNumber,
    nonce: u64,
    sequence: u32,
) -> ProbeResult<Vec<u8>> {
    let id_len = check_identity(device)?;
    let id = device.as_bytes();

    let mut bytes =
        Vec::with_capacity(ETHER_LEN + PAYLOAD_FIXED_LEN + id.len());
    bytes.extend_from_slice(&MacAddr::DISCOVERY.octets());
    bytes.extend_from_slice(&MacAddr::local_from_seed(nonce).octets());
    bytes.extend_from_slice(&ETHER_LINK_PROBE.to_be_bytes());

    let payload = bytes.len();
    bytes.push(PROBE_TAG);
    bytes.extend_from_slice(&id_len.to_be_bytes());
    bytes.extend_from_slice(id);
    bytes.extend_from_slice(&port.to_be_bytes());
    bytes.extend_from_slice(&nonce.to_be_bytes());
    bytes.extend_from_slice(&sequence.to_be_bytes());
    let crc = crc32fast::hash(&bytes[payload..]);
    bytes.extend_from_slice(&crc.to_be_bytes());

    Ok(bytes)
}

/// Extract a probe from a received frame.
///
/// Frames for other protocols, or addressed to anything other than the
/// discovery group address, yield `NotADiscoveryFrame`.  Frames that look
/// like probes but are truncated or fail the crc yield
/// `MalformedFrame`.  A partially decoded probe is never returned.
pub fn decode(data: &[u8]) -> ProbeResult<DiscoveryProbe> {
    let payload = eth_payload(data)?;

    let mut r = Reader::new(payload);
    let _tag = r.u8()?;
    let id_len = r.u16()? as usize;
    let body_len = PAYLOAD_FIXED_LEN + id_len;
    if payload.len() < body_len {
        return Err(malformed(format!(
            "payload too short. have: {}  need: {}",
            payload.len(),
            body_len
        )));
    }

    let covered = body_len - CRC_LEN;
    let expected = crc32fast::hash(&payload[..covered]);
    let mut found = [0u8; CRC_LEN];
    found.copy_from_slice(&payload[covered..body_len]);
    let found = u32::from_be_bytes(found);
    if expected != found {
        return Err(malformed(format!(
            "bad crc. expected: {expected:#010x}  found: {found:#010x}"
        )));
    }

    if payload[0] != PROBE_TAG {
        return Err(ProbeError::NotADiscoveryFrame);
    }
    if id_len == 0 {
        return Err(malformed("empty device identity"));
    }

    let device = std::str::from_utf8(r.bytes(id_len)?)
        .map(DeviceId::from)
        .map_err(|e| malformed(format!("device identity not utf-8: {e}")))?;
    let port = r.u32()?;
    let nonce = r.u64()?;
    let sequence = r.u32()?;

    Ok(DiscoveryProbe {
        device,
        port,
        nonce,
        sequence,
    })
}

// Validate the link-layer header and return the bytes that follow it.
fn eth_payload(data: &[u8]) -> ProbeResult<&[u8]> {
    if data.len() < ETHER_LEN {
        return Err(malformed("ethernet header too short"));
    }
    let dmac = MacAddr::from_slice(&data[0..6])
        .ok_or_else(|| malformed("ethernet header too short"))?;
    if dmac != MacAddr::DISCOVERY {
        return Err(ProbeError::NotADiscoveryFrame);
    }

    let mut offset = 12;
    let mut eth_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
    if eth_type == ETHER_VLAN {
        offset += VLAN_LEN;
        if data.len() < offset + 2 {
            return Err(malformed("vlan header too short"));
        }
        eth_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
    }
    if eth_type != ETHER_LINK_PROBE {
        return Err(ProbeError::NotADiscoveryFrame);
    }
    Ok(&data[offset + 2..])
}

// Bounds-checked big-endian cursor over the payload.
struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, offset: 0 }
    }

    fn bytes(&mut self, len: usize) -> ProbeResult<&'a [u8]> {
        let end = self.offset + len;
        if end > self.data.len() {
            return Err(malformed(format!(
                "truncated at byte {}",
                self.data.len()
            )));
        }
        let b = &self.data[self.offset..end];
        self.offset = end;
        Ok(b)
    }

    fn array<const N: usize>(&mut self) -> ProbeResult<[u8; N]> {
        let mut a = [0u8; N];
        a.copy_from_slice(self.bytes(N)?);
        Ok(a)
    }

    fn u8(&mut self) -> ProbeResult<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> ProbeResult<u16> {
        self.array().map(u16::from_be_bytes)
    }

    fn u32(&mut self) -> ProbeResult<u32> {
        self.array().map(u32::from_be_bytes)
    }

    fn u64(&mut self) -> ProbeResult<u64> {
        self.array().map(u64::from_be_bytes)
    }
}
