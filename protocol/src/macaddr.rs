// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// An EUI-48 MAC address, used for layer-2 addressing.
#[derive(
    Clone, Copy, Deserialize, Serialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
pub struct MacAddr {
    a: [u8; 6],
}

impl From<[u8; 6]> for MacAddr {
    fn from(a: [u8; 6]) -> Self {
        Self { a }
    }
}

impl MacAddr {
    /// The nearest-bridge group address.  Frames sent here are consumed by
    /// the first bridge that sees them and are never flooded, so a probe
    /// addressed to it travels exactly one hop.
    pub const DISCOVERY: Self = MacAddr {
        a: [0x01, 0x80, 0xc2, 0x00, 0x00, 0x0e],
    };

    /// Create a new MAC address from octets in network byte order.
    pub fn new(o0: u8, o1: u8, o2: u8, o3: u8, o4: u8, o5: u8) -> MacAddr {
        MacAddr {
            a: [o0, o1, o2, o3, o4, o5],
        }
    }

    /// Create a new MAC address from the first six octets of a slice, or
    /// None if the slice is too short.
    pub fn from_slice(s: &[u8]) -> Option<MacAddr> {
        match s {
            [o0, o1, o2, o3, o4, o5, ..] => {
                Some(MacAddr::new(*o0, *o1, *o2, *o3, *o4, *o5))
            }
            _ => None,
        }
    }

    /// Build a locally-administered unicast address from a 64-bit seed.
    /// The same seed always yields the same address.
    pub fn local_from_seed(seed: u64) -> MacAddr {
        let b = seed.to_be_bytes();
        MacAddr::new(0x02, b[3], b[4], b[5], b[6], b[7])
    }

    /// Convert `self` to an array of bytes in network byte order.
    pub fn octets(self) -> [u8; 6] {
        self.a
    }

    /// Return `true` if the group bit is set.
    pub fn is_multicast(self) -> bool {
        self.a[0] & 0x01 != 0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, octet) in self.a.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{octet:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
