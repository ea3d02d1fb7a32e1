//! `ipn`-scheme endpoint identifiers.
//!
//! Waypost speaks the two-element `ipn` scheme only: an endpoint is a
//! `(node, service)` pair, written `ipn:<node>.<service>`. The scheme code
//! used on the wire is 2 (RFC 9171 §4.2.5.1.2).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// URI scheme code for `ipn` endpoints.
pub const EID_SCHEME_IPN: u64 = 2;

/// An `ipn` endpoint: node number plus service number.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct IpnAddr {
    pub node: u64,
    pub service: u64,
}

impl IpnAddr {
    pub const fn new(node: u64, service: u64) -> Self {
        IpnAddr { node, service }
    }

    /// The null endpoint `ipn:0.0`, standing in for `dtn:none`.
    pub const NULL: IpnAddr = IpnAddr::new(0, 0);

    /// Fixed-width key material for hashing this address.
    pub fn hash_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.node.to_le_bytes());
        out[8..].copy_from_slice(&self.service.to_le_bytes());
        out
    }
}

impl fmt::Display for IpnAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ipn:{}.{}", self.node, self.service)
    }
}

/// Failure to parse an `ipn:<node>.<service>` string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid ipn endpoint `{0}`, expected ipn:<node>.<service>")]
pub struct ParseEidError(String);

impl FromStr for IpnAddr {
    type Err = ParseEidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseEidError(s.to_string());
        let ssp = s.strip_prefix("ipn:").ok_or_else(err)?;
        let (node, service) = ssp.split_once('.').ok_or_else(err)?;
        Ok(IpnAddr {
            node: node.parse().map_err(|_| err())?,
            service: service.parse().map_err(|_| err())?,
        })
    }
}

impl TryFrom<String> for IpnAddr {
    type Error = ParseEidError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<IpnAddr> for String {
    fn from(addr: IpnAddr) -> String {
        addr.to_string()
    }
}
