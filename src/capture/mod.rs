//! Ingress capture: per-connection assembly of HTTP exchanges
//!
//! The interception collaborator delivers directional byte streams per TCP
//! flow. A [`Tracker`] assembles one request/response pair per flow, and the
//! [`Factory`] owns all live trackers, sweeping completed and idle ones into
//! test cases.

pub mod factory;
pub mod http1;
pub mod tracker;

pub use factory::Factory;
pub use tracker::Tracker;

use std::net::SocketAddr;

/// Identity of one intercepted TCP flow.
///
/// The nonce disambiguates reused 4-tuples (port reuse across the lifetime
/// of a recording session); it is minted by the interception layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub nonce: u64,
}

impl ConnId {
    pub fn new(src: SocketAddr, dst: SocketAddr, nonce: u64) -> Self {
        Self { src, dst, nonce }
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}#{}", self.src, self.dst, self.nonce)
    }
}
