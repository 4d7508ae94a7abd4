//! Edge address pool.
//!
//! [`EdgeAddrs`] is what the supervisor needs from address discovery.
//! [`StaticEdge`] implements it over a fixed address list, handing each
//! connection index its own address.

use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};

use rand::RngExt;
use tracing::debug;

use super::error::TunnelError;

/// Source of edge addresses for connection indices.
pub trait EdgeAddrs: Send + Sync {
    /// Address for `index`, reusing the one it already holds if any.
    fn addr_for(&self, index: usize) -> Result<SocketAddr, TunnelError>;

    /// Give back the address `index` holds and take a different unused one.
    fn different_addr_for(&self, index: usize) -> Result<SocketAddr, TunnelError>;

    /// Any address, for one-off RPCs that do not occupy a connection slot.
    fn addr_for_rpc(&self) -> Result<SocketAddr, TunnelError>;

    /// Number of addresses not held by any connection.
    fn available_addrs(&self) -> usize;
}

#[derive(Debug)]
struct Slot {
    addr: SocketAddr,
    used_by: Option<usize>,
}

/// Fixed list of edge addresses.
#[derive(Debug)]
pub struct StaticEdge {
    slots: Mutex<Vec<Slot>>,
}

impl StaticEdge {
    /// Duplicate addresses are collapsed.
    pub fn new(addrs: impl IntoIterator<Item = SocketAddr>) -> Result<Self, TunnelError> {
        let mut slots: Vec<Slot> = Vec::new();
        for addr in addrs {
            if !slots.iter().any(|s| s.addr == addr) {
                slots.push(Slot {
                    addr,
                    used_by: None,
                });
            }
        }
        if slots.is_empty() {
            return Err(TunnelError::NoAddressesLeft);
        }
        Ok(Self {
            slots: Mutex::new(slots),
        })
    }

    /// Address currently held by `index`.
    pub fn addr_used_by(&self, index: usize) -> Option<SocketAddr> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|s| s.used_by == Some(index))
            .map(|s| s.addr)
    }
}

impl EdgeAddrs for StaticEdge {
    fn addr_for(&self, index: usize) -> Result<SocketAddr, TunnelError> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slots.iter().find(|s| s.used_by == Some(index)) {
            return Ok(slot.addr);
        }
        let slot = slots
            .iter_mut()
            .find(|s| s.used_by.is_none())
            .ok_or(TunnelError::NoAddressesLeft)?;
        slot.used_by = Some(index);
        Ok(slot.addr)
    }

    fn different_addr_for(&self, index: usize) -> Result<SocketAddr, TunnelError> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let old = slots.iter().position(|s| s.used_by == Some(index));
        if let Some(pos) = old {
            slots[pos].used_by = None;
        }

        // Walk forward from the old slot so repeated failures rotate
        // through the whole list.
        let len = slots.len();
        let start = old.map_or(0, |pos| pos + 1);
        let pick = (0..len)
            .map(|offset| (start + offset) % len)
            .find(|&i| Some(i) != old && slots[i].used_by.is_none())
            .ok_or(TunnelError::NoAddressesLeft)?;

        slots[pick].used_by = Some(index);
        debug!(index, addr = %slots[pick].addr, "Switched edge address");
        Ok(slots[pick].addr)
    }

    fn addr_for_rpc(&self) -> Result<SocketAddr, TunnelError> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.is_empty() {
            return Err(TunnelError::NoAddressesLeft);
        }
        let i = rand::rng().random_range(0..slots.len());
        Ok(slots[i].addr)
    }

    fn available_addrs(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.used_by.is_none())
            .count()
    }
}
