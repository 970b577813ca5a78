//! The multicast address pool.
//!

use std::{collections::BTreeSet, net::Ipv4Addr};

use crate::ChatError;

/// A contiguous, inclusive range of multicast addresses, and which of them are taken.
///
/// Allocation always hands out the lowest free address, so that a process that
/// restarts with the same groups ends up with the same layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressPool {
    first: Ipv4Addr,
    last: Ipv4Addr,
    allocated: BTreeSet<Ipv4Addr>,
}

impl AddressPool {
    /// Create a pool from `first` to `last`, both included.
    pub fn new(first: Ipv4Addr, last: Ipv4Addr) -> Result<Self, ChatError> {
        if !first.is_multicast() || !last.is_multicast() || u32::from(first) > u32::from(last) {
            return Err(ChatError::InvalidConfig(format!(
                "{first}-{last} is not a range of multicast addresses"
            )));
        }

        Ok(Self {
            first,
            last,
            allocated: BTreeSet::new(),
        })
    }

    /// The range, for display.
    pub fn describe(&self) -> String {
        format!("{}-{}", self.first, self.last)
    }

    /// Whether the address lies within the pool.
    pub fn contains(&self, ip: &Ipv4Addr) -> bool {
        (u32::from(self.first)..=u32::from(self.last)).contains(&u32::from(*ip))
    }

    pub fn is_allocated(&self, ip: &Ipv4Addr) -> bool {
        self.allocated.contains(ip)
    }

    /// The number of addresses in the pool.
    pub fn capacity(&self) -> usize {
        (u32::from(self.last) - u32::from(self.first)) as usize + 1
    }

    /// The number of addresses still free.
    pub fn available(&self) -> usize {
        self.capacity() - self.allocated.len()
    }

    /// Take the lowest free address.
    pub fn allocate(&mut self) -> Result<Ipv4Addr, ChatError> {
        let ip = (u32::from(self.first)..=u32::from(self.last))
            .map(Ipv4Addr::from)
            .find(|ip| !self.allocated.contains(ip))
            .ok_or_else(|| ChatError::PoolExhausted(self.describe()))?;

        self.allocated.insert(ip);
        Ok(ip)
    }

    /// Take a specific address, as when joining a group someone else created.
    ///
    /// Returns `false` if it was already taken.
    pub fn reserve(&mut self, ip: Ipv4Addr) -> Result<bool, ChatError> {
        if !self.contains(&ip) {
            return Err(ChatError::AddressOutsidePool(ip.to_string(), self.describe()));
        }

        Ok(self.allocated.insert(ip))
    }

    /// Give an address back; returns if it was taken.
    pub fn release(&mut self, ip: &Ipv4Addr) -> bool {
        self.allocated.remove(ip)
    }
}
