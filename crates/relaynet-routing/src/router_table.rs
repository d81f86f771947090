//! Directly connected routers.
//!
//! A router is reachable over exactly one connection at a time. The table
//! reports the connection a newer one displaced; closing it is up to the
//! caller.

use dashmap::DashMap;
use relaynet_core::{ConnectionId, RouterInfo};
use serde::Serialize;

/// A directly connected router and the connection it is reached over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouterEntry {
    pub info: RouterInfo,
    pub connection: ConnectionId,
}

/// Directly connected routers keyed by address.
///
/// Holds at most one live connection per router address.
pub struct RouterTable {
    table: DashMap<String, RouterEntry>,
}

impl RouterTable {
    /// Create a new, empty router table.
    pub fn new() -> Self {
        Self {
            table: DashMap::new(),
        }
    }

    /// Register `info` as reachable over `connection`.
    ///
    /// Returns the connection this one displaced, if the router was already
    /// known over a different connection.
    pub fn insert(&self, info: RouterInfo, connection: ConnectionId) -> Option<ConnectionId> {
        let address = info.address.clone();
        let previous = self.table.insert(address, RouterEntry { info, connection });
        previous
            .map(|entry| entry.connection)
            .filter(|old| *old != connection)
    }

    /// Remove the router at `address`.
    pub fn remove(&self, address: &str) -> Option<RouterEntry> {
        self.table.remove(address).map(|(_k, v)| v)
    }

    /// Remove whichever router is reached over `connection`.
    pub fn remove_by_connection(&self, connection: ConnectionId) -> Option<RouterEntry> {
        let address = self.address_of(connection)?;
        self.table
            .remove_if(&address, |_, entry| entry.connection == connection)
            .map(|(_k, v)| v)
    }

    /// Address of the router reached over `connection`.
    pub fn address_of(&self, connection: ConnectionId) -> Option<String> {
        self.table
            .iter()
            .find(|entry| entry.value().connection == connection)
            .map(|entry| entry.key().clone())
    }

    pub fn contains(&self, address: &str) -> bool {
        !address.is_empty() && self.table.contains_key(address)
    }

    /// Connection to the router at `address`.
    pub fn connection(&self, address: &str) -> Option<ConnectionId> {
        self.table.get(address).map(|entry| entry.connection)
    }

    /// Known routers, sorted by address.
    pub fn routers(&self) -> Vec<RouterInfo> {
        let mut routers: Vec<RouterInfo> =
            self.table.iter().map(|entry| entry.info.clone()).collect();
        routers.sort_by(|a, b| a.address.cmp(&b.address));
        routers
    }

    /// Known router addresses, sorted.
    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.table.iter().map(|e| e.key().clone()).collect();
        addresses.sort();
        addresses
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn clear(&self) {
        self.table.clear();
    }
}

impl Default for RouterTable {
    fn default() -> Self {
        Self::new()
    }
}
