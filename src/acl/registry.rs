//! The two handle-keyed link tables. A handle lives in at most one of the
//! two maps; membership routes operations to the correct transport.

use std::collections::HashMap;

use log::error;

use crate::core::hci::ConnectionHandle;

use super::link::{ClassicLink, LeLink};

/// Owner of every established link, keyed by connection handle
#[derive(Default)]
pub(crate) struct LinkRegistry {
    handle_to_classic_connection_map: HashMap<ConnectionHandle, ClassicLink>,
    handle_to_le_connection_map: HashMap<ConnectionHandle, LeLink>,
}

impl LinkRegistry {
    /// Whether the handle names an established classic link
    pub fn is_classic_acl(&self, handle: ConnectionHandle) -> bool {
        self.handle_to_classic_connection_map.contains_key(&handle)
    }

    /// Whether the handle names an established LE link
    pub fn is_le_acl(&self, handle: ConnectionHandle) -> bool {
        self.handle_to_le_connection_map.contains_key(&handle)
    }

    pub fn add_classic_connection(&mut self, link: ClassicLink) {
        let handle = link.handle();
        debug_assert!(!self.is_le_acl(handle));
        self.handle_to_classic_connection_map.insert(handle, link);
    }

    pub fn add_le_connection(&mut self, link: LeLink) {
        let handle = link.handle();
        debug_assert!(!self.is_classic_acl(handle));
        self.handle_to_le_connection_map.insert(handle, link);
    }

    pub fn get_classic_connection(&self, handle: ConnectionHandle) -> Option<&ClassicLink> {
        self.handle_to_classic_connection_map.get(&handle)
    }

    pub fn get_le_connection(&self, handle: ConnectionHandle) -> Option<&LeLink> {
        self.handle_to_le_connection_map.get(&handle)
    }

    pub fn remove_classic_connection(&mut self, handle: ConnectionHandle) -> Option<ClassicLink> {
        self.handle_to_classic_connection_map.remove(&handle)
    }

    pub fn remove_le_connection(&mut self, handle: ConnectionHandle) -> Option<LeLink> {
        self.handle_to_le_connection_map.remove(&handle)
    }

    /// Route an outbound payload to the owning link; unknown handles drop
    /// the packet
    pub fn write_data(&self, handle: ConnectionHandle, packet: Vec<u8>) {
        if let Some(link) = self.get_classic_connection(handle) {
            link.enqueue_packet(packet);
        } else if let Some(link) = self.get_le_connection(handle) {
            link.enqueue_packet(packet);
        } else {
            error!("Unable to find destination to write data handle:0x{handle:04x}");
        }
    }

    /// Flush controller-buffered data; defined for classic links only
    pub fn flush(&self, handle: ConnectionHandle) {
        match self.get_classic_connection(handle) {
            Some(link) => link.flush(),
            None => error!("handle 0x{handle:04x} is not a classic connection"),
        }
    }

    pub fn classic_connections(&self) -> impl Iterator<Item = &ClassicLink> {
        self.handle_to_classic_connection_map.values()
    }

    pub fn le_connections(&self) -> impl Iterator<Item = &LeLink> {
        self.handle_to_le_connection_map.values()
    }

    pub fn classic_handles(&self) -> Vec<ConnectionHandle> {
        self.handle_to_classic_connection_map.keys().copied().collect()
    }

    pub fn le_handles(&self) -> Vec<ConnectionHandle> {
        self.handle_to_le_connection_map.keys().copied().collect()
    }

    pub fn classic_connection_count(&self) -> usize {
        self.handle_to_classic_connection_map.len()
    }

    pub fn le_connection_count(&self) -> usize {
        self.handle_to_le_connection_map.len()
    }

    /// Shut down every classic link and drop them
    pub fn shutdown_classic_connections(&mut self) {
        for link in self.handle_to_classic_connection_map.values() {
            link.shutdown();
        }
        self.handle_to_classic_connection_map.clear();
    }

    /// Shut down every LE link and drop them
    pub fn shutdown_le_connections(&mut self) {
        for link in self.handle_to_le_connection_map.values() {
            link.shutdown();
        }
        self.handle_to_le_connection_map.clear();
    }
}
