//! Diagnostics kept across link teardowns: a bounded ring of
//! completed-connection descriptors and counters over disconnect-reason
//! comments.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Local};

use crate::core::{
    address::{Address, AddressWithType},
    hci::{ConnectionHandle, ErrorCode},
};

/// Timestamp taken when a link is established
pub type CreationTime = DateTime<Local>;
/// Timestamp taken when a link is torn down
pub type TeardownTime = DateTime<Local>;

/// Time format used in all connection diagnostics
pub const CONNECTION_DESCRIPTOR_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// The remote end of a completed connection, rendered per-transport
#[derive(Copy, Clone, Debug)]
pub enum RemoteAddress {
    /// A classic peer
    Classic(Address),
    /// An LE peer, with its address type
    Le(AddressWithType),
}

/// Descriptor of a completed (established then torn down) connection
#[derive(Clone, Debug)]
pub struct ConnectionDescriptor {
    /// When the link was established
    pub creation_time: CreationTime,
    /// When the link was torn down
    pub teardown_time: TeardownTime,
    /// The controller-assigned handle the link had
    pub handle: ConnectionHandle,
    /// Whether the local host initiated the link
    pub is_locally_initiated: bool,
    /// The reason reported in the disconnection event
    pub disconnect_reason: ErrorCode,
    /// The remote device
    pub remote_address: RemoteAddress,
}

impl ConnectionDescriptor {
    fn to_string(&self) -> String {
        let peer = match self.remote_address {
            RemoteAddress::Classic(address) => address.to_string(),
            RemoteAddress::Le(address_with_type) => address_with_type.to_string(),
        };
        format!(
            "peer:{} handle:0x{:04x} is_locally_initiated:{} creation_time:{} teardown_time:{} disconnect_reason:{}",
            peer,
            self.handle,
            self.is_locally_initiated,
            self.creation_time.format(CONNECTION_DESCRIPTOR_TIME_FORMAT),
            self.teardown_time.format(CONNECTION_DESCRIPTOR_TIME_FORMAT),
            self.disconnect_reason,
        )
    }
}

/// Default number of completed connections retained
pub const CONNECTION_HISTORY_SIZE: usize = 40;

/// Bounded insertion-ordered ring of completed-connection descriptors
#[derive(Debug)]
pub struct ConnectionHistory {
    max_size: usize,
    queue: VecDeque<ConnectionDescriptor>,
}

impl ConnectionHistory {
    /// Constructor with the given retention bound
    pub fn new(max_size: usize) -> Self {
        Self { max_size, queue: VecDeque::new() }
    }

    /// Append a descriptor, evicting the oldest when the ring is full
    pub fn push(&mut self, descriptor: ConnectionDescriptor) {
        if self.queue.len() == self.max_size {
            self.queue.pop_front();
        }
        self.queue.push_back(descriptor);
    }

    /// Render all retained descriptors as timestamped lines, oldest first
    pub fn read_elements_as_string(&self) -> Vec<String> {
        self.queue.iter().map(ConnectionDescriptor::to_string).collect()
    }

    /// Number of retained descriptors
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether no descriptors are retained
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Default for ConnectionHistory {
    fn default() -> Self {
        Self::new(CONNECTION_HISTORY_SIZE)
    }
}

/// An insertion-counting multiset with a sorted high-to-low readout,
/// used for the per-transport disconnect-reason histograms
#[derive(Debug, Default)]
pub struct MapCount<T: std::hash::Hash + Eq + Ord + Clone> {
    counts: HashMap<T, usize>,
}

impl<T: std::hash::Hash + Eq + Ord + Clone> MapCount<T> {
    /// Constructor
    pub fn new() -> Self {
        Self { counts: HashMap::new() }
    }

    /// Count one occurrence of the item
    pub fn put(&mut self, item: T) {
        *self.counts.entry(item).or_insert(0) += 1;
    }

    /// Number of distinct items counted
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Whether nothing has been counted
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// All (item, count) pairs, highest count first; ties break on the item
    /// so the readout is stable
    pub fn get_sorted_high_to_low(&self) -> Vec<(T, usize)> {
        let mut entries: Vec<_> =
            self.counts.iter().map(|(item, count)| (item.clone(), *count)).collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        entries
    }
}
