//! Host-side mirrors of the controller's filter accept list and address
//! resolution list. Each shadow is bounded by the controller-reported
//! capacity, so capacity and duplicate checks never need a round-trip.

use std::collections::HashSet;

use log::{error, warn};

use crate::core::address::{AddressWithType, ConnectAddressWithType};

/// Outcome of adding an entry to a shadow list
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ShadowListAdd {
    /// The entry was inserted
    Added,
    /// The list is at the controller maximum, nothing was inserted
    Full,
    /// The entry was already present (set semantics, reported as success)
    AlreadyPresent,
}

impl ShadowListAdd {
    /// Whether the entry is present after the call
    pub fn is_ok(self) -> bool {
        self != Self::Full
    }
}

/// Mirror of the controller's LE filter accept list, keyed on
/// (address, filter-accept-list address type)
#[derive(Debug)]
pub struct ShadowAcceptlist {
    max_acceptlist_size: u8,
    acceptlist_set: HashSet<ConnectAddressWithType>,
}

impl ShadowAcceptlist {
    /// Constructor taking the controller-reported maximum size
    pub fn new(max_acceptlist_size: u8) -> Self {
        Self { max_acceptlist_size, acceptlist_set: HashSet::new() }
    }

    /// Insert an entry, unless the list is at the controller maximum
    pub fn add(&mut self, address_with_type: AddressWithType) -> ShadowListAdd {
        if self.is_full() {
            error!("Acceptlist is full size:{}", self.acceptlist_set.len());
            return ShadowListAdd::Full;
        }
        if !self.acceptlist_set.insert(address_with_type.into()) {
            warn!("Attempted to add duplicate le address to acceptlist:{address_with_type}");
            return ShadowListAdd::AlreadyPresent;
        }
        ShadowListAdd::Added
    }

    /// Remove an entry, returning whether it was present
    pub fn remove(&mut self, address_with_type: AddressWithType) -> bool {
        if !self.acceptlist_set.remove(&address_with_type.into()) {
            warn!("Unknown device being removed from acceptlist:{address_with_type}");
            return false;
        }
        true
    }

    /// A by-value copy of the current entries, for diagnostics
    pub fn get_copy(&self) -> HashSet<ConnectAddressWithType> {
        self.acceptlist_set.clone()
    }

    /// Whether the list is at the controller maximum
    pub fn is_full(&self) -> bool {
        self.acceptlist_set.len() == self.max_acceptlist_size as usize
    }

    /// Drop all entries
    pub fn clear(&mut self) {
        self.acceptlist_set.clear();
    }

    /// Number of entries currently mirrored
    pub fn len(&self) -> usize {
        self.acceptlist_set.len()
    }

    /// The controller-reported maximum size
    pub fn get_max_size(&self) -> u8 {
        self.max_acceptlist_size
    }
}

/// Mirror of the controller's LE address resolution list
#[derive(Debug)]
pub struct ShadowAddressResolutionList {
    max_address_resolution_size: u8,
    address_resolution_set: HashSet<AddressWithType>,
}

impl ShadowAddressResolutionList {
    /// Constructor taking the controller-reported maximum size
    pub fn new(max_address_resolution_size: u8) -> Self {
        Self { max_address_resolution_size, address_resolution_set: HashSet::new() }
    }

    /// Insert an entry, unless the list is at the controller maximum
    pub fn add(&mut self, address_with_type: AddressWithType) -> ShadowListAdd {
        if self.is_full() {
            error!("Address Resolution is full size:{}", self.address_resolution_set.len());
            return ShadowListAdd::Full;
        }
        if !self.address_resolution_set.insert(address_with_type) {
            warn!(
                "Attempted to add duplicate le address to address_resolution:{address_with_type}"
            );
            return ShadowListAdd::AlreadyPresent;
        }
        ShadowListAdd::Added
    }

    /// Remove an entry, returning whether it was present
    pub fn remove(&mut self, address_with_type: AddressWithType) -> bool {
        self.address_resolution_set.remove(&address_with_type)
    }

    /// A by-value copy of the current entries, for diagnostics
    pub fn get_copy(&self) -> HashSet<AddressWithType> {
        self.address_resolution_set.clone()
    }

    /// Whether the list is at the controller maximum
    pub fn is_full(&self) -> bool {
        self.address_resolution_set.len() == self.max_address_resolution_size as usize
    }

    /// Number of entries currently mirrored
    pub fn len(&self) -> usize {
        self.address_resolution_set.len()
    }

    /// Drop all entries
    pub fn clear(&mut self) {
        self.address_resolution_set.clear();
    }

    /// The controller-reported maximum size
    pub fn get_max_size(&self) -> u8 {
        self.max_address_resolution_size
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::core::address::{Address, AddressType};

    const ADDRESS_1: AddressWithType = AddressWithType {
        address: Address::new([1, 2, 3, 4, 5, 6]),
        address_type: AddressType::Public,
    };
    const ADDRESS_1_RANDOM: AddressWithType = AddressWithType {
        address: Address::new([1, 2, 3, 4, 5, 6]),
        address_type: AddressType::Random,
    };
    const ADDRESS_2: AddressWithType = AddressWithType {
        address: Address::new([6, 5, 4, 3, 2, 1]),
        address_type: AddressType::Public,
    };

    #[test]
    fn test_add_remove_round_trip() {
        let mut acceptlist = ShadowAcceptlist::new(4);

        assert_eq!(acceptlist.add(ADDRESS_1), ShadowListAdd::Added);
        assert!(acceptlist.remove(ADDRESS_1));

        assert!(acceptlist.get_copy().is_empty());
    }

    #[test]
    fn test_same_address_with_both_types_is_two_entries() {
        let mut acceptlist = ShadowAcceptlist::new(4);

        assert_eq!(acceptlist.add(ADDRESS_1), ShadowListAdd::Added);
        assert_eq!(acceptlist.add(ADDRESS_1_RANDOM), ShadowListAdd::Added);

        assert_eq!(acceptlist.len(), 2);
    }

    #[test]
    fn test_duplicate_add_is_idempotent() {
        let mut acceptlist = ShadowAcceptlist::new(4);

        assert_eq!(acceptlist.add(ADDRESS_1), ShadowListAdd::Added);
        assert_eq!(acceptlist.add(ADDRESS_1), ShadowListAdd::AlreadyPresent);
        assert!(acceptlist.add(ADDRESS_1).is_ok());

        assert_eq!(acceptlist.len(), 1);
    }

    #[test]
    fn test_add_on_full_is_rejected() {
        let mut acceptlist = ShadowAcceptlist::new(1);

        assert_eq!(acceptlist.add(ADDRESS_1), ShadowListAdd::Added);
        assert!(acceptlist.is_full());
        assert_eq!(acceptlist.add(ADDRESS_2), ShadowListAdd::Full);

        assert_eq!(acceptlist.len(), 1);
        assert!(!acceptlist.get_copy().contains(&ADDRESS_2.into()));
    }

    #[test]
    fn test_remove_absent_reports_absent() {
        let mut acceptlist = ShadowAcceptlist::new(4);

        assert!(!acceptlist.remove(ADDRESS_1));
    }

    #[test]
    fn test_clear_is_idempotent() {
        let mut acceptlist = ShadowAcceptlist::new(4);
        acceptlist.add(ADDRESS_1);

        acceptlist.clear();
        acceptlist.clear();

        assert_eq!(acceptlist.len(), 0);
    }

    #[test]
    fn test_address_resolution_capacity() {
        let mut resolving = ShadowAddressResolutionList::new(2);

        assert_eq!(resolving.add(ADDRESS_1), ShadowListAdd::Added);
        assert_eq!(resolving.add(ADDRESS_1_RANDOM), ShadowListAdd::Added);
        assert!(resolving.is_full());
        assert_eq!(resolving.add(ADDRESS_2), ShadowListAdd::Full);

        assert!(resolving.remove(ADDRESS_1));
        assert!(!resolving.remove(ADDRESS_1));
        assert_eq!(resolving.add(ADDRESS_2), ShadowListAdd::Added);
        assert_eq!(resolving.get_max_size(), 2);
    }
}
