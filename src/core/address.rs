//! Bluetooth device addresses, with and without an LE address type

use std::fmt;

/// A Bluetooth device address (BR/EDR or LE)
#[derive(Copy, Clone, Default, Hash, PartialEq, Eq)]
pub struct Address {
    /// The 6 address bytes stored in little-endian format
    pub address: [u8; 6],
}

impl Address {
    /// An empty/invalid address
    pub const EMPTY: Self = Self { address: [0, 0, 0, 0, 0, 0] };

    /// Constructor from raw bytes (little-endian, index 5 is the MSB)
    pub const fn new(address: [u8; 6]) -> Self {
        Self { address }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.address[5],
            self.address[4],
            self.address[3],
            self.address[2],
            self.address[1],
            self.address[0]
        )
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// The type of an LE address (see: 5.3 Vol 6B 1.3 Device Address)
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum AddressType {
    /// A public address
    Public = 0x0,
    /// A random address (either random static or private)
    Random = 0x1,
    /// A public identity address, resolved from an RPA
    PublicIdentity = 0x2,
    /// A random static identity address, resolved from an RPA
    RandomIdentity = 0x3,
}

/// An LE address with its address type
#[derive(Copy, Clone, Hash, PartialEq, Eq)]
pub struct AddressWithType {
    /// The device address
    pub address: Address,
    /// The LE address type
    pub address_type: AddressType,
}

impl AddressWithType {
    /// An empty/invalid address
    pub const EMPTY: Self = Self { address: Address::EMPTY, address_type: AddressType::Public };

    /// True if this is a resolvable private address. Checks the upper two
    /// bits of the most-significant address byte for the 0b01 RPA marker.
    pub fn is_rpa(&self) -> bool {
        self.address_type == AddressType::Random && (self.address.address[5] & 0xc0) == 0x40
    }
}

impl fmt::Display for AddressWithType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{:?}]", self.address, self.address_type)
    }
}

impl fmt::Debug for AddressWithType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// The address types distinguished by the controller's filter accept list.
/// Identity address types fold onto their public/random base type.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum FilterAcceptListAddressType {
    /// Public device or public identity address
    Public,
    /// Random device or random static identity address
    Random,
}

impl From<AddressType> for FilterAcceptListAddressType {
    fn from(address_type: AddressType) -> Self {
        match address_type {
            AddressType::Public | AddressType::PublicIdentity => Self::Public,
            AddressType::Random | AddressType::RandomIdentity => Self::Random,
        }
    }
}

/// Key type for the shadow accept list. Note that `(A, Public)` and
/// `(A, Random)` are distinct entries.
#[derive(Copy, Clone, Hash, PartialEq, Eq)]
pub struct ConnectAddressWithType {
    /// The device address
    pub address: Address,
    /// The filter-accept-list address type
    pub filter_type: FilterAcceptListAddressType,
}

impl From<AddressWithType> for ConnectAddressWithType {
    fn from(address_with_type: AddressWithType) -> Self {
        Self {
            address: address_with_type.address,
            filter_type: address_with_type.address_type.into(),
        }
    }
}

impl fmt::Display for ConnectAddressWithType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{:?}]", self.address, self.filter_type)
    }
}

impl fmt::Debug for ConnectAddressWithType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}
