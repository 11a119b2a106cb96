//! The upper-facing callback table registered at initialization. Every
//! callback is invoked on the upper thread with plain values only; entries
//! left unset cause the corresponding events to be dropped with a warning.

use crate::core::{
    address::{Address, AddressType, AddressWithType},
    hci::{ClassOfDevice, ConnectionHandle, ErrorCode, Mode, Role},
};

/// Inbound ACL data, already carrying the 4-byte handle/length preamble
pub type OnSendDataUpwards = Box<dyn Fn(Vec<u8>) + Send + Sync>;
/// Controller credits returned for a handle
pub type OnPacketsCompleted = Box<dyn Fn(ConnectionHandle, u16) + Send + Sync>;

/// Classic link established: address, handle, encrypted, locally initiated
pub type OnClassicConnected = Box<dyn Fn(Address, ConnectionHandle, bool, bool) + Send + Sync>;
/// Incoming classic connection request
pub type OnClassicConnectRequest = Box<dyn Fn(Address, ClassOfDevice) + Send + Sync>;
/// Classic connection attempt failed: address, reason, locally initiated
pub type OnClassicFailed = Box<dyn Fn(Address, ErrorCode, bool) + Send + Sync>;
/// Classic link torn down: status, handle, reason
pub type OnClassicDisconnected =
    Box<dyn Fn(ErrorCode, ConnectionHandle, ErrorCode) + Send + Sync>;

/// LE link established: peer, handle, role, interval, latency, timeout,
/// local RPA, peer RPA, peer address type, can read discoverable
/// characteristics
pub type OnLeConnected = Box<
    dyn Fn(AddressWithType, ConnectionHandle, Role, u16, u16, u16, Address, Address, AddressType, bool)
        + Send
        + Sync,
>;
/// LE connection attempt failed: peer, handle, enhanced, status
pub type OnLeFailed =
    Box<dyn Fn(AddressWithType, ConnectionHandle, bool, ErrorCode) + Send + Sync>;
/// LE link torn down: status, handle, reason
pub type OnLeDisconnected = Box<dyn Fn(ErrorCode, ConnectionHandle, ErrorCode) + Send + Sync>;

pub type OnPacketTypeChanged = Box<dyn Fn(u16) + Send + Sync>;
pub type OnAuthenticationComplete = Box<dyn Fn(ConnectionHandle, ErrorCode) + Send + Sync>;
pub type OnEncryptionChange = Box<dyn Fn(bool) + Send + Sync>;
pub type OnChangeConnectionLinkKeyComplete = Box<dyn Fn() + Send + Sync>;
/// Mode change: status, handle, new mode, interval
pub type OnModeChange = Box<dyn Fn(ErrorCode, ConnectionHandle, Mode, u16) + Send + Sync>;
/// Sniff subrating: status, handle, max tx latency, max rx latency,
/// min remote timeout, min local timeout
pub type OnSniffSubrating =
    Box<dyn Fn(ErrorCode, ConnectionHandle, u16, u16, u16, u16) + Send + Sync>;
pub type OnRoleChange = Box<dyn Fn(ErrorCode, Address, Role) + Send + Sync>;
/// Remote version: status, handle, lmp version, manufacturer, subversion
pub type OnReadRemoteVersionInformationComplete =
    Box<dyn Fn(ErrorCode, ConnectionHandle, u8, u16, u16) + Send + Sync>;
pub type OnReadRemoteSupportedFeaturesComplete =
    Box<dyn Fn(ConnectionHandle, u64) + Send + Sync>;
/// Remote extended features: handle, page number, max page number, features
pub type OnReadRemoteExtendedFeaturesComplete =
    Box<dyn Fn(ConnectionHandle, u8, u8, u64) + Send + Sync>;

/// Connection update: status, handle, interval, latency, timeout
pub type OnConnectionUpdate =
    Box<dyn Fn(ErrorCode, ConnectionHandle, u16, u16, u16) + Send + Sync>;
/// Data length change: handle, tx octets, tx time, rx octets, rx time
pub type OnDataLengthChange =
    Box<dyn Fn(ConnectionHandle, u16, u16, u16, u16) + Send + Sync>;
/// Subrate change: handle, subrate factor, peripheral latency,
/// continuation number, supervision timeout, status
pub type OnLeSubrateChange =
    Box<dyn Fn(ConnectionHandle, u16, u16, u16, u16, ErrorCode) + Send + Sync>;
/// Phy update: status, handle, tx phy, rx phy
pub type OnPhyUpdate = Box<dyn Fn(ErrorCode, ConnectionHandle, u8, u8) + Send + Sync>;

/// Callbacks responding to classic connection lifecycle events
#[derive(Default)]
pub struct ClassicConnectionInterface {
    pub on_connected: Option<OnClassicConnected>,
    pub on_connect_request: Option<OnClassicConnectRequest>,
    pub on_failed: Option<OnClassicFailed>,
    pub on_disconnected: Option<OnClassicDisconnected>,
}

/// Callbacks responding to LE connection lifecycle events
#[derive(Default)]
pub struct LeConnectionInterface {
    pub on_connected: Option<OnLeConnected>,
    pub on_failed: Option<OnLeFailed>,
    pub on_disconnected: Option<OnLeDisconnected>,
}

/// Connection lifecycle callbacks for both transports
#[derive(Default)]
pub struct ConnectionInterface {
    pub classic: ClassicConnectionInterface,
    pub le: LeConnectionInterface,
}

/// Callbacks responding to events on an established classic link
#[derive(Default)]
pub struct ClassicLinkInterface {
    pub on_packet_type_changed: Option<OnPacketTypeChanged>,
    pub on_authentication_complete: Option<OnAuthenticationComplete>,
    pub on_encryption_change: Option<OnEncryptionChange>,
    pub on_change_connection_link_key_complete: Option<OnChangeConnectionLinkKeyComplete>,
    pub on_mode_change: Option<OnModeChange>,
    pub on_sniff_subrating: Option<OnSniffSubrating>,
    pub on_role_change: Option<OnRoleChange>,
    pub on_read_remote_version_information_complete:
        Option<OnReadRemoteVersionInformationComplete>,
    pub on_read_remote_supported_features_complete:
        Option<OnReadRemoteSupportedFeaturesComplete>,
    pub on_read_remote_extended_features_complete:
        Option<OnReadRemoteExtendedFeaturesComplete>,
}

/// Callbacks responding to events on an established LE link
#[derive(Default)]
pub struct LeLinkInterface {
    pub on_connection_update: Option<OnConnectionUpdate>,
    pub on_data_length_change: Option<OnDataLengthChange>,
    pub on_le_subrate_change: Option<OnLeSubrateChange>,
    pub on_read_remote_version_information_complete:
        Option<OnReadRemoteVersionInformationComplete>,
    pub on_phy_update: Option<OnPhyUpdate>,
}

/// Established-link callbacks for both transports
#[derive(Default)]
pub struct LinkInterface {
    pub classic: ClassicLinkInterface,
    pub le: LeLinkInterface,
}

/// The complete upper-facing callback table
#[derive(Default)]
pub struct AclInterface {
    pub on_send_data_upwards: Option<OnSendDataUpwards>,
    pub on_packets_completed: Option<OnPacketsCompleted>,
    pub connection: ConnectionInterface,
    pub link: LinkInterface,
}

/// Initialization-time check that the callbacks every stack must provide
/// are present. Panics on a missing required callback, before any link can
/// exist.
pub fn verify_acl_interface(interface: &AclInterface) {
    assert!(
        interface.on_send_data_upwards.is_some(),
        "Must provide to receive data on acl links"
    );
    assert!(
        interface.on_packets_completed.is_some(),
        "Must provide to receive completed packet indication"
    );

    assert!(
        interface.connection.classic.on_connected.is_some(),
        "Must provide to respond to successful classic connections"
    );
    assert!(
        interface.connection.classic.on_failed.is_some(),
        "Must provide to respond when classic connection attempts fail"
    );
    assert!(
        interface.connection.classic.on_disconnected.is_some(),
        "Must provide to respond when active classic connection disconnects"
    );

    assert!(
        interface.connection.le.on_connected.is_some(),
        "Must provide to respond to successful le connections"
    );
    assert!(
        interface.connection.le.on_failed.is_some(),
        "Must provide to respond when le connection attempts fail"
    );
    assert!(
        interface.connection.le.on_disconnected.is_some(),
        "Must provide to respond when active le connection disconnects"
    );
}
