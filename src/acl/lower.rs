//! These traits represent the lower-level operations made available to the
//! link manager. The driver owns the HCI transport and the controller state
//! machine; the link manager owns link lifecycle and the host-side shadows
//! of the controller tables.
//!
//! All callbacks registered through these traits are invoked on the lower
//! handler. A per-link connection object stays valid until the link manager
//! drops it after the corresponding disconnection event.

use std::fmt::Debug;
use std::rc::Rc;

use async_trait::async_trait;

use crate::core::{
    address::{Address, AddressWithType},
    hci::{ClassOfDevice, ConnectionHandle, DisconnectReason, ErrorCode, EncryptionStatus, Mode, Role},
};

/// One end of the bidirectional per-link data queue owned by the driver.
///
/// The registered closures are invoked on the lower handler: the dequeue
/// callback when an inbound packet is available, the enqueue callback when
/// the driver is ready to consume one outbound packet.
pub trait AclQueueEnd {
    /// Register the producer invoked each time the driver can accept an
    /// outbound packet. Must not be called while already registered.
    fn register_enqueue(&self, producer: Box<dyn FnMut() -> Vec<u8>>);
    /// Remove the outbound producer
    fn unregister_enqueue(&self);
    /// Register the callback invoked when an inbound packet is available
    fn register_dequeue(&self, on_data_ready: Box<dyn Fn()>);
    /// Remove the inbound callback
    fn unregister_dequeue(&self);
    /// Take one inbound packet, if any is waiting
    fn try_dequeue(&self) -> Option<Vec<u8>>;
}

/// Operations common to both transports' connection objects
pub trait AclConnection {
    /// The controller-assigned handle of this link
    fn handle(&self) -> ConnectionHandle;
    /// Whether the local host initiated this link
    fn locally_initiated(&self) -> bool;
    /// The data queue end for this link
    fn queue_end(&self) -> Rc<dyn AclQueueEnd>;
    /// Issue a Disconnect command for this link. Completion is reported
    /// through the disconnection event.
    fn disconnect(&self, reason: DisconnectReason);
}

/// Events delivered by the driver for an established classic link
pub trait ConnectionManagementCallbacks {
    fn on_connection_packet_type_changed(&self, packet_type: u16);
    fn on_authentication_complete(&self, status: ErrorCode);
    fn on_encryption_change(&self, enabled: EncryptionStatus);
    fn on_change_connection_link_key_complete(&self);
    fn on_mode_change(&self, status: ErrorCode, current_mode: Mode, interval: u16);
    fn on_sniff_subrating(
        &self,
        status: ErrorCode,
        maximum_transmit_latency: u16,
        maximum_receive_latency: u16,
        minimum_remote_timeout: u16,
        minimum_local_timeout: u16,
    );
    fn on_role_change(&self, status: ErrorCode, new_role: Role);
    fn on_disconnection(&self, reason: ErrorCode);
    fn on_read_remote_version_information_complete(
        &self,
        status: ErrorCode,
        lmp_version: u8,
        manufacturer_name: u16,
        sub_version: u16,
    );
    fn on_read_remote_supported_features_complete(&self, features: u64);
    fn on_read_remote_extended_features_complete(
        &self,
        page_number: u8,
        max_page_number: u8,
        features: u64,
    );
}

/// A classic (BR/EDR) connection handed over by the driver on
/// connect-success
pub trait ClassicAclConnection: AclConnection {
    /// The remote device address
    fn address(&self) -> Address;
    /// Register for link events. Must be called exactly once, directly
    /// after the connection is handed over.
    fn register_callbacks(&self, callbacks: Rc<dyn ConnectionManagementCallbacks>);
    fn read_remote_version_information(&self);
    fn read_remote_supported_features(&self);
    fn read_remote_extended_features(&self, page_number: u8);
    fn hold_mode(&self, max_interval: u16, min_interval: u16);
    fn sniff_mode(&self, max_interval: u16, min_interval: u16, attempt: u16, timeout: u16);
    fn exit_sniff_mode(&self);
    fn sniff_subrating(
        &self,
        maximum_latency: u16,
        minimum_remote_timeout: u16,
        minimum_local_timeout: u16,
    );
    fn set_connection_encryption(&self, enabled: bool);
    /// Flush pending outbound data in the controller for this link
    fn flush(&self);
}

/// Events delivered by the driver for an established LE link
pub trait LeConnectionManagementCallbacks {
    fn on_connection_update(
        &self,
        status: ErrorCode,
        connection_interval: u16,
        connection_latency: u16,
        supervision_timeout: u16,
    );
    fn on_data_length_change(
        &self,
        tx_octets: u16,
        tx_time: u16,
        rx_octets: u16,
        rx_time: u16,
    );
    fn on_le_subrate_change(
        &self,
        status: ErrorCode,
        subrate_factor: u16,
        peripheral_latency: u16,
        continuation_number: u16,
        supervision_timeout: u16,
    );
    fn on_read_remote_version_information_complete(
        &self,
        status: ErrorCode,
        lmp_version: u8,
        manufacturer_name: u16,
        sub_version: u16,
    );
    fn on_phy_update(&self, status: ErrorCode, tx_phy: u8, rx_phy: u8);
    fn on_disconnection(&self, reason: ErrorCode);
}

/// Data that only exists for one of the two LE connection roles
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RoleSpecificData {
    /// We are the central of this link
    Central,
    /// We are the peripheral of this link
    Peripheral {
        /// The advertising set that accepted the connection, when known
        advertising_set_id: Option<u8>,
        /// Whether the peer connected through a discoverable advertisement
        connected_to_discoverable: bool,
    },
}

/// An LE connection handed over by the driver on connect-success
pub trait LeAclConnection: AclConnection {
    /// Our role on this link
    fn role(&self) -> Role;
    /// The peer identity address
    fn peer_address(&self) -> AddressWithType;
    /// The peer address seen over the air
    fn peer_ota_address(&self) -> AddressWithType;
    /// Our identity address for this link
    fn local_address(&self) -> AddressWithType;
    /// Our address as sent over the air
    fn local_ota_address(&self) -> AddressWithType;
    /// Our resolvable private address, or the empty address
    fn local_resolvable_private_address(&self) -> Address;
    /// The peer's resolvable private address, or the empty address
    fn peer_resolvable_private_address(&self) -> Address;
    /// Connection interval negotiated at establishment
    fn interval(&self) -> u16;
    /// Peripheral latency negotiated at establishment
    fn latency(&self) -> u16;
    /// Supervision timeout negotiated at establishment
    fn supervision_timeout(&self) -> u16;
    /// Whether the peer was in the controller filter accept list when the
    /// connection completed
    fn in_filter_accept_list(&self) -> bool;
    /// Role-specific connection data
    fn role_specific_data(&self) -> RoleSpecificData;
    /// Register for link events. Must be called exactly once, directly
    /// after the connection is handed over.
    fn register_callbacks(&self, callbacks: Rc<dyn LeConnectionManagementCallbacks>);
    fn connection_update(
        &self,
        conn_interval_min: u16,
        conn_interval_max: u16,
        conn_latency: u16,
        supervision_timeout: u16,
        min_ce_length: u16,
        max_ce_length: u16,
    );
    fn subrate_request(
        &self,
        subrate_min: u16,
        subrate_max: u16,
        max_latency: u16,
        continuation_number: u16,
        supervision_timeout: u16,
    );
}

/// The driver before the link manager has registered for connection events
pub trait InactiveAclDriver {
    /// The type implementing AclDriver once callbacks are registered
    type Active: AclDriver + 'static;

    /// Register callbacks for connection events, and produce the active
    /// driver
    fn register_callbacks(self, callbacks: impl AclDriverCallbacks + 'static) -> Self::Active;
}

/// The operations provided by the driver to the link manager
#[async_trait(?Send)]
pub trait AclDriver: Debug {
    /// Initiate an outgoing classic connection
    fn create_connection(&self, address: Address);
    /// Cancel an outstanding classic connection attempt
    fn cancel_connect(&self, address: Address);
    /// Arm the controller to connect to the given LE peer. Due to races,
    /// a connection complete may still arrive after a later cancel.
    fn create_le_connection(&self, address: AddressWithType, is_direct: bool);
    /// Cancel an outstanding LE connection attempt
    fn cancel_le_connect(&self, address: AddressWithType);
    /// Drop the peer from the background connect list
    fn remove_from_background_list(&self, address: AddressWithType);
    fn add_device_to_resolving_list(
        &self,
        address: AddressWithType,
        peer_irk: [u8; 16],
        local_irk: [u8; 16],
    );
    fn remove_device_from_resolving_list(&self, address: AddressWithType);
    fn clear_resolving_list(&self);
    fn clear_filter_accept_list(&self);
    fn le_set_default_subrate(
        &self,
        subrate_min: u16,
        subrate_max: u16,
        max_latency: u16,
        continuation_number: u16,
        supervision_timeout: u16,
    );
    fn set_system_suspend_state(&self, suspended: bool);
    /// Tell the driver a classic link is going away because of a suspend
    /// disconnect, ahead of the (masked) link-layer event
    fn on_classic_suspend_initiated_disconnect(
        &self,
        handle: ConnectionHandle,
        reason: ErrorCode,
    );
    /// Tell the driver an LE link is going away because of a suspend
    /// disconnect, ahead of the (masked) link-layer event
    fn on_le_suspend_initiated_disconnect(&self, handle: ConnectionHandle, reason: ErrorCode);
    /// Stop delivery of classic connection events. Resolves once the driver
    /// guarantees no further classic callback will run.
    async fn unregister_classic_callbacks(&self);
    /// Stop delivery of LE connection events. Resolves once the driver
    /// guarantees no further LE callback will run.
    async fn unregister_le_callbacks(&self);
}

/// The callbacks invoked by the driver in response to controller events
pub trait AclDriverCallbacks {
    /// A classic connection completed; ownership of the connection object
    /// moves to the link manager
    fn on_classic_connect_success(&self, connection: Box<dyn ClassicAclConnection>);
    /// An incoming classic connection request awaits an accept decision
    fn on_classic_connect_request(&self, address: Address, class_of_device: ClassOfDevice);
    /// A classic connection attempt failed
    fn on_classic_connect_fail(&self, address: Address, reason: ErrorCode, locally_initiated: bool);
    /// An LE connection completed. `address_with_type` is the address
    /// reported in the connection complete event (possibly an RPA);
    /// ownership of the connection object moves to the link manager
    fn on_le_connect_success(
        &self,
        address_with_type: AddressWithType,
        connection: Box<dyn LeAclConnection>,
    );
    /// An LE connection attempt failed
    fn on_le_connect_fail(&self, address_with_type: AddressWithType, reason: ErrorCode);
    /// The controller returned transmit credits for a handle
    fn on_incoming_acl_credits(&self, handle: ConnectionHandle, credits: u16);
}
