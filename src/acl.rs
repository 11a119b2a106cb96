//! This module manages established ACL links on both transports. It tracks
//! every live link in a handle-keyed registry, routes data and lifecycle
//! events between the upper stack and the lower driver, owns the host-side
//! shadows of the controller filter-accept and address-resolution lists,
//! and coordinates teardown across suspend and shutdown.
//!
//! All state is mutated on the lower handler; every user-visible callback
//! is posted to the upper thread as a plain-value closure.

use std::cell::RefCell;
use std::io::Write;
use std::ops::Deref;
use std::rc::Rc;
use std::sync::Arc;

use chrono::Local;
use log::{debug, error, info, warn};
use tokio::sync::oneshot;
use tokio::task::spawn_local;

use crate::core::{
    address::{Address, AddressWithType},
    hci::{
        ClassOfDevice, ConnectionHandle, DisconnectReason, ErrorCode, Role,
        INVALID_CONNECTION_HANDLE,
    },
    shared_box::{SharedBox, WeakBox},
};

use self::{
    dispatch::{UpperDispatcher, UpperThread},
    history::{
        ConnectionDescriptor, ConnectionHistory, MapCount, RemoteAddress,
        CONNECTION_DESCRIPTOR_TIME_FORMAT,
    },
    interface::{verify_acl_interface, AclInterface},
    link::{ClassicLink, LeLink, OnLinkDisconnect},
    lower::{
        AclDriver, AclDriverCallbacks, ClassicAclConnection, InactiveAclDriver, LeAclConnection,
    },
    registry::LinkRegistry,
    shadow::{ShadowAcceptlist, ShadowAddressResolutionList},
};

pub mod dispatch;
pub mod history;
pub mod interface;
mod link;
pub mod lower;
pub mod mocks;
mod registry;
pub mod shadow;

struct AclState {
    registry: LinkRegistry,
    shadow_acceptlist: ShadowAcceptlist,
    shadow_address_resolution_list: ShadowAddressResolutionList,
    connection_history: ConnectionHistory,
    classic_acl_disconnect_reason: MapCount<String>,
    le_acl_disconnect_reason: MapCount<String>,
}

/// The ACL link manager. Owns every established link on both transports
/// and the host shadows of the controller connection tables.
pub struct AclManager {
    driver: Rc<dyn AclDriver>,
    dispatcher: UpperDispatcher,
    weak_self: WeakBox<AclManager>,
    state: RefCell<AclState>,
}

struct AclDriverCallbackHandler(WeakBox<AclManager>);

impl AclDriverCallbackHandler {
    fn with_manager(&self, f: impl FnOnce(&AclManager)) {
        self.0.with(|manager| f(manager.expect("got connection event after stack died").deref()))
    }
}

impl AclDriverCallbacks for AclDriverCallbackHandler {
    fn on_classic_connect_success(&self, connection: Box<dyn ClassicAclConnection>) {
        self.with_manager(|manager| manager.on_classic_connect_success(connection))
    }

    fn on_classic_connect_request(&self, address: Address, class_of_device: ClassOfDevice) {
        self.with_manager(|manager| manager.on_classic_connect_request(address, class_of_device))
    }

    fn on_classic_connect_fail(
        &self,
        address: Address,
        reason: ErrorCode,
        locally_initiated: bool,
    ) {
        self.with_manager(|manager| {
            manager.on_classic_connect_fail(address, reason, locally_initiated)
        })
    }

    fn on_le_connect_success(
        &self,
        address_with_type: AddressWithType,
        connection: Box<dyn LeAclConnection>,
    ) {
        self.with_manager(|manager| manager.on_le_connect_success(address_with_type, connection))
    }

    fn on_le_connect_fail(&self, address_with_type: AddressWithType, reason: ErrorCode) {
        self.with_manager(|manager| manager.on_le_connect_fail(address_with_type, reason))
    }

    fn on_incoming_acl_credits(&self, handle: ConnectionHandle, credits: u16) {
        self.with_manager(|manager| manager.on_incoming_acl_credits(handle, credits))
    }
}

impl AclManager {
    /// Constructor. Registers for driver events and validates that the
    /// upper stack provided every required callback.
    pub fn new(
        driver: impl InactiveAclDriver,
        interface: AclInterface,
        upper: UpperThread,
        max_acceptlist_size: u8,
        max_address_resolution_size: u8,
    ) -> SharedBox<Self> {
        verify_acl_interface(&interface);
        let dispatcher = UpperDispatcher::new(upper, Arc::new(interface));
        SharedBox::new_cyclic(|weak| Self {
            driver: Rc::new(driver.register_callbacks(AclDriverCallbackHandler(weak.clone()))),
            dispatcher,
            weak_self: weak,
            state: RefCell::new(AclState {
                registry: LinkRegistry::default(),
                shadow_acceptlist: ShadowAcceptlist::new(max_acceptlist_size),
                shadow_address_resolution_list: ShadowAddressResolutionList::new(
                    max_address_resolution_size,
                ),
                connection_history: ConnectionHistory::default(),
                classic_acl_disconnect_reason: MapCount::new(),
                le_acl_disconnect_reason: MapCount::new(),
            }),
        })
    }

    /// Whether the handle names an established classic link
    pub fn is_classic_acl(&self, handle: ConnectionHandle) -> bool {
        self.state.borrow().registry.is_classic_acl(handle)
    }

    /// Whether the handle names an established LE link
    pub fn is_le_acl(&self, handle: ConnectionHandle) -> bool {
        self.state.borrow().registry.is_le_acl(handle)
    }

    /// Route an outbound payload to the owning link
    pub fn write_data(&self, handle: ConnectionHandle, packet: Vec<u8>) {
        self.state.borrow().registry.write_data(handle, packet);
    }

    /// Flush controller-buffered outbound data; classic links only
    pub fn flush(&self, handle: ConnectionHandle) {
        self.state.borrow().registry.flush(handle);
    }

    pub fn create_classic_connection(&self, address: Address) {
        self.driver.create_connection(address);
        debug!("Connection initiated for classic to remote:{address}");
    }

    pub fn cancel_classic_connection(&self, address: Address) {
        self.driver.cancel_connect(address);
        debug!("Connection cancelled for classic to remote:{address}");
    }

    /// Allow an LE connection from the given peer. Resolves `false`
    /// without touching the controller when the accept list is full.
    pub fn accept_le_connection_from(
        &self,
        address_with_type: AddressWithType,
        is_direct: bool,
        promise: oneshot::Sender<bool>,
    ) {
        let mut state = self.state.borrow_mut();
        if state.shadow_acceptlist.is_full() {
            error!("Acceptlist is full preventing new Le connection");
            let _ = promise.send(false);
            return;
        }
        state.shadow_acceptlist.add(address_with_type);
        drop(state);
        let _ = promise.send(true);
        self.driver.create_le_connection(address_with_type, is_direct);
        debug!("Allow Le connection from remote:{address_with_type}");
    }

    /// Stop accepting LE connections from the given peer and cancel any
    /// outstanding attempt
    pub fn ignore_le_connection_from(&self, address_with_type: AddressWithType) {
        self.state.borrow_mut().shadow_acceptlist.remove(address_with_type);
        self.driver.cancel_le_connect(address_with_type);
        debug!("Ignore Le connection from remote:{address_with_type}");
    }

    /// Initiate disconnect of a classic link, recording the caller's
    /// comment for diagnostics
    pub fn disconnect_classic(
        &self,
        handle: ConnectionHandle,
        reason: DisconnectReason,
        comment: &str,
    ) {
        let state = &mut *self.state.borrow_mut();
        match state.registry.get_classic_connection(handle) {
            Some(link) => {
                let remote_address = link.get_remote_address();
                link.initiate_disconnect(reason);
                debug!(
                    "Disconnection initiated classic remote:{remote_address} handle:0x{handle:04x} reason:{reason:?} comment:{comment}"
                );
                state.classic_acl_disconnect_reason.put(comment.to_string());
            }
            None => {
                warn!("Unable to disconnect unknown classic connection handle:0x{handle:04x}")
            }
        }
    }

    /// Initiate disconnect of an LE link, recording the caller's comment
    /// for diagnostics
    pub fn disconnect_le(&self, handle: ConnectionHandle, reason: DisconnectReason, comment: &str) {
        let state = &mut *self.state.borrow_mut();
        match state.registry.get_le_connection(handle) {
            Some(link) => {
                let remote_address_with_type = link.get_remote_address_with_type();
                self.driver.remove_from_background_list(remote_address_with_type);
                link.initiate_disconnect(reason);
                debug!(
                    "Disconnection initiated le remote:{remote_address_with_type} handle:0x{handle:04x} reason:{reason:?} comment:{comment}"
                );
                state.le_acl_disconnect_reason.put(comment.to_string());
            }
            None => warn!("Unable to disconnect unknown le connection handle:0x{handle:04x}"),
        }
    }

    /// Request new connection parameters on an LE link
    pub fn update_connection_parameters(
        &self,
        handle: ConnectionHandle,
        conn_interval_min: u16,
        conn_interval_max: u16,
        conn_latency: u16,
        supervision_timeout: u16,
        min_ce_length: u16,
        max_ce_length: u16,
    ) {
        let state = self.state.borrow();
        let Some(link) = state.registry.get_le_connection(handle) else {
            warn!("Unknown le connection handle:0x{handle:04x}");
            return;
        };
        link.update_connection_parameters(
            conn_interval_min,
            conn_interval_max,
            conn_latency,
            supervision_timeout,
            min_ce_length,
            max_ce_length,
        );
    }

    /// Enable or disable link-level encryption; classic links only
    pub fn set_connection_encryption(&self, handle: ConnectionHandle, enabled: bool) {
        let state = self.state.borrow();
        match state.registry.get_classic_connection(handle) {
            Some(link) => link.set_connection_encryption(enabled),
            None => error!("handle 0x{handle:04x} is not a classic connection"),
        }
    }

    pub fn hold_mode(&self, handle: ConnectionHandle, max_interval: u16, min_interval: u16) {
        let state = self.state.borrow();
        match state.registry.get_classic_connection(handle) {
            Some(link) => link.hold_mode(max_interval, min_interval),
            None => error!("handle 0x{handle:04x} is not a classic connection"),
        }
    }

    pub fn sniff_mode(
        &self,
        handle: ConnectionHandle,
        max_interval: u16,
        min_interval: u16,
        attempt: u16,
        timeout: u16,
    ) {
        let state = self.state.borrow();
        match state.registry.get_classic_connection(handle) {
            Some(link) => link.sniff_mode(max_interval, min_interval, attempt, timeout),
            None => error!("handle 0x{handle:04x} is not a classic connection"),
        }
    }

    pub fn exit_sniff_mode(&self, handle: ConnectionHandle) {
        let state = self.state.borrow();
        match state.registry.get_classic_connection(handle) {
            Some(link) => link.exit_sniff_mode(),
            None => error!("handle 0x{handle:04x} is not a classic connection"),
        }
    }

    pub fn sniff_subrating(
        &self,
        handle: ConnectionHandle,
        maximum_latency: u16,
        minimum_remote_timeout: u16,
        minimum_local_timeout: u16,
    ) {
        let state = self.state.borrow();
        match state.registry.get_classic_connection(handle) {
            Some(link) => {
                link.sniff_subrating(maximum_latency, minimum_remote_timeout, minimum_local_timeout)
            }
            None => error!("handle 0x{handle:04x} is not a classic connection"),
        }
    }

    pub fn le_set_default_subrate(
        &self,
        subrate_min: u16,
        subrate_max: u16,
        max_latency: u16,
        continuation_number: u16,
        supervision_timeout: u16,
    ) {
        self.driver.le_set_default_subrate(
            subrate_min,
            subrate_max,
            max_latency,
            continuation_number,
            supervision_timeout,
        );
    }

    pub fn le_subrate_request(
        &self,
        handle: ConnectionHandle,
        subrate_min: u16,
        subrate_max: u16,
        max_latency: u16,
        continuation_number: u16,
        supervision_timeout: u16,
    ) {
        let state = self.state.borrow();
        match state.registry.get_le_connection(handle) {
            Some(link) => link.subrate_request(
                subrate_min,
                subrate_max,
                max_latency,
                continuation_number,
                supervision_timeout,
            ),
            None => error!("handle 0x{handle:04x} is not a LE connection"),
        }
    }

    /// Mirror an identity into the shadow resolving list and program the
    /// controller. Dropped with a log when the shadow is full.
    pub fn add_to_address_resolution(
        &self,
        address_with_type: AddressWithType,
        peer_irk: [u8; 16],
        local_irk: [u8; 16],
    ) {
        let mut state = self.state.borrow_mut();
        if state.shadow_address_resolution_list.is_full() {
            warn!(
                "Le Address Resolution list is full size:{}",
                state.shadow_address_resolution_list.len()
            );
            return;
        }
        // TODO This should really be added upon successful completion
        state.shadow_address_resolution_list.add(address_with_type);
        drop(state);
        self.driver.add_device_to_resolving_list(address_with_type, peer_irk, local_irk);
    }

    pub fn remove_from_address_resolution(&self, address_with_type: AddressWithType) {
        // TODO This should really be removed upon successful removal
        if !self.state.borrow_mut().shadow_address_resolution_list.remove(address_with_type) {
            warn!("Unable to remove from Le Address Resolution list device:{address_with_type}");
        }
        self.driver.remove_device_from_resolving_list(address_with_type);
    }

    pub fn clear_address_resolution(&self) {
        self.driver.clear_resolving_list();
        // TODO This should really be cleared after successful clear status
        self.state.borrow_mut().shadow_address_resolution_list.clear();
    }

    pub fn clear_filter_accept_list(&self) {
        let mut state = self.state.borrow_mut();
        let count = state.shadow_acceptlist.len();
        self.driver.clear_filter_accept_list();
        state.shadow_acceptlist.clear();
        debug!("Cleared entire Le address acceptlist count:{count}");
    }

    pub fn set_system_suspend_state(&self, suspended: bool) {
        self.driver.set_system_suspend_state(suspended);
    }

    /// The local address used on an LE link, identity or over-the-air form
    pub fn get_connection_local_address(
        &self,
        handle: ConnectionHandle,
        ota_address: bool,
    ) -> Option<AddressWithType> {
        let state = self.state.borrow();
        let Some(link) = state.registry.get_le_connection(handle) else {
            warn!("address not found handle:0x{handle:04x}");
            return None;
        };
        Some(if ota_address {
            link.get_local_ota_address_with_type()
        } else {
            link.get_local_address_with_type()
        })
    }

    /// The peer address on an LE link, identity or over-the-air form
    pub fn get_connection_peer_address(
        &self,
        handle: ConnectionHandle,
        ota_address: bool,
    ) -> Option<AddressWithType> {
        let state = self.state.borrow();
        let Some(link) = state.registry.get_le_connection(handle) else {
            warn!("address not found handle:0x{handle:04x}");
            return None;
        };
        Some(if ota_address {
            link.get_peer_ota_address_with_type()
        } else {
            link.get_peer_address_with_type()
        })
    }

    /// The advertising set a peripheral-role LE link was accepted through
    pub fn get_advertising_set_connected_to(&self, remote_address: Address) -> Option<u8> {
        let state = self.state.borrow();
        for link in state.registry.le_connections() {
            if link.get_remote_address_with_type().address == remote_address {
                return link.get_advertising_set_connected_to();
            }
        }
        warn!("address not found remote:{remote_address}");
        None
    }

    fn classic_link_disconnect_callback(&self) -> OnLinkDisconnect {
        let weak = self.weak_self.clone();
        Box::new(move |handle, reason| {
            weak.with(|manager| match manager {
                Some(manager) => manager.on_classic_link_disconnected(handle, reason),
                None => warn!("Classic link disconnect after stack died handle:0x{handle:04x}"),
            })
        })
    }

    fn le_link_disconnect_callback(&self) -> OnLinkDisconnect {
        let weak = self.weak_self.clone();
        Box::new(move |handle, reason| {
            weak.with(|manager| match manager {
                Some(manager) => manager.on_le_link_disconnected(handle, reason),
                None => warn!("Le link disconnect after stack died handle:0x{handle:04x}"),
            })
        })
    }

    fn on_classic_connect_success(&self, connection: Box<dyn ClassicAclConnection>) {
        let handle = connection.handle();
        let locally_initiated = connection.locally_initiated();
        let remote_address = connection.address();

        let link = ClassicLink::new(
            connection,
            self.dispatcher.clone(),
            self.classic_link_disconnect_callback(),
            Local::now(),
        );
        link.read_remote_controller_information();
        self.state.borrow_mut().registry.add_classic_connection(link);

        self.dispatcher.post_or_drop("classic on_connected", move |interface| {
            interface
                .connection
                .classic
                .on_connected
                .as_ref()
                .map(|cb| cb(remote_address, handle, false, locally_initiated))
        });
        debug!(
            "Connection successful classic remote:{remote_address} handle:0x{handle:04x} initiator:{}",
            if locally_initiated { "local" } else { "remote" }
        );
    }

    fn on_classic_connect_request(&self, address: Address, class_of_device: ClassOfDevice) {
        self.dispatcher.post_or_drop("classic on_connect_request", move |interface| {
            interface
                .connection
                .classic
                .on_connect_request
                .as_ref()
                .map(|cb| cb(address, class_of_device))
        });
        debug!("Received connect request remote:{address} cod:{class_of_device}");
    }

    fn on_classic_connect_fail(&self, address: Address, reason: ErrorCode, locally_initiated: bool) {
        self.dispatcher.post_or_drop("classic on_failed", move |interface| {
            interface
                .connection
                .classic
                .on_failed
                .as_ref()
                .map(|cb| cb(address, reason, locally_initiated))
        });
        warn!("Connection failed classic remote:{address} reason:{reason}");
    }

    fn on_classic_link_disconnected(&self, handle: ConnectionHandle, reason: ErrorCode) {
        let state = &mut *self.state.borrow_mut();
        let Some(link) = state.registry.get_classic_connection(handle) else {
            error!("Disconnection for unknown classic connection handle:0x{handle:04x}");
            return;
        };
        let remote_address = link.get_remote_address();
        state.connection_history.push(ConnectionDescriptor {
            creation_time: link.get_creation_time(),
            teardown_time: Local::now(),
            handle,
            is_locally_initiated: link.is_locally_initiated(),
            disconnect_reason: reason,
            remote_address: RemoteAddress::Classic(remote_address),
        });
        state.registry.remove_classic_connection(handle);

        self.dispatcher.post_or_drop("classic on_disconnected", move |interface| {
            interface
                .connection
                .classic
                .on_disconnected
                .as_ref()
                .map(|cb| cb(ErrorCode::SUCCESS, handle, reason))
        });
        debug!("Disconnected classic link remote:{remote_address} handle:0x{handle:04x} reason:{reason}");
    }

    fn on_le_connect_success(
        &self,
        address_with_type: AddressWithType,
        connection: Box<dyn LeAclConnection>,
    ) {
        let handle = connection.handle();
        let peer_address_with_type = connection.peer_address();
        let connection_role = connection.role();
        let locally_initiated = connection.locally_initiated();
        let conn_interval = connection.interval();
        let conn_latency = connection.latency();
        let conn_timeout = connection.supervision_timeout();
        let local_rpa = connection.local_resolvable_private_address();
        let peer_rpa = connection.peer_resolvable_private_address();
        let peer_addr_type = peer_address_with_type.address_type;

        let link = LeLink::new(
            connection,
            self.dispatcher.clone(),
            self.le_link_disconnect_callback(),
            Local::now(),
        );
        let in_filter_accept_list = link.was_in_filter_accept_list();
        let can_read_discoverable_characteristics = link.can_read_discoverable_characteristics();

        let mut state = self.state.borrow_mut();

        // Once an le connection has successfully been established the
        // device address is removed from the controller accept list.
        if address_with_type.is_rpa() {
            debug!(
                "Connection address is rpa:{address_with_type} identity_addr:{peer_address_with_type}"
            );
            state.shadow_acceptlist.remove(peer_address_with_type);
        } else {
            debug!("Connection address is not rpa addr:{address_with_type}");
            state.shadow_acceptlist.remove(address_with_type);
        }

        // A connection complete may race the removal of the peer from the
        // accept list; a central link the controller reports as outside the
        // accept list has been canceled by the host and is torn down at
        // once, without surfacing it upward.
        if !in_filter_accept_list && connection_role == Role::Central {
            link.initiate_disconnect(DisconnectReason::RemoteUserTerminatedConnection);
            state.registry.add_le_connection(link);
            info!("Disconnected ACL after connection canceled");
            return;
        }

        state.registry.add_le_connection(link);
        drop(state);

        self.dispatcher.post_or_drop("le on_connected", move |interface| {
            interface.connection.le.on_connected.as_ref().map(|cb| {
                cb(
                    address_with_type,
                    handle,
                    connection_role,
                    conn_interval,
                    conn_latency,
                    conn_timeout,
                    local_rpa,
                    peer_rpa,
                    peer_addr_type,
                    can_read_discoverable_characteristics,
                )
            })
        });
        debug!(
            "Connection successful le remote:{address_with_type} handle:0x{handle:04x} initiator:{}",
            if locally_initiated { "local" } else { "remote" }
        );
    }

    fn on_le_connect_fail(&self, address_with_type: AddressWithType, reason: ErrorCode) {
        let handle = INVALID_CONNECTION_HANDLE;
        let enhanced = true;
        self.dispatcher.post_or_drop("le on_failed", move |interface| {
            interface
                .connection
                .le
                .on_failed
                .as_ref()
                .map(|cb| cb(address_with_type, handle, enhanced, reason))
        });

        self.state.borrow_mut().shadow_acceptlist.remove(address_with_type);
        warn!("Connection failed le remote:{address_with_type} reason:{reason}");
    }

    fn on_le_link_disconnected(&self, handle: ConnectionHandle, reason: ErrorCode) {
        let state = &mut *self.state.borrow_mut();
        let Some(link) = state.registry.get_le_connection(handle) else {
            error!("Disconnection for unknown le connection handle:0x{handle:04x}");
            return;
        };
        let remote_address_with_type = link.get_remote_address_with_type();
        state.connection_history.push(ConnectionDescriptor {
            creation_time: link.get_creation_time(),
            teardown_time: Local::now(),
            handle,
            is_locally_initiated: link.is_locally_initiated(),
            disconnect_reason: reason,
            remote_address: RemoteAddress::Le(remote_address_with_type),
        });
        state.registry.remove_le_connection(handle);

        self.dispatcher.post_or_drop("le on_disconnected", move |interface| {
            interface
                .connection
                .le
                .on_disconnected
                .as_ref()
                .map(|cb| cb(ErrorCode::SUCCESS, handle, reason))
        });
        debug!(
            "Disconnected le link remote:{remote_address_with_type} handle:0x{handle:04x} reason:{reason}"
        );
    }

    fn on_incoming_acl_credits(&self, handle: ConnectionHandle, credits: u16) {
        self.dispatcher.post_or_drop("on_packets_completed", move |interface| {
            interface.on_packets_completed.as_ref().map(|cb| cb(handle, credits))
        });
    }

    /// Disconnect every classic link for suspend. The stack view is
    /// cleaned up ahead of the link layer because the controller events
    /// for these handles will be masked; the second pass tells the driver
    /// which handles it must consider gone.
    pub fn disconnect_classic_connections(&self, promise: oneshot::Sender<()>) {
        info!("Disconnect acl classic connections");
        let disconnect_handles = self.state.borrow().registry.classic_handles();
        for handle in &disconnect_handles {
            self.disconnect_classic(
                *handle,
                DisconnectReason::RemoteDeviceTerminatedConnectionPowerOff,
                "Suspend disconnect",
            );
        }

        for handle in disconnect_handles {
            if self.state.borrow().registry.is_classic_acl(handle) {
                self.driver.on_classic_suspend_initiated_disconnect(
                    handle,
                    ErrorCode::CONNECTION_TERMINATED_BY_LOCAL_HOST,
                );
            }
        }
        let _ = promise.send(());
    }

    /// Disconnect every LE link for suspend; see
    /// [`Self::disconnect_classic_connections`] for the two-pass shape
    pub fn disconnect_le_connections(&self, promise: oneshot::Sender<()>) {
        info!("Disconnect acl le connections");
        let disconnect_handles = self.state.borrow().registry.le_handles();
        for handle in &disconnect_handles {
            self.disconnect_le(
                *handle,
                DisconnectReason::RemoteDeviceTerminatedConnectionPowerOff,
                "Suspend disconnect",
            );
        }

        for handle in disconnect_handles {
            if self.state.borrow().registry.is_le_acl(handle) {
                self.driver.on_le_suspend_initiated_disconnect(
                    handle,
                    ErrorCode::CONNECTION_TERMINATED_BY_LOCAL_HOST,
                );
            }
        }
        let _ = promise.send(());
    }

    /// Force-shutdown every classic link and drop them
    pub fn shutdown_classic_connections(&self, promise: oneshot::Sender<()>) {
        info!("Shutdown acl classic connections");
        self.state.borrow_mut().registry.shutdown_classic_connections();
        let _ = promise.send(());
    }

    /// Force-shutdown every LE link and drop them
    pub fn shutdown_le_connections(&self, promise: oneshot::Sender<()>) {
        info!("Shutdown acl le connections");
        self.state.borrow_mut().registry.shutdown_le_connections();
        let _ = promise.send(());
    }

    /// Report (and log) links still present; any such link at final
    /// shutdown is a protocol error upstream
    pub fn check_for_orphaned_acl_connections(&self) -> bool {
        let state = self.state.borrow();
        let mut orphaned_acl_connections = false;

        if state.registry.classic_connection_count() != 0 {
            error!("About to destroy classic active ACL");
            for link in state.registry.classic_connections() {
                error!(
                    "Orphaned classic ACL handle:0x{:04x} bd_addr:{} created:{}",
                    link.handle(),
                    link.get_remote_address(),
                    link.get_creation_time().format(CONNECTION_DESCRIPTOR_TIME_FORMAT)
                );
            }
            orphaned_acl_connections = true;
        }

        if state.registry.le_connection_count() != 0 {
            error!("About to destroy le active ACL");
            for link in state.registry.le_connections() {
                error!(
                    "Orphaned le ACL handle:0x{:04x} bd_addr:{} created:{}",
                    link.handle(),
                    link.get_remote_address_with_type(),
                    link.get_creation_time().format(CONNECTION_DESCRIPTOR_TIME_FORMAT)
                );
            }
            orphaned_acl_connections = true;
        }
        orphaned_acl_connections
    }

    /// Unregister from the driver, then force-shutdown anything left in
    /// either map. Resolves the promise once both unregistrations have
    /// been acknowledged and the maps are empty.
    pub fn final_shutdown(&self, promise: oneshot::Sender<()>) {
        let driver = self.driver.clone();
        let this = self.weak_self.clone();
        spawn_local(async move {
            driver.unregister_classic_callbacks().await;
            debug!("Unregistered classic callbacks from acl driver");
            driver.unregister_le_callbacks().await;
            debug!("Unregistered le callbacks from acl driver");

            this.with(|manager| match manager {
                Some(manager) => manager.complete_final_shutdown(),
                None => warn!("Acl manager dropped before final shutdown completed"),
            });
            let _ = promise.send(());
        });
    }

    fn complete_final_shutdown(&self) {
        if self.check_for_orphaned_acl_connections() {
            self.dump_connection_history();
        }

        let mut state = self.state.borrow_mut();
        if state.registry.classic_connection_count() != 0 {
            state.registry.shutdown_classic_connections();
            info!("Cleared all classic connections");
        }
        if state.registry.le_connection_count() != 0 {
            state.registry.shutdown_le_connections();
            info!("Cleared all le connections");
        }
        drop(state);
        info!("Unregistered and cleared any orphaned ACL connections");
    }

    /// Log the connection history and accept-list shadow
    pub fn dump_connection_history(&self) {
        let state = self.state.borrow();
        for entry in state.connection_history.read_elements_as_string() {
            debug!("{entry}");
        }
        let acceptlist = state.shadow_acceptlist.get_copy();
        debug!(
            "Shadow le accept list  size:{:<3} controller_max_size:{}",
            acceptlist.len(),
            state.shadow_acceptlist.get_max_size()
        );
        for entry in acceptlist {
            debug!("acceptlist:{entry}");
        }
    }

    /// Write the full diagnostic dump: connection history, disconnect
    /// reason histograms (sorted high to low), and both shadow lists
    pub fn dump(&self, writer: &mut dyn Write) -> std::io::Result<()> {
        let state = self.state.borrow();
        for entry in state.connection_history.read_elements_as_string() {
            writeln!(writer, "{entry}")?;
        }
        if !state.classic_acl_disconnect_reason.is_empty() {
            writeln!(writer, "Classic sources of initiated disconnects")?;
            for (comment, count) in state.classic_acl_disconnect_reason.get_sorted_high_to_low() {
                writeln!(writer, "  {comment}:{count}")?;
            }
        }
        if !state.le_acl_disconnect_reason.is_empty() {
            writeln!(writer, "Le sources of initiated disconnects")?;
            for (comment, count) in state.le_acl_disconnect_reason.get_sorted_high_to_low() {
                writeln!(writer, "  {comment}:{count}")?;
            }
        }

        let acceptlist = state.shadow_acceptlist.get_copy();
        writeln!(
            writer,
            "Shadow le accept list              size:{:<3} controller_max_size:{}",
            acceptlist.len(),
            state.shadow_acceptlist.get_max_size()
        )?;
        for (index, entry) in acceptlist.iter().enumerate() {
            writeln!(writer, "  {:03} {entry}", index + 1)?;
        }
        let address_resolution_list = state.shadow_address_resolution_list.get_copy();
        writeln!(
            writer,
            "Shadow le address resolution list  size:{:<3} controller_max_size:{}",
            address_resolution_list.len(),
            state.shadow_address_resolution_list.get_max_size()
        )?;
        for (index, entry) in address_resolution_list.iter().enumerate() {
            writeln!(writer, "  {:03} {entry}", index + 1)?;
        }

        for link in state.registry.classic_connections() {
            writeln!(
                writer,
                "remote_addr:{} handle:0x{:04x} transport:BR_EDR",
                link.get_remote_address(),
                link.handle()
            )?;
            writeln!(writer, "    role:{:?}", link.role())?;
            for (page, features) in link.feature_pages().iter().enumerate() {
                writeln!(writer, "    peer_lmp_features[{page}] data:0x{features:016x}")?;
            }
        }
        for link in state.registry.le_connections() {
            writeln!(
                writer,
                "remote_addr:{} handle:0x{:04x} transport:LE",
                link.get_remote_address_with_type(),
                link.handle()
            )?;
            writeln!(
                writer,
                "    interval:{} latency:{} supervision_timeout:{} role:{:?}",
                link.connection_interval(),
                link.connection_latency(),
                link.supervision_timeout(),
                link.role()
            )?;
        }
        Ok(())
    }

    #[cfg(test)]
    fn acceptlist_copy(
        &self,
    ) -> std::collections::HashSet<crate::core::address::ConnectAddressWithType> {
        self.state.borrow().shadow_acceptlist.get_copy()
    }

    #[cfg(test)]
    fn address_resolution_list_copy(&self) -> std::collections::HashSet<AddressWithType> {
        self.state.borrow().shadow_address_resolution_list.get_copy()
    }

    #[cfg(test)]
    fn connection_history_len(&self) -> usize {
        self.state.borrow().connection_history.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use tokio::sync::mpsc::{
        error::TryRecvError, unbounded_channel, UnboundedReceiver, UnboundedSender,
    };

    use crate::acl::dispatch::UpperTask;
    use crate::acl::mocks::{
        mock_acl_driver::{MockAclDriver, MockAclDriverEvents},
        mock_connections::{MockClassicAclConnection, MockConnectionEvents, MockLeAclConnection},
    };
    use crate::core::address::AddressType;
    use crate::core::hci::EncryptionStatus;
    use crate::utils::task::block_on_locally;

    const CLASSIC_ADDRESS: Address = Address::new([1, 2, 3, 4, 5, 6]);
    const ADDRESS_A: AddressWithType = AddressWithType {
        address: Address::new([0x0a, 2, 3, 4, 5, 6]),
        address_type: AddressType::Public,
    };
    const ADDRESS_B: AddressWithType = AddressWithType {
        address: Address::new([0x0b, 2, 3, 4, 5, 6]),
        address_type: AddressType::Random,
    };
    const ADDRESS_C: AddressWithType = AddressWithType {
        address: Address::new([0x0c, 2, 3, 4, 5, 6]),
        address_type: AddressType::Public,
    };
    // an RPA (upper two bits of the MSB are 0b01) resolving to ADDRESS_A
    const RPA_OF_A: AddressWithType = AddressWithType {
        address: Address::new([0x0a, 2, 3, 4, 5, 0x4f]),
        address_type: AddressType::Random,
    };

    #[derive(Debug, PartialEq)]
    enum UpperEvent {
        DataReceived(Vec<u8>),
        PacketsCompleted(ConnectionHandle, u16),
        ClassicConnected(Address, ConnectionHandle, bool),
        ClassicConnectRequest(Address),
        ClassicFailed(Address, ErrorCode),
        ClassicDisconnected(ErrorCode, ConnectionHandle, ErrorCode),
        LeConnected(AddressWithType, ConnectionHandle, Role, u16, u16, u16),
        LeFailed(AddressWithType, ErrorCode),
        LeDisconnected(ErrorCode, ConnectionHandle, ErrorCode),
        SupportedFeatures(ConnectionHandle, u64),
        ExtendedFeatures(ConnectionHandle, u8, u8, u64),
        EncryptionChange(bool),
        ModeChange(ErrorCode, ConnectionHandle, crate::core::hci::Mode, u16),
        ConnectionUpdate(ErrorCode, ConnectionHandle, u16, u16, u16),
    }

    fn test_interface(tx: UnboundedSender<UpperEvent>) -> AclInterface {
        let mut interface = AclInterface::default();

        let event_tx = tx.clone();
        interface.on_send_data_upwards =
            Some(Box::new(move |packet| event_tx.send(UpperEvent::DataReceived(packet)).unwrap()));
        let event_tx = tx.clone();
        interface.on_packets_completed = Some(Box::new(move |handle, credits| {
            event_tx.send(UpperEvent::PacketsCompleted(handle, credits)).unwrap()
        }));

        let event_tx = tx.clone();
        interface.connection.classic.on_connected =
            Some(Box::new(move |address, handle, _encrypted, locally_initiated| {
                event_tx
                    .send(UpperEvent::ClassicConnected(address, handle, locally_initiated))
                    .unwrap()
            }));
        let event_tx = tx.clone();
        interface.connection.classic.on_connect_request = Some(Box::new(move |address, _cod| {
            event_tx.send(UpperEvent::ClassicConnectRequest(address)).unwrap()
        }));
        let event_tx = tx.clone();
        interface.connection.classic.on_failed =
            Some(Box::new(move |address, reason, _locally_initiated| {
                event_tx.send(UpperEvent::ClassicFailed(address, reason)).unwrap()
            }));
        let event_tx = tx.clone();
        interface.connection.classic.on_disconnected =
            Some(Box::new(move |status, handle, reason| {
                event_tx.send(UpperEvent::ClassicDisconnected(status, handle, reason)).unwrap()
            }));

        let event_tx = tx.clone();
        interface.connection.le.on_connected = Some(Box::new(
            move |peer, handle, role, interval, latency, timeout, _local_rpa, _peer_rpa, _type, _discoverable| {
                event_tx
                    .send(UpperEvent::LeConnected(peer, handle, role, interval, latency, timeout))
                    .unwrap()
            },
        ));
        let event_tx = tx.clone();
        interface.connection.le.on_failed = Some(Box::new(move |peer, _handle, _enhanced, status| {
            event_tx.send(UpperEvent::LeFailed(peer, status)).unwrap()
        }));
        let event_tx = tx.clone();
        interface.connection.le.on_disconnected = Some(Box::new(move |status, handle, reason| {
            event_tx.send(UpperEvent::LeDisconnected(status, handle, reason)).unwrap()
        }));

        let event_tx = tx.clone();
        interface.link.classic.on_read_remote_supported_features_complete =
            Some(Box::new(move |handle, features| {
                event_tx.send(UpperEvent::SupportedFeatures(handle, features)).unwrap()
            }));
        let event_tx = tx.clone();
        interface.link.classic.on_read_remote_extended_features_complete =
            Some(Box::new(move |handle, page, max_page, features| {
                event_tx.send(UpperEvent::ExtendedFeatures(handle, page, max_page, features)).unwrap()
            }));
        let event_tx = tx.clone();
        interface.link.classic.on_encryption_change = Some(Box::new(move |enabled| {
            event_tx.send(UpperEvent::EncryptionChange(enabled)).unwrap()
        }));
        let event_tx = tx.clone();
        interface.link.classic.on_mode_change =
            Some(Box::new(move |status, handle, mode, interval| {
                event_tx.send(UpperEvent::ModeChange(status, handle, mode, interval)).unwrap()
            }));
        let event_tx = tx;
        interface.link.le.on_connection_update =
            Some(Box::new(move |status, handle, interval, latency, timeout| {
                event_tx
                    .send(UpperEvent::ConnectionUpdate(status, handle, interval, latency, timeout))
                    .unwrap()
            }));

        interface
    }

    struct TestStack {
        manager: SharedBox<AclManager>,
        driver: MockAclDriver,
        driver_rx: UnboundedReceiver<MockAclDriverEvents>,
        upper_rx: UnboundedReceiver<UpperTask>,
        event_rx: UnboundedReceiver<UpperEvent>,
    }

    impl TestStack {
        fn new(max_acceptlist_size: u8, max_address_resolution_size: u8) -> Self {
            let (driver, driver_rx) = MockAclDriver::new();
            let (upper_tx, upper_rx) = unbounded_channel();
            let (event_tx, event_rx) = unbounded_channel();
            let manager = AclManager::new(
                driver.clone(),
                test_interface(event_tx),
                UpperThread::new(upper_tx),
                max_acceptlist_size,
                max_address_resolution_size,
            );
            Self { manager, driver, driver_rx, upper_rx, event_rx }
        }

        /// Run everything queued for the upper thread
        fn process_upper_posts(&mut self) {
            while let Ok(task) = self.upper_rx.try_recv() {
                task();
            }
        }

        fn expect_no_upper_event(&mut self) {
            self.process_upper_posts();
            assert_eq!(self.event_rx.try_recv(), Err(TryRecvError::Empty));
        }

        fn connect_classic(
            &self,
            handle: ConnectionHandle,
            address: Address,
        ) -> (
            std::rc::Rc<MockClassicAclConnection>,
            UnboundedReceiver<MockConnectionEvents>,
        ) {
            let (connection, mut connection_rx) =
                MockClassicAclConnection::new(handle, address, true);
            self.driver.on_classic_connect_success(Box::new(connection.clone()));
            // every new classic link reads the remote version and features
            assert_eq!(
                connection_rx.try_recv(),
                Ok(MockConnectionEvents::ReadRemoteVersionInformation)
            );
            assert_eq!(
                connection_rx.try_recv(),
                Ok(MockConnectionEvents::ReadRemoteSupportedFeatures)
            );
            (connection, connection_rx)
        }

        fn connect_le(
            &self,
            handle: ConnectionHandle,
            peer: AddressWithType,
        ) -> (std::rc::Rc<MockLeAclConnection>, UnboundedReceiver<MockConnectionEvents>) {
            let (connection, connection_rx) =
                MockLeAclConnection::new(handle, peer, Role::Central, true);
            self.driver.on_le_connect_success(peer, Box::new(connection.clone()));
            (connection, connection_rx)
        }
    }

    #[test]
    fn test_le_connect_and_clean_disconnect() {
        block_on_locally(async {
            // arrange: an accept-list slot armed for peer A
            let mut stack = TestStack::new(5, 5);
            let (promise, resolved) = oneshot::channel();
            stack.manager.accept_le_connection_from(ADDRESS_A, true, promise);
            assert!(resolved.await.unwrap());
            assert_eq!(
                stack.driver_rx.try_recv(),
                Ok(MockAclDriverEvents::CreateLeConnection(ADDRESS_A, true))
            );
            assert_eq!(stack.manager.acceptlist_copy(), [ADDRESS_A.into()].into());

            // act: the controller reports the connection complete
            let (connection, mut connection_rx) = stack.connect_le(0x0040, ADDRESS_A);
            stack.process_upper_posts();

            // assert: the upper stack saw the connection, and the peer left
            // the shadow accept list
            assert_eq!(
                stack.event_rx.try_recv(),
                Ok(UpperEvent::LeConnected(ADDRESS_A, 0x0040, Role::Central, 24, 0, 400))
            );
            assert!(stack.manager.acceptlist_copy().is_empty());
            assert!(stack.manager.is_le_acl(0x0040));

            // act: upper-initiated disconnect, acknowledged by the
            // controller event
            stack.manager.disconnect_le(
                0x0040,
                DisconnectReason::RemoteUserTerminatedConnection,
                "test",
            );
            assert_eq!(
                stack.driver_rx.try_recv(),
                Ok(MockAclDriverEvents::RemoveFromBackgroundList(ADDRESS_A))
            );
            assert_eq!(
                connection_rx.try_recv(),
                Ok(MockConnectionEvents::Disconnect(
                    DisconnectReason::RemoteUserTerminatedConnection
                ))
            );
            connection.callbacks().on_disconnection(ErrorCode::SUCCESS);
            stack.process_upper_posts();

            // assert: exactly one disconnect callback, after the history
            // entry was pushed
            assert_eq!(
                stack.event_rx.try_recv(),
                Ok(UpperEvent::LeDisconnected(ErrorCode::SUCCESS, 0x0040, ErrorCode::SUCCESS))
            );
            assert_eq!(stack.event_rx.try_recv(), Err(TryRecvError::Empty));
            assert_eq!(stack.manager.connection_history_len(), 1);
            assert!(!stack.manager.is_le_acl(0x0040));
        });
    }

    #[test]
    fn test_le_accept_list_race_disconnects_silently() {
        block_on_locally(async {
            // arrange: accept then immediately ignore peer B
            let mut stack = TestStack::new(5, 5);
            let (promise, resolved) = oneshot::channel();
            stack.manager.accept_le_connection_from(ADDRESS_B, true, promise);
            assert!(resolved.await.unwrap());
            stack.manager.ignore_le_connection_from(ADDRESS_B);
            assert!(stack.manager.acceptlist_copy().is_empty());
            assert_eq!(
                stack.driver_rx.try_recv(),
                Ok(MockAclDriverEvents::CreateLeConnection(ADDRESS_B, true))
            );
            assert_eq!(
                stack.driver_rx.try_recv(),
                Ok(MockAclDriverEvents::CancelLeConnect(ADDRESS_B))
            );

            // act: the cancel lost the race and a connection complete
            // arrives, marked as outside the accept list
            let (connection, mut connection_rx) =
                MockLeAclConnection::new(0x0041, ADDRESS_B, Role::Central, false);
            stack
                .driver
                .on_le_connect_success(ADDRESS_B, Box::new(connection.clone()));

            // assert: no on_connected, and the link was told to disconnect
            stack.expect_no_upper_event();
            assert_eq!(
                connection_rx.try_recv(),
                Ok(MockConnectionEvents::Disconnect(
                    DisconnectReason::RemoteUserTerminatedConnection
                ))
            );

            // act: the disconnection event drives the normal teardown
            connection.callbacks().on_disconnection(ErrorCode::CONNECTION_TERMINATED_BY_LOCAL_HOST);
            stack.process_upper_posts();
            assert_eq!(
                stack.event_rx.try_recv(),
                Ok(UpperEvent::LeDisconnected(
                    ErrorCode::SUCCESS,
                    0x0041,
                    ErrorCode::CONNECTION_TERMINATED_BY_LOCAL_HOST
                ))
            );
            assert_eq!(stack.manager.connection_history_len(), 1);
        });
    }

    #[test]
    fn test_classic_extended_features_walk() {
        // arrange
        let mut stack = TestStack::new(5, 5);
        let (connection, mut connection_rx) = stack.connect_classic(0x0010, CLASSIC_ADDRESS);
        stack.process_upper_posts();
        assert_eq!(
            stack.event_rx.try_recv(),
            Ok(UpperEvent::ClassicConnected(CLASSIC_ADDRESS, 0x0010, true))
        );

        // act: features with bit 63 set start the page walk
        connection.callbacks().on_read_remote_supported_features_complete(1 << 63);
        assert_eq!(
            connection_rx.try_recv(),
            Ok(MockConnectionEvents::ReadRemoteExtendedFeatures(1))
        );
        connection.callbacks().on_read_remote_extended_features_complete(1, 2, 0x0002);
        assert_eq!(
            connection_rx.try_recv(),
            Ok(MockConnectionEvents::ReadRemoteExtendedFeatures(2))
        );
        connection.callbacks().on_read_remote_extended_features_complete(2, 2, 0x0003);

        // assert: the walk stopped at max_page and the upper stack saw all
        // three pages in order
        assert_eq!(connection_rx.try_recv(), Err(TryRecvError::Empty));
        stack.process_upper_posts();
        assert_eq!(
            stack.event_rx.try_recv(),
            Ok(UpperEvent::SupportedFeatures(0x0010, 1 << 63))
        );
        assert_eq!(
            stack.event_rx.try_recv(),
            Ok(UpperEvent::ExtendedFeatures(0x0010, 1, 2, 0x0002))
        );
        assert_eq!(
            stack.event_rx.try_recv(),
            Ok(UpperEvent::ExtendedFeatures(0x0010, 2, 2, 0x0003))
        );
    }

    #[test]
    fn test_classic_connect_request_and_failure_are_posted() {
        let mut stack = TestStack::new(5, 5);

        stack
            .driver
            .on_classic_connect_request(CLASSIC_ADDRESS, ClassOfDevice([0x0c, 0x02, 0x5a]));
        stack.driver.on_classic_connect_fail(CLASSIC_ADDRESS, ErrorCode::PAGE_TIMEOUT, true);
        stack.process_upper_posts();

        assert_eq!(
            stack.event_rx.try_recv(),
            Ok(UpperEvent::ClassicConnectRequest(CLASSIC_ADDRESS))
        );
        assert_eq!(
            stack.event_rx.try_recv(),
            Ok(UpperEvent::ClassicFailed(CLASSIC_ADDRESS, ErrorCode::PAGE_TIMEOUT))
        );
    }

    #[test]
    fn test_classic_disconnect_pushes_history_then_posts() {
        let mut stack = TestStack::new(5, 5);
        let (connection, mut connection_rx) = stack.connect_classic(0x10, CLASSIC_ADDRESS);
        stack.process_upper_posts();
        while stack.event_rx.try_recv().is_ok() {}

        stack.manager.disconnect_classic(
            0x10,
            DisconnectReason::RemoteUserTerminatedConnection,
            "test",
        );
        assert_eq!(
            connection_rx.try_recv(),
            Ok(MockConnectionEvents::Disconnect(DisconnectReason::RemoteUserTerminatedConnection))
        );
        connection.callbacks().on_disconnection(ErrorCode::REMOTE_USER_TERMINATED_CONNECTION);
        stack.process_upper_posts();

        assert_eq!(
            stack.event_rx.try_recv(),
            Ok(UpperEvent::ClassicDisconnected(
                ErrorCode::SUCCESS,
                0x10,
                ErrorCode::REMOTE_USER_TERMINATED_CONNECTION
            ))
        );
        assert_eq!(stack.event_rx.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(stack.manager.connection_history_len(), 1);
        assert!(!stack.manager.is_classic_acl(0x10));
    }

    #[test]
    fn test_classic_features_without_extended_support_stop_at_page_zero() {
        let mut stack = TestStack::new(5, 5);
        let (connection, mut connection_rx) = stack.connect_classic(0x0010, CLASSIC_ADDRESS);

        connection.callbacks().on_read_remote_supported_features_complete(0x1234);

        assert_eq!(connection_rx.try_recv(), Err(TryRecvError::Empty));
        stack.process_upper_posts();
    }

    #[test]
    fn test_accept_le_on_full_acceptlist_resolves_false() {
        block_on_locally(async {
            // arrange: capacity two, both slots taken
            let mut stack = TestStack::new(2, 5);
            for address in [ADDRESS_A, ADDRESS_B] {
                let (promise, resolved) = oneshot::channel();
                stack.manager.accept_le_connection_from(address, true, promise);
                assert!(resolved.await.unwrap());
                assert_eq!(
                    stack.driver_rx.try_recv(),
                    Ok(MockAclDriverEvents::CreateLeConnection(address, true))
                );
            }

            // act
            let (promise, resolved) = oneshot::channel();
            stack.manager.accept_le_connection_from(ADDRESS_C, true, promise);

            // assert: resolved false, shadow unchanged, no controller call
            assert!(!resolved.await.unwrap());
            assert_eq!(
                stack.manager.acceptlist_copy(),
                [ADDRESS_A.into(), ADDRESS_B.into()].into()
            );
            assert_eq!(stack.driver_rx.try_recv(), Err(TryRecvError::Empty));
        });
    }

    #[test]
    fn test_rpa_connection_removes_identity_from_acceptlist() {
        block_on_locally(async {
            // arrange: the accept list holds the identity address of A
            let mut stack = TestStack::new(5, 5);
            let (promise, resolved) = oneshot::channel();
            stack.manager.accept_le_connection_from(ADDRESS_A, true, promise);
            assert!(resolved.await.unwrap());

            // act: the connection completes under an RPA, with the identity
            // reported separately
            let (connection, _connection_rx) =
                MockLeAclConnection::new(0x0042, ADDRESS_A, Role::Central, true);
            stack
                .driver
                .on_le_connect_success(RPA_OF_A, Box::new(connection.clone()));
            stack.process_upper_posts();

            // assert: the identity entry is gone from the shadow
            assert!(stack.manager.acceptlist_copy().is_empty());
            assert_eq!(
                stack.event_rx.try_recv(),
                Ok(UpperEvent::LeConnected(RPA_OF_A, 0x0042, Role::Central, 24, 0, 400))
            );
        });
    }

    #[test]
    fn test_le_connect_fail_cleans_acceptlist_and_reports() {
        block_on_locally(async {
            let mut stack = TestStack::new(5, 5);
            let (promise, resolved) = oneshot::channel();
            stack.manager.accept_le_connection_from(ADDRESS_A, true, promise);
            assert!(resolved.await.unwrap());

            stack.driver.on_le_connect_fail(ADDRESS_A, ErrorCode::CONNECTION_ACCEPT_TIMEOUT);
            stack.process_upper_posts();

            assert_eq!(
                stack.event_rx.try_recv(),
                Ok(UpperEvent::LeFailed(ADDRESS_A, ErrorCode::CONNECTION_ACCEPT_TIMEOUT))
            );
            assert!(stack.manager.acceptlist_copy().is_empty());
        });
    }

    #[test]
    fn test_suspend_disconnects_all_links_and_notifies_driver() {
        block_on_locally(async {
            // arrange: two classic links and one le link
            let mut stack = TestStack::new(5, 5);
            let (_classic_1, mut classic_1_rx) = stack.connect_classic(0x11, CLASSIC_ADDRESS);
            let (_classic_2, mut classic_2_rx) =
                stack.connect_classic(0x12, Address::new([9, 9, 9, 9, 9, 9]));
            let (_le, mut le_rx) = stack.connect_le(0x21, ADDRESS_A);
            stack.process_upper_posts();
            while stack.event_rx.try_recv().is_ok() {}

            // act: suspend, classic pass then le pass
            let (promise, done) = oneshot::channel();
            stack.manager.disconnect_classic_connections(promise);
            done.await.unwrap();
            let (promise, done) = oneshot::channel();
            stack.manager.disconnect_le_connections(promise);
            done.await.unwrap();

            // assert: every link got the power-off disconnect
            let power_off = MockConnectionEvents::Disconnect(
                DisconnectReason::RemoteDeviceTerminatedConnectionPowerOff,
            );
            assert_eq!(classic_1_rx.try_recv(), Ok(power_off.clone()));
            assert_eq!(classic_2_rx.try_recv(), Ok(power_off.clone()));
            assert_eq!(le_rx.try_recv(), Ok(power_off));

            // assert: the driver heard about each handle, after the
            // background-list cleanup for the le link
            let mut driver_events = vec![];
            while let Ok(event) = stack.driver_rx.try_recv() {
                driver_events.push(event);
            }
            assert!(driver_events.contains(
                &MockAclDriverEvents::ClassicSuspendInitiatedDisconnect(
                    0x11,
                    ErrorCode::CONNECTION_TERMINATED_BY_LOCAL_HOST
                )
            ));
            assert!(driver_events.contains(
                &MockAclDriverEvents::ClassicSuspendInitiatedDisconnect(
                    0x12,
                    ErrorCode::CONNECTION_TERMINATED_BY_LOCAL_HOST
                )
            ));
            assert!(driver_events.contains(&MockAclDriverEvents::LeSuspendInitiatedDisconnect(
                0x21,
                ErrorCode::CONNECTION_TERMINATED_BY_LOCAL_HOST
            )));

            // assert: the suspend comments were counted for diagnostics
            let mut dump = vec![];
            stack.manager.dump(&mut dump).unwrap();
            let dump = String::from_utf8(dump).unwrap();
            assert!(dump.contains("Suspend disconnect:2"));
            assert!(dump.contains("Suspend disconnect:1"));
        });
    }

    #[test]
    fn test_shutdown_clears_links_without_callbacks() {
        block_on_locally(async {
            let mut stack = TestStack::new(5, 5);
            let (_classic, _classic_rx) = stack.connect_classic(0x11, CLASSIC_ADDRESS);
            let (_le, _le_rx) = stack.connect_le(0x21, ADDRESS_A);
            stack.process_upper_posts();
            while stack.event_rx.try_recv().is_ok() {}

            let (promise, done) = oneshot::channel();
            stack.manager.shutdown_classic_connections(promise);
            done.await.unwrap();
            let (promise, done) = oneshot::channel();
            stack.manager.shutdown_le_connections(promise);
            done.await.unwrap();

            assert!(!stack.manager.is_classic_acl(0x11));
            assert!(!stack.manager.is_le_acl(0x21));
            // forced shutdown is not a disconnection: nothing is posted
            stack.expect_no_upper_event();
        });
    }

    #[test]
    fn test_final_shutdown_unregisters_then_clears_orphans() {
        block_on_locally(async {
            let mut stack = TestStack::new(5, 5);
            let (_classic, _classic_rx) = stack.connect_classic(0x11, CLASSIC_ADDRESS);
            stack.process_upper_posts();
            while stack.event_rx.try_recv().is_ok() {}
            assert!(stack.manager.check_for_orphaned_acl_connections());

            let (promise, done) = oneshot::channel();
            stack.manager.final_shutdown(promise);
            done.await.unwrap();

            assert_eq!(
                stack.driver_rx.try_recv(),
                Ok(MockAclDriverEvents::UnregisterClassicCallbacks)
            );
            assert_eq!(
                stack.driver_rx.try_recv(),
                Ok(MockAclDriverEvents::UnregisterLeCallbacks)
            );
            assert!(!stack.manager.is_classic_acl(0x11));
            assert!(!stack.manager.check_for_orphaned_acl_connections());
        });
    }

    #[test]
    fn test_write_data_routes_to_owning_link() {
        let mut stack = TestStack::new(5, 5);
        let (connection, _connection_rx) = stack.connect_le(0x0123, ADDRESS_A);

        stack.manager.write_data(0x0123, vec![0xaa, 0xbb]);

        assert_eq!(connection.mock_queue_end().pull_outbound(), Some(vec![0xaa, 0xbb]));
        // unknown handles drop the packet without side effects
        stack.manager.write_data(0x0666, vec![0xcc]);
        assert_eq!(connection.mock_queue_end().pull_outbound(), None);
    }

    #[test]
    fn test_inbound_data_carries_preamble_through_manager() {
        let mut stack = TestStack::new(5, 5);
        let (connection, _connection_rx) = stack.connect_le(0x0123, ADDRESS_A);
        stack.process_upper_posts();
        while stack.event_rx.try_recv().is_ok() {}

        connection.mock_queue_end().inject_inbound(vec![0xaa, 0xbb, 0xcc, 0xdd, 0xee]);
        stack.process_upper_posts();

        assert_eq!(
            stack.event_rx.try_recv(),
            Ok(UpperEvent::DataReceived(vec![
                0x23, 0x01, 0x05, 0x00, 0xaa, 0xbb, 0xcc, 0xdd, 0xee
            ]))
        );
    }

    #[test]
    fn test_wrong_transport_operations_are_dropped() {
        let mut stack = TestStack::new(5, 5);
        let (_classic, mut classic_rx) = stack.connect_classic(0x10, CLASSIC_ADDRESS);
        let (_le, mut le_rx) = stack.connect_le(0x20, ADDRESS_A);

        // classic-only operations against the le handle
        stack.manager.set_connection_encryption(0x20, true);
        stack.manager.hold_mode(0x20, 0x40, 0x20);
        stack.manager.flush(0x20);
        // le-only operations against the classic handle
        stack.manager.update_connection_parameters(0x10, 6, 12, 0, 500, 0, 0);
        stack.manager.le_subrate_request(0x10, 1, 2, 3, 4, 5);

        assert_eq!(classic_rx.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(le_rx.try_recv(), Err(TryRecvError::Empty));

        // the correctly-typed calls go through
        stack.manager.set_connection_encryption(0x10, true);
        assert_eq!(
            classic_rx.try_recv(),
            Ok(MockConnectionEvents::SetConnectionEncryption(true))
        );
        stack.manager.update_connection_parameters(0x20, 6, 12, 0, 500, 0, 0);
        assert_eq!(
            le_rx.try_recv(),
            Ok(MockConnectionEvents::ConnectionUpdate(6, 12, 0, 500, 0, 0))
        );
    }

    #[test]
    fn test_address_resolution_list_commands() {
        let mut stack = TestStack::new(5, 2);
        let irk = [1; 16];

        stack.manager.add_to_address_resolution(ADDRESS_A, irk, irk);
        assert_eq!(
            stack.driver_rx.try_recv(),
            Ok(MockAclDriverEvents::AddDeviceToResolvingList(ADDRESS_A))
        );
        stack.manager.add_to_address_resolution(ADDRESS_B, irk, irk);
        assert_eq!(
            stack.driver_rx.try_recv(),
            Ok(MockAclDriverEvents::AddDeviceToResolvingList(ADDRESS_B))
        );

        // full shadow: dropped before reaching the controller
        stack.manager.add_to_address_resolution(ADDRESS_C, irk, irk);
        assert_eq!(stack.driver_rx.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(
            stack.manager.address_resolution_list_copy(),
            [ADDRESS_A, ADDRESS_B].into()
        );

        // remove is forwarded even when the shadow disagrees
        stack.manager.remove_from_address_resolution(ADDRESS_C);
        assert_eq!(
            stack.driver_rx.try_recv(),
            Ok(MockAclDriverEvents::RemoveDeviceFromResolvingList(ADDRESS_C))
        );

        stack.manager.clear_address_resolution();
        assert_eq!(stack.driver_rx.try_recv(), Ok(MockAclDriverEvents::ClearResolvingList));
        assert!(stack.manager.address_resolution_list_copy().is_empty());
    }

    #[test]
    fn test_clear_filter_accept_list() {
        block_on_locally(async {
            let mut stack = TestStack::new(5, 5);
            let (promise, resolved) = oneshot::channel();
            stack.manager.accept_le_connection_from(ADDRESS_A, false, promise);
            assert!(resolved.await.unwrap());
            stack.driver_rx.try_recv().unwrap();

            stack.manager.clear_filter_accept_list();

            assert_eq!(
                stack.driver_rx.try_recv(),
                Ok(MockAclDriverEvents::ClearFilterAcceptList)
            );
            assert!(stack.manager.acceptlist_copy().is_empty());
        });
    }

    #[test]
    fn test_incoming_credits_are_posted() {
        let mut stack = TestStack::new(5, 5);

        stack.driver.on_incoming_acl_credits(0x40, 3);
        stack.process_upper_posts();

        assert_eq!(stack.event_rx.try_recv(), Ok(UpperEvent::PacketsCompleted(0x40, 3)));
    }

    #[test]
    fn test_classic_link_events_are_forwarded() {
        let mut stack = TestStack::new(5, 5);
        let (connection, _connection_rx) = stack.connect_classic(0x10, CLASSIC_ADDRESS);
        stack.process_upper_posts();
        while stack.event_rx.try_recv().is_ok() {}

        connection.callbacks().on_encryption_change(EncryptionStatus::BrEdrAesCcm);
        connection
            .callbacks()
            .on_mode_change(ErrorCode::SUCCESS, crate::core::hci::Mode::Sniff, 0x320);
        stack.process_upper_posts();

        assert_eq!(stack.event_rx.try_recv(), Ok(UpperEvent::EncryptionChange(true)));
        assert_eq!(
            stack.event_rx.try_recv(),
            Ok(UpperEvent::ModeChange(
                ErrorCode::SUCCESS,
                0x10,
                crate::core::hci::Mode::Sniff,
                0x320
            ))
        );
    }

    #[test]
    fn test_le_connection_update_refreshes_link_parameters() {
        let mut stack = TestStack::new(5, 5);
        let (connection, _connection_rx) = stack.connect_le(0x20, ADDRESS_A);
        stack.process_upper_posts();
        while stack.event_rx.try_recv().is_ok() {}

        connection.callbacks().on_connection_update(ErrorCode::SUCCESS, 36, 2, 600);
        stack.process_upper_posts();

        assert_eq!(
            stack.event_rx.try_recv(),
            Ok(UpperEvent::ConnectionUpdate(ErrorCode::SUCCESS, 0x20, 36, 2, 600))
        );
    }

    #[test]
    fn test_le_address_getters() {
        let mut stack = TestStack::new(5, 5);
        let (connection, _connection_rx) = stack.connect_le(0x20, ADDRESS_A);
        connection.local_address.set(ADDRESS_C);

        assert_eq!(stack.manager.get_connection_peer_address(0x20, false), Some(ADDRESS_A));
        assert_eq!(stack.manager.get_connection_local_address(0x20, false), Some(ADDRESS_C));
        assert_eq!(stack.manager.get_connection_peer_address(0x99, false), None);
        stack.process_upper_posts();
    }

    #[test]
    fn test_advertising_set_lookup_is_peripheral_only() {
        let mut stack = TestStack::new(5, 5);
        let (connection, _connection_rx) =
            MockLeAclConnection::new(0x20, ADDRESS_A, Role::Peripheral, true);
        connection.role_specific_data.set(lower::RoleSpecificData::Peripheral {
            advertising_set_id: Some(2),
            connected_to_discoverable: true,
        });
        stack
            .driver
            .on_le_connect_success(ADDRESS_A, Box::new(connection.clone()));
        stack.process_upper_posts();

        assert_eq!(
            stack.manager.get_advertising_set_connected_to(ADDRESS_A.address),
            Some(2)
        );
        assert_eq!(
            stack.manager.get_advertising_set_connected_to(ADDRESS_C.address),
            None
        );
    }

    #[test]
    fn test_second_disconnect_request_after_teardown_is_dropped() {
        let mut stack = TestStack::new(5, 5);
        let (connection, mut connection_rx) = stack.connect_le(0x20, ADDRESS_A);

        stack.manager.disconnect_le(
            0x20,
            DisconnectReason::RemoteUserTerminatedConnection,
            "first",
        );
        connection.callbacks().on_disconnection(ErrorCode::SUCCESS);
        // the link is gone; a second disconnect is logged and dropped
        stack.manager.disconnect_le(
            0x20,
            DisconnectReason::RemoteUserTerminatedConnection,
            "second",
        );

        assert_eq!(
            connection_rx.try_recv(),
            Ok(MockConnectionEvents::Disconnect(DisconnectReason::RemoteUserTerminatedConnection))
        );
        assert_eq!(connection_rx.try_recv(), Err(TryRecvError::Empty));
        stack.process_upper_posts();
    }
}
