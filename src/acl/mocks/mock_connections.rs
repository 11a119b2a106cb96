//! Mocked per-link connection objects handed over by the driver on
//! connect-success. Commands issued against a connection are reported
//! through an event channel; link events can be fired back through the
//! registered management callbacks.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::acl::lower::{
    AclConnection, AclQueueEnd, ClassicAclConnection, ConnectionManagementCallbacks,
    LeAclConnection, LeConnectionManagementCallbacks, RoleSpecificData,
};
use crate::core::{
    address::{Address, AddressWithType},
    hci::{ConnectionHandle, DisconnectReason, Role},
};

use super::mock_queue_end::MockAclQueueEnd;

/// Commands observed on a mocked connection object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockConnectionEvents {
    Disconnect(DisconnectReason),
    ReadRemoteVersionInformation,
    ReadRemoteSupportedFeatures,
    ReadRemoteExtendedFeatures(u8),
    HoldMode(u16, u16),
    SniffMode(u16, u16, u16, u16),
    ExitSniffMode,
    SniffSubrating(u16, u16, u16),
    SetConnectionEncryption(bool),
    Flush,
    ConnectionUpdate(u16, u16, u16, u16, u16, u16),
    SubrateRequest(u16, u16, u16, u16, u16),
}

pub struct MockClassicAclConnection {
    handle: ConnectionHandle,
    address: Address,
    locally_initiated: bool,
    queue_end: Rc<MockAclQueueEnd>,
    callbacks: RefCell<Option<Rc<dyn ConnectionManagementCallbacks>>>,
    tx: UnboundedSender<MockConnectionEvents>,
}

impl MockClassicAclConnection {
    pub fn new(
        handle: ConnectionHandle,
        address: Address,
        locally_initiated: bool,
    ) -> (Rc<Self>, UnboundedReceiver<MockConnectionEvents>) {
        let (tx, rx) = unbounded_channel();
        (
            Rc::new(Self {
                handle,
                address,
                locally_initiated,
                queue_end: MockAclQueueEnd::new(),
                callbacks: RefCell::new(None),
                tx,
            }),
            rx,
        )
    }

    /// The mocked data queue, for injecting and pulling packets
    pub fn mock_queue_end(&self) -> Rc<MockAclQueueEnd> {
        self.queue_end.clone()
    }

    /// The link-event callbacks registered by the link manager
    pub fn callbacks(&self) -> Rc<dyn ConnectionManagementCallbacks> {
        self.callbacks.borrow().as_ref().expect("callbacks not registered").clone()
    }
}

impl AclConnection for Rc<MockClassicAclConnection> {
    fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    fn locally_initiated(&self) -> bool {
        self.locally_initiated
    }

    fn queue_end(&self) -> Rc<dyn AclQueueEnd> {
        self.queue_end.clone()
    }

    fn disconnect(&self, reason: DisconnectReason) {
        self.tx.send(MockConnectionEvents::Disconnect(reason)).unwrap();
    }
}

impl ClassicAclConnection for Rc<MockClassicAclConnection> {
    fn address(&self) -> Address {
        self.address
    }

    fn register_callbacks(&self, callbacks: Rc<dyn ConnectionManagementCallbacks>) {
        let prev = self.callbacks.borrow_mut().replace(callbacks);
        assert!(prev.is_none(), "Callbacks registered twice");
    }

    fn read_remote_version_information(&self) {
        self.tx.send(MockConnectionEvents::ReadRemoteVersionInformation).unwrap();
    }

    fn read_remote_supported_features(&self) {
        self.tx.send(MockConnectionEvents::ReadRemoteSupportedFeatures).unwrap();
    }

    fn read_remote_extended_features(&self, page_number: u8) {
        self.tx.send(MockConnectionEvents::ReadRemoteExtendedFeatures(page_number)).unwrap();
    }

    fn hold_mode(&self, max_interval: u16, min_interval: u16) {
        self.tx.send(MockConnectionEvents::HoldMode(max_interval, min_interval)).unwrap();
    }

    fn sniff_mode(&self, max_interval: u16, min_interval: u16, attempt: u16, timeout: u16) {
        self.tx
            .send(MockConnectionEvents::SniffMode(max_interval, min_interval, attempt, timeout))
            .unwrap();
    }

    fn exit_sniff_mode(&self) {
        self.tx.send(MockConnectionEvents::ExitSniffMode).unwrap();
    }

    fn sniff_subrating(
        &self,
        maximum_latency: u16,
        minimum_remote_timeout: u16,
        minimum_local_timeout: u16,
    ) {
        self.tx
            .send(MockConnectionEvents::SniffSubrating(
                maximum_latency,
                minimum_remote_timeout,
                minimum_local_timeout,
            ))
            .unwrap();
    }

    fn set_connection_encryption(&self, enabled: bool) {
        self.tx.send(MockConnectionEvents::SetConnectionEncryption(enabled)).unwrap();
    }

    fn flush(&self) {
        self.tx.send(MockConnectionEvents::Flush).unwrap();
    }
}

pub struct MockLeAclConnection {
    handle: ConnectionHandle,
    role: Role,
    peer_address: AddressWithType,
    in_filter_accept_list: bool,
    pub locally_initiated: Cell<bool>,
    pub peer_ota_address: Cell<AddressWithType>,
    pub local_address: Cell<AddressWithType>,
    pub local_ota_address: Cell<AddressWithType>,
    pub local_rpa: Cell<Address>,
    pub peer_rpa: Cell<Address>,
    pub interval: Cell<u16>,
    pub latency: Cell<u16>,
    pub supervision_timeout: Cell<u16>,
    pub role_specific_data: Cell<RoleSpecificData>,
    queue_end: Rc<MockAclQueueEnd>,
    callbacks: RefCell<Option<Rc<dyn LeConnectionManagementCallbacks>>>,
    tx: UnboundedSender<MockConnectionEvents>,
}

impl MockLeAclConnection {
    pub fn new(
        handle: ConnectionHandle,
        peer_address: AddressWithType,
        role: Role,
        in_filter_accept_list: bool,
    ) -> (Rc<Self>, UnboundedReceiver<MockConnectionEvents>) {
        let (tx, rx) = unbounded_channel();
        let role_specific_data = match role {
            Role::Central => RoleSpecificData::Central,
            Role::Peripheral => RoleSpecificData::Peripheral {
                advertising_set_id: None,
                connected_to_discoverable: true,
            },
        };
        (
            Rc::new(Self {
                handle,
                role,
                peer_address,
                in_filter_accept_list,
                locally_initiated: Cell::new(role == Role::Central),
                peer_ota_address: Cell::new(peer_address),
                local_address: Cell::new(AddressWithType::EMPTY),
                local_ota_address: Cell::new(AddressWithType::EMPTY),
                local_rpa: Cell::new(Address::EMPTY),
                peer_rpa: Cell::new(Address::EMPTY),
                interval: Cell::new(24),
                latency: Cell::new(0),
                supervision_timeout: Cell::new(400),
                role_specific_data: Cell::new(role_specific_data),
                queue_end: MockAclQueueEnd::new(),
                callbacks: RefCell::new(None),
                tx,
            }),
            rx,
        )
    }

    /// The mocked data queue, for injecting and pulling packets
    pub fn mock_queue_end(&self) -> Rc<MockAclQueueEnd> {
        self.queue_end.clone()
    }

    /// The link-event callbacks registered by the link manager
    pub fn callbacks(&self) -> Rc<dyn LeConnectionManagementCallbacks> {
        self.callbacks.borrow().as_ref().expect("callbacks not registered").clone()
    }
}

impl AclConnection for Rc<MockLeAclConnection> {
    fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    fn locally_initiated(&self) -> bool {
        self.locally_initiated.get()
    }

    fn queue_end(&self) -> Rc<dyn AclQueueEnd> {
        self.queue_end.clone()
    }

    fn disconnect(&self, reason: DisconnectReason) {
        self.tx.send(MockConnectionEvents::Disconnect(reason)).unwrap();
    }
}

impl LeAclConnection for Rc<MockLeAclConnection> {
    fn role(&self) -> Role {
        self.role
    }

    fn peer_address(&self) -> AddressWithType {
        self.peer_address
    }

    fn peer_ota_address(&self) -> AddressWithType {
        self.peer_ota_address.get()
    }

    fn local_address(&self) -> AddressWithType {
        self.local_address.get()
    }

    fn local_ota_address(&self) -> AddressWithType {
        self.local_ota_address.get()
    }

    fn local_resolvable_private_address(&self) -> Address {
        self.local_rpa.get()
    }

    fn peer_resolvable_private_address(&self) -> Address {
        self.peer_rpa.get()
    }

    fn interval(&self) -> u16 {
        self.interval.get()
    }

    fn latency(&self) -> u16 {
        self.latency.get()
    }

    fn supervision_timeout(&self) -> u16 {
        self.supervision_timeout.get()
    }

    fn in_filter_accept_list(&self) -> bool {
        self.in_filter_accept_list
    }

    fn role_specific_data(&self) -> RoleSpecificData {
        self.role_specific_data.get()
    }

    fn register_callbacks(&self, callbacks: Rc<dyn LeConnectionManagementCallbacks>) {
        let prev = self.callbacks.borrow_mut().replace(callbacks);
        assert!(prev.is_none(), "Callbacks registered twice");
    }

    fn connection_update(
        &self,
        conn_interval_min: u16,
        conn_interval_max: u16,
        conn_latency: u16,
        supervision_timeout: u16,
        min_ce_length: u16,
        max_ce_length: u16,
    ) {
        self.tx
            .send(MockConnectionEvents::ConnectionUpdate(
                conn_interval_min,
                conn_interval_max,
                conn_latency,
                supervision_timeout,
                min_ce_length,
                max_ce_length,
            ))
            .unwrap();
    }

    fn subrate_request(
        &self,
        subrate_min: u16,
        subrate_max: u16,
        max_latency: u16,
        continuation_number: u16,
        supervision_timeout: u16,
    ) {
        self.tx
            .send(MockConnectionEvents::SubrateRequest(
                subrate_min,
                subrate_max,
                max_latency,
                continuation_number,
                supervision_timeout,
            ))
            .unwrap();
    }
}
