//! Mock of the lower ACL driver. Commands issued by the link manager are
//! reported through an event channel; controller events can be fired back
//! through the registered callbacks.

use std::cell::RefCell;
use std::rc::Rc;

use async_trait::async_trait;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::acl::lower::{
    AclDriver, AclDriverCallbacks, ClassicAclConnection, InactiveAclDriver, LeAclConnection,
};
use crate::core::{
    address::{Address, AddressWithType},
    hci::{ClassOfDevice, ConnectionHandle, ErrorCode},
};

/// Commands observed on the mocked driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockAclDriverEvents {
    CreateConnection(Address),
    CancelConnect(Address),
    CreateLeConnection(AddressWithType, bool),
    CancelLeConnect(AddressWithType),
    RemoveFromBackgroundList(AddressWithType),
    AddDeviceToResolvingList(AddressWithType),
    RemoveDeviceFromResolvingList(AddressWithType),
    ClearResolvingList,
    ClearFilterAcceptList,
    LeSetDefaultSubrate(u16, u16, u16, u16, u16),
    SetSystemSuspendState(bool),
    ClassicSuspendInitiatedDisconnect(ConnectionHandle, ErrorCode),
    LeSuspendInitiatedDisconnect(ConnectionHandle, ErrorCode),
    UnregisterClassicCallbacks,
    UnregisterLeCallbacks,
}

#[derive(Clone)]
pub struct MockAclDriver {
    tx: UnboundedSender<MockAclDriverEvents>,
    callbacks: Rc<RefCell<Option<Box<dyn AclDriverCallbacks>>>>,
}

impl MockAclDriver {
    pub fn new() -> (Self, UnboundedReceiver<MockAclDriverEvents>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx, callbacks: Rc::new(RefCell::new(None)) }, rx)
    }

    fn callbacks(&self) -> std::cell::Ref<'_, Option<Box<dyn AclDriverCallbacks>>> {
        self.callbacks.borrow()
    }

    pub fn on_classic_connect_success(&self, connection: Box<dyn ClassicAclConnection>) {
        self.callbacks().as_ref().unwrap().on_classic_connect_success(connection);
    }

    pub fn on_classic_connect_request(&self, address: Address, class_of_device: ClassOfDevice) {
        self.callbacks().as_ref().unwrap().on_classic_connect_request(address, class_of_device);
    }

    pub fn on_classic_connect_fail(
        &self,
        address: Address,
        reason: ErrorCode,
        locally_initiated: bool,
    ) {
        self.callbacks().as_ref().unwrap().on_classic_connect_fail(
            address,
            reason,
            locally_initiated,
        );
    }

    pub fn on_le_connect_success(
        &self,
        address_with_type: AddressWithType,
        connection: Box<dyn LeAclConnection>,
    ) {
        self.callbacks().as_ref().unwrap().on_le_connect_success(address_with_type, connection);
    }

    pub fn on_le_connect_fail(&self, address_with_type: AddressWithType, reason: ErrorCode) {
        self.callbacks().as_ref().unwrap().on_le_connect_fail(address_with_type, reason);
    }

    pub fn on_incoming_acl_credits(&self, handle: ConnectionHandle, credits: u16) {
        self.callbacks().as_ref().unwrap().on_incoming_acl_credits(handle, credits);
    }
}

impl InactiveAclDriver for MockAclDriver {
    type Active = ActiveMockAclDriver;

    fn register_callbacks(self, callbacks: impl AclDriverCallbacks + 'static) -> Self::Active {
        *self.callbacks.borrow_mut() = Some(Box::new(callbacks));
        ActiveMockAclDriver { tx: self.tx }
    }
}

#[derive(Debug)]
pub struct ActiveMockAclDriver {
    tx: UnboundedSender<MockAclDriverEvents>,
}

#[async_trait(?Send)]
impl AclDriver for ActiveMockAclDriver {
    fn create_connection(&self, address: Address) {
        self.tx.send(MockAclDriverEvents::CreateConnection(address)).unwrap();
    }

    fn cancel_connect(&self, address: Address) {
        self.tx.send(MockAclDriverEvents::CancelConnect(address)).unwrap();
    }

    fn create_le_connection(&self, address: AddressWithType, is_direct: bool) {
        self.tx.send(MockAclDriverEvents::CreateLeConnection(address, is_direct)).unwrap();
    }

    fn cancel_le_connect(&self, address: AddressWithType) {
        self.tx.send(MockAclDriverEvents::CancelLeConnect(address)).unwrap();
    }

    fn remove_from_background_list(&self, address: AddressWithType) {
        self.tx.send(MockAclDriverEvents::RemoveFromBackgroundList(address)).unwrap();
    }

    fn add_device_to_resolving_list(
        &self,
        address: AddressWithType,
        _peer_irk: [u8; 16],
        _local_irk: [u8; 16],
    ) {
        self.tx.send(MockAclDriverEvents::AddDeviceToResolvingList(address)).unwrap();
    }

    fn remove_device_from_resolving_list(&self, address: AddressWithType) {
        self.tx.send(MockAclDriverEvents::RemoveDeviceFromResolvingList(address)).unwrap();
    }

    fn clear_resolving_list(&self) {
        self.tx.send(MockAclDriverEvents::ClearResolvingList).unwrap();
    }

    fn clear_filter_accept_list(&self) {
        self.tx.send(MockAclDriverEvents::ClearFilterAcceptList).unwrap();
    }

    fn le_set_default_subrate(
        &self,
        subrate_min: u16,
        subrate_max: u16,
        max_latency: u16,
        continuation_number: u16,
        supervision_timeout: u16,
    ) {
        self.tx
            .send(MockAclDriverEvents::LeSetDefaultSubrate(
                subrate_min,
                subrate_max,
                max_latency,
                continuation_number,
                supervision_timeout,
            ))
            .unwrap();
    }

    fn set_system_suspend_state(&self, suspended: bool) {
        self.tx.send(MockAclDriverEvents::SetSystemSuspendState(suspended)).unwrap();
    }

    fn on_classic_suspend_initiated_disconnect(
        &self,
        handle: ConnectionHandle,
        reason: ErrorCode,
    ) {
        self.tx
            .send(MockAclDriverEvents::ClassicSuspendInitiatedDisconnect(handle, reason))
            .unwrap();
    }

    fn on_le_suspend_initiated_disconnect(&self, handle: ConnectionHandle, reason: ErrorCode) {
        self.tx.send(MockAclDriverEvents::LeSuspendInitiatedDisconnect(handle, reason)).unwrap();
    }

    async fn unregister_classic_callbacks(&self) {
        self.tx.send(MockAclDriverEvents::UnregisterClassicCallbacks).unwrap();
    }

    async fn unregister_le_callbacks(&self) {
        self.tx.send(MockAclDriverEvents::UnregisterLeCallbacks).unwrap();
    }
}
