//! Mock of the driver-owned per-link data queue. Tracks both registration
//! latches, enforces the no-double-registration invariant, and lets tests
//! inject inbound packets and pull outbound ones.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use crate::acl::lower::AclQueueEnd;

#[derive(Default)]
pub struct MockAclQueueEnd {
    enqueue_producer: RefCell<Option<Box<dyn FnMut() -> Vec<u8>>>>,
    is_enqueue_registered: Cell<bool>,
    dequeue_callback: RefCell<Option<Box<dyn Fn()>>>,
    is_dequeue_registered: Cell<bool>,
    inbound: RefCell<VecDeque<Vec<u8>>>,
}

impl MockAclQueueEnd {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn is_enqueue_registered(&self) -> bool {
        self.is_enqueue_registered.get()
    }

    pub fn is_dequeue_registered(&self) -> bool {
        self.is_dequeue_registered.get()
    }

    /// Act as the driver asking for one outbound packet. Returns None when
    /// no producer is registered.
    pub fn pull_outbound(&self) -> Option<Vec<u8>> {
        if !self.is_enqueue_registered.get() {
            return None;
        }
        // take the producer out so it may unregister itself mid-call
        let mut producer = self.enqueue_producer.borrow_mut().take()?;
        let packet = producer();
        if self.is_enqueue_registered.get() && self.enqueue_producer.borrow().is_none() {
            *self.enqueue_producer.borrow_mut() = Some(producer);
        }
        Some(packet)
    }

    /// Act as the driver delivering one inbound packet
    pub fn inject_inbound(&self, packet: Vec<u8>) {
        self.inbound.borrow_mut().push_back(packet);
        if !self.is_dequeue_registered.get() {
            return;
        }
        let Some(callback) = self.dequeue_callback.borrow_mut().take() else {
            return;
        };
        callback();
        if self.is_dequeue_registered.get() && self.dequeue_callback.borrow().is_none() {
            *self.dequeue_callback.borrow_mut() = Some(callback);
        }
    }
}

impl AclQueueEnd for MockAclQueueEnd {
    fn register_enqueue(&self, producer: Box<dyn FnMut() -> Vec<u8>>) {
        assert!(!self.is_enqueue_registered.get(), "Enqueue registered twice");
        self.is_enqueue_registered.set(true);
        *self.enqueue_producer.borrow_mut() = Some(producer);
    }

    fn unregister_enqueue(&self) {
        assert!(self.is_enqueue_registered.get(), "Enqueue not registered");
        self.is_enqueue_registered.set(false);
        if let Ok(mut producer) = self.enqueue_producer.try_borrow_mut() {
            *producer = None;
        }
    }

    fn register_dequeue(&self, on_data_ready: Box<dyn Fn()>) {
        assert!(!self.is_dequeue_registered.get(), "Dequeue registered twice");
        self.is_dequeue_registered.set(true);
        *self.dequeue_callback.borrow_mut() = Some(on_data_ready);
    }

    fn unregister_dequeue(&self) {
        assert!(self.is_dequeue_registered.get(), "Dequeue not registered");
        self.is_dequeue_registered.set(false);
        if let Ok(mut callback) = self.dequeue_callback.try_borrow_mut() {
            *callback = None;
        }
    }

    fn try_dequeue(&self) -> Option<Vec<u8>> {
        self.inbound.borrow_mut().pop_front()
    }
}
