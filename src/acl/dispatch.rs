//! Delivery of user-visible callbacks onto the upper stack's serial
//! executor. Event handlers capture plain values on the lower handler and
//! post closures here; the upper thread never sees link state.

use std::sync::Arc;

use log::warn;
use tokio::sync::mpsc::UnboundedSender;

use super::interface::AclInterface;

/// A task posted to the upper stack's serial executor
pub type UpperTask = Box<dyn FnOnce() + Send + 'static>;

/// Handle to the upper stack's serial executor, supplied at initialization.
/// Tasks posted from a single producer are executed in posting order.
#[derive(Clone)]
pub struct UpperThread {
    tx: UnboundedSender<UpperTask>,
}

impl UpperThread {
    /// Constructor wrapping the executor's task queue
    pub fn new(tx: UnboundedSender<UpperTask>) -> Self {
        Self { tx }
    }

    /// Post a task onto the upper thread. Posting after the executor has
    /// shut down drops the task with a warning.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        if self.tx.send(Box::new(task)).is_err() {
            warn!("Dropping ACL event for stopped upper thread");
        }
    }
}

/// Posts callback invocations onto the upper thread against a shared
/// callback table
#[derive(Clone)]
pub struct UpperDispatcher {
    upper: UpperThread,
    interface: Arc<AclInterface>,
}

impl UpperDispatcher {
    /// Constructor
    pub fn new(upper: UpperThread, interface: Arc<AclInterface>) -> Self {
        Self { upper, interface }
    }

    /// The shared upper-facing callback table
    pub fn interface(&self) -> &Arc<AclInterface> {
        &self.interface
    }

    /// Post a closure that invokes one callback out of the table with
    /// captured plain values. `post` returns `None` when the target
    /// callback is not registered; such events are dropped with a warning
    /// instead of aborting.
    pub fn post_or_drop(
        &self,
        event: &'static str,
        post: impl FnOnce(&AclInterface) -> Option<()> + Send + 'static,
    ) {
        let interface = self.interface.clone();
        self.upper.post(move || {
            if post(&interface).is_none() {
                warn!("Dropping ACL event with no callback event:{event}");
            }
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn drain(rx: &mut UnboundedReceiver<UpperTask>) {
        while let Ok(task) = rx.try_recv() {
            task();
        }
    }

    #[test]
    fn test_posts_run_in_order() {
        let (task_tx, mut task_rx) = unbounded_channel();
        let dispatcher =
            UpperDispatcher::new(UpperThread::new(task_tx), Arc::new(AclInterface::default()));
        let (observed_tx, mut observed_rx) = unbounded_channel();

        for i in 0..3 {
            let observed_tx = observed_tx.clone();
            dispatcher.post_or_drop("test", move |_| {
                observed_tx.send(i).unwrap();
                Some(())
            });
        }
        drain(&mut task_rx);

        assert_eq!(observed_rx.try_recv(), Ok(0));
        assert_eq!(observed_rx.try_recv(), Ok(1));
        assert_eq!(observed_rx.try_recv(), Ok(2));
        assert!(observed_rx.try_recv().is_err());
    }

    #[test]
    fn test_absent_callback_does_not_panic() {
        let (task_tx, mut task_rx) = unbounded_channel();
        let dispatcher =
            UpperDispatcher::new(UpperThread::new(task_tx), Arc::new(AclInterface::default()));

        dispatcher.post_or_drop("classic on_connected", |interface| {
            interface.connection.classic.on_connected.as_ref().map(|_| unreachable!())
        });
        drain(&mut task_rx);
    }
}
