// Copyright 2022, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The core event loop for the ACL link manager. All manager state lives on
//! a single lower-handler thread; foreign threads post work in through
//! [`do_in_lower_handler`], and user-visible callbacks leave through the
//! upper-thread executor supplied at startup.

use log::{info, warn};
use tokio::runtime::Builder;
use tokio::sync::{mpsc, oneshot};
use tokio::task::LocalSet;

use std::sync::Mutex;

use crate::acl::dispatch::UpperThread;
use crate::acl::interface::AclInterface;
use crate::acl::lower::InactiveAclDriver;
use crate::acl::AclManager;
use crate::core::shared_box::SharedBox;

pub mod acl;
pub mod core;
pub mod utils;

/// The owner of the lower handler thread on which the ACL manager runs
struct GlobalAclRegistry {
    pub task_tx: LowerHandlerTx,
}

/// The ModuleViews lets us access the ACL manager from foreign threads
/// while the stack is running.
pub struct ModuleViews<'a> {
    /// Proxies calls into the link manager
    pub acl_manager: &'a SharedBox<AclManager>,
}

static GLOBAL_ACL_REGISTRY: Mutex<Option<GlobalAclRegistry>> = Mutex::new(None);

impl GlobalAclRegistry {
    /// Handles bringup of the ACL manager. Blocks running the lower
    /// handler until [`GlobalAclRegistry::stop`] is invoked, so must run on
    /// its own thread. This occurs after the driver is ready, but before
    /// the upper stack issues its first request.
    pub fn start(
        driver: impl InactiveAclDriver,
        interface: AclInterface,
        upper: UpperThread,
        max_acceptlist_size: u8,
        max_address_resolution_size: u8,
        on_started: impl FnOnce(),
    ) {
        info!("starting ACL manager");
        let rt = Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to start tokio runtime");
        let local = LocalSet::new();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let prev_registry = GLOBAL_ACL_REGISTRY.lock().unwrap().replace(Self { task_tx: tx });

        // initialization should only happen once
        assert!(prev_registry.is_none());

        // Now enter the runtime
        local.block_on(&rt, async move {
            let acl_manager = AclManager::new(
                driver,
                interface,
                upper,
                max_acceptlist_size,
                max_address_resolution_size,
            );

            // notify the caller that we are ready to receive messages
            on_started();

            // This is the core event loop that serializes incoming requests
            // into the lower handler; do_in_lower_handler lets us post into
            // here from foreign threads
            info!("starting Tokio event loop");
            while let Some(message) = rx.recv().await {
                match message {
                    LowerHandlerTxMessage::Callback(f) => {
                        f(&mut ModuleViews { acl_manager: &acl_manager })
                    }
                    LowerHandlerTxMessage::Stop(stopped) => {
                        let (tx, teardown_complete) = oneshot::channel();
                        acl_manager.final_shutdown(tx);
                        let _ = teardown_complete.await;
                        let _ = stopped.send(());
                        break;
                    }
                }
            }
        });
        warn!("Lower handler queue has stopped, shutting down executor thread");
        GLOBAL_ACL_REGISTRY.lock().unwrap().take();
    }

    /// Runs the final-shutdown sequence on the lower handler and stops the
    /// event loop, blocking the caller until teardown is observed-complete
    pub fn stop() {
        let (tx, stopped) = oneshot::channel();
        let sent = match GLOBAL_ACL_REGISTRY.lock().unwrap().as_ref() {
            Some(registry) => registry.task_tx.send(LowerHandlerTxMessage::Stop(tx)).is_ok(),
            None => false,
        };
        if !sent {
            warn!("ACL manager is not running");
            return;
        }
        let _ = stopped.blocking_recv();
    }
}

type BoxedLowerHandlerCallback = Box<dyn for<'a> FnOnce(&'a mut ModuleViews) + Send + 'static>;
enum LowerHandlerTxMessage {
    Callback(BoxedLowerHandlerCallback),
    Stop(oneshot::Sender<()>),
}
type LowerHandlerTx = mpsc::UnboundedSender<LowerHandlerTxMessage>;

thread_local! {
    /// The TX end of a channel into the lower handler, so external callers
    /// can access the ACL manager. Objects passed to the driver as
    /// callbacks should clone this channel to fail loudly if it's not yet
    /// initialized.
    ///
    /// This will be lazily initialized on first use from each client thread
    static LOWER_HANDLER_TX: LowerHandlerTx = GLOBAL_ACL_REGISTRY
        .lock()
        .unwrap()
        .as_ref()
        .expect("stack not initialized")
        .task_tx
        .clone();
}

/// Posts a callback to the lower handler and gives it access to the ACL
/// manager, used from foreign threads.
///
/// Do not call this from the lower handler itself! Work running there
/// already holds a reference to the manager through [`ModuleViews`].
pub fn do_in_lower_handler<F>(f: F)
where
    F: for<'a> FnOnce(&'a mut ModuleViews) + Send + 'static,
{
    let ret = LOWER_HANDLER_TX.with(|tx| tx.send(LowerHandlerTxMessage::Callback(Box::new(f))));
    if ret.is_err() {
        panic!("lower handler call failed");
    }
}

/// Disconnect every link ahead of a system suspend. Blocks until the stack
/// view is clean; the driver is told about each handle since the link-layer
/// events will be masked.
pub fn disconnect_all_for_suspend() {
    let (tx, classic_disconnected) = oneshot::channel();
    do_in_lower_handler(move |views| views.acl_manager.disconnect_classic_connections(tx));
    let _ = classic_disconnected.blocking_recv();

    let (tx, le_disconnected) = oneshot::channel();
    do_in_lower_handler(move |views| views.acl_manager.disconnect_le_connections(tx));
    let _ = le_disconnected.blocking_recv();
    warn!("Disconnected open ACL connections");
}

/// Force-shutdown every link, dropping them without upper callbacks.
/// Blocks until both maps are empty.
pub fn shutdown_all_connections() {
    let (tx, classic_shutdown) = oneshot::channel();
    do_in_lower_handler(move |views| views.acl_manager.shutdown_classic_connections(tx));
    let _ = classic_shutdown.blocking_recv();

    let (tx, le_shutdown) = oneshot::channel();
    do_in_lower_handler(move |views| views.acl_manager.shutdown_le_connections(tx));
    let _ = le_shutdown.blocking_recv();
    warn!("Flushed open ACL connections");
}
