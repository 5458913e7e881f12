//! # Connection Management Module
//!
//! Hosts the stimulator session on its own thread and gives the
//! presentation layer a handle to drive it.
//!
//! ## Key Components
//! - `ConnectionManager`: owns the Tokio runtime, the BLE transport and the
//!   session loop
//! - `SessionHandle`: the only way in for user intents; the presentation
//!   layer never touches the transport directly
//!
//! State flows back out as `SessionUpdate`s on a crossbeam channel the
//! caller supplies.

use crate::ble_transport::BtleplugTransport;
use crate::config::Config;
use crate::error::{ConnectionError, SessionError};
use crate::session::{Intent, SessionEvent, SessionMachine, SessionUpdate};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Sends user intents to the session loop.
pub struct SessionHandle {
    sender: UnboundedSender<SessionEvent>,
}

impl SessionHandle {
    fn send(&self, intent: Intent) -> Result<(), ConnectionError> {
        self.sender
            .send(SessionEvent::Intent(intent))
            .map_err(|_| ConnectionError::ChannelClosed)
    }

    pub fn scan(&self) -> Result<(), ConnectionError> {
        self.send(Intent::Scan)
    }

    pub fn start(&self, strength: u8, duration_minutes: u32) -> Result<(), ConnectionError> {
        self.send(Intent::Start { strength, duration_minutes })
    }

    pub fn stop(&self) -> Result<(), ConnectionError> {
        self.send(Intent::Stop)
    }

    pub fn set_strength(&self, value: i64) -> Result<(), ConnectionError> {
        self.send(Intent::SetStrength(value))
    }

    pub fn toggle_polling(&self) -> Result<(), ConnectionError> {
        self.send(Intent::TogglePolling)
    }

    pub fn disconnect(&self) -> Result<(), ConnectionError> {
        self.send(Intent::Disconnect)
    }

    pub fn shutdown(&self) -> Result<(), ConnectionError> {
        self.send(Intent::Shutdown)
    }
}

/// Manages the session lifecycle for the stimulator.
///
/// Runs in a dedicated thread with its own Tokio runtime so the
/// presentation layer is never blocked by BLE operations.
pub struct ConnectionManager {
    config: Config,
    ingress_sender: UnboundedSender<SessionEvent>,
    ingress_receiver: UnboundedReceiver<SessionEvent>,
    update_sender: crossbeam_channel::Sender<SessionUpdate>,
}

impl ConnectionManager {
    /// Creates a new ConnectionManager.
    ///
    /// Returns the manager and a handle for issuing intents from the UI thread.
    pub fn new(
        config: Config,
        update_sender: crossbeam_channel::Sender<SessionUpdate>,
    ) -> (Self, SessionHandle) {
        let (ingress_sender, ingress_receiver) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            sender: ingress_sender.clone(),
        };

        let manager = ConnectionManager {
            config,
            ingress_sender,
            ingress_receiver,
            update_sender,
        };

        (manager, handle)
    }

    /// Runs the session loop until a shutdown intent arrives.
    ///
    /// This should be called in a spawned thread. Failures to bring up the
    /// runtime or the Bluetooth stack are reported as updates, not panics.
    pub fn run(self) {
        let rt = match Runtime::new() {
            Ok(runtime) => runtime,
            Err(e) => {
                let error = ConnectionError::RuntimeCreation(e.to_string());
                log::error!("{}", error);
                return;
            }
        };

        let ConnectionManager {
            config,
            ingress_sender,
            ingress_receiver,
            update_sender,
        } = self;

        rt.block_on(async move {
            let gatt = match config.gatt_ids() {
                Ok(gatt) => gatt,
                Err(e) => {
                    log::error!("{}", e);
                    return;
                }
            };

            let transport = match BtleplugTransport::new(gatt).await {
                Ok(transport) => transport,
                Err(e) => {
                    log::error!("Bluetooth unavailable: {}", e);
                    let _ = update_sender.send(SessionUpdate::Condition(SessionError::ScanFailed(e)));
                    return;
                }
            };

            let machine = SessionMachine::new(config, Arc::new(transport), ingress_sender, update_sender);
            machine.run(ingress_receiver).await;
        });

        log::info!("Connection manager: shutting down");
    }
}
