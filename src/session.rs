//! # Session State Machine
//!
//! Owns the connection lifecycle of the one stimulator this process talks
//! to: scanning, connecting, reconnecting after link loss, status polling,
//! keep-alive and the run countdown.
//!
//! ## Event Flow
//! Everything arrives through a single ingress channel of `SessionEvent`s:
//! user intents, scan results, connect results, notification frames,
//! disconnect signals and timer ticks. One loop (`SessionMachine::run`) consumes them in order, so
//! state is only ever touched from one place and writes to the device are
//! awaited one at a time.
//!
//! ## Generations
//! Each asynchronous source stamps its events with the generation it was
//! started under (scan generation, link epoch, timer generation). Once the
//! machine has moved on, late events from an old scan, link or timer no
//! longer match and are dropped.
//!
//! ```text
//! Disconnected --scan--> Scanning --match--> Connecting --ok--> Connected
//!      ^                    |                    |                  |
//!      |<----timeout--------+                    |            link lost
//!      |<----failure (no auto-reconnect)---------+                  v
//!      |                                    Reconnecting <---------+
//!      |                                         | delay, scan, match
//!      +---------- user disconnect               +------> Connecting
//! ```

use crate::config::Config;
use crate::device_scanner::{matches_name_prefix, BluetoothDevice};
use crate::error::{SessionError, TransportError};
use crate::policy::{ReconnectPolicy, RetryCounter, RetryOutcome};
use crate::protocol::{Command, Strength};
use crate::run_controller::{RunController, SessionParameters, Tick};
use crate::telemetry::TelemetrySnapshot;
use crate::timers::{TimerKind, Timers};
use crate::transport::{DeviceHandle, Transport};
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

const COUNTDOWN_TICK: Duration = Duration::from_secs(1);

/// What the presentation layer asks for
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    Scan,
    Start { strength: u8, duration_minutes: u32 },
    Stop,
    SetStrength(i64),
    TogglePolling,
    /// Drop the link and stay disconnected
    Disconnect,
    Shutdown,
}

#[derive(Debug)]
pub enum SessionEvent {
    Intent(Intent),
    Discovered { scan: u64, device: BluetoothDevice },
    ScanTimedOut { scan: u64 },
    ConnectFinished {
        scan: u64,
        device: BluetoothDevice,
        result: Result<DeviceHandle, TransportError>,
    },
    ReconnectDue { scan: u64 },
    Notification { epoch: u64, frame: Vec<u8> },
    Disconnected { epoch: u64 },
    TimerFired { kind: TimerKind, generation: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Scanning,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Scanning => "scanning",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(label)
    }
}

/// Observable state published after every change
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub connection: ConnectionState,
    pub device: Option<String>,
    pub telemetry: TelemetrySnapshot,
    pub params: SessionParameters,
    pub polling: bool,
}

#[derive(Debug, Clone)]
pub enum SessionUpdate {
    Status(SessionStatus),
    Condition(SessionError),
}

pub struct SessionMachine {
    config: Config,
    transport: Arc<dyn Transport>,
    ingress: UnboundedSender<SessionEvent>,
    updates: crossbeam_channel::Sender<SessionUpdate>,
    state: ConnectionState,
    handle: Option<DeviceHandle>,
    telemetry: TelemetrySnapshot,
    run: RunController,
    timers: Timers,
    reconnect_policy: Box<dyn ReconnectPolicy>,
    reconnect_attempt: u32,
    retries: RetryCounter,
    polling_enabled: bool,
    scan_generation: u64,
    scan_task: Option<JoinHandle<()>>,
    connect_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
    epoch: u64,
    link_tasks: Vec<JoinHandle<()>>,
    last_published: Option<SessionStatus>,
}

impl SessionMachine {
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        ingress: UnboundedSender<SessionEvent>,
        updates: crossbeam_channel::Sender<SessionUpdate>,
    ) -> Self {
        let run = RunController::new(
            Strength::clamped(i64::from(config.default_strength)),
            config.default_duration_minutes,
        );
        Self {
            reconnect_policy: config.reconnect_policy(),
            retries: RetryCounter::new(config.max_retry_attempts),
            polling_enabled: config.poll_enabled,
            timers: Timers::new(ingress.clone()),
            config,
            transport,
            ingress,
            updates,
            state: ConnectionState::Disconnected,
            handle: None,
            telemetry: TelemetrySnapshot::default(),
            run,
            reconnect_attempt: 0,
            scan_generation: 0,
            scan_task: None,
            connect_task: None,
            reconnect_task: None,
            epoch: 0,
            link_tasks: Vec::new(),
            last_published: None,
        }
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            connection: self.state,
            device: self.handle.as_ref().map(|h| h.name.clone()),
            telemetry: self.telemetry.clone(),
            params: self.run.params().clone(),
            polling: self.polling_enabled,
        }
    }

    /// Consume events until a shutdown intent arrives.
    pub async fn run(mut self, mut ingress: UnboundedReceiver<SessionEvent>) {
        log::info!("Session loop started");
        self.publish();

        while let Some(event) = ingress.recv().await {
            if !self.handle(event).await {
                break;
            }
        }

        log::info!("Session loop stopped");
    }

    /// Process one event. Returns `false` once the session should end.
    pub async fn handle(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::Intent(intent) => return self.on_intent(intent).await,
            SessionEvent::Discovered { scan, device } => self.on_discovered(scan, device).await,
            SessionEvent::ScanTimedOut { scan } => self.on_scan_timeout(scan).await,
            SessionEvent::ConnectFinished { scan, device, result } => {
                self.on_connect_finished(scan, device, result).await
            }
            SessionEvent::ReconnectDue { scan } => {
                if scan == self.scan_generation && self.state == ConnectionState::Reconnecting {
                    log::info!("Reconnect attempt {}", self.reconnect_attempt);
                    self.begin_scan().await;
                }
            }
            SessionEvent::Notification { epoch, frame } => {
                if epoch == self.epoch {
                    self.on_notification(&frame);
                }
            }
            SessionEvent::Disconnected { epoch } => {
                if epoch == self.epoch && self.state == ConnectionState::Connected {
                    log::warn!("Device reported disconnect");
                    self.link_lost().await;
                }
            }
            SessionEvent::TimerFired { kind, generation } => {
                if self.state == ConnectionState::Connected && self.timers.is_current(kind, generation) {
                    self.on_timer(kind).await;
                } else {
                    log::debug!("Dropping stale {:?} tick", kind);
                }
            }
        }
        true
    }

    async fn on_intent(&mut self, intent: Intent) -> bool {
        log::debug!("Intent: {:?}", intent);
        match intent {
            Intent::Scan => {
                if self.state != ConnectionState::Disconnected {
                    log::warn!("Scan ignored while {}", self.state);
                    return true;
                }
                self.reconnect_attempt = 0;
                self.set_state(ConnectionState::Scanning);
                self.begin_scan().await;
            }
            Intent::Start { strength, duration_minutes } => {
                self.start_run(Strength::clamped(i64::from(strength)), duration_minutes).await;
            }
            Intent::Stop => self.stop_run().await,
            Intent::SetStrength(value) => {
                let command = self.run.set_strength(value);
                self.publish();
                if let Some(command) = command {
                    if self.state == ConnectionState::Connected {
                        self.send(command).await;
                    }
                }
            }
            Intent::TogglePolling => self.toggle_polling(),
            Intent::Disconnect => self.disconnect().await,
            Intent::Shutdown => {
                self.disconnect().await;
                return false;
            }
        }
        true
    }

    // ----- scanning & connecting -----

    async fn begin_scan(&mut self) {
        self.scan_generation += 1;
        let scan = self.scan_generation;

        let mut devices = match self.transport.scan(&self.config.device_name_prefix).await {
            Ok(devices) => devices,
            Err(TransportError::PermissionDenied) => {
                log::error!("Bluetooth permission denied");
                self.set_state(ConnectionState::Disconnected);
                self.emit(SessionError::PermissionDenied);
                return;
            }
            Err(e) => {
                log::error!("Failed to start scan: {}", e);
                if self.state == ConnectionState::Reconnecting {
                    self.schedule_reconnect();
                } else {
                    self.set_state(ConnectionState::Disconnected);
                    self.emit(SessionError::ScanFailed(e));
                }
                return;
            }
        };

        log::info!("Scanning for devices named {}*", self.config.device_name_prefix);
        let sender = self.ingress.clone();
        let timeout = self.config.scan_timeout();
        let prefix = self.config.device_name_prefix.clone();
        self.scan_task = Some(tokio::spawn(async move {
            // One window for the whole scan; foreign devices do not extend it
            let found = tokio::time::timeout(timeout, async {
                while let Some(device) = devices.next().await {
                    if matches_name_prefix(&device.name, &prefix) {
                        return Some(device);
                    }
                    log::debug!("Ignoring non-matching device {}", device.name);
                }
                None
            })
            .await;

            let event = match found {
                Ok(Some(device)) => SessionEvent::Discovered { scan, device },
                Ok(None) | Err(_) => SessionEvent::ScanTimedOut { scan },
            };
            let _ = sender.send(event);
        }));
    }

    async fn end_scan(&mut self) {
        if let Some(task) = self.scan_task.take() {
            task.abort();
            if let Err(e) = self.transport.stop_scan().await {
                log::debug!("Failed to stop scan cleanly: {}", e);
            }
        }
    }

    async fn on_scan_timeout(&mut self, scan: u64) {
        if scan != self.scan_generation {
            return;
        }
        self.end_scan().await;
        match self.state {
            ConnectionState::Reconnecting => {
                log::info!("Device not seen yet, retrying");
                self.schedule_reconnect();
            }
            ConnectionState::Scanning => {
                log::warn!("Scan timed out after {:?}", self.config.scan_timeout());
                self.set_state(ConnectionState::Disconnected);
                self.emit(SessionError::ScanTimeout);
            }
            _ => {}
        }
    }

    async fn on_discovered(&mut self, scan: u64, device: BluetoothDevice) {
        let scanning = matches!(
            self.state,
            ConnectionState::Scanning | ConnectionState::Reconnecting
        );
        if scan != self.scan_generation || !scanning {
            return;
        }

        log::info!("Found {} ({})", device.name, device.id);
        self.end_scan().await;
        self.set_state(ConnectionState::Connecting);

        // Connect off the loop; a disconnect or shutdown must not wait on it
        let transport = Arc::clone(&self.transport);
        let sender = self.ingress.clone();
        let timeout = self.config.connect_timeout();
        if let Some(task) = self.connect_task.replace(tokio::spawn(async move {
            let result = tokio::time::timeout(timeout, transport.connect(&device))
                .await
                .unwrap_or(Err(TransportError::Timeout));
            let _ = sender.send(SessionEvent::ConnectFinished { scan, device, result });
        })) {
            task.abort();
        }
    }

    async fn on_connect_finished(
        &mut self,
        scan: u64,
        device: BluetoothDevice,
        result: Result<DeviceHandle, TransportError>,
    ) {
        if scan != self.scan_generation || self.state != ConnectionState::Connecting {
            if let Ok(handle) = result {
                log::debug!("Releasing abandoned connection to {}", handle.name);
                if let Err(e) = self.transport.disconnect(&handle).await {
                    log::debug!("Disconnect of {} failed: {}", handle.name, e);
                }
            }
            return;
        }
        self.connect_task = None;

        match result {
            Ok(handle) => self.on_connected(handle).await,
            Err(e) => self.on_connect_failed(&device.name, e),
        }
    }

    fn on_connect_failed(&mut self, device: &str, reason: TransportError) {
        log::warn!("Failed to connect to {}: {}", device, reason);
        if reason == TransportError::PermissionDenied {
            self.set_state(ConnectionState::Disconnected);
            self.emit(SessionError::PermissionDenied);
        } else if self.config.auto_reconnect {
            self.schedule_reconnect();
        } else {
            self.set_state(ConnectionState::Disconnected);
            self.emit(SessionError::ConnectFailure {
                device: device.to_string(),
                reason,
            });
        }
    }

    fn schedule_reconnect(&mut self) {
        self.reconnect_attempt += 1;
        self.scan_generation += 1;
        let scan = self.scan_generation;
        let delay = self.reconnect_policy.delay(self.reconnect_attempt);
        log::info!("Reconnecting in {:?} (attempt {})", delay, self.reconnect_attempt);

        let sender = self.ingress.clone();
        if let Some(task) = self.reconnect_task.replace(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(SessionEvent::ReconnectDue { scan });
        })) {
            task.abort();
        }
        self.set_state(ConnectionState::Reconnecting);
    }

    async fn on_connected(&mut self, handle: DeviceHandle) {
        self.epoch += 1;
        let epoch = self.epoch;
        self.handle = Some(handle.clone());
        self.reconnect_attempt = 0;
        self.retries.reset();

        match self.transport.subscribe(&handle).await {
            Ok(mut frames) => {
                let sender = self.ingress.clone();
                self.link_tasks.push(tokio::spawn(async move {
                    while let Some(frame) = frames.next().await {
                        if sender.send(SessionEvent::Notification { epoch, frame }).is_err() {
                            break;
                        }
                    }
                    log::debug!("Notification stream ended");
                }));
            }
            Err(e) if e.is_link_loss() => {
                log::warn!("Link dropped while subscribing: {}", e);
                self.link_lost().await;
                return;
            }
            Err(e) => {
                log::warn!("Could not subscribe to notifications: {}", e);
                self.release_link().await;
                self.on_connect_failed(&handle.name, e);
                return;
            }
        }

        match self.transport.on_disconnect(&handle).await {
            Ok(disconnected) => {
                let sender = self.ingress.clone();
                self.link_tasks.push(tokio::spawn(async move {
                    disconnected.await;
                    let _ = sender.send(SessionEvent::Disconnected { epoch });
                }));
            }
            Err(e) => log::warn!("Could not watch for disconnects: {}", e),
        }

        self.set_state(ConnectionState::Connected);

        if !self.query_status(false).await {
            return;
        }
        if self.polling_enabled {
            self.timers.start(TimerKind::StatusPoll, self.config.poll_interval(self.run.is_running()));
        }

        let resume = self.run.resume_commands();
        if !resume.is_empty() {
            log::info!(
                "Resuming run with {}s remaining",
                self.run.params().remaining_seconds
            );
            if self.send_all(&resume).await {
                self.start_run_timers();
            }
        }
    }

    /// Tear down everything tied to the current link and decide where to go next.
    async fn link_lost(&mut self) {
        self.release_link().await;
        self.telemetry.on_link_lost(self.config.telemetry_retention);

        if self.config.auto_reconnect {
            self.schedule_reconnect();
        } else {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    async fn release_link(&mut self) {
        self.timers.cancel_all();
        for task in self.link_tasks.drain(..) {
            task.abort();
        }
        self.epoch += 1;

        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.transport.disconnect(&handle).await {
                log::debug!("Disconnect of {} failed: {}", handle.name, e);
            }
        }
    }

    async fn disconnect(&mut self) {
        // Ends the run in every state; deactivate only goes out on a live link
        self.stop_run().await;
        self.end_scan().await;
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
        self.scan_generation += 1;
        self.reconnect_attempt = 0;
        self.release_link().await;
        self.set_state(ConnectionState::Disconnected);
    }

    // ----- run control -----

    async fn start_run(&mut self, strength: Strength, duration_minutes: u32) {
        if self.state != ConnectionState::Connected {
            log::warn!("Cannot start a run while {}", self.state);
            self.emit(SessionError::NotConnected);
            return;
        }

        let commands = self.run.start(strength, duration_minutes);
        self.publish();
        if self.send_all(&commands).await {
            self.start_run_timers();
        }
    }

    fn start_run_timers(&mut self) {
        self.timers.start(TimerKind::Countdown, COUNTDOWN_TICK);
        self.timers.start(TimerKind::KeepAlive, self.config.keepalive_interval());
        self.timers.retune(TimerKind::StatusPoll, self.config.poll_interval(true));
    }

    async fn stop_run(&mut self) {
        let was_running = self.run.stop();
        self.timers.cancel(TimerKind::Countdown);
        self.timers.cancel(TimerKind::KeepAlive);
        if !was_running {
            return;
        }
        self.publish();

        if self.state != ConnectionState::Connected {
            return;
        }
        if !self.send(Command::Deactivate).await {
            return;
        }
        self.timers.retune(TimerKind::StatusPoll, self.config.poll_interval(false));
        self.query_status(false).await;
    }

    fn toggle_polling(&mut self) {
        self.polling_enabled = !self.polling_enabled;
        log::info!("Status polling {}", if self.polling_enabled { "enabled" } else { "disabled" });

        if !self.polling_enabled {
            self.timers.cancel(TimerKind::StatusPoll);
        } else if self.state == ConnectionState::Connected {
            self.retries.reset();
            self.timers.start(TimerKind::StatusPoll, self.config.poll_interval(self.run.is_running()));
        }
        self.publish();
    }

    async fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Countdown => match self.run.tick() {
                Tick::Expired => {
                    log::info!("Run finished");
                    self.stop_run().await;
                }
                Tick::Counting(_) => self.publish(),
                Tick::Idle => self.timers.cancel(TimerKind::Countdown),
            },
            TimerKind::KeepAlive => {
                if let Some(command) = self.run.keepalive_command() {
                    log::trace!("Keep-alive");
                    self.send(command).await;
                }
            }
            TimerKind::StatusPoll => {
                self.query_status(true).await;
            }
        }
    }

    // ----- device I/O -----

    async fn write(&mut self, command: Command) -> Result<(), TransportError> {
        let handle = self.handle.clone().ok_or(TransportError::NotConnected)?;
        let bytes = command.encode();
        tokio::time::timeout(self.config.write_timeout(), self.transport.write(&handle, &bytes))
            .await
            .unwrap_or(Err(TransportError::Timeout))?;
        log::debug!("Sent {}", command);
        Ok(())
    }

    /// Send one command. Returns `false` if the link was lost doing so.
    async fn send(&mut self, command: Command) -> bool {
        match self.write(command).await {
            Ok(()) => true,
            Err(e) if e.is_link_loss() => {
                log::warn!("Link lost while sending {}: {}", command, e);
                self.link_lost().await;
                false
            }
            Err(e) => {
                log::warn!("Dropping {}: {}", command, e);
                self.emit(SessionError::WriteFailure {
                    command: command.to_string(),
                    reason: e,
                });
                true
            }
        }
    }

    async fn send_all(&mut self, commands: &[Command]) -> bool {
        for command in commands {
            if !self.send(*command).await {
                return false;
            }
        }
        true
    }

    /// Battery then charging query. With `count_retries` every failure feeds
    /// the poll retry counter. Returns `false` if the link was lost.
    async fn query_status(&mut self, count_retries: bool) -> bool {
        if !count_retries {
            return self.send_all(&[Command::QueryBattery, Command::QueryCharging]).await;
        }

        for command in [Command::QueryBattery, Command::QueryCharging] {
            if let Err(e) = self.write(command).await {
                let outcome = self.retries.record_failure();
                log::warn!("Status poll failed ({:?}): {}", outcome, e);
                if let RetryOutcome::Exhausted(attempts) = outcome {
                    self.timers.cancel(TimerKind::StatusPoll);
                    self.polling_enabled = false;
                    self.emit(SessionError::PollExhausted { attempts });
                    self.publish();
                }
                if e.is_link_loss() {
                    self.link_lost().await;
                    return false;
                }
                return true;
            }
        }
        self.retries.reset();
        true
    }

    fn on_notification(&mut self, frame: &[u8]) {
        match self.telemetry.apply_frame(frame) {
            Ok(true) => self.publish(),
            Ok(false) => {}
            Err(e) => {
                log::warn!("{}", e);
                self.emit(SessionError::DecodeFailure(e));
            }
        }
    }

    // ----- observers -----

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            log::info!("Connection state: {} -> {}", self.state, state);
            self.state = state;
        }
        self.publish();
    }

    fn publish(&mut self) {
        let status = self.status();
        if self.last_published.as_ref() == Some(&status) {
            return;
        }
        self.last_published = Some(status.clone());
        if self.updates.send(SessionUpdate::Status(status)).is_err() {
            log::trace!("No status observer attached");
        }
    }

    fn emit(&self, condition: SessionError) {
        if self.updates.send(SessionUpdate::Condition(condition)).is_err() {
            log::trace!("No condition observer attached");
        }
    }
}
