use std::time::Duration;
use tokio::{
    sync::{mpsc, oneshot},
    time::{sleep_until, Instant},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    adapter::{AdapterState, Advertisement, RadioAdapter, RadioEvent},
    connection::{Channel, ConnectionManager, Unbound},
    error::{ErgError, Result},
    protocol::{clamp_watts, ControlCommand, ControlResponse, MachineStatus, OpCode},
    registry::DeviceRegistry,
    session::Session,
    telemetry::{parse_heart_rate_measurement, parse_indoor_bike_data},
    types::{
        ControllerConfig, DeviceRole, DiscoveredPeripheral, ErgEvent, Selector, SessionState,
        StatusUpdate,
    },
};

type Reply<T> = oneshot::Sender<Result<T>>;

/// Requests accepted by the controller actor
#[derive(Debug)]
enum Command {
    StartDiscovery {
        reply: Reply<()>,
    },
    StopDiscovery {
        reply: Reply<()>,
    },
    Connect {
        selector: Selector,
        role: DeviceRole,
        timeout: Option<Duration>,
        reply: Reply<String>,
    },
    Disconnect {
        selector: Option<Selector>,
        role: DeviceRole,
        reply: Reply<()>,
    },
    StartSession {
        watts: f64,
        duration: Option<Duration>,
        reply: Reply<()>,
    },
    PauseSession {
        reply: Reply<()>,
    },
    ResumeSession {
        reply: Reply<()>,
    },
    StopSession {
        reply: Reply<()>,
    },
    SetTargetWatts {
        watts: f64,
        reply: Reply<u16>,
    },
    NudgeWatts {
        delta: i32,
        reply: Reply<u16>,
    },
    Status {
        reply: Reply<StatusUpdate>,
    },
    Devices {
        reply: Reply<Vec<DiscoveredPeripheral>>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Handle to the controller actor
///
/// `ErgController` is cheap to clone; every clone talks to the same actor task,
/// which owns the device registry, both device bindings, and the session. Commands
/// are processed one at a time in arrival order, after any radio event that was
/// already queued.
///
/// # Examples
///
/// ```no_run
/// use ergolink::{BtleplugAdapter, ControllerConfig, DeviceRole, ErgController, Selector};
///
/// # async fn example() -> ergolink::Result<()> {
/// let adapter = BtleplugAdapter::new().await?;
/// let (controller, _events) = ErgController::spawn(adapter, ControllerConfig::default()).await?;
///
/// let label = controller
///     .connect(Selector::Name("kickr".to_string()), DeviceRole::Control)
///     .await?;
/// println!("Riding on {label}");
///
/// controller.start_session(200.0, None).await?;
/// controller.nudge_watts(10).await?;
/// controller.stop_session().await?;
/// controller.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ErgController {
    commands: mpsc::UnboundedSender<Command>,
}

impl ErgController {
    /// Start the actor on the current tokio runtime
    ///
    /// Returns the handle and the receiving end of the event stream.
    ///
    /// # Errors
    ///
    /// Returns the adapter error if its event stream or state cannot be read.
    pub async fn spawn<A: RadioAdapter>(
        adapter: A,
        config: ControllerConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ErgEvent>)> {
        let radio = adapter.events().await?;
        let adapter_state = adapter.state().await?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        let connect_timeout = Duration::from_millis(config.connect_timeout_ms);
        let actor = ControllerActor {
            registry: DeviceRegistry::new(Duration::from_millis(config.staleness_window_ms)),
            connections: ConnectionManager::new(connect_timeout),
            session: Session::new(),
            adapter,
            adapter_state,
            connect_timeout,
            discovery_requested: false,
            scan_active: false,
            pending: Vec::new(),
            events: events_tx,
            timer_tx,
        };

        info!("Starting controller (adapter {adapter_state})");
        tokio::spawn(actor.run(radio, timer_rx, commands_rx));

        Ok((
            Self {
                commands: commands_tx,
            },
            events_rx,
        ))
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| ErgError::ControllerClosed)?;
        response.await.map_err(|_| ErgError::ControllerClosed)?
    }

    /// Start listing nearby peripherals
    ///
    /// Entries that are not connected are dropped first. While discovery is on,
    /// a [`ErgEvent::DeviceList`] is emitted on every advertisement. If the radio
    /// is not powered yet the scan starts as soon as it is.
    ///
    /// # Errors
    ///
    /// Returns [`ErgError::AdapterUnavailable`] when the radio is unsupported or
    /// unauthorized.
    pub async fn start_discovery(&self) -> Result<()> {
        self.request(|reply| Command::StartDiscovery { reply }).await
    }

    /// Stop listing nearby peripherals
    ///
    /// The radio keeps scanning while a connect is waiting for its device.
    ///
    /// # Errors
    ///
    /// Returns [`ErgError::ControllerClosed`] after shutdown.
    pub async fn stop_discovery(&self) -> Result<()> {
        self.request(|reply| Command::StopDiscovery { reply }).await
    }

    /// Bind a device for `role` using the configured connect timeout
    ///
    /// # Errors
    ///
    /// See [`ErgController::connect_with_timeout`].
    pub async fn connect(&self, selector: Selector, role: DeviceRole) -> Result<String> {
        self.request(|reply| Command::Connect {
            selector,
            role,
            timeout: None,
            reply,
        })
        .await
    }

    /// Bind a device for `role`, scanning for at most `timeout`
    ///
    /// Returns the label of the bound device. A role that is already bound is
    /// left alone and reports its current label.
    ///
    /// # Errors
    ///
    /// Returns [`ErgError::Timeout`] if no matching device shows up in time,
    /// [`ErgError::ProtocolMismatch`] if the device lacks a required channel,
    /// or the adapter error of a failed connect, subscribe or write.
    pub async fn connect_with_timeout(
        &self,
        selector: Selector,
        role: DeviceRole,
        timeout: Duration,
    ) -> Result<String> {
        self.request(|reply| Command::Connect {
            selector,
            role,
            timeout: Some(timeout),
            reply,
        })
        .await
    }

    /// Drop the binding for `role`
    ///
    /// With a selector, only a bound device matching it is dropped. A running or
    /// paused session receives a best-effort stop before the trainer link goes.
    ///
    /// # Errors
    ///
    /// Returns [`ErgError::ControllerClosed`] after shutdown.
    pub async fn disconnect(&self, selector: Option<Selector>, role: DeviceRole) -> Result<()> {
        self.request(|reply| Command::Disconnect {
            selector,
            role,
            reply,
        })
        .await
    }

    /// Start (or restart) an ERG session at `watts`
    ///
    /// With a `duration` the session stops by itself once that much running
    /// time has passed; paused time does not count.
    ///
    /// # Errors
    ///
    /// Returns [`ErgError::NotReady`] when no trainer is bound or known, or the
    /// adapter error of a failed write.
    pub async fn start_session(&self, watts: f64, duration: Option<Duration>) -> Result<()> {
        self.request(|reply| Command::StartSession {
            watts,
            duration,
            reply,
        })
        .await
    }

    /// Pause a running session
    ///
    /// # Errors
    ///
    /// Returns the adapter error of a failed write.
    pub async fn pause_session(&self) -> Result<()> {
        self.request(|reply| Command::PauseSession { reply }).await
    }

    /// Resume a paused session
    ///
    /// # Errors
    ///
    /// Returns the adapter error of a failed write.
    pub async fn resume_session(&self) -> Result<()> {
        self.request(|reply| Command::ResumeSession { reply }).await
    }

    /// Stop a running or paused session
    ///
    /// # Errors
    ///
    /// Returns the adapter error of a failed write.
    pub async fn stop_session(&self) -> Result<()> {
        self.request(|reply| Command::StopSession { reply }).await
    }

    /// Set the target power, returning the accepted (clamped) value
    ///
    /// # Errors
    ///
    /// Returns [`ErgError::NotReady`] when no trainer is bound, or the adapter
    /// error of a failed write.
    pub async fn set_target_watts(&self, watts: f64) -> Result<u16> {
        self.request(|reply| Command::SetTargetWatts { watts, reply })
            .await
    }

    /// Shift the last accepted target by `delta` watts
    ///
    /// # Errors
    ///
    /// Same as [`ErgController::set_target_watts`].
    pub async fn nudge_watts(&self, delta: i32) -> Result<u16> {
        self.request(|reply| Command::NudgeWatts { delta, reply })
            .await
    }

    /// Current connection and session status
    ///
    /// # Errors
    ///
    /// Returns [`ErgError::ControllerClosed`] after shutdown.
    pub async fn status(&self) -> Result<StatusUpdate> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Current sorted device list
    ///
    /// # Errors
    ///
    /// Returns [`ErgError::ControllerClosed`] after shutdown.
    pub async fn devices(&self) -> Result<Vec<DiscoveredPeripheral>> {
        self.request(|reply| Command::Devices { reply }).await
    }

    /// Stop everything and end the actor
    ///
    /// Best effort: failures are logged, never returned. Later calls on any
    /// clone fail with [`ErgError::ControllerClosed`].
    pub async fn shutdown(&self) {
        if let Err(e) = self.request(|reply| Command::Shutdown { reply }).await {
            debug!("Shutdown requested on a closed controller: {e}");
        }
    }
}

/// A connect waiting for its device to advertise
#[derive(Debug)]
struct PendingConnect {
    selector: Selector,
    role: DeviceRole,
    deadline: Instant,
    timeout: Duration,
    reply: Reply<String>,
}

/// Owns every piece of mutable state; runs on its own task
struct ControllerActor<A> {
    adapter: A,
    adapter_state: AdapterState,
    connect_timeout: Duration,
    registry: DeviceRegistry,
    connections: ConnectionManager,
    session: Session,
    discovery_requested: bool,
    scan_active: bool,
    pending: Vec<PendingConnect>,
    events: mpsc::UnboundedSender<ErgEvent>,
    timer_tx: mpsc::UnboundedSender<u64>,
}

impl<A: RadioAdapter> ControllerActor<A> {
    async fn run(
        mut self,
        mut radio: mpsc::UnboundedReceiver<RadioEvent>,
        mut timer: mpsc::UnboundedReceiver<u64>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        loop {
            let deadline = self.pending.iter().map(|p| p.deadline).min();

            tokio::select! {
                biased;

                Some(event) = radio.recv() => self.on_radio_event(event).await,
                Some(generation) = timer.recv() => self.on_auto_stop(generation).await,
                command = commands.recv() => {
                    let Some(command) = command else {
                        // every handle dropped
                        self.shutdown().await;
                        break;
                    };
                    if !self.handle(command).await {
                        break;
                    }
                }
                () = wait_until(deadline) => self.expire_pending().await,
            }
        }

        info!("Controller stopped");
    }

    /// Returns `false` once the actor should exit
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::StartDiscovery { reply } => {
                let _ = reply.send(self.start_discovery().await);
            }
            Command::StopDiscovery { reply } => {
                self.stop_discovery().await;
                let _ = reply.send(Ok(()));
            }
            Command::Connect {
                selector,
                role,
                timeout,
                reply,
            } => self.connect(selector, role, timeout, reply).await,
            Command::Disconnect {
                selector,
                role,
                reply,
            } => {
                self.disconnect(selector.as_ref(), role).await;
                let _ = reply.send(Ok(()));
            }
            Command::StartSession {
                watts,
                duration,
                reply,
            } => {
                let _ = reply.send(self.start_session(watts, duration).await);
            }
            Command::PauseSession { reply } => {
                let _ = reply.send(self.pause_session().await);
            }
            Command::ResumeSession { reply } => {
                let _ = reply.send(self.resume_session().await);
            }
            Command::StopSession { reply } => {
                let _ = reply.send(self.stop_session().await);
            }
            Command::SetTargetWatts { watts, reply } => {
                let _ = reply.send(self.set_target_watts(watts).await);
            }
            Command::NudgeWatts { delta, reply } => {
                let watts = f64::from(self.session.target_watts()) + f64::from(delta);
                let _ = reply.send(self.set_target_watts(watts).await);
            }
            Command::Status { reply } => {
                let _ = reply.send(Ok(self.status(None)));
            }
            Command::Devices { reply } => {
                let _ = reply.send(Ok(self.registry.snapshot(std::time::Instant::now())));
            }
            Command::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(Ok(()));
                return false;
            }
        }
        true
    }

    fn emit(&self, event: ErgEvent) {
        if self.events.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }

    /// Publish the sorted device list while discovery is on
    fn emit_device_list(&mut self) {
        if !self.discovery_requested {
            return;
        }
        let devices = self.registry.snapshot(std::time::Instant::now());
        self.emit(ErgEvent::DeviceList(devices));
    }

    fn emit_status(&self, message: impl Into<String>) {
        self.emit(ErgEvent::Status(self.status(Some(message.into()))));
    }

    fn status(&self, message: Option<String>) -> StatusUpdate {
        let control = self.connections.control();
        let state = self.session.state();
        StatusUpdate {
            connected: control.is_some(),
            controlling: control.is_some_and(|d| d.controlling),
            running: state == SessionState::Running,
            paused: state == SessionState::Paused,
            scanning: self.scan_active,
            message,
            device_id: control.map(|d| d.id.clone()),
            device_label: self.connections.last_label().map(str::to_string),
            heart_rate_device_id: self.connections.heart_rate().map(|d| d.id.clone()),
            state,
            target_watts: self.session.target_watts(),
            remaining_ms: self.session.remaining().map(millis),
        }
    }

    // Radio events

    async fn on_radio_event(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::StateChanged(state) => self.on_adapter_state(state).await,
            RadioEvent::Advertisement(adv) => self.on_advertisement(adv).await,
            RadioEvent::Notification {
                peripheral,
                characteristic,
                value,
            } => self.on_notification(&peripheral, characteristic, &value),
            RadioEvent::Disconnected(peripheral) => self.on_disconnected(&peripheral),
        }
    }

    async fn on_adapter_state(&mut self, state: AdapterState) {
        if state == self.adapter_state {
            return;
        }
        info!("Adapter state changed: {} -> {state}", self.adapter_state);
        self.adapter_state = state;

        match state {
            AdapterState::PoweredOn => {
                if self.discovery_requested || !self.pending.is_empty() {
                    if let Err(e) = self.ensure_scan().await {
                        error!("Failed to start deferred scan: {e}");
                        self.emit_status(format!("Failed to start scan: {e}"));
                        return;
                    }
                }
                self.emit_status("Adapter ready");
            }
            state if state.is_fatal() => {
                self.scan_active = false;
                self.discovery_requested = false;
                for pending in self.pending.drain(..) {
                    let _ = pending.reply.send(Err(ErgError::AdapterUnavailable {
                        reason: state.to_string(),
                    }));
                }
                self.emit_status(format!("Bluetooth adapter {state}"));
            }
            _ => {
                self.scan_active = false;
                self.emit_status(format!("Bluetooth adapter {state}, waiting for adapter"));
            }
        }
    }

    async fn on_advertisement(&mut self, adv: Advertisement) {
        let id = self.registry.on_advertisement(adv, std::time::Instant::now()).id.clone();

        self.emit_device_list();
        self.match_pending(&id).await;
    }

    fn on_notification(&mut self, peripheral: &str, characteristic: Uuid, value: &[u8]) {
        let decoded = match self.connections.route(peripheral, characteristic) {
            Some(Channel::Data) => parse_indoor_bike_data(value),
            Some(Channel::HeartRate) => parse_heart_rate_measurement(value),
            Some(Channel::Command) => {
                self.on_control_response(value);
                return;
            }
            Some(Channel::Status) => {
                self.on_machine_status(value);
                return;
            }
            None => {
                debug!("Ignoring notification from {peripheral} on {characteristic}");
                return;
            }
        };

        match decoded {
            Ok(sample) if !sample.is_empty() => self.emit(ErgEvent::Telemetry(sample)),
            Ok(_) => {}
            Err(e) => debug!("Dropping telemetry frame from {peripheral}: {e}"),
        }
    }

    fn on_control_response(&mut self, value: &[u8]) {
        let response = match ControlResponse::from_bytes(value) {
            Ok(response) => response,
            Err(e) => {
                debug!("Ignoring control point notification: {e}");
                return;
            }
        };

        if response.is_success() {
            debug!("{}", response.describe());
            return;
        }

        let message = response.describe();
        warn!("{message}");
        if response.request_opcode() == Some(OpCode::RequestControl) {
            self.connections.set_controlling(false);
        }
        self.emit_status(message);
    }

    fn on_machine_status(&mut self, value: &[u8]) {
        match MachineStatus::from_bytes(value) {
            Ok(status) => {
                info!("{status}");
                if status == MachineStatus::ControlPermissionLost {
                    self.connections.set_controlling(false);
                }
                self.emit_status(status.to_string());
            }
            Err(e) => debug!("Ignoring machine status notification: {e}"),
        }
    }

    fn on_disconnected(&mut self, peripheral: &str) {
        let unbound = self.connections.on_disconnected(peripheral);
        if unbound.is_empty() {
            debug!("Ignoring disconnect of unbound peripheral {peripheral}");
            return;
        }

        self.registry.set_connected(peripheral, false);
        for binding in unbound {
            match binding {
                Unbound::Control(device) => {
                    warn!("Lost connection to {}", device.label);
                    self.session.reset();
                    self.emit_status(format!("Disconnected from {}", device.label));
                }
                Unbound::HeartRate(device) => {
                    warn!("Lost connection to heart rate device {}", device.label);
                    self.emit_status(format!("Heart rate device {} disconnected", device.label));
                }
            }
        }
        self.emit_device_list();
    }

    // Discovery

    async fn start_discovery(&mut self) -> Result<()> {
        if self.adapter_state.is_fatal() {
            return Err(ErgError::AdapterUnavailable {
                reason: self.adapter_state.to_string(),
            });
        }

        info!("Starting discovery");
        self.registry.begin_scan();
        self.discovery_requested = true;

        if self.adapter_state == AdapterState::PoweredOn {
            self.ensure_scan().await?;
            self.emit_device_list();
            self.emit_status("Scanning");
        } else {
            info!("Adapter {}, deferring scan", self.adapter_state);
            self.emit_status("Waiting for adapter");
        }
        Ok(())
    }

    async fn stop_discovery(&mut self) {
        if !self.discovery_requested {
            return;
        }
        info!("Stopping discovery");
        self.discovery_requested = false;
        self.stop_scan_if_idle().await;
        self.emit_status("Discovery stopped");
    }

    async fn ensure_scan(&mut self) -> Result<()> {
        if self.scan_active || self.adapter_state != AdapterState::PoweredOn {
            return Ok(());
        }
        self.adapter.start_scan().await?;
        self.scan_active = true;
        Ok(())
    }

    async fn stop_scan_if_idle(&mut self) {
        if !self.scan_active || self.discovery_requested || !self.pending.is_empty() {
            return;
        }
        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop scan: {e}");
        }
        self.scan_active = false;
    }

    // Connections

    async fn connect(
        &mut self,
        selector: Selector,
        role: DeviceRole,
        timeout: Option<Duration>,
        reply: Reply<String>,
    ) {
        if let Some(label) = self.connections.bound_label(role) {
            debug!("{role} role already bound to {label}");
            let _ = reply.send(Ok(label.to_string()));
            return;
        }

        if let Some(peripheral) = self.registry.find(&selector, role).cloned() {
            let _ = reply.send(self.bind(peripheral, role, timeout).await);
            return;
        }

        if self.adapter_state.is_fatal() {
            let _ = reply.send(Err(ErgError::AdapterUnavailable {
                reason: self.adapter_state.to_string(),
            }));
            return;
        }

        let timeout = timeout.unwrap_or(self.connect_timeout);
        info!("Scanning up to {timeout:?} for a {role} device matching {selector}");
        self.pending.push(PendingConnect {
            selector,
            role,
            deadline: Instant::now() + timeout,
            timeout,
            reply,
        });

        if let Err(e) = self.ensure_scan().await {
            error!("Failed to start scan: {e}");
            if let Some(pending) = self.pending.pop() {
                let _ = pending.reply.send(Err(e));
            }
        }
    }

    /// Link and bind `peripheral`; `timeout` of `None` uses the configured default
    async fn bind(
        &mut self,
        peripheral: DiscoveredPeripheral,
        role: DeviceRole,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let bound = match role {
            DeviceRole::Control => {
                self.connections
                    .bind_control_device(&self.adapter, &peripheral, timeout)
                    .await
            }
            DeviceRole::HeartRate => {
                self.connections
                    .bind_heart_rate_device(&self.adapter, &peripheral, timeout)
                    .await
            }
        };

        let label = match bound {
            Ok(label) => label,
            Err(e) => {
                error!("Failed to bind {}: {e}", peripheral.label());
                self.emit_status(format!("Failed to connect to {}: {e}", peripheral.label()));
                return Err(e);
            }
        };

        self.registry.set_connected(&peripheral.id, true);
        self.emit_device_list();

        // anyone else waiting on this role gets the winner
        let (resolved, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| p.role == role);
        self.pending = waiting;
        for pending in resolved {
            let _ = pending.reply.send(Ok(label.clone()));
        }
        self.stop_scan_if_idle().await;

        self.emit_status(format!("Connected to {label}"));
        Ok(label)
    }

    async fn match_pending(&mut self, id: &str) {
        let Some(peripheral) = self.registry.get(id).cloned() else {
            return;
        };
        let Some(index) = self
            .pending
            .iter()
            .position(|p| p.selector.matches(&peripheral, p.role))
        else {
            return;
        };

        let pending = self.pending.remove(index);
        info!("Found {} for pending {} connect", peripheral.label(), pending.role);
        // the link gets whatever is left of the connect's bound
        let remaining = pending.deadline.saturating_duration_since(Instant::now());
        let result = self.bind(peripheral, pending.role, Some(remaining)).await;
        let _ = pending.reply.send(result);
        self.stop_scan_if_idle().await;
    }

    async fn expire_pending(&mut self) {
        let now = Instant::now();
        let (expired, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| p.deadline <= now);
        self.pending = live;

        for pending in expired {
            warn!(
                "No {} device matching {} within {:?}",
                pending.role, pending.selector, pending.timeout
            );
            let _ = pending.reply.send(Err(ErgError::Timeout {
                timeout_ms: millis(pending.timeout),
            }));
        }
        self.stop_scan_if_idle().await;
    }

    async fn disconnect(&mut self, selector: Option<&Selector>, role: DeviceRole) {
        if let Some(selector) = selector {
            if !self.connections.bound_matches(role, selector) {
                debug!("No {role} device bound matching {selector}");
                return;
            }
        }

        if role == DeviceRole::Control && self.session.is_active() {
            self.connections
                .send_best_effort(&self.adapter, &ControlCommand::stop_or_pause())
                .await;
        }

        let (id, label) = match self.connections.unbind(&self.adapter, role).await {
            Some(Unbound::Control(device)) => {
                self.session.reset();
                (device.id, device.label)
            }
            Some(Unbound::HeartRate(device)) => (device.id, device.label),
            None => return,
        };

        info!("Disconnected {role} device {label}");
        self.registry
            .set_connected(&id, self.connections.is_bound(&id));
        self.emit_device_list();
        self.emit_status(format!("Disconnected from {label}"));
    }

    /// Bind the best known trainer when none is bound
    async fn ensure_control_device(&mut self) -> Result<()> {
        if self.connections.control().is_some() {
            return Ok(());
        }
        let peripheral = self
            .registry
            .find(&Selector::Any, DeviceRole::Control)
            .cloned()
            .ok_or_else(|| ErgError::not_ready("no control device bound or discovered"))?;
        self.bind(peripheral, DeviceRole::Control, None)
            .await
            .map(|_| ())
    }

    // Session

    async fn start_session(&mut self, watts: f64, duration: Option<Duration>) -> Result<()> {
        let watts = finite_watts(watts)?;
        self.ensure_control_device().await?;
        self.connections.ensure_control(&self.adapter).await?;

        let watts = clamp_watts(watts);
        self.connections
            .send(&self.adapter, &ControlCommand::set_target_power(watts))
            .await?;
        self.connections
            .send(&self.adapter, &ControlCommand::start_or_resume())
            .await?;

        if self.session.is_active() {
            info!("Restarting session");
        }
        self.session.set_target(watts);
        self.session.begin(duration, &self.timer_tx);

        match duration {
            Some(duration) => info!("Session started at {watts} W for {duration:?}"),
            None => info!("Session started at {watts} W"),
        }
        self.emit_status(format!("Session started at {watts} W"));
        Ok(())
    }

    async fn pause_session(&mut self) -> Result<()> {
        if self.session.state() != SessionState::Running {
            debug!("Pause ignored in {} state", self.session.state());
            return Ok(());
        }

        self.connections.ensure_control(&self.adapter).await?;
        self.connections
            .send(&self.adapter, &ControlCommand::stop_or_pause())
            .await?;
        self.session.pause();

        info!("Session paused");
        self.emit_status("Session paused");
        Ok(())
    }

    async fn resume_session(&mut self) -> Result<()> {
        if self.session.state() != SessionState::Paused {
            debug!("Resume ignored in {} state", self.session.state());
            return Ok(());
        }

        self.connections.ensure_control(&self.adapter).await?;
        self.connections
            .send(&self.adapter, &ControlCommand::start_or_resume())
            .await?;
        self.session.resume(&self.timer_tx);

        info!("Session resumed");
        self.emit_status("Session resumed");
        Ok(())
    }

    async fn stop_session(&mut self) -> Result<()> {
        if !self.session.is_active() {
            debug!("Stop ignored in {} state", self.session.state());
            return Ok(());
        }

        self.connections.ensure_control(&self.adapter).await?;
        self.connections
            .send(&self.adapter, &ControlCommand::stop_or_pause())
            .await?;
        self.session.stop();

        info!("Session stopped");
        self.emit_status("Session stopped");
        Ok(())
    }

    async fn on_auto_stop(&mut self, generation: u64) {
        if !self.session.take_fired(generation) {
            return;
        }

        info!("Session duration reached, stopping");
        let written = match self.connections.ensure_control(&self.adapter).await {
            Ok(()) => {
                self.connections
                    .send(&self.adapter, &ControlCommand::stop_or_pause())
                    .await
            }
            Err(e) => Err(e),
        };
        self.session.stop();

        match written {
            Ok(()) => self.emit_status("Session complete"),
            Err(e) => {
                error!("Failed to stop trainer at end of session: {e}");
                self.emit_status(format!("Session complete, stop command failed: {e}"));
            }
        }
    }

    async fn set_target_watts(&mut self, watts: f64) -> Result<u16> {
        if self.connections.control().is_none() {
            return Err(ErgError::not_ready("no control device bound"));
        }

        let watts = clamp_watts(finite_watts(watts)?);
        self.connections.ensure_control(&self.adapter).await?;
        self.connections
            .send(&self.adapter, &ControlCommand::set_target_power(watts))
            .await?;
        self.session.set_target(watts);

        debug!("Target power set to {watts} W");
        self.emit(ErgEvent::TargetWattsChanged(watts));
        Ok(watts)
    }

    // Teardown

    async fn shutdown(&mut self) {
        info!("Shutting down controller");

        for pending in self.pending.drain(..) {
            let _ = pending.reply.send(Err(ErgError::ControllerClosed));
        }

        self.discovery_requested = false;
        if self.scan_active {
            if let Err(e) = self.adapter.stop_scan().await {
                warn!("Failed to stop scan during shutdown: {e}");
            }
            self.scan_active = false;
        }

        self.session.reset();
        if self.connections.control().is_some() {
            self.connections
                .send_best_effort(&self.adapter, &ControlCommand::stop_or_pause())
                .await;
            self.connections
                .send_best_effort(&self.adapter, &ControlCommand::reset())
                .await;
        }

        self.connections.unbind(&self.adapter, DeviceRole::Control).await;
        self.connections.unbind(&self.adapter, DeviceRole::HeartRate).await;
        self.registry.clear();

        self.emit_status("Controller shut down");
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn finite_watts(watts: f64) -> Result<f64> {
    if watts.is_finite() {
        Ok(watts)
    } else {
        Err(ErgError::InvalidParameters(format!(
            "target power must be finite, got {watts}"
        )))
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
