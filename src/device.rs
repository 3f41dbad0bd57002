//! # Device
//!
//! The user-facing object of the runtime: it owns the property store, the
//! transport factories, a named map of channels, the state machine and the
//! worker thread, and turns registered callbacks into a running data loop.
//!
//! Threading model (see the crate docs): the thread calling
//! [`Device::run_state_machine`] is the machine thread, which applies
//! transitions and runs every hook except the Running-phase ones; a worker
//! thread is spawned on entry to `Running` and joined before the machine
//! leaves it; controllers live on their own threads and talk to the
//! machine exclusively through transition requests and state queues.

use crate::channel::Channel;
use crate::config;
use crate::error::{DeviceError, TransferError, TransferResult, TransportError};
use crate::events::EventManager;
use crate::parts::Parts;
use crate::properties::PropertyStore;
use crate::state_machine::{StateChangeEvent, StateMachine};
use crate::states::{auto_target, State, StateQueue, Transition};
use crate::transport::{
    create_transport_factory, FactoryConfig, FactoryPtr, GenericPoller, MessagePtr, Poller,
    PollerPtr, RegionCallback, RegionConfig, RegionPtr, Socket, Transport,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// A state-entry hook. Hooks run on the machine thread except for the
/// Running-phase hooks, which run on the worker thread.
pub type Hook = Box<dyn FnMut(&Device) -> Result<(), DeviceError> + Send>;

/// Called repeatedly while `Running`; returning `false` makes the core
/// enqueue `Stop` itself.
pub type ConditionalRunHook = Box<dyn FnMut(&Device) -> Result<bool, DeviceError> + Send>;

/// Inbound-data callback; `false` means "no more messages on this
/// handler".
pub type DataHandler = Box<dyn FnMut(&Device, &mut Parts) -> Result<bool, DeviceError> + Send>;

/// The capability table user code plugs into the lifecycle. User state
/// lives in the closures' captures.
#[derive(Default)]
pub struct DeviceHooks {
    pub(crate) init: Option<Hook>,
    pub(crate) init_task: Option<Hook>,
    pub(crate) pre_run: Option<Hook>,
    pub(crate) run: Option<Hook>,
    pub(crate) conditional_run: Option<ConditionalRunHook>,
    pub(crate) post_run: Option<Hook>,
    pub(crate) reset_task: Option<Hook>,
    pub(crate) reset: Option<Hook>,
}

impl DeviceHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init(mut self, f: impl FnMut(&Device) -> Result<(), DeviceError> + Send + 'static) -> Self {
        self.init = Some(Box::new(f));
        self
    }

    pub fn init_task(
        mut self,
        f: impl FnMut(&Device) -> Result<(), DeviceError> + Send + 'static,
    ) -> Self {
        self.init_task = Some(Box::new(f));
        self
    }

    pub fn pre_run(
        mut self,
        f: impl FnMut(&Device) -> Result<(), DeviceError> + Send + 'static,
    ) -> Self {
        self.pre_run = Some(Box::new(f));
        self
    }

    /// Long-running hook owning the Running phase; it must poll
    /// [`Device::new_state_pending`] and return when it turns true.
    pub fn run(mut self, f: impl FnMut(&Device) -> Result<(), DeviceError> + Send + 'static) -> Self {
        self.run = Some(Box::new(f));
        self
    }

    /// Alternative to [`run`](Self::run): called repeatedly, `false` stops.
    pub fn conditional_run(
        mut self,
        f: impl FnMut(&Device) -> Result<bool, DeviceError> + Send + 'static,
    ) -> Self {
        self.conditional_run = Some(Box::new(f));
        self
    }

    pub fn post_run(
        mut self,
        f: impl FnMut(&Device) -> Result<(), DeviceError> + Send + 'static,
    ) -> Self {
        self.post_run = Some(Box::new(f));
        self
    }

    pub fn reset_task(
        mut self,
        f: impl FnMut(&Device) -> Result<(), DeviceError> + Send + 'static,
    ) -> Self {
        self.reset_task = Some(Box::new(f));
        self
    }

    pub fn reset(mut self, f: impl FnMut(&Device) -> Result<(), DeviceError> + Send + 'static) -> Self {
        self.reset = Some(Box::new(f));
        self
    }
}

struct HandlerEntry {
    channel: String,
    handler: DataHandler,
    active: bool,
}

struct Inner {
    id: String,
    events: Arc<EventManager>,
    properties: PropertyStore,
    machine: StateMachine,
    internal_queue: Arc<StateQueue>,
    attached_queues: Mutex<Vec<Arc<StateQueue>>>,
    channels: RwLock<BTreeMap<String, Channel>>,
    factories: Mutex<HashMap<Transport, FactoryPtr>>,
    default_transport: Mutex<Transport>,
    hooks: Mutex<DeviceHooks>,
    handlers: Mutex<Vec<HandlerEntry>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    machine_active: AtomicBool,
}

#[derive(Clone)]
pub struct Device {
    inner: Arc<Inner>,
}

impl Device {
    pub fn new(id: &str) -> Self {
        let events = Arc::new(EventManager::new());
        let properties = PropertyStore::new(events.clone());
        properties.set("id", id);
        properties.set("session", crate::defaults::SESSION);
        let inner = Arc::new(Inner {
            id: id.to_owned(),
            machine: StateMachine::new(id, events.clone()),
            properties,
            internal_queue: Arc::new(StateQueue::new()),
            attached_queues: Mutex::new(Vec::new()),
            channels: RwLock::new(BTreeMap::new()),
            factories: Mutex::new(HashMap::new()),
            default_transport: Mutex::new(Transport::Zeromq),
            hooks: Mutex::new(DeviceHooks::default()),
            handlers: Mutex::new(Vec::new()),
            worker: Mutex::new(None),
            machine_active: AtomicBool::new(false),
            events,
        });

        // Fan state entries out to the device's own queue and any queue a
        // controller attached. Weak: the subscription must not keep the
        // device alive.
        let weak: Weak<Inner> = Arc::downgrade(&inner);
        inner
            .events
            .subscribe::<StateChangeEvent>("device-state-queues", move |_, state| {
                if let Some(inner) = weak.upgrade() {
                    inner.internal_queue.push(*state);
                    for queue in inner.attached_queues.lock().iter() {
                        queue.push(*state);
                    }
                }
            });
        Self { inner }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The device's property store. Channel parameters are read when the
    /// sockets are created during bind/connect: property changes after
    /// `Bound` have no effect on already-bound sockets.
    pub fn properties(&self) -> &PropertyStore {
        &self.inner.properties
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.inner.events
    }

    pub fn set_default_transport(&self, transport: Transport) {
        if transport != Transport::Default {
            *self.inner.default_transport.lock() = transport;
        }
    }

    pub fn default_transport(&self) -> Transport {
        *self.inner.default_transport.lock()
    }

    pub fn set_hooks(&self, hooks: DeviceHooks) {
        *self.inner.hooks.lock() = hooks;
    }

    /// Add or replace a named channel definition. Accepted until binding
    /// starts; after that, channel identities are frozen.
    pub fn add_channel(&self, name: &str, mut channel: Channel) -> Result<(), DeviceError> {
        let state = self.state();
        if !matches!(
            state,
            State::Idle | State::InitializingDevice | State::Initialized
        ) {
            return Err(DeviceError::OperationCanceled(format!(
                "cannot add channel \"{name}\" in state {state}"
            )));
        }
        channel.set_name(name);
        self.inner.channels.write().insert(name.to_owned(), channel);
        Ok(())
    }

    /// Register a handler for inbound messages on `channel` while Running.
    pub fn on_data(
        &self,
        channel: &str,
        handler: impl FnMut(&Device, &mut Parts) -> Result<bool, DeviceError> + Send + 'static,
    ) {
        self.inner.handlers.lock().push(HandlerEntry {
            channel: channel.to_owned(),
            handler: Box::new(handler),
            active: true,
        });
    }

    fn factory_config(&self) -> FactoryConfig {
        let props = &self.inner.properties;
        let or = |key: &str, default: bool| props.get_or(key, default).unwrap_or(default);
        FactoryConfig {
            session: props
                .get_or("session", crate::defaults::SESSION.to_owned())
                .unwrap_or_else(|_| crate::defaults::SESSION.to_owned()),
            device_id: self.inner.id.clone(),
            shm_segment_size: props
                .get_or("shm-segment-size", crate::defaults::SHM_SEGMENT_SIZE as u64)
                .unwrap_or(crate::defaults::SHM_SEGMENT_SIZE as u64) as usize,
            shm_allocation: props
                .get_or("shm-allocation", String::new())
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
            shm_mlock_segment: or("shm-mlock-segment", false),
            shm_zero_segment: or("shm-zero-segment", false),
            shm_mlock_segment_on_creation: or("shm-mlock-segment-on-creation", false),
            shm_zero_segment_on_creation: or("shm-zero-segment-on-creation", false),
        }
    }

    /// The factory of `kind`, created on first use. `Default` resolves to
    /// the device default.
    pub fn transport(&self, kind: Transport) -> Result<FactoryPtr, TransportError> {
        let kind = match kind {
            Transport::Default => self.default_transport(),
            other => other,
        };
        let mut factories = self.inner.factories.lock();
        if let Some(factory) = factories.get(&kind) {
            return Ok(factory.clone());
        }
        let config = self.factory_config();
        let factory =
            create_transport_factory(kind, &format!("{}.{kind}", self.inner.id), &config)?;
        factories.insert(kind, factory.clone());
        Ok(factory)
    }

    fn channel_socket(
        &self,
        channel: &str,
        sub: usize,
    ) -> Result<crate::transport::SocketPtr, TransferError> {
        let channels = self.inner.channels.read();
        let Some(ch) = channels.get(channel) else {
            warn!("{}: no channel \"{channel}\"", self.inner.id);
            return Err(TransferError::Error);
        };
        match ch.socket(sub) {
            Ok(socket) => Ok(socket.clone()),
            Err(e) => {
                warn!("{}: {e}", self.inner.id);
                Err(TransferError::Error)
            }
        }
    }

    pub fn send(
        &self,
        msg: &mut MessagePtr,
        channel: &str,
        sub: usize,
        timeout_ms: i64,
    ) -> TransferResult {
        self.channel_socket(channel, sub)?.send(msg, timeout_ms)
    }

    pub fn receive(
        &self,
        msg: &mut MessagePtr,
        channel: &str,
        sub: usize,
        timeout_ms: i64,
    ) -> TransferResult {
        self.channel_socket(channel, sub)?.receive(msg, timeout_ms)
    }

    pub fn send_parts(
        &self,
        parts: &mut Parts,
        channel: &str,
        sub: usize,
        timeout_ms: i64,
    ) -> TransferResult {
        self.channel_socket(channel, sub)?.send_parts(parts, timeout_ms)
    }

    pub fn receive_parts(
        &self,
        parts: &mut Parts,
        channel: &str,
        sub: usize,
        timeout_ms: i64,
    ) -> TransferResult {
        self.channel_socket(channel, sub)?
            .receive_parts(parts, timeout_ms)
    }

    /// New empty message on the device default transport.
    pub fn new_message(&self) -> Result<MessagePtr, TransportError> {
        Ok(self.transport(Transport::Default)?.new_message())
    }

    pub fn new_message_with_size(&self, size: usize) -> Result<MessagePtr, TransportError> {
        self.transport(Transport::Default)?.new_message_with_size(size)
    }

    /// New message on the transport of `channel`'s sub-socket.
    pub fn new_message_for(
        &self,
        channel: &str,
        sub: usize,
        size: usize,
    ) -> Result<MessagePtr, TransportError> {
        let kind = {
            let channels = self.inner.channels.read();
            let ch = channels.get(channel).ok_or_else(|| {
                TransportError::Socket(format!("no channel \"{channel}\""))
            })?;
            ch.transport_of(sub, self.default_transport())
        };
        self.transport(kind)?.new_message_with_size(size)
    }

    /// New unmanaged region on the device default transport.
    pub fn new_region(
        &self,
        config: RegionConfig,
        callback: RegionCallback,
    ) -> Result<RegionPtr, TransportError> {
        self.transport(Transport::Default)?.new_region(config, callback)
    }

    /// Poller over the sub-sockets of the named channels.
    pub fn new_poller(&self, channels: &[&str]) -> Result<PollerPtr, TransportError> {
        let map = self.inner.channels.read();
        let mut entries = Vec::new();
        for name in channels {
            let ch = map
                .get(*name)
                .ok_or_else(|| TransportError::Poller(format!("no channel \"{name}\"")))?;
            entries.push(((*name).to_owned(), ch.sockets().to_vec()));
        }
        Ok(Box::new(GenericPoller::new(&entries)))
    }

    // ---- state control ------------------------------------------------

    pub fn state(&self) -> State {
        self.inner.machine.current()
    }

    /// True whenever a transition request is enqueued; the Running-phase
    /// interruption flag.
    pub fn new_state_pending(&self) -> bool {
        self.inner.machine.pending()
    }

    /// Request a transition; `false` when it is not allowed in the current
    /// state.
    pub fn change_state(&self, transition: Transition) -> bool {
        self.change_state_or_throw(transition).is_ok()
    }

    /// Request a transition; rejection is reported as an error.
    pub fn change_state_or_throw(&self, transition: Transition) -> Result<(), DeviceError> {
        self.inner.machine.request(transition)?;
        // Unblock transport waits so the worker observes the request.
        if self.inner.machine.current() == State::Running
            || transition == Transition::ErrorFound
        {
            self.interrupt_transports();
        }
        Ok(())
    }

    /// Block until `state` is entered; `Error` unblocks with an error.
    pub fn wait_for_state(&self, state: State) -> Result<(), DeviceError> {
        self.inner.internal_queue.wait_for_state(state)
    }

    /// A fresh state queue fed with the current state and every subsequent
    /// entry; the rendezvous object for external controllers.
    pub fn attach_state_queue(&self) -> Arc<StateQueue> {
        let queue = Arc::new(StateQueue::new());
        queue.push(self.state());
        self.inner.attached_queues.lock().push(queue.clone());
        queue
    }

    /// Interruptible sleep for hooks: returns `false` when cut short by a
    /// pending state change.
    pub fn wait_for(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            if self.new_state_pending() {
                return false;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            std::thread::sleep(left.min(Duration::from_millis(50)));
        }
        !self.new_state_pending()
    }

    fn interrupt_transports(&self) {
        for factory in self.inner.factories.lock().values() {
            factory.interrupt();
        }
    }

    fn resume_transports(&self) {
        for factory in self.inner.factories.lock().values() {
            factory.resume();
        }
    }

    // ---- machine loop -------------------------------------------------

    /// The blocking driver: consumes the transition queue and runs hooks
    /// until `Exiting` is reached. Returns an error if the device passed
    /// through the `Error` state.
    pub fn run_state_machine(&self) -> Result<(), DeviceError> {
        if self.inner.machine_active.swap(true, Ordering::AcqRel) {
            return Err(DeviceError::OperationInProgress(
                "state machine already running".to_owned(),
            ));
        }
        info!("{}: entering {}", self.inner.id, State::Idle);
        self.inner.internal_queue.push(State::Idle);
        for queue in self.inner.attached_queues.lock().iter() {
            queue.push(State::Idle);
        }

        loop {
            let transition = self.inner.machine.wait_next();
            if self.inner.machine.current() == State::Running {
                // The Running-to-Ready transition must not start before
                // the worker thread has returned.
                self.interrupt_transports();
                if let Some(worker) = self.inner.worker.lock().take() {
                    let _ = worker.join();
                }
            }
            let mut state = self.inner.machine.advance(transition);
            loop {
                match self.enter(state) {
                    Err(e) => {
                        error!("{}: error in {state}: {e}", self.inner.id);
                        self.interrupt_transports();
                        self.inner.machine.fail();
                        break;
                    }
                    Ok(()) => match auto_target(state) {
                        Some(_) => match self.inner.machine.advance_auto() {
                            Some(next) => state = next,
                            None => break,
                        },
                        None => break,
                    },
                }
            }
            if self.inner.machine.current() == State::Exiting {
                break;
            }
        }

        self.inner.machine_active.store(false, Ordering::Release);
        if self.inner.machine.errored() {
            Err(DeviceError::ErrorState)
        } else {
            Ok(())
        }
    }

    /// State-entry actions of the machine thread.
    fn enter(&self, state: State) -> Result<(), DeviceError> {
        match state {
            State::InitializingDevice => {
                self.materialize_channels()?;
                self.run_hook(|h| h.init.as_mut())?;
            }
            State::Initialized => {
                // Early validation report; binding re-checks and fails.
                let channels = self.inner.channels.read();
                for (name, channel) in channels.iter() {
                    if let Err(e) = channel.validate() {
                        warn!("{}: channel \"{name}\" is invalid: {e}", self.inner.id);
                    }
                }
            }
            State::Binding => {
                self.validate_all_channels()?;
                self.init_all_sockets()?;
                let channels = self.inner.channels.read();
                for channel in channels.values() {
                    channel.bind_subs().map_err(DeviceError::from)?;
                }
            }
            State::Connecting => {
                let channels = self.inner.channels.read();
                for channel in channels.values() {
                    channel.connect_subs().map_err(DeviceError::from)?;
                }
            }
            State::InitializingTask => {
                self.run_hook(|h| h.init_task.as_mut())?;
            }
            State::Running => {
                self.resume_transports();
                let device = self.clone();
                *self.inner.worker.lock() =
                    Some(std::thread::spawn(move || device.worker_main()));
            }
            State::ResettingTask => {
                self.run_hook(|h| h.reset_task.as_mut())?;
            }
            State::ResettingDevice => {
                self.run_hook(|h| h.reset.as_mut())?;
                self.release_transports();
            }
            State::Exiting => {
                self.release_transports();
                info!("{}: shutting down", self.inner.id);
            }
            State::Error => {
                self.interrupt_transports();
            }
            State::Bound | State::DeviceReady | State::Ready | State::Idle => {}
            // Ok is a reporting value, never an entered state.
            State::Ok => {}
        }
        Ok(())
    }

    fn run_hook(
        &self,
        select: impl FnOnce(&mut DeviceHooks) -> Option<&mut Hook>,
    ) -> Result<(), DeviceError> {
        let mut hooks = self.inner.hooks.lock();
        if let Some(hook) = select(&mut hooks) {
            hook(self)?;
        }
        Ok(())
    }

    /// Merge `chans.*` properties into the channel map (configuration wins
    /// over earlier programmatic definitions of the same name).
    fn materialize_channels(&self) -> Result<(), DeviceError> {
        let configured = config::channels_from_properties(&self.inner.properties)?;
        let mut channels = self.inner.channels.write();
        for (name, subs) in configured {
            let mut channel = Channel::with_subs(subs);
            channel.set_name(&name);
            channels.insert(name, channel);
        }
        Ok(())
    }

    fn validate_all_channels(&self) -> Result<(), DeviceError> {
        let channels = self.inner.channels.read();
        for channel in channels.values() {
            channel.validate()?;
        }
        Ok(())
    }

    fn init_all_sockets(&self) -> Result<(), DeviceError> {
        let fallback = self.default_transport();
        let mut channels = self.inner.channels.write();
        for channel in channels.values_mut() {
            channel
                .init_sockets(&self.inner.id, |kind| {
                    let kind = if kind == Transport::Default { fallback } else { kind };
                    self.transport(kind)
                })
                .map_err(DeviceError::from)?;
        }
        Ok(())
    }

    fn release_transports(&self) {
        let mut channels = self.inner.channels.write();
        for channel in channels.values_mut() {
            channel.drop_sockets();
        }
        drop(channels);
        self.inner.factories.lock().clear();
    }

    // ---- worker -------------------------------------------------------

    fn worker_main(&self) {
        debug!("{}: worker thread started", self.inner.id);
        if let Err(e) = self.worker_body() {
            error!("{}: error in Running: {e}", self.inner.id);
            let _ = self.change_state(Transition::ErrorFound);
        }
        debug!("{}: worker thread finished", self.inner.id);
    }

    fn worker_body(&self) -> Result<(), DeviceError> {
        self.run_hook(|h| h.pre_run.as_mut())?;

        let has_handlers = self.inner.handlers.lock().iter().any(|h| h.active);
        let has_run = self.inner.hooks.lock().run.is_some();
        let has_conditional = self.inner.hooks.lock().conditional_run.is_some();

        if has_handlers {
            self.handler_loop()?;
        } else if has_run {
            self.run_hook(|h| h.run.as_mut())?;
        } else if has_conditional {
            let mut rates = RateLogger::new();
            loop {
                if self.new_state_pending() {
                    break;
                }
                let keep_going = {
                    let mut hooks = self.inner.hooks.lock();
                    let hook = hooks.conditional_run.as_mut().expect("checked above");
                    hook(self)?
                };
                if !keep_going {
                    debug!("{}: ConditionalRun finished, stopping", self.inner.id);
                    let _ = self.change_state(Transition::Stop);
                    break;
                }
                rates.tick(self);
            }
        } else {
            while !self.new_state_pending() {
                std::thread::sleep(Duration::from_millis(50));
            }
        }

        self.run_hook(|h| h.post_run.as_mut())?;
        Ok(())
    }

    /// Drive registered data handlers: poll their channels, deliver each
    /// inbound part group in arrival order.
    fn handler_loop(&self) -> Result<(), DeviceError> {
        let names: Vec<String> = {
            let handlers = self.inner.handlers.lock();
            handlers.iter().map(|h| h.channel.clone()).collect()
        };
        let poller = self.new_poller(&names.iter().map(|s| s.as_str()).collect::<Vec<_>>())?;
        let sub_counts: Vec<(String, usize)> = {
            let channels = self.inner.channels.read();
            names
                .iter()
                .map(|n| (n.clone(), channels.get(n).map_or(0, |c| c.sub_count())))
                .collect()
        };
        let mut rates = RateLogger::new();

        loop {
            if self.new_state_pending() {
                return Ok(());
            }
            poller.poll(50).map_err(DeviceError::from)?;
            for (name, subs) in &sub_counts {
                for sub in 0..*subs {
                    if !poller.check_input_of(name, sub) {
                        continue;
                    }
                    let mut parts = Parts::new();
                    match self.receive_parts(&mut parts, name, sub, 0) {
                        Ok(_) => self.dispatch(name, &mut parts)?,
                        Err(TransferError::Timeout) => {}
                        Err(TransferError::Interrupted) => return Ok(()),
                        Err(TransferError::Error) => {
                            warn!("{}: receive failed on \"{name}\"", self.inner.id);
                        }
                    }
                }
            }
            if !self.inner.handlers.lock().iter().any(|h| h.active) {
                debug!("{}: all data handlers done, stopping", self.inner.id);
                let _ = self.change_state(Transition::Stop);
                return Ok(());
            }
            rates.tick(self);
        }
    }

    fn dispatch(&self, channel: &str, parts: &mut Parts) -> Result<(), DeviceError> {
        let mut handlers = self.inner.handlers.lock();
        for entry in handlers.iter_mut() {
            if entry.channel != channel || !entry.active {
                continue;
            }
            if !(entry.handler)(self, parts)? {
                entry.active = false;
            }
            break;
        }
        Ok(())
    }

    pub(crate) fn channels_traffic(&self) -> Vec<(String, u64, (u64, u64, u64, u64))> {
        let channels = self.inner.channels.read();
        channels
            .iter()
            .map(|(name, ch)| (name.clone(), ch.rate_interval(), ch.traffic()))
            .collect()
    }
}

/// Per-channel transfer-rate logging at the configured interval.
struct RateLogger {
    since: Instant,
    last: HashMap<String, (Instant, (u64, u64, u64, u64))>,
}

impl RateLogger {
    fn new() -> Self {
        Self {
            since: Instant::now(),
            last: HashMap::new(),
        }
    }

    fn tick(&mut self, device: &Device) {
        // Cheap guard: never evaluate more than once a second.
        if self.since.elapsed() < Duration::from_secs(1) {
            return;
        }
        self.since = Instant::now();
        for (name, interval, traffic) in device.channels_traffic() {
            if interval == 0 {
                continue;
            }
            let now = Instant::now();
            let entry = self.last.entry(name.clone()).or_insert((now, traffic));
            let elapsed = now.duration_since(entry.0).as_secs_f64();
            if elapsed < interval as f64 {
                continue;
            }
            let (in_b, out_b, in_m, out_m) = traffic;
            let (p_in_b, p_out_b, p_in_m, p_out_m) = entry.1;
            info!(
                "{name}: in: {:.0} msg/s ({:.3} MB/s), out: {:.0} msg/s ({:.3} MB/s)",
                (in_m - p_in_m) as f64 / elapsed,
                (in_b - p_in_b) as f64 / elapsed / 1_000_000.0,
                (out_m - p_out_m) as f64 / elapsed,
                (out_b - p_out_b) as f64 / elapsed / 1_000_000.0,
            );
            *entry = (now, traffic);
        }
    }
}
