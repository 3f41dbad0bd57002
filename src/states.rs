//! Device lifecycle states, transitions and the state queue.
//!
//! The transition graph is the single source of truth for what a controller
//! may ask of a device. `next_state` encodes it; everything else (the state
//! machine, the controllers, the tests) consults that one function.

use crate::error::DeviceError;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Lifecycle states of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Ok,
    Error,
    Idle,
    InitializingDevice,
    Initialized,
    Binding,
    Bound,
    Connecting,
    DeviceReady,
    InitializingTask,
    Ready,
    Running,
    ResettingTask,
    ResettingDevice,
    Exiting,
}

/// Requests that move a device between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    /// Internal completion, generated by the machine itself after the entry
    /// work of an intermediate state returns normally.
    Auto,
    InitDevice,
    CompleteInit,
    Bind,
    Connect,
    InitTask,
    Run,
    Stop,
    ResetTask,
    ResetDevice,
    End,
    ErrorFound,
}

impl State {
    pub fn name(self) -> &'static str {
        match self {
            State::Ok => "OK",
            State::Error => "ERROR",
            State::Idle => "IDLE",
            State::InitializingDevice => "INITIALIZING DEVICE",
            State::Initialized => "INITIALIZED",
            State::Binding => "BINDING",
            State::Bound => "BOUND",
            State::Connecting => "CONNECTING",
            State::DeviceReady => "DEVICE READY",
            State::InitializingTask => "INITIALIZING TASK",
            State::Ready => "READY",
            State::Running => "RUNNING",
            State::ResettingTask => "RESETTING TASK",
            State::ResettingDevice => "RESETTING DEVICE",
            State::Exiting => "EXITING",
        }
    }
}

impl Transition {
    pub fn name(self) -> &'static str {
        match self {
            Transition::Auto => "AUTO",
            Transition::InitDevice => "INIT DEVICE",
            Transition::CompleteInit => "COMPLETE INIT",
            Transition::Bind => "BIND",
            Transition::Connect => "CONNECT",
            Transition::InitTask => "INIT TASK",
            Transition::Run => "RUN",
            Transition::Stop => "STOP",
            Transition::ResetTask => "RESET TASK",
            Transition::ResetDevice => "RESET DEVICE",
            Transition::End => "END",
            Transition::ErrorFound => "ERROR FOUND",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for State {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const ALL: [State; 15] = [
            State::Ok,
            State::Error,
            State::Idle,
            State::InitializingDevice,
            State::Initialized,
            State::Binding,
            State::Bound,
            State::Connecting,
            State::DeviceReady,
            State::InitializingTask,
            State::Ready,
            State::Running,
            State::ResettingTask,
            State::ResettingDevice,
            State::Exiting,
        ];
        ALL.iter()
            .copied()
            .find(|st| st.name() == s)
            .ok_or_else(|| format!("unknown state: \"{s}\""))
    }
}

impl FromStr for Transition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const ALL: [Transition; 12] = [
            Transition::Auto,
            Transition::InitDevice,
            Transition::CompleteInit,
            Transition::Bind,
            Transition::Connect,
            Transition::InitTask,
            Transition::Run,
            Transition::Stop,
            Transition::ResetTask,
            Transition::ResetDevice,
            Transition::End,
            Transition::ErrorFound,
        ];
        ALL.iter()
            .copied()
            .find(|tr| tr.name() == s)
            .ok_or_else(|| format!("unknown transition: \"{s}\""))
    }
}

/// The destination of `transition` taken from `from`, or `None` when the
/// request is illegal in that state.
pub fn next_state(from: State, transition: Transition) -> Option<State> {
    use State as S;
    use Transition as T;

    // Any state (except a device already past teardown) may fail over.
    if transition == T::ErrorFound {
        return if from == S::Exiting { None } else { Some(S::Error) };
    }

    match (from, transition) {
        (S::Idle, T::InitDevice) => Some(S::InitializingDevice),
        (S::Idle, T::End) => Some(S::Exiting),
        (S::InitializingDevice, T::CompleteInit) => Some(S::Initialized),
        (S::Initialized, T::Bind) => Some(S::Binding),
        (S::Binding, T::Auto) => Some(S::Bound),
        (S::Bound, T::Connect) => Some(S::Connecting),
        (S::Connecting, T::Auto) => Some(S::DeviceReady),
        (S::DeviceReady, T::InitTask) => Some(S::InitializingTask),
        (S::DeviceReady, T::ResetDevice) => Some(S::ResettingDevice),
        (S::InitializingTask, T::Auto) => Some(S::Ready),
        (S::Ready, T::Run) => Some(S::Running),
        (S::Ready, T::ResetTask) => Some(S::ResettingTask),
        (S::Running, T::Stop) => Some(S::Ready),
        (S::ResettingTask, T::Auto) => Some(S::DeviceReady),
        (S::ResettingDevice, T::Auto) => Some(S::Idle),
        (S::Error, T::End) => Some(S::Exiting),
        _ => None,
    }
}

/// Destination of the internal completion for `state`, if it has one.
pub fn auto_target(state: State) -> Option<State> {
    next_state(state, Transition::Auto)
}

/// `state` after all internal completions have run, e.g. a `Bind` request
/// from `Initialized` settles in `Bound`.
pub fn settle(mut state: State) -> State {
    while let Some(next) = auto_target(state) {
        state = next;
    }
    state
}

/// Thread-safe FIFO of observed state arrivals, the rendezvous between a
/// device's state machine and external controllers.
///
/// Consumers block until a state is available, a timeout elapses, or a
/// custom predicate (a controller's "please quit") fires. Observing the
/// `Error` state unblocks every wait with [`DeviceError::ErrorState`]; the
/// error entry is left at the front so later waits fail too.
#[derive(Default)]
pub struct StateQueue {
    states: Mutex<VecDeque<State>>,
    cv: Condvar,
}

impl StateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, state: State) {
        self.states.lock().push_back(state);
        self.cv.notify_all();
    }

    /// Wake all waiters without pushing, so they can re-evaluate custom
    /// predicates (used by controllers on signal delivery).
    pub fn notify(&self) {
        self.cv.notify_all();
    }

    pub fn clear(&self) {
        self.states.lock().clear();
    }

    /// Block until the next state arrives and pop it.
    pub fn wait_for_next(&self) -> Result<State, DeviceError> {
        let mut states = self.states.lock();
        while states.is_empty() {
            self.cv.wait(&mut states);
        }
        Self::pop_front(&mut states)
    }

    /// Like [`wait_for_next`](Self::wait_for_next) with a deadline; `None`
    /// means the timeout elapsed with nothing to pop.
    pub fn wait_for_next_timeout(&self, timeout: Duration) -> Result<Option<State>, DeviceError> {
        let deadline = Instant::now() + timeout;
        let mut states = self.states.lock();
        while states.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let _ = self.cv.wait_for(&mut states, deadline - now);
        }
        Self::pop_front(&mut states).map(Some)
    }

    /// Consume states until `state` arrives.
    pub fn wait_for_state(&self, state: State) -> Result<(), DeviceError> {
        while self.wait_for_next()? != state {}
        Ok(())
    }

    /// Consume states until `state` arrives or `quit` returns true.
    /// `Ok(true)` means the state arrived, `Ok(false)` the predicate fired.
    pub fn wait_for_state_or(
        &self,
        state: State,
        quit: impl Fn() -> bool,
    ) -> Result<bool, DeviceError> {
        loop {
            if quit() {
                return Ok(false);
            }
            match self.wait_for_next_timeout(Duration::from_millis(50))? {
                Some(st) if st == state => return Ok(true),
                _ => {}
            }
        }
    }

    fn pop_front(states: &mut VecDeque<State>) -> Result<State, DeviceError> {
        match states.front() {
            Some(State::Error) => Err(DeviceError::ErrorState),
            Some(_) => Ok(states.pop_front().expect("checked non-empty")),
            None => unreachable!("pop_front called on empty queue"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn names_round_trip() {
        for st in [State::InitializingDevice, State::DeviceReady, State::Idle] {
            assert_eq!(st.name().parse::<State>().unwrap(), st);
        }
        for tr in [Transition::CompleteInit, Transition::ErrorFound] {
            assert_eq!(tr.name().parse::<Transition>().unwrap(), tr);
        }
        assert!("BOGUS".parse::<State>().is_err());
    }

    #[test]
    fn graph_accepts_the_full_cycle() {
        let mut state = State::Idle;
        for tr in [
            Transition::InitDevice,
            Transition::CompleteInit,
            Transition::Bind,
            Transition::Auto,
            Transition::Connect,
            Transition::Auto,
            Transition::InitTask,
            Transition::Auto,
            Transition::Run,
            Transition::Stop,
            Transition::ResetTask,
            Transition::Auto,
            Transition::ResetDevice,
            Transition::Auto,
            Transition::End,
        ] {
            state = next_state(state, tr).unwrap_or_else(|| panic!("{tr} rejected in {state}"));
        }
        assert_eq!(state, State::Exiting);
    }

    #[test]
    fn graph_rejects_out_of_order_requests() {
        assert_eq!(next_state(State::Idle, Transition::Connect), None);
        assert_eq!(next_state(State::Running, Transition::Run), None);
        assert_eq!(next_state(State::Ready, Transition::End), None);
        // ERROR FOUND is legal everywhere except past teardown.
        assert_eq!(next_state(State::Running, Transition::ErrorFound), Some(State::Error));
        assert_eq!(next_state(State::Exiting, Transition::ErrorFound), None);
        // END only from IDLE or ERROR.
        assert_eq!(next_state(State::Error, Transition::End), Some(State::Exiting));
    }

    #[test]
    fn settle_follows_internal_completions() {
        assert_eq!(settle(State::Binding), State::Bound);
        assert_eq!(settle(State::Connecting), State::DeviceReady);
        assert_eq!(settle(State::ResettingDevice), State::Idle);
        assert_eq!(settle(State::Ready), State::Ready);
    }

    #[test]
    fn queue_delivers_in_fifo_order() {
        let q = StateQueue::new();
        q.push(State::Idle);
        q.push(State::InitializingDevice);
        assert_eq!(q.wait_for_next().unwrap(), State::Idle);
        assert_eq!(q.wait_for_next().unwrap(), State::InitializingDevice);
    }

    #[test]
    fn queue_times_out_empty() {
        let q = StateQueue::new();
        let start = Instant::now();
        let res = q.wait_for_next_timeout(Duration::from_millis(50)).unwrap();
        assert!(res.is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn queue_unblocks_waiter_across_threads() {
        let q = Arc::new(StateQueue::new());
        let q2 = q.clone();
        let t = thread::spawn(move || q2.wait_for_state(State::Running));
        thread::sleep(Duration::from_millis(20));
        q.push(State::Ready);
        q.push(State::Running);
        t.join().unwrap().unwrap();
    }

    #[test]
    fn error_state_poisons_the_queue() {
        let q = StateQueue::new();
        q.push(State::Error);
        assert!(matches!(q.wait_for_next(), Err(DeviceError::ErrorState)));
        // The error entry stays, subsequent waits keep failing.
        assert!(matches!(q.wait_for_next(), Err(DeviceError::ErrorState)));
    }
}
