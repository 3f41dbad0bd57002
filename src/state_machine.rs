//! The controlled lifecycle: a FIFO of validated transition requests.
//!
//! External controllers call [`StateMachine::request`]; the machine thread
//! (driven by `Device::run_state_machine`) pops requests in order, applies
//! them, and generates the internal `Auto` completions itself. A request is
//! validated fast against the *front* state (the state the machine will
//! settle in after everything already queued, internal completions
//! included), so a controller may enqueue a whole startup burst without
//! waiting in between, and an illegal request never touches the machine.

use crate::error::DeviceError;
use crate::events::{Event, EventManager};
use crate::states::{auto_target, next_state, settle, State, Transition};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error};

/// Emitted on every state entry; key is the device id.
pub struct StateChangeEvent;
impl Event for StateChangeEvent {
    type Key = String;
    type Payload = State;
}

struct Inner {
    current: State,
    front: State,
    queue: VecDeque<Transition>,
    errored: bool,
}

pub struct StateMachine {
    id: String,
    state: Mutex<Inner>,
    cv: Condvar,
    events: Arc<EventManager>,
}

impl StateMachine {
    pub fn new(id: &str, events: Arc<EventManager>) -> Self {
        Self {
            id: id.to_owned(),
            state: Mutex::new(Inner {
                current: State::Idle,
                front: State::Idle,
                queue: VecDeque::new(),
                errored: false,
            }),
            cv: Condvar::new(),
            events,
        }
    }

    pub fn current(&self) -> State {
        self.state.lock().current
    }

    /// The state the machine will settle in once the queue drains.
    pub fn front(&self) -> State {
        self.state.lock().front
    }

    pub fn errored(&self) -> bool {
        self.state.lock().errored
    }

    /// A transition request is enqueued but not yet applied; this is the
    /// global "new state pending" interruption flag.
    pub fn pending(&self) -> bool {
        !self.state.lock().queue.is_empty()
    }

    /// Validate and enqueue an external transition request. Illegal
    /// requests fail fast and leave the machine untouched.
    pub fn request(&self, transition: Transition) -> Result<(), DeviceError> {
        let mut inner = self.state.lock();
        let dest = next_state(inner.front, transition).ok_or(DeviceError::StateChangeFailed {
            state: inner.front,
            transition,
        })?;
        debug!("{}: requesting {transition}", self.id);
        inner.queue.push_back(transition);
        inner.front = settle(dest);
        drop(inner);
        self.cv.notify_all();
        Ok(())
    }

    /// Block the machine thread until the next queued transition.
    pub(crate) fn wait_next(&self) -> Transition {
        let mut inner = self.state.lock();
        loop {
            if let Some(transition) = inner.queue.pop_front() {
                return transition;
            }
            self.cv.wait(&mut inner);
        }
    }

    /// Apply `transition` from the current state and announce the entry.
    /// Only the machine thread calls this; the queue discipline guarantees
    /// the transition is legal.
    pub(crate) fn advance(&self, transition: Transition) -> State {
        let dest = {
            let mut inner = self.state.lock();
            let dest = match next_state(inner.current, transition) {
                Some(dest) => dest,
                None => {
                    // Can only happen if an earlier entry failed over
                    // between validation and application; fold into Error.
                    error!(
                        "{}: {transition} impossible from {}, entering ERROR",
                        self.id, inner.current
                    );
                    State::Error
                }
            };
            inner.current = dest;
            if dest == State::Error {
                inner.queue.clear();
                inner.front = State::Error;
                inner.errored = true;
            }
            dest
        };
        debug!("{}: entering {dest}", self.id);
        self.events.emit::<StateChangeEvent>(&self.id, &dest);
        dest
    }

    /// Internal completion of the current state, if it has one.
    pub(crate) fn advance_auto(&self) -> Option<State> {
        let has_auto = auto_target(self.state.lock().current).is_some();
        has_auto.then(|| self.advance(Transition::Auto))
    }

    /// A state-entry action failed: drain the queue and fail over.
    pub(crate) fn fail(&self) {
        {
            let mut inner = self.state.lock();
            inner.queue.clear();
            inner.current = State::Error;
            inner.front = State::Error;
            inner.errored = true;
        }
        self.events.emit::<StateChangeEvent>(&self.id, &State::Error);
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> StateMachine {
        StateMachine::new("test", Arc::new(EventManager::new()))
    }

    #[test]
    fn illegal_request_fails_fast_and_changes_nothing() {
        let m = machine();
        let err = m.request(Transition::Connect).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::StateChangeFailed {
                state: State::Idle,
                transition: Transition::Connect
            }
        ));
        assert_eq!(m.current(), State::Idle);
        assert!(!m.pending());
    }

    #[test]
    fn burst_of_requests_validates_against_front() {
        let m = machine();
        for t in [
            Transition::InitDevice,
            Transition::CompleteInit,
            Transition::Bind,
            Transition::Connect,
            Transition::InitTask,
            Transition::Run,
        ] {
            m.request(t).unwrap_or_else(|e| panic!("{t} rejected: {e}"));
        }
        assert_eq!(m.front(), State::Running);
        assert_eq!(m.current(), State::Idle, "nothing applied yet");
        // A second Run is illegal against the front state.
        assert!(m.request(Transition::Run).is_err());
    }

    #[test]
    fn advance_applies_in_fifo_order_with_auto_completions() {
        let m = machine();
        m.request(Transition::InitDevice).unwrap();
        m.request(Transition::CompleteInit).unwrap();
        m.request(Transition::Bind).unwrap();

        assert_eq!(m.advance(m.wait_next()), State::InitializingDevice);
        assert_eq!(m.advance(m.wait_next()), State::Initialized);
        assert_eq!(m.advance(m.wait_next()), State::Binding);
        assert_eq!(m.advance_auto(), Some(State::Bound));
        assert_eq!(m.advance_auto(), None);
        assert!(!m.pending());
    }

    #[test]
    fn failure_drains_the_queue() {
        let m = machine();
        m.request(Transition::InitDevice).unwrap();
        m.request(Transition::CompleteInit).unwrap();
        let _ = m.advance(m.wait_next());
        m.fail();
        assert_eq!(m.current(), State::Error);
        assert!(!m.pending(), "queued requests are drained");
        assert!(m.errored());
        // End remains available from Error.
        m.request(Transition::End).unwrap();
        assert_eq!(m.advance(m.wait_next()), State::Exiting);
    }
}
