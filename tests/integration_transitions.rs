//! Lifecycle state machine behavior of a bare device.

use pipemq::{Device, DeviceError, DeviceHooks, State, Transition};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn drive_to_running(device: &Device) {
    for transition in [
        Transition::InitDevice,
        Transition::CompleteInit,
        Transition::Bind,
        Transition::Connect,
        Transition::InitTask,
        Transition::Run,
    ] {
        assert!(device.change_state(transition), "{transition} rejected");
    }
    device.wait_for_state(State::Running).unwrap();
}

#[test]
fn invalid_change_state_returns_false() {
    let device = Device::new("transitions-1");
    let d = device.clone();
    let t = thread::spawn(move || d.run_state_machine());

    assert!(!device.change_state(Transition::Connect));

    assert!(device.change_state(Transition::End));
    t.join().unwrap().unwrap();
}

#[test]
fn invalid_change_state_or_throw_errors() {
    let device = Device::new("transitions-2");
    let d = device.clone();
    let t = thread::spawn(move || d.run_state_machine());

    let err = device.change_state_or_throw(Transition::Connect).unwrap_err();
    assert!(matches!(
        err,
        DeviceError::StateChangeFailed {
            state: State::Idle,
            transition: Transition::Connect
        }
    ));

    device.change_state_or_throw(Transition::End).unwrap();
    t.join().unwrap().unwrap();
}

#[test]
fn full_cycle_visits_every_state_in_order() {
    let device = Device::new("transitions-3");
    let queue = device.attach_state_queue();
    let d = device.clone();
    let t = thread::spawn(move || d.run_state_machine());

    for transition in [
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
    ] {
        assert!(device.change_state(transition), "{transition} rejected");
    }

    let expected = [
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
        State::Ready,
        State::ResettingTask,
        State::DeviceReady,
        State::ResettingDevice,
        State::Idle,
        State::Exiting,
    ];
    for state in expected {
        assert_eq!(queue.wait_for_next().unwrap(), state);
    }
    t.join().unwrap().unwrap();
}

#[test]
fn hook_error_moves_the_machine_to_error_and_end_still_works() {
    let device = Device::new("transitions-4");
    device.set_hooks(
        DeviceHooks::new().init_task(|_| Err(DeviceError::hook("task setup exploded"))),
    );
    let d = device.clone();
    let t = thread::spawn(move || d.run_state_machine());

    for transition in [
        Transition::InitDevice,
        Transition::CompleteInit,
        Transition::Bind,
        Transition::Connect,
        Transition::InitTask,
    ] {
        assert!(device.change_state(transition));
    }
    assert!(matches!(
        device.wait_for_state(State::Ready),
        Err(DeviceError::ErrorState)
    ));

    // Queued requests were drained; only End is meaningful now.
    assert!(!device.change_state(Transition::Run));
    assert!(device.change_state(Transition::End));
    assert!(matches!(t.join().unwrap(), Err(DeviceError::ErrorState)));
}

#[test]
fn end_terminates_from_running_within_bounded_time() {
    let device = Device::new("transitions-5");
    let d = device.clone();
    let t = thread::spawn(move || d.run_state_machine());
    drive_to_running(&device);

    let start = Instant::now();
    pipemq::runner::drive_to_exit(&device);
    t.join().unwrap().unwrap();
    assert!(
        start.elapsed() < Duration::from_secs(5),
        "shutdown took {:?}",
        start.elapsed()
    );
}

#[test]
fn wait_for_is_interrupted_by_a_pending_state_change() {
    let device = Device::new("transitions-6");
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    device.set_hooks(DeviceHooks::new().run(move |dev| {
        if !dev.wait_for(Duration::from_secs(60)) {
            flag.store(true, Ordering::SeqCst);
        }
        Ok(())
    }));
    let d = device.clone();
    let t = thread::spawn(move || d.run_state_machine());
    drive_to_running(&device);

    thread::sleep(Duration::from_millis(100));
    let start = Instant::now();
    assert!(device.change_state(Transition::Stop));
    device.wait_for_state(State::Ready).unwrap();
    assert!(start.elapsed() < Duration::from_secs(2));
    assert!(interrupted.load(Ordering::SeqCst), "sleep was not cut short");

    pipemq::runner::drive_to_exit(&device);
    t.join().unwrap().unwrap();
}
