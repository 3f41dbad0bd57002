//! # Device Launcher and Controllers
//!
//! The launcher owns everything a device `main` needs around the core:
//! logging initialization, signal capture, configuration loading, the
//! controller thread that drives the state machine, and the mapping of
//! outcomes to process exit codes (0 = clean shutdown, 1 = uncaught error
//! in hooks or the machine, 2 = catastrophic failure at the outermost
//! frame).
//!
//! Two controllers ship with the core. The *static* controller scripts the
//! full startup sequence to `Running` and shuts down cleanly on a signal
//! or when the device stops itself. The *interactive* controller maps
//! keyboard input to transitions. External cluster control is an
//! integration of its own and only surfaces here as a configuration error.

use crate::cli::{Args, ControlMode};
use crate::config;
use crate::device::Device;
use crate::error::{ConfigError, DeviceError};
use crate::logging::init_logging;
use crate::signal;
use crate::states::{State, Transition};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Launch a device: configure from `args`, let `setup` register channels,
/// hooks and handlers, then drive the state machine to completion.
/// Returns the process exit code.
pub fn run(args: Args, setup: impl FnOnce(&Device) -> Result<(), DeviceError>) -> i32 {
    init_logging(args.severity, args.color);
    match catch_unwind(AssertUnwindSafe(|| run_inner(args, setup))) {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            error!("device failed: {e}");
            1
        }
        Err(_) => {
            error!("catastrophic failure, aborting");
            2
        }
    }
}

fn run_inner(
    args: Args,
    setup: impl FnOnce(&Device) -> Result<(), DeviceError>,
) -> Result<(), DeviceError> {
    if args.control == ControlMode::Dds {
        return Err(DeviceError::Config(ConfigError::Parse {
            input: "--control dds".to_owned(),
            reason: "external cluster control is not available in this build \
                     (DDS_SESSION_ID would name the session)"
                .to_owned(),
        }));
    }
    signal::install().map_err(|e| {
        DeviceError::OperationCanceled(format!("cannot install signal handlers: {e}"))
    })?;

    let device = Device::new(&args.id);
    configure_device(&device, &args)?;
    setup(&device)?;

    let controller = {
        let device = device.clone();
        match args.control {
            ControlMode::Static => std::thread::spawn(move || static_controller(device)),
            ControlMode::Interactive => std::thread::spawn(move || interactive_controller(device)),
            ControlMode::Dds => unreachable!("rejected above"),
        }
    };

    let result = device.run_state_machine();
    let _ = controller.join();
    result
}

/// Apply the command-line surface to the device's property store.
pub fn configure_device(device: &Device, args: &Args) -> Result<(), DeviceError> {
    let props = device.properties();
    props.set("session", args.session.as_str());
    props.set("shm-segment-size", args.shm_segment_size);
    args.shm_allocation
        .parse::<crate::transport::SegmentAlgorithm>()
        .map_err(DeviceError::from)?;
    props.set("shm-allocation", args.shm_allocation.as_str());
    props.set("shm-mlock-segment", args.shm_mlock_segment);
    props.set("shm-zero-segment", args.shm_zero_segment);
    props.set(
        "shm-mlock-segment-on-creation",
        args.shm_mlock_segment_on_creation,
    );
    props.set(
        "shm-zero-segment-on-creation",
        args.shm_zero_segment_on_creation,
    );
    device.set_default_transport(args.transport.into());

    if let Some(path) = &args.mq_config {
        for (key, value) in config::load_config_file(path)? {
            props.set(&key, value);
        }
    }
    for (key, value) in config::parse_suboptions(&args.channel_config)? {
        props.set(&key, value);
    }
    Ok(())
}

fn signal_seen() -> bool {
    signal::pending().is_some()
}

/// Scripted controller: Idle → Running, then wait for a stop condition
/// and shut down in order.
pub fn static_controller(device: Device) {
    let queue = device.attach_state_queue();
    let result = (|| -> Result<(), DeviceError> {
        const SEQUENCE: [(Transition, State); 6] = [
            (Transition::InitDevice, State::InitializingDevice),
            (Transition::CompleteInit, State::Initialized),
            (Transition::Bind, State::Bound),
            (Transition::Connect, State::DeviceReady),
            (Transition::InitTask, State::Ready),
            (Transition::Run, State::Running),
        ];
        for (transition, state) in SEQUENCE {
            device.change_state_or_throw(transition)?;
            if !queue.wait_for_state_or(state, signal_seen)? {
                return Ok(()); // signal during startup
            }
        }
        // Running: wait for a signal, a self-stop (Ready arrives), or an
        // error (the queue wait fails).
        loop {
            if signal_seen() {
                info!("signal received, shutting down");
                return Ok(());
            }
            if let Some(State::Ready) = queue.wait_for_next_timeout(Duration::from_millis(50))? {
                return Ok(());
            }
        }
    })();
    if let Err(DeviceError::ErrorState) = result {
        warn!("device moved to ERROR, requesting shutdown");
    } else if let Err(e) = result {
        error!("static controller failed: {e}");
    }
    drive_to_exit(&device);
}

/// Keyboard-driven controller; `h` prints the key map.
pub fn interactive_controller(device: Device) {
    print_interactive_help();
    let (tx, rx) = crossbeam::channel::unbounded::<char>();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            match std::io::BufRead::read_line(&mut stdin.lock(), &mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    for ch in line.chars().filter(|c| !c.is_whitespace()) {
                        if tx.send(ch).is_err() {
                            return;
                        }
                    }
                }
            }
        }
    });

    loop {
        if signal_seen() {
            info!("signal received, shutting down");
            break;
        }
        if device.state() == State::Exiting {
            return;
        }
        let key = match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(key) => key,
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
        };
        let transition = match key {
            'i' => Transition::InitDevice,
            'k' => Transition::CompleteInit,
            'b' => Transition::Bind,
            'x' => Transition::Connect,
            'j' => Transition::InitTask,
            'r' => Transition::Run,
            's' => Transition::Stop,
            't' => Transition::ResetTask,
            'd' => Transition::ResetDevice,
            'h' => {
                print_interactive_help();
                continue;
            }
            'q' => break,
            other => {
                warn!("no transition bound to key '{other}'");
                continue;
            }
        };
        if let Err(e) = device.change_state_or_throw(transition) {
            warn!("{e}");
        }
    }
    drive_to_exit(&device);
}

fn print_interactive_help() {
    info!("Use keys to control the device state machine:");
    info!("[i] init device, [k] complete init, [b] bind, [x] connect, [j] init task");
    info!("[r] run, [s] stop, [t] reset task, [d] reset device, [h] help, [q] end");
}

/// Shepherd the device from wherever it is down to `Exiting`, issuing only
/// legal transitions. This is what turns an "end" request in an arbitrary
/// state into a bounded, clean teardown.
pub fn drive_to_exit(device: &Device) {
    let overall = Instant::now() + Duration::from_secs(30);
    loop {
        if Instant::now() >= overall {
            error!("shutdown did not complete in time, giving up");
            return;
        }
        let state = device.state();
        let step = match state {
            State::Exiting => return,
            State::Idle | State::Error => {
                let _ = device.change_state(Transition::End);
                settle(device, |s| s == State::Exiting);
                return;
            }
            State::Running => Some((Transition::Stop, State::Ready)),
            State::Ready => Some((Transition::ResetTask, State::DeviceReady)),
            State::DeviceReady => Some((Transition::ResetDevice, State::Idle)),
            State::InitializingDevice => Some((Transition::CompleteInit, State::Initialized)),
            // No downward edge exists before DeviceReady: continue the
            // forward path, the reset edges bring us back.
            State::Initialized => Some((Transition::Bind, State::Bound)),
            State::Bound => Some((Transition::Connect, State::DeviceReady)),
            // Transient states settle on their own.
            _ => None,
        };
        match step {
            Some((transition, target)) => {
                if !device.change_state(transition) {
                    // Someone else queued a transition first; let the
                    // machine settle and re-evaluate.
                    std::thread::sleep(Duration::from_millis(10));
                    continue;
                }
                settle(device, |s| s == target || s == State::Error);
            }
            None => std::thread::sleep(Duration::from_millis(10)),
        }
    }
}

/// Poll until the device state satisfies `done` or a step timeout passes.
fn settle(device: &Device, done: impl Fn(State) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if done(device.state()) {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
