//! Signal-driven shutdown: a device sleeping in PreRun exits cleanly and
//! promptly when SIGINT arrives.
//!
//! This file holds a single test on purpose: it installs the process-wide
//! signal handler and raises a real SIGINT.

use nix::sys::signal::{raise, Signal};
use pipemq::cli::{Args, ControlMode, Severity, TransportArg};
use pipemq::{DeviceHooks, runner, signal};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

fn args(id: &str) -> Args {
    Args {
        id: id.to_owned(),
        transport: TransportArg::Zeromq,
        control: ControlMode::Static,
        session: format!("sig-{}", uuid::Uuid::new_v4().simple()),
        mq_config: None,
        channel_config: Vec::new(),
        severity: Severity::Info,
        color: false,
        shm_segment_size: 1 << 20,
        shm_allocation: "rbtree_best_fit".to_owned(),
        shm_mlock_segment: false,
        shm_zero_segment: false,
        shm_mlock_segment_on_creation: false,
        shm_zero_segment_on_creation: false,
    }
}

#[test]
fn sigint_during_pre_run_shuts_down_with_exit_code_zero() {
    signal::reset();
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();

    let killer = std::thread::spawn(|| {
        std::thread::sleep(Duration::from_secs(1));
        raise(Signal::SIGINT).unwrap();
    });

    let start = Instant::now();
    let exit_code = runner::run(args("signals-prerun"), move |device| {
        device.set_hooks(DeviceHooks::new().pre_run(move |dev| {
            if dev.wait_for(Duration::from_secs(60)) {
                info!("Sleeping Done.");
            } else {
                info!("Sleeping Done. Interrupted.");
                flag.store(true, Ordering::SeqCst);
            }
            Ok(())
        }));
        Ok(())
    });
    killer.join().unwrap();

    assert_eq!(exit_code, 0);
    assert!(
        start.elapsed() < Duration::from_secs(5),
        "shutdown took {:?}",
        start.elapsed()
    );
    assert!(
        interrupted.load(Ordering::SeqCst),
        "the 60 s sleep was not interrupted"
    );
    signal::reset();
}
