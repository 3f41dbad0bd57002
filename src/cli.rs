//! # Command-Line Interface Module
//!
//! Every device executable shares this argument surface: identity and
//! session, the default transport, the control mode driving the state
//! machine, channel configuration (file and inline), logging, and the
//! shared-memory tuning knobs. Parsing uses the `clap` derive API so the
//! help output stays in sync with the actual options.

use crate::transport::Transport;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Who drives the device through its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ControlMode {
    /// Scripted sequence: straight to Running, clean shutdown on signal.
    Static,
    /// Keyboard input maps single characters to transitions.
    Interactive,
    /// External cluster controller (requires the cluster integration).
    Dds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportArg {
    Zeromq,
    Shmem,
}

impl From<TransportArg> for Transport {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Zeromq => Transport::Zeromq,
            TransportArg::Shmem => Transport::Shmem,
        }
    }
}

/// Log verbosity, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Severity {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Severity {
    pub fn as_filter(self) -> &'static str {
        match self {
            Severity::Trace => "trace",
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Message-passing device runtime", long_about = None)]
pub struct Args {
    /// Identifier of this device instance
    #[arg(long, help_heading = "Device")]
    pub id: String,

    /// Default transport for channels that do not name their own
    #[arg(long, value_enum, default_value_t = TransportArg::Zeromq, help_heading = "Device")]
    pub transport: TransportArg,

    /// Who drives the state machine
    #[arg(long, value_enum, default_value_t = ControlMode::Interactive, help_heading = "Device")]
    pub control: ControlMode,

    /// Session name; devices sharing data segments or ipc paths must agree
    #[arg(long, default_value = crate::defaults::SESSION, help_heading = "Device")]
    pub session: String,

    /// Path to a channel configuration file (JSON or line format)
    #[arg(long = "mq-config", help_heading = "Channels")]
    pub mq_config: Option<PathBuf>,

    /// Inline channel definition: a comma-separated key=value list with a
    /// leading name=foo selector; may be given multiple times
    #[arg(long = "channel-config", help_heading = "Channels")]
    pub channel_config: Vec<String>,

    /// Log verbosity
    #[arg(long, value_enum, default_value_t = Severity::Info, help_heading = "Output and Logging")]
    pub severity: Severity,

    /// Colorize the log output
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, help_heading = "Output and Logging")]
    pub color: bool,

    /// Size of the default shared-memory data segment in bytes
    #[arg(long = "shm-segment-size", default_value_t = crate::defaults::SHM_SEGMENT_SIZE as u64, help_heading = "Shared Memory")]
    pub shm_segment_size: u64,

    /// Allocator of data segments: rbtree_best_fit or simple_seq_fit
    #[arg(long = "shm-allocation", default_value = "rbtree_best_fit", help_heading = "Shared Memory")]
    pub shm_allocation: String,

    /// mlock data segments on first use
    #[arg(long = "shm-mlock-segment", default_value_t = false, action = clap::ArgAction::Set, help_heading = "Shared Memory")]
    pub shm_mlock_segment: bool,

    /// Zero data segments on first use
    #[arg(long = "shm-zero-segment", default_value_t = false, action = clap::ArgAction::Set, help_heading = "Shared Memory")]
    pub shm_zero_segment: bool,

    /// mlock data segments at creation time
    #[arg(long = "shm-mlock-segment-on-creation", default_value_t = false, action = clap::ArgAction::Set, help_heading = "Shared Memory")]
    pub shm_mlock_segment_on_creation: bool,

    /// Zero data segments at creation time
    #[arg(long = "shm-zero-segment-on-creation", default_value_t = false, action = clap::ArgAction::Set, help_heading = "Shared Memory")]
    pub shm_zero_segment_on_creation: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_invocation_parses_with_defaults() {
        let args = Args::try_parse_from(["dev", "--id", "sampler-1"]).unwrap();
        assert_eq!(args.id, "sampler-1");
        assert_eq!(args.transport, TransportArg::Zeromq);
        assert_eq!(args.control, ControlMode::Interactive);
        assert_eq!(args.session, "default");
        assert!(args.color);
    }

    #[test]
    fn id_is_required() {
        assert!(Args::try_parse_from(["dev"]).is_err());
    }

    #[test]
    fn full_invocation_parses() {
        let args = Args::try_parse_from([
            "dev",
            "--id",
            "sink",
            "--transport",
            "shmem",
            "--control",
            "static",
            "--session",
            "s1",
            "--channel-config",
            "name=data,type=pull,method=connect,address=tcp://127.0.0.1:5555",
            "--channel-config",
            "name=ctl,type=sub,method=connect,address=tcp://127.0.0.1:5556",
            "--severity",
            "debug",
            "--color",
            "false",
            "--shm-segment-size",
            "16777216",
            "--shm-zero-segment-on-creation",
            "true",
        ])
        .unwrap();
        assert_eq!(args.transport, TransportArg::Shmem);
        assert_eq!(args.control, ControlMode::Static);
        assert_eq!(args.channel_config.len(), 2);
        assert_eq!(args.shm_segment_size, 16_777_216);
        assert!(args.shm_zero_segment_on_creation);
        assert!(!args.color);
    }
}
