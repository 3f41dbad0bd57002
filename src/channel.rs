//! Named, validated channel configuration and its sub-sockets.
//!
//! A channel is either valid (accepted method, address and non-negative
//! tunables on every sub-socket) or invalid; only valid channels take part
//! in state transitions past binding/connecting. A single channel name may
//! fan out to multiple peers through its ordered list of sub-sockets.

use crate::error::{ConfigError, TransportError};
use crate::transport::{
    FactoryPtr, SocketPtr, SocketType, Transport, OPT_LINGER, OPT_RCV_HWM, OPT_RCV_KERNEL_SIZE,
    OPT_SND_HWM, OPT_SND_KERNEL_SIZE,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Whether a sub-socket opens a listening endpoint or dials out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Bind,
    Connect,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Bind => "bind",
            Method::Connect => "connect",
        })
    }
}

impl FromStr for Method {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bind" => Ok(Method::Bind),
            "connect" => Ok(Method::Connect),
            other => Err(ConfigError::Parse {
                input: other.to_owned(),
                reason: "expected \"bind\" or \"connect\"".to_owned(),
            }),
        }
    }
}

/// Configuration of one sub-socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SocketConfig {
    #[serde(rename = "type")]
    pub socket_type: SocketType,
    pub method: Method,
    pub address: String,
    /// Send high-water mark in messages.
    pub snd_buf_size: i32,
    /// Receive high-water mark in messages.
    pub rcv_buf_size: i32,
    /// Kernel send buffer in bytes (0 keeps the OS default).
    pub snd_kernel_size: i32,
    pub rcv_kernel_size: i32,
    pub linger: i32,
    /// Rate-logging interval in seconds, 0 disables.
    pub rate_logging: i32,
    pub transport: Transport,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            socket_type: SocketType::Pair,
            method: Method::Connect,
            address: String::new(),
            snd_buf_size: crate::defaults::SND_BUF_SIZE,
            rcv_buf_size: crate::defaults::RCV_BUF_SIZE,
            snd_kernel_size: 0,
            rcv_kernel_size: 0,
            linger: crate::defaults::LINGER_MS,
            rate_logging: 1,
            transport: Transport::Default,
        }
    }
}

const ADDRESS_SCHEMES: [&str; 4] = ["tcp://", "ipc://", "inproc://", "verbs://"];

impl SocketConfig {
    fn validate(&self, channel: &str, index: usize) -> Result<(), ConfigError> {
        let fail = |reason: String| {
            Err(ConfigError::InvalidChannel {
                channel: format!("{channel}[{index}]"),
                reason,
            })
        };
        let scheme = ADDRESS_SCHEMES
            .iter()
            .find(|s| self.address.starts_with(**s));
        match scheme {
            None => {
                return fail(format!(
                    "address \"{}\" does not match tcp://, ipc://, inproc:// or verbs://",
                    self.address
                ))
            }
            Some(s) if self.address.len() == s.len() => {
                return fail("address has an empty authority".to_owned())
            }
            Some(_) => {}
        }
        for (name, value) in [
            ("sndBufSize", self.snd_buf_size),
            ("rcvBufSize", self.rcv_buf_size),
            ("sndKernelSize", self.snd_kernel_size),
            ("rcvKernelSize", self.rcv_kernel_size),
            ("rateLogging", self.rate_logging),
        ] {
            if value < 0 {
                return fail(format!("{name} is negative ({value})"));
            }
        }
        Ok(())
    }
}

/// A named channel: configuration plus (once initialized) live sockets.
pub struct Channel {
    name: String,
    subs: Vec<SocketConfig>,
    sockets: Vec<SocketPtr>,
}

impl Channel {
    /// Single sub-socket channel with default tunables.
    pub fn new(socket_type: SocketType, method: Method, address: &str) -> Self {
        Self::with_subs(vec![SocketConfig {
            socket_type,
            method,
            address: address.to_owned(),
            ..SocketConfig::default()
        }])
    }

    pub fn from_config(config: SocketConfig) -> Self {
        Self::with_subs(vec![config])
    }

    pub fn with_subs(subs: Vec<SocketConfig>) -> Self {
        Self {
            name: String::new(),
            subs,
            sockets: Vec::new(),
        }
    }

    pub(crate) fn set_name(&mut self, name: &str) {
        self.name = name.to_owned();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subs(&self) -> &[SocketConfig] {
        &self.subs
    }

    pub fn sub_count(&self) -> usize {
        self.subs.len()
    }

    /// Resolved transport of sub `index` (`Default` falls back to
    /// `fallback`).
    pub fn transport_of(&self, index: usize, fallback: Transport) -> Transport {
        match self.subs.get(index).map(|s| s.transport) {
            Some(Transport::Default) | None => fallback,
            Some(t) => t,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subs.is_empty() {
            return Err(ConfigError::InvalidChannel {
                channel: self.name.clone(),
                reason: "channel has no sub-sockets".to_owned(),
            });
        }
        for (index, sub) in self.subs.iter().enumerate() {
            sub.validate(&self.name, index)?;
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    pub(crate) fn sockets(&self) -> &[SocketPtr] {
        &self.sockets
    }

    pub(crate) fn socket(&self, index: usize) -> Result<&SocketPtr, TransportError> {
        self.sockets.get(index).ok_or_else(|| {
            TransportError::Socket(format!(
                "channel \"{}\" has no initialized sub-socket {index}",
                self.name
            ))
        })
    }

    /// Create the sub-sockets against their factories and apply tunables.
    /// Idempotent: existing sockets are kept.
    pub(crate) fn init_sockets<F>(&mut self, device_id: &str, factory: F) -> Result<(), TransportError>
    where
        F: Fn(Transport) -> Result<FactoryPtr, TransportError>,
    {
        if !self.sockets.is_empty() {
            return Ok(());
        }
        for (index, sub) in self.subs.iter().enumerate() {
            let fac = factory(sub.transport)?;
            let socket = fac.new_socket(
                sub.socket_type,
                &format!("{}[{index}].{device_id}", self.name),
            )?;
            socket.set_option(OPT_LINGER, sub.linger)?;
            socket.set_option(OPT_SND_HWM, sub.snd_buf_size)?;
            socket.set_option(OPT_RCV_HWM, sub.rcv_buf_size)?;
            socket.set_option(OPT_SND_KERNEL_SIZE, sub.snd_kernel_size)?;
            socket.set_option(OPT_RCV_KERNEL_SIZE, sub.rcv_kernel_size)?;
            self.sockets.push(socket);
        }
        Ok(())
    }

    /// Open listening endpoints for every `bind` sub-socket.
    pub(crate) fn bind_subs(&self) -> Result<(), TransportError> {
        for (index, sub) in self.subs.iter().enumerate() {
            if sub.method == Method::Bind {
                debug!("binding {}[{index}] at {}", self.name, sub.address);
                self.socket(index)?.bind(&sub.address)?;
            }
        }
        Ok(())
    }

    /// Start connection attempts for every `connect` sub-socket.
    pub(crate) fn connect_subs(&self) -> Result<(), TransportError> {
        for (index, sub) in self.subs.iter().enumerate() {
            if sub.method == Method::Connect {
                debug!("connecting {}[{index}] to {}", self.name, sub.address);
                self.socket(index)?.connect(&sub.address)?;
            }
        }
        Ok(())
    }

    pub(crate) fn drop_sockets(&mut self) {
        self.sockets.clear();
    }

    /// Rate-logging interval of the channel in seconds (0 disables);
    /// sub-socket 0 decides.
    pub(crate) fn rate_interval(&self) -> u64 {
        self.subs.first().map_or(0, |s| s.rate_logging.max(0) as u64)
    }

    /// (bytes in, bytes out, msgs in, msgs out) summed over sub-sockets.
    pub(crate) fn traffic(&self) -> (u64, u64, u64, u64) {
        self.sockets.iter().fold((0, 0, 0, 0), |acc, s| {
            (
                acc.0 + s.bytes_rx(),
                acc.1 + s.bytes_tx(),
                acc.2 + s.messages_rx(),
                acc.3 + s.messages_tx(),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fully_configured_channel_is_valid() {
        let mut ch = Channel::new(SocketType::Rep, Method::Bind, "tcp://*:15001");
        ch.set_name("data");
        assert!(ch.is_valid());
    }

    #[test]
    fn all_accepted_schemes_validate() {
        for address in [
            "tcp://127.0.0.1:5555",
            "ipc:///tmp/sock",
            "inproc://pipe",
            "verbs://10.0.0.1:7777",
        ] {
            let mut ch = Channel::new(SocketType::Push, Method::Connect, address);
            ch.set_name("data");
            assert!(ch.is_valid(), "{address} should validate");
        }
    }

    #[test]
    fn bad_address_is_invalid() {
        for address in ["", "tcp://", "foo://bar", "localhost:5555"] {
            let mut ch = Channel::new(SocketType::Push, Method::Connect, address);
            ch.set_name("data");
            assert!(!ch.is_valid(), "{address:?} should be rejected");
        }
    }

    #[test]
    fn negative_tunables_are_invalid() {
        let mut config = SocketConfig {
            socket_type: SocketType::Pull,
            method: Method::Bind,
            address: "tcp://*:5555".to_owned(),
            ..SocketConfig::default()
        };
        config.rcv_buf_size = -1;
        let mut ch = Channel::from_config(config);
        ch.set_name("data");
        let err = ch.validate().unwrap_err();
        assert!(err.to_string().contains("rcvBufSize"));
    }

    #[test]
    fn transport_resolution_falls_back_to_device_default() {
        let mut ch = Channel::new(SocketType::Pair, Method::Bind, "tcp://*:5555");
        ch.set_name("data");
        assert_eq!(ch.transport_of(0, Transport::Shmem), Transport::Shmem);

        let mut config = SocketConfig::default();
        config.transport = Transport::Zeromq;
        config.address = "tcp://*:5556".to_owned();
        let mut ch = Channel::from_config(config);
        ch.set_name("meta");
        assert_eq!(ch.transport_of(0, Transport::Shmem), Transport::Zeromq);
    }
}
