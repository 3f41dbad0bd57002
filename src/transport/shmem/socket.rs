//! Shared-memory socket: descriptors over a network meta-channel.
//!
//! Payloads never leave shared memory. What a socket actually transfers is
//! a [`Descriptor`](super::message::Descriptor) per part, serialized over
//! an internal network socket bound/connected to the channel's configured
//! address. This keeps bind/connect, fan-out, multipart atomicity and
//! timeout semantics identical to the network transport while the bytes
//! move by reference.

use super::message::{Descriptor, ShmemMessage};
use super::ShmemState;
use crate::error::{TransferError, TransferResult, TransportError};
use crate::parts::Parts;
use crate::transport::tcp::{TcpMessage, TcpSocket};
use crate::transport::{Message, MessagePtr, Socket, SocketType, Transport};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

pub struct ShmemSocket {
    id: String,
    meta: TcpSocket,
    state: Arc<ShmemState>,
    bytes_tx: AtomicU64,
    bytes_rx: AtomicU64,
    msgs_tx: AtomicU64,
    msgs_rx: AtomicU64,
}

impl ShmemSocket {
    pub(crate) fn new(stype: SocketType, id: &str, state: Arc<ShmemState>) -> Self {
        Self {
            id: id.to_owned(),
            meta: TcpSocket::new(stype, &format!("{id}.meta"), state.interrupt_flag()),
            state,
            bytes_tx: AtomicU64::new(0),
            bytes_rx: AtomicU64::new(0),
            msgs_tx: AtomicU64::new(0),
            msgs_rx: AtomicU64::new(0),
        }
    }

    fn descriptor_of(&self, msg: &MessagePtr) -> Result<Option<Descriptor>, TransferError> {
        if msg.transport() != Transport::Shmem {
            warn!(
                "{}: dropping send of {} message on {} socket",
                self.id,
                msg.transport(),
                Transport::Shmem
            );
            return Err(TransferError::Error);
        }
        let shm = msg
            .as_any()
            .downcast_ref::<ShmemMessage>()
            .ok_or(TransferError::Error)?;
        Ok(shm.descriptor())
    }

    fn wire_message(desc: &Option<Descriptor>) -> Result<MessagePtr, TransferError> {
        let wire = bincode::serialize(desc).map_err(|_| TransferError::Error)?;
        Ok(Box::new(TcpMessage::from_vec(wire)))
    }

    fn unwire(&self, meta: &MessagePtr) -> Result<ShmemMessage, TransferError> {
        let desc: Option<Descriptor> =
            bincode::deserialize(meta.data()).map_err(|_| TransferError::Error)?;
        Ok(ShmemMessage::from_descriptor(self.state.clone(), desc))
    }
}

impl Socket for ShmemSocket {
    fn id(&self) -> &str {
        &self.id
    }

    fn transport(&self) -> Transport {
        Transport::Shmem
    }

    fn bind(&self, address: &str) -> Result<(), TransportError> {
        self.meta.bind(address)
    }

    fn connect(&self, address: &str) -> Result<(), TransportError> {
        self.meta.connect(address)
    }

    fn send(&self, msg: &mut MessagePtr, timeout_ms: i64) -> TransferResult {
        let desc = self.descriptor_of(msg)?;
        let size = desc.map_or(0, |d| d.size as usize);
        let mut wire = Self::wire_message(&desc)?;
        self.meta.send(&mut wire, timeout_ms)?;
        if let Some(shm) = msg.as_any_mut().downcast_mut::<ShmemMessage>() {
            shm.complete_send();
        }
        self.bytes_tx.fetch_add(size as u64, Ordering::Relaxed);
        self.msgs_tx.fetch_add(1, Ordering::Relaxed);
        Ok(size)
    }

    fn receive(&self, msg: &mut MessagePtr, timeout_ms: i64) -> TransferResult {
        let mut wire: MessagePtr = Box::new(TcpMessage::empty());
        self.meta.receive(&mut wire, timeout_ms)?;
        let message = self.unwire(&wire)?;
        let size = message.len();
        *msg = Box::new(message);
        self.bytes_rx.fetch_add(size as u64, Ordering::Relaxed);
        self.msgs_rx.fetch_add(1, Ordering::Relaxed);
        Ok(size)
    }

    fn send_parts(&self, parts: &mut Parts, timeout_ms: i64) -> TransferResult {
        if parts.is_empty() {
            return Err(TransferError::Error);
        }
        let mut size = 0;
        let mut wire = Parts::new();
        for part in parts.iter() {
            let desc = self.descriptor_of(part)?;
            size += desc.map_or(0, |d| d.size as usize);
            wire.add_part(Self::wire_message(&desc)?);
        }
        self.meta.send_parts(&mut wire, timeout_ms)?;
        for part in parts.iter_mut() {
            if let Some(shm) = part.as_any_mut().downcast_mut::<ShmemMessage>() {
                shm.complete_send();
            }
        }
        self.bytes_tx.fetch_add(size as u64, Ordering::Relaxed);
        self.msgs_tx.fetch_add(parts.len() as u64, Ordering::Relaxed);
        Ok(size)
    }

    fn receive_parts(&self, parts: &mut Parts, timeout_ms: i64) -> TransferResult {
        let mut wire = Parts::new();
        self.meta.receive_parts(&mut wire, timeout_ms)?;
        let mut size = 0;
        let count = wire.len() as u64;
        for meta in wire.iter() {
            let message = self.unwire(meta)?;
            size += message.len();
            parts.add_part(Box::new(message));
        }
        self.bytes_rx.fetch_add(size as u64, Ordering::Relaxed);
        self.msgs_rx.fetch_add(count, Ordering::Relaxed);
        Ok(size)
    }

    fn set_option(&self, name: &str, value: i32) -> Result<(), TransportError> {
        self.meta.set_option(name, value)
    }

    fn option(&self, name: &str) -> Result<i32, TransportError> {
        self.meta.option(name)
    }

    fn bytes_tx(&self) -> u64 {
        self.bytes_tx.load(Ordering::Relaxed)
    }

    fn bytes_rx(&self) -> u64 {
        self.bytes_rx.load(Ordering::Relaxed)
    }

    fn messages_tx(&self) -> u64 {
        self.msgs_tx.load(Ordering::Relaxed)
    }

    fn messages_rx(&self) -> u64 {
        self.msgs_rx.load(Ordering::Relaxed)
    }

    fn connected_peers(&self) -> usize {
        self.meta.connected_peers()
    }

    fn has_input(&self) -> bool {
        self.meta.has_input()
    }

    fn has_output(&self) -> bool {
        self.meta.has_output()
    }
}
