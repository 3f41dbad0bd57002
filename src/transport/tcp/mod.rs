//! Network transport ("zeromq" in configuration).

mod message;
pub(crate) mod region;
mod socket;

pub use message::TcpMessage;
pub use region::TcpRegion;
pub use socket::TcpSocket;

use crate::error::TransportError;
use crate::transport::{
    Alignment, MessagePtr, RegionCallback, RegionConfig, RegionPtr, SocketPtr, SocketType,
    Transport, TransportFactory,
};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

pub struct TcpFactory {
    id: String,
    interrupt: Arc<AtomicBool>,
    next_region_id: AtomicU16,
}

impl TcpFactory {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_owned(),
            interrupt: Arc::new(AtomicBool::new(false)),
            next_region_id: AtomicU16::new(0),
        }
    }
}

impl TransportFactory for TcpFactory {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> Transport {
        Transport::Zeromq
    }

    fn new_message(&self) -> MessagePtr {
        Box::new(TcpMessage::empty())
    }

    fn new_message_with_size(&self, size: usize) -> Result<MessagePtr, TransportError> {
        Ok(Box::new(TcpMessage::with_size(size)))
    }

    fn new_message_aligned(
        &self,
        size: usize,
        alignment: Alignment,
    ) -> Result<MessagePtr, TransportError> {
        let mut msg = TcpMessage::empty();
        crate::transport::Message::rebuild_aligned(&mut msg, size, alignment)?;
        Ok(Box::new(msg))
    }

    fn new_socket(&self, stype: SocketType, id: &str) -> Result<SocketPtr, TransportError> {
        Ok(Arc::new(TcpSocket::new(stype, id, self.interrupt.clone())))
    }

    fn new_region(
        &self,
        config: RegionConfig,
        callback: RegionCallback,
    ) -> Result<RegionPtr, TransportError> {
        let id = config
            .id
            .unwrap_or_else(|| self.next_region_id.fetch_add(1, Ordering::Relaxed));
        Ok(Arc::new(TcpRegion::new(id, config, callback)?))
    }

    fn interrupt(&self) {
        self.interrupt.store(true, Ordering::Release);
    }

    fn resume(&self) {
        self.interrupt.store(false, Ordering::Release);
    }

    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Acquire)
    }
}
