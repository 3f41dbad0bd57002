//! Message type of the network transport: payloads carried inline.

use super::region::TcpRegionInner;
use crate::error::TransportError;
use crate::transport::{Alignment, Message, ReleaseHook, Transport};
use std::any::Any;
use std::sync::Arc;

pub(crate) enum Payload {
    Empty,
    Owned {
        data: Vec<u8>,
        /// Start offset into `data`, non-zero only for aligned rebuilds.
        start: usize,
        used: usize,
        on_release: Option<ReleaseHook>,
    },
    Region {
        region: Arc<TcpRegionInner>,
        offset: usize,
        len: usize,
    },
}

pub struct TcpMessage {
    payload: Payload,
}

impl TcpMessage {
    pub(crate) fn empty() -> Self {
        Self {
            payload: Payload::Empty,
        }
    }

    pub(crate) fn with_size(size: usize) -> Self {
        Self {
            payload: Payload::Owned {
                data: vec![0; size],
                start: 0,
                used: size,
                on_release: None,
            },
        }
    }

    pub(crate) fn from_vec(data: Vec<u8>) -> Self {
        let used = data.len();
        Self {
            payload: Payload::Owned {
                data,
                start: 0,
                used,
                on_release: None,
            },
        }
    }

    pub(crate) fn for_region(region: Arc<TcpRegionInner>, offset: usize, len: usize) -> Self {
        Self {
            payload: Payload::Region {
                region,
                offset,
                len,
            },
        }
    }

    /// Release the current payload, honoring the user deallocator.
    fn drop_payload(&mut self) {
        match std::mem::replace(&mut self.payload, Payload::Empty) {
            Payload::Owned {
                data,
                on_release: Some(hook),
                ..
            } => hook(data),
            _ => {}
        }
    }

    /// Called by the socket after the bytes hit the wire: the payload is
    /// logically moved out of the handle. For region-backed messages the
    /// network transport has no remote acknowledgement, so the sub-range is
    /// released right here.
    pub(crate) fn complete_send(&mut self) {
        match std::mem::replace(&mut self.payload, Payload::Empty) {
            Payload::Owned {
                data,
                on_release: Some(hook),
                ..
            } => hook(data),
            Payload::Region {
                region,
                offset,
                len,
            } => region.acknowledge_sent(offset, len),
            _ => {}
        }
    }
}

impl Message for TcpMessage {
    fn rebuild(&mut self, size: usize) -> Result<(), TransportError> {
        self.drop_payload();
        self.payload = Payload::Owned {
            data: vec![0; size],
            start: 0,
            used: size,
            on_release: None,
        };
        Ok(())
    }

    fn rebuild_aligned(&mut self, size: usize, alignment: Alignment) -> Result<(), TransportError> {
        let align = alignment.0.max(1);
        self.drop_payload();
        let data = vec![0; size + align];
        let misfit = data.as_ptr() as usize % align;
        let start = if misfit == 0 { 0 } else { align - misfit };
        self.payload = Payload::Owned {
            data,
            start,
            used: size,
            on_release: None,
        };
        Ok(())
    }

    fn rebuild_from(
        &mut self,
        data: Vec<u8>,
        on_release: Option<ReleaseHook>,
    ) -> Result<(), TransportError> {
        self.drop_payload();
        let used = data.len();
        self.payload = Payload::Owned {
            data,
            start: 0,
            used,
            on_release,
        };
        Ok(())
    }

    fn data(&self) -> &[u8] {
        match &self.payload {
            Payload::Empty => &[],
            Payload::Owned {
                data, start, used, ..
            } => &data[*start..*start + *used],
            Payload::Region {
                region,
                offset,
                len,
            } => unsafe { std::slice::from_raw_parts(region.data_ptr().add(*offset), *len) },
        }
    }

    fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.payload {
            Payload::Empty => &mut [],
            Payload::Owned {
                data, start, used, ..
            } => &mut data[*start..*start + *used],
            Payload::Region {
                region,
                offset,
                len,
            } => unsafe { std::slice::from_raw_parts_mut(region.data_ptr().add(*offset), *len) },
        }
    }

    fn len(&self) -> usize {
        match &self.payload {
            Payload::Empty => 0,
            Payload::Owned { used, .. } => *used,
            Payload::Region { len, .. } => *len,
        }
    }

    fn set_used_size(&mut self, size: usize) -> bool {
        match &mut self.payload {
            Payload::Empty => size == 0,
            Payload::Owned { used, .. } => {
                if size <= *used {
                    *used = size;
                    true
                } else {
                    false
                }
            }
            Payload::Region { len, .. } => {
                if size <= *len {
                    *len = size;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn transport(&self) -> Transport {
        Transport::Zeromq
    }

    fn copy_from(&mut self, other: &dyn Message) -> Result<(), TransportError> {
        if other.transport() != Transport::Zeromq {
            return Err(TransportError::TransportMismatch {
                message: other.transport(),
                socket: Transport::Zeromq,
            });
        }
        self.drop_payload();
        let other = other
            .as_any()
            .downcast_ref::<TcpMessage>()
            .ok_or_else(|| TransportError::Message("copy from foreign message type".to_owned()))?;
        self.payload = match &other.payload {
            // Region sub-ranges are shared by reference, not copied.
            Payload::Region {
                region,
                offset,
                len,
            } => Payload::Region {
                region: region.clone(),
                offset: *offset,
                len: *len,
            },
            _ => Payload::Owned {
                data: other.data().to_vec(),
                start: 0,
                used: other.len(),
                on_release: None,
            },
        };
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Drop for TcpMessage {
    fn drop(&mut self) {
        self.drop_payload();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_in_place_shrinks_and_copies_inherit() {
        let mut msg = TcpMessage::with_size(1000);
        assert!(msg.set_used_size(500));
        assert_eq!(msg.len(), 500);
        assert!(msg.set_used_size(250));
        assert_eq!(msg.len(), 250);
        assert!(!msg.set_used_size(500), "growing is rejected");

        let mut copy = TcpMessage::empty();
        copy.copy_from(&msg).unwrap();
        assert_eq!(copy.len(), 250);
    }

    #[test]
    fn rebuild_from_invokes_release_hook() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let released = Arc::new(AtomicUsize::new(0));
        let r = released.clone();

        let mut msg = TcpMessage::empty();
        msg.rebuild_from(
            vec![7; 64],
            Some(Box::new(move |buf| {
                r.store(buf.len(), Ordering::SeqCst);
            })),
        )
        .unwrap();
        assert_eq!(msg.len(), 64);
        msg.rebuild(8).unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 64, "hook ran on rebuild");
    }

    #[test]
    fn aligned_rebuild_honors_alignment() {
        let mut msg = TcpMessage::empty();
        msg.rebuild_aligned(100, Alignment(64)).unwrap();
        assert_eq!(msg.len(), 100);
        assert_eq!(msg.data().as_ptr() as usize % 64, 0);
    }
}
