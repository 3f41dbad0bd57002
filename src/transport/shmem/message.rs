//! Shared-memory messages and the descriptor that travels on the wire.

use super::ShmemState;
use crate::error::TransportError;
use crate::transport::{Alignment, Message, ReleaseHook, Transport};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;

/// What actually crosses the meta-channel: a locator of the payload, not
/// the payload itself.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct Descriptor {
    /// true = managed data segment block, false = unmanaged region range.
    pub managed: bool,
    /// Segment or region identifier within the session.
    pub id: u16,
    pub offset: u64,
    pub size: u64,
    pub align: u16,
}

pub struct ShmemMessage {
    state: Arc<ShmemState>,
    desc: Option<Descriptor>,
    /// Whether this handle holds the payload reference (and must release
    /// it on drop).
    owns: bool,
    /// Set on messages reconstructed from a received descriptor; their
    /// release must acknowledge back to the creator.
    remote: bool,
}

impl ShmemMessage {
    pub(crate) fn empty(state: Arc<ShmemState>) -> Self {
        Self {
            state,
            desc: None,
            owns: false,
            remote: false,
        }
    }

    pub(crate) fn allocate(
        state: Arc<ShmemState>,
        size: usize,
        align: usize,
    ) -> Result<Self, TransportError> {
        let segment = state.default_segment()?;
        let offset = segment.alloc(size, align)?;
        Ok(Self {
            state,
            desc: Some(Descriptor {
                managed: true,
                id: segment.id(),
                offset,
                size: size as u64,
                align: align as u16,
            }),
            owns: true,
            remote: false,
        })
    }

    pub(crate) fn for_region(
        state: Arc<ShmemState>,
        id: u16,
        offset: u64,
        size: u64,
    ) -> Self {
        Self {
            state,
            desc: Some(Descriptor {
                managed: false,
                id,
                offset,
                size,
                align: 0,
            }),
            owns: true,
            remote: false,
        }
    }

    pub(crate) fn from_descriptor(state: Arc<ShmemState>, desc: Option<Descriptor>) -> Self {
        Self {
            state,
            owns: desc.is_some(),
            remote: true,
            desc,
        }
    }

    pub(crate) fn descriptor(&self) -> Option<Descriptor> {
        self.desc
    }

    /// Give up the payload reference after a successful send: ownership
    /// moved to the receiver, the handle stays valid but empty.
    pub(crate) fn complete_send(&mut self) {
        if let Some(desc) = self.desc.take() {
            if !desc.managed {
                self.state.note_region_sent(desc.id, desc.size);
            }
        }
        self.owns = false;
    }

    fn release(&mut self) {
        let Some(desc) = self.desc.take() else {
            return;
        };
        if !self.owns {
            return;
        }
        self.owns = false;
        if desc.managed {
            if let Ok(segment) = self.state.segment(desc.id) {
                segment.dec_ref(desc.offset);
            }
        } else if self.remote {
            // A receiver done with a region range: acknowledge to the
            // creator. Unsent creator-side ranges stay with the creator
            // and produce no callback.
            self.state.push_region_ack(desc.id, desc.offset, desc.size);
        }
    }

    fn payload_ptr(&self, desc: &Descriptor) -> Result<*mut u8, TransportError> {
        if desc.managed {
            Ok(self.state.segment(desc.id)?.ptr_at(desc.offset))
        } else {
            self.state.region_ptr(desc.id, desc.offset, desc.size)
        }
    }
}

impl Message for ShmemMessage {
    fn rebuild(&mut self, size: usize) -> Result<(), TransportError> {
        self.release();
        *self = ShmemMessage::allocate(self.state.clone(), size, 0)?;
        Ok(())
    }

    fn rebuild_aligned(&mut self, size: usize, alignment: Alignment) -> Result<(), TransportError> {
        self.release();
        *self = ShmemMessage::allocate(self.state.clone(), size, alignment.0)?;
        Ok(())
    }

    fn rebuild_from(
        &mut self,
        data: Vec<u8>,
        on_release: Option<ReleaseHook>,
    ) -> Result<(), TransportError> {
        // Payloads must live in shared memory, so a user buffer is copied
        // in and handed back through the hook right away.
        self.rebuild(data.len())?;
        self.data_mut().copy_from_slice(&data);
        if let Some(hook) = on_release {
            hook(data);
        }
        Ok(())
    }

    fn data(&self) -> &[u8] {
        match &self.desc {
            None => &[],
            Some(desc) => match self.payload_ptr(desc) {
                Ok(ptr) => unsafe { std::slice::from_raw_parts(ptr, desc.size as usize) },
                Err(_) => &[],
            },
        }
    }

    fn data_mut(&mut self) -> &mut [u8] {
        match &self.desc {
            None => &mut [],
            Some(desc) => match self.payload_ptr(desc) {
                Ok(ptr) => unsafe { std::slice::from_raw_parts_mut(ptr, desc.size as usize) },
                Err(_) => &mut [],
            },
        }
    }

    fn len(&self) -> usize {
        self.desc.map_or(0, |d| d.size as usize)
    }

    fn set_used_size(&mut self, size: usize) -> bool {
        match &mut self.desc {
            None => size == 0,
            Some(desc) => {
                if size as u64 <= desc.size {
                    desc.size = size as u64;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn transport(&self) -> Transport {
        Transport::Shmem
    }

    fn copy_from(&mut self, other: &dyn Message) -> Result<(), TransportError> {
        if other.transport() != Transport::Shmem {
            return Err(TransportError::TransportMismatch {
                message: other.transport(),
                socket: Transport::Shmem,
            });
        }
        let other = other
            .as_any()
            .downcast_ref::<ShmemMessage>()
            .ok_or_else(|| TransportError::Message("copy from foreign message type".to_owned()))?;
        self.release();
        match other.desc {
            None => {
                self.desc = None;
                self.owns = false;
            }
            Some(desc) if desc.managed => {
                // Share the block: bump the cross-process reference count.
                self.state.segment(desc.id)?.inc_ref(desc.offset);
                self.desc = Some(desc);
                self.owns = true;
                self.remote = other.remote;
            }
            Some(desc) => {
                // Region ranges have a single acknowledging owner; the
                // copy is a non-owning view.
                self.desc = Some(desc);
                self.owns = false;
                self.remote = other.remote;
            }
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Drop for ShmemMessage {
    fn drop(&mut self) {
        self.release();
    }
}
