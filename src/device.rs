// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    io::{self, Result as IoResult},
    sync::{Arc, Mutex},
};

use log::{debug, info, trace, warn};
use thiserror::Error as ThisError;
use vhost::vhost_user::message::{VhostUserProtocolFeatures, VhostUserVirtioFeatures};
use vhost_user_backend::{VhostUserBackend, VringRwLock, VringT};
use virtio_bindings::bindings::{
    virtio_config::{VIRTIO_F_NOTIFY_ON_EMPTY, VIRTIO_F_RING_RESET, VIRTIO_F_VERSION_1},
    virtio_ring::{VIRTIO_RING_F_EVENT_IDX, VIRTIO_RING_F_INDIRECT_DESC},
};
use virtio_queue::{QueueOwnedT, Reader, Writer};
use vm_memory::{ByteValued, GuestAddressSpace, GuestMemoryAtomic, GuestMemoryMmap, Le32};
use vmm_sys_util::{
    epoll::EventSet,
    eventfd::{EventFd, EFD_NONBLOCK},
};

use crate::{
    protocol::{
        GpuCommand, GpuCommandDecodeError, GpuResponse::ErrUnspec, GpuResponseEncodeError,
        VirtioGpuConfig, VirtioGpuResult, CONTROL_QUEUE, CURSOR_QUEUE, NUM_QUEUES, QUEUE_SIZE,
    },
    sink::MemorySink,
    virtio_gpu::{VirtioGpu, ZoneVirtioGpu},
    GpuConfig,
};

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("Failed to handle event, didn't match EPOLLIN")]
    HandleEventNotEpollIn,
    #[error("Failed to handle unknown event")]
    HandleEventUnknown,
    #[error("Descriptor read failed")]
    DescriptorReadFailed,
    #[error("Descriptor write failed")]
    DescriptorWriteFailed,
    #[error("Failed to send used queue notification: {0}")]
    NotificationFailed(io::Error),
    #[error("Failed to create new EventFd")]
    EventFdFailed,
    #[error("Failed to create an iterator over a descriptor chain: {0}")]
    CreateIteratorDescChain(virtio_queue::Error),
    #[error("Failed to create descriptor chain Reader: {0}")]
    CreateReader(virtio_queue::Error),
    #[error("Failed to create descriptor chain Writer: {0}")]
    CreateWriter(virtio_queue::Error),
    #[error("Failed to decode gpu command: {0}")]
    GpuCommandDecode(GpuCommandDecodeError),
    #[error("Failed to encode gpu response: {0}")]
    GpuResponseEncode(GpuResponseEncodeError),
    #[error("Failed add used chain to queue: {0}")]
    QueueAddUsed(virtio_queue::Error),
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        Self::new(io::ErrorKind::Other, e)
    }
}

struct VhostUserGpuBackendInner {
    virtio_cfg: VirtioGpuConfig,
    event_idx_enabled: bool,
    virtio_gpu: Option<ZoneVirtioGpu>,
    pub exit_event: EventFd,
    mem: Option<GuestMemoryAtomic<GuestMemoryMmap>>,
    gpu_config: GpuConfig,
}

pub struct VhostUserGpuBackend {
    inner: Mutex<VhostUserGpuBackendInner>,
}

impl VhostUserGpuBackend {
    pub fn new(gpu_config: GpuConfig) -> Result<Arc<Self>> {
        info!(
            "GPU backend with {} scanout(s), host memory budget of {} bytes",
            gpu_config.num_scanouts(),
            gpu_config.max_hostmem()
        );

        let inner = VhostUserGpuBackendInner {
            virtio_cfg: VirtioGpuConfig {
                events_read: 0.into(),
                events_clear: 0.into(),
                num_scanouts: Le32::from(gpu_config.num_scanouts()),
                num_capsets: 0.into(),
            },
            event_idx_enabled: false,
            virtio_gpu: None,
            exit_event: EventFd::new(EFD_NONBLOCK).map_err(|_| Error::EventFdFailed)?,
            mem: None,
            gpu_config,
        };

        Ok(Arc::new(Self {
            inner: Mutex::new(inner),
        }))
    }
}

impl VhostUserGpuBackendInner {
    fn process_gpu_command(
        virtio_gpu: &mut impl VirtioGpu,
        mem: &GuestMemoryMmap,
        cmd: GpuCommand,
    ) -> VirtioGpuResult {
        debug!("process_gpu_command: {cmd:?}");
        match cmd {
            GpuCommand::GetDisplayInfo => virtio_gpu.display_info(),
            GpuCommand::GetEdid(req) => virtio_gpu.get_edid(req.scanout.into()),
            GpuCommand::ResourceCreate2d(req) => virtio_gpu.resource_create_2d(
                req.resource_id.into(),
                req.format.into(),
                req.width.into(),
                req.height.into(),
            ),
            GpuCommand::ResourceUnref(req) => virtio_gpu.unref_resource(req.resource_id.into()),
            GpuCommand::SetScanout(req) => {
                virtio_gpu.set_scanout(req.scanout_id.into(), req.resource_id.into(), req.r.into())
            }
            GpuCommand::ResourceFlush(req) => {
                virtio_gpu.flush_resource(req.resource_id.into(), req.r.into(), mem)
            }
            GpuCommand::TransferToHost2d(req) => virtio_gpu.transfer_to_host_2d(
                req.resource_id.into(),
                req.r.into(),
                req.offset.into(),
            ),
            GpuCommand::ResourceAttachBacking(req, entries) => {
                virtio_gpu.attach_backing(req.resource_id.into(), mem, entries)
            }
            GpuCommand::ResourceDetachBacking(req) => {
                virtio_gpu.detach_backing(req.resource_id.into())
            }
            GpuCommand::UpdateCursor(req) => {
                virtio_gpu.update_cursor(req.pos.scanout_id.into(), req.resource_id.into())
            }
            GpuCommand::MoveCursor(req) => {
                virtio_gpu.move_cursor(req.pos.scanout_id.into(), req.resource_id.into())
            }
        }
    }

    fn process_queue_chain(
        &self,
        virtio_gpu: &mut impl VirtioGpu,
        vring: &VringRwLock,
        head_index: u16,
        reader: &mut Reader,
        writer: &mut Writer,
        signal_used_queue: &mut bool,
    ) -> Result<()> {
        let mem = self.mem.as_ref().unwrap().memory().into_inner();

        let response = match GpuCommand::decode(reader) {
            Ok((_hdr, gpu_cmd)) => {
                let cmd_name = gpu_cmd.command_name();
                match Self::process_gpu_command(virtio_gpu, &mem, gpu_cmd) {
                    Ok(response) => response,
                    Err(response) => {
                        debug!("GpuCommand {cmd_name} failed: {response:?}");
                        response
                    }
                }
            }
            Err(e) => {
                // The chain is still consumed, a stalled queue would be worse
                // than one bogus command.
                warn!("Failed to decode GpuCommand: {e}");
                ErrUnspec
            }
        };

        if writer.available_bytes() == 0 {
            debug!("Command does not have descriptors for a response");
            vring.add_used(head_index, 0).map_err(Error::QueueAddUsed)?;
            *signal_used_queue = true;
            return Ok(());
        }

        let response_len = response.encode(writer).map_err(Error::GpuResponseEncode)?;
        vring
            .add_used(head_index, response_len)
            .map_err(Error::QueueAddUsed)?;
        trace!("add_used {response_len} bytes");
        *signal_used_queue = true;
        Ok(())
    }

    /// Process the requests in the vring and dispatch replies
    fn process_queue(&self, virtio_gpu: &mut impl VirtioGpu, vring: &VringRwLock) -> Result<()> {
        let mem = self.mem.as_ref().unwrap().memory().into_inner();
        let desc_chains: Vec<_> = vring
            .get_mut()
            .get_queue_mut()
            .iter(mem.clone())
            .map_err(Error::CreateIteratorDescChain)?
            .collect();

        let mut signal_used_queue = false;
        for desc_chain in desc_chains {
            let head_index = desc_chain.head_index();
            let mut reader = desc_chain
                .clone()
                .reader(&mem)
                .map_err(Error::CreateReader)?;
            let mut writer = desc_chain.writer(&mem).map_err(Error::CreateWriter)?;

            self.process_queue_chain(
                virtio_gpu,
                vring,
                head_index,
                &mut reader,
                &mut writer,
                &mut signal_used_queue,
            )?;
        }

        if signal_used_queue {
            debug!("Notifying used queue");
            vring
                .signal_used_queue()
                .map_err(Error::NotificationFailed)?;
        }
        debug!("Processing queue finished");

        Ok(())
    }

    fn handle_event(
        &self,
        device_event: u16,
        virtio_gpu: &mut impl VirtioGpu,
        vrings: &[VringRwLock],
    ) -> IoResult<()> {
        match device_event {
            CONTROL_QUEUE | CURSOR_QUEUE => {
                let vring = &vrings
                    .get(device_event as usize)
                    .ok_or(Error::HandleEventUnknown)?;
                if self.event_idx_enabled {
                    // vm-virtio's Queue implementation only checks avail_index
                    // once, so to properly support EVENT_IDX we need to keep
                    // calling process_queue() until it stops finding new
                    // requests on the queue.
                    loop {
                        vring.disable_notification().unwrap();
                        self.process_queue(virtio_gpu, vring)?;
                        if !vring.enable_notification().unwrap() {
                            break;
                        }
                    }
                } else {
                    // Without EVENT_IDX, a single call is enough.
                    self.process_queue(virtio_gpu, vring)?;
                }
            }
            _ => {
                warn!("unhandled device_event: {}", device_event);
                return Err(Error::HandleEventUnknown.into());
            }
        }

        Ok(())
    }

    fn lazy_init_and_handle_event(
        &mut self,
        device_event: u16,
        evset: EventSet,
        vrings: &[VringRwLock],
        _thread_id: usize,
    ) -> IoResult<()> {
        debug!("Handle event called");
        if evset != EventSet::IN {
            return Err(Error::HandleEventNotEpollIn.into());
        }

        // The device model is built on the first queue event, once guest
        // memory and the scanout configuration are known.
        if self.virtio_gpu.is_none() {
            self.virtio_gpu = Some(ZoneVirtioGpu::new(&self.gpu_config, Box::new(MemorySink)));
        }
        let mut virtio_gpu = self.virtio_gpu.take().unwrap();
        let result = self.handle_event(device_event, &mut virtio_gpu, vrings);
        self.virtio_gpu = Some(virtio_gpu);
        result
    }

    fn get_config(&self, offset: u32, size: u32) -> Vec<u8> {
        let offset = offset as usize;
        let size = size as usize;

        let buf = self.virtio_cfg.as_slice();

        if offset + size > buf.len() {
            return Vec::new();
        }

        buf[offset..offset + size].to_vec()
    }
}

/// `VhostUserBackend` trait methods
impl VhostUserBackend for VhostUserGpuBackend {
    type Vring = VringRwLock;
    type Bitmap = ();

    fn num_queues(&self) -> usize {
        debug!("Num queues called");
        NUM_QUEUES
    }

    fn max_queue_size(&self) -> usize {
        debug!("Max queues called");
        QUEUE_SIZE
    }

    fn features(&self) -> u64 {
        (1 << VIRTIO_F_VERSION_1)
            | (1 << VIRTIO_F_RING_RESET)
            | (1 << VIRTIO_F_NOTIFY_ON_EMPTY)
            | (1 << VIRTIO_RING_F_INDIRECT_DESC)
            | (1 << VIRTIO_RING_F_EVENT_IDX)
            | VhostUserVirtioFeatures::PROTOCOL_FEATURES.bits()
    }

    fn protocol_features(&self) -> VhostUserProtocolFeatures {
        debug!("Protocol features called");
        VhostUserProtocolFeatures::CONFIG | VhostUserProtocolFeatures::MQ
    }

    fn set_event_idx(&self, enabled: bool) {
        self.inner.lock().unwrap().event_idx_enabled = enabled;
        debug!("Event idx set to: {}", enabled);
    }

    fn update_memory(&self, mem: GuestMemoryAtomic<GuestMemoryMmap>) -> IoResult<()> {
        debug!("Update memory called");
        self.inner.lock().unwrap().mem = Some(mem);
        Ok(())
    }

    fn get_config(&self, offset: u32, size: u32) -> Vec<u8> {
        self.inner.lock().unwrap().get_config(offset, size)
    }

    fn exit_event(&self, _thread_index: usize) -> Option<EventFd> {
        self.inner.lock().unwrap().exit_event.try_clone().ok()
    }

    fn handle_event(
        &self,
        device_event: u16,
        evset: EventSet,
        vrings: &[Self::Vring],
        thread_id: usize,
    ) -> IoResult<()> {
        self.inner.lock().unwrap().lazy_init_and_handle_event(
            device_event,
            evset,
            vrings,
            thread_id,
        )
    }
}
