// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

#![allow(non_camel_case_types)]

use std::{
    convert::From,
    fmt::{self, Display},
    io::{self, Write},
    mem::{size_of, size_of_val},
};

use log::{trace, warn};
use thiserror::Error;
pub use virtio_bindings::virtio_gpu::{
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_GET_DISPLAY_INFO as VIRTIO_GPU_CMD_GET_DISPLAY_INFO,
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_GET_EDID as VIRTIO_GPU_CMD_GET_EDID,
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_MOVE_CURSOR as VIRTIO_GPU_CMD_MOVE_CURSOR,
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING as VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING,
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_RESOURCE_CREATE_2D as VIRTIO_GPU_CMD_RESOURCE_CREATE_2D,
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_RESOURCE_DETACH_BACKING as VIRTIO_GPU_CMD_RESOURCE_DETACH_BACKING,
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_RESOURCE_FLUSH as VIRTIO_GPU_CMD_RESOURCE_FLUSH,
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_RESOURCE_UNREF as VIRTIO_GPU_CMD_RESOURCE_UNREF,
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_SET_SCANOUT as VIRTIO_GPU_CMD_SET_SCANOUT,
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D as VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D,
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_UPDATE_CURSOR as VIRTIO_GPU_CMD_UPDATE_CURSOR,
    virtio_gpu_ctrl_type_VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER as VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER,
    virtio_gpu_ctrl_type_VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID as VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID,
    virtio_gpu_ctrl_type_VIRTIO_GPU_RESP_ERR_INVALID_SCANOUT_ID as VIRTIO_GPU_RESP_ERR_INVALID_SCANOUT_ID,
    virtio_gpu_ctrl_type_VIRTIO_GPU_RESP_ERR_UNSPEC as VIRTIO_GPU_RESP_ERR_UNSPEC,
    virtio_gpu_ctrl_type_VIRTIO_GPU_RESP_OK_DISPLAY_INFO as VIRTIO_GPU_RESP_OK_DISPLAY_INFO,
    virtio_gpu_ctrl_type_VIRTIO_GPU_RESP_OK_NODATA as VIRTIO_GPU_RESP_OK_NODATA,
};
use virtio_queue::{Reader, Writer};
use vm_memory::{ByteValued, GuestAddress, Le32, Le64};

use crate::device::{self, Error};

pub const QUEUE_SIZE: usize = 1024;
pub const NUM_QUEUES: usize = 2;

pub const CONTROL_QUEUE: u16 = 0;
pub const CURSOR_QUEUE: u16 = 1;

pub const VIRTIO_GPU_MAX_SCANOUTS: u32 = 16;

/// Virtio Gpu Configuration
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct VirtioGpuConfig {
    /// Signals pending events to the driver
    pub events_read: Le32,
    /// Clears pending events in the device
    pub events_clear: Le32,
    /// Maximum number of scanouts supported by the device
    pub num_scanouts: Le32,
    /// Maximum number of capability sets supported by the device
    pub num_capsets: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for VirtioGpuConfig {}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_ctrl_hdr {
    pub type_: Le32,
    pub flags: Le32,
    pub fence_id: Le64,
    pub ctx_id: Le32,
    pub ring_idx: u8,
    pub padding: [u8; 3],
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for virtio_gpu_ctrl_hdr {}

/// Data passed in the cursor `vq`

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_cursor_pos {
    pub scanout_id: Le32,
    pub x: Le32,
    pub y: Le32,
    pub padding: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for virtio_gpu_cursor_pos {}

// VIRTIO_GPU_CMD_UPDATE_CURSOR, VIRTIO_GPU_CMD_MOVE_CURSOR
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_update_cursor {
    /// update & move
    pub pos: virtio_gpu_cursor_pos,
    /// update only
    pub resource_id: Le32,
    /// update only
    pub hot_x: Le32,
    /// update only
    pub hot_y: Le32,
    pub padding: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for virtio_gpu_update_cursor {}

/// Data passed in the control `vq`, 2d related

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_rect {
    pub x: Le32,
    pub y: Le32,
    pub width: Le32,
    pub height: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for virtio_gpu_rect {}

// VIRTIO_GPU_CMD_GET_EDID
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_get_edid {
    pub scanout: Le32,
    pub padding: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for virtio_gpu_get_edid {}

// VIRTIO_GPU_CMD_RESOURCE_UNREF
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_resource_unref {
    pub resource_id: Le32,
    pub padding: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for virtio_gpu_resource_unref {}

// VIRTIO_GPU_CMD_RESOURCE_CREATE_2D: create a 2d resource with a format
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_resource_create_2d {
    pub resource_id: Le32,
    pub format: Le32,
    pub width: Le32,
    pub height: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for virtio_gpu_resource_create_2d {}

// VIRTIO_GPU_CMD_SET_SCANOUT
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_set_scanout {
    pub r: virtio_gpu_rect,
    pub scanout_id: Le32,
    pub resource_id: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for virtio_gpu_set_scanout {}

// VIRTIO_GPU_CMD_RESOURCE_FLUSH
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_resource_flush {
    pub r: virtio_gpu_rect,
    pub resource_id: Le32,
    pub padding: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for virtio_gpu_resource_flush {}

// VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D: simple transfer to_host
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_transfer_to_host_2d {
    pub r: virtio_gpu_rect,
    pub offset: Le64,
    pub resource_id: Le32,
    pub padding: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for virtio_gpu_transfer_to_host_2d {}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_mem_entry {
    pub addr: Le64,
    pub length: Le32,
    pub padding: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for virtio_gpu_mem_entry {}

// VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_resource_attach_backing {
    pub resource_id: Le32,
    pub nr_entries: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for virtio_gpu_resource_attach_backing {}

// VIRTIO_GPU_CMD_RESOURCE_DETACH_BACKING
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_resource_detach_backing {
    pub resource_id: Le32,
    pub padding: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for virtio_gpu_resource_detach_backing {}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virtio_gpu_display_one {
    pub r: virtio_gpu_rect,
    pub enabled: Le32,
    pub flags: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for virtio_gpu_display_one {}

#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct virtio_gpu_resp_display_info {
    pub hdr: virtio_gpu_ctrl_hdr,
    pub pmodes: [virtio_gpu_display_one; VIRTIO_GPU_MAX_SCANOUTS as usize],
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for virtio_gpu_resp_display_info {}

// simple formats for fbcon/X use
pub const VIRTIO_GPU_FORMAT_B8G8R8A8_UNORM: u32 = 1;
pub const VIRTIO_GPU_FORMAT_B8G8R8X8_UNORM: u32 = 2;
pub const VIRTIO_GPU_FORMAT_A8R8G8B8_UNORM: u32 = 3;
pub const VIRTIO_GPU_FORMAT_X8R8G8B8_UNORM: u32 = 4;
pub const VIRTIO_GPU_FORMAT_R8G8B8A8_UNORM: u32 = 67;
pub const VIRTIO_GPU_FORMAT_X8B8G8R8_UNORM: u32 = 68;
pub const VIRTIO_GPU_FORMAT_A8B8G8R8_UNORM: u32 = 121;
pub const VIRTIO_GPU_FORMAT_R8G8B8X8_UNORM: u32 = 134;

/// A virtio gpu command and associated metadata specific to each command.
#[derive(Clone, PartialEq, Eq)]
pub enum GpuCommand {
    GetDisplayInfo,
    GetEdid(virtio_gpu_get_edid),
    ResourceCreate2d(virtio_gpu_resource_create_2d),
    ResourceUnref(virtio_gpu_resource_unref),
    SetScanout(virtio_gpu_set_scanout),
    ResourceFlush(virtio_gpu_resource_flush),
    TransferToHost2d(virtio_gpu_transfer_to_host_2d),
    ResourceAttachBacking(
        virtio_gpu_resource_attach_backing,
        Vec<(GuestAddress, usize)>,
    ),
    ResourceDetachBacking(virtio_gpu_resource_detach_backing),
    UpdateCursor(virtio_gpu_update_cursor),
    MoveCursor(virtio_gpu_update_cursor),
}

/// An error indicating something went wrong decoding a `GpuCommand`. These
/// correspond to `VIRTIO_GPU_CMD_*`.
#[derive(Error, Debug)]
pub enum GpuCommandDecodeError {
    /// The type of the command was invalid.
    #[error("invalid command type ({0})")]
    InvalidType(u32),
    /// An I/O error occurred.
    #[error("an I/O error occurred: {0}")]
    IO(io::Error),
    #[error("Descriptor read failed")]
    DescriptorReadFailed,
}

impl From<io::Error> for GpuCommandDecodeError {
    fn from(e: io::Error) -> Self {
        Self::IO(e)
    }
}

impl From<device::Error> for GpuCommandDecodeError {
    fn from(_: device::Error) -> Self {
        Self::DescriptorReadFailed
    }
}

impl From<device::Error> for GpuResponseEncodeError {
    fn from(_: device::Error) -> Self {
        Self::DescriptorWriteFailed
    }
}

impl fmt::Debug for GpuCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct(self.command_name()).finish()
    }
}

impl GpuCommand {
    pub const fn command_name(&self) -> &'static str {
        use GpuCommand::*;
        match self {
            GetDisplayInfo => "GetDisplayInfo",
            GetEdid(_info) => "GetEdid",
            ResourceCreate2d(_info) => "ResourceCreate2d",
            ResourceUnref(_info) => "ResourceUnref",
            SetScanout(_info) => "SetScanout",
            ResourceFlush(_info) => "ResourceFlush",
            TransferToHost2d(_info) => "TransferToHost2d",
            ResourceAttachBacking(_info, _entries) => "ResourceAttachBacking",
            ResourceDetachBacking(_info) => "ResourceDetachBacking",
            UpdateCursor(_info) => "UpdateCursor",
            MoveCursor(_info) => "MoveCursor",
        }
    }

    /// Decodes a command from the given chunk of memory.
    pub fn decode(
        reader: &mut Reader,
    ) -> Result<(virtio_gpu_ctrl_hdr, Self), GpuCommandDecodeError> {
        use self::GpuCommand::*;
        let hdr = reader
            .read_obj::<virtio_gpu_ctrl_hdr>()
            .map_err(|_| Error::DescriptorReadFailed)?;
        trace!(
            "Decoding GpuCommand 0x{:0x}",
            <Le32 as Into<u32>>::into(hdr.type_)
        );
        let cmd = match hdr.type_.into() {
            VIRTIO_GPU_CMD_GET_DISPLAY_INFO => GetDisplayInfo,
            VIRTIO_GPU_CMD_GET_EDID => {
                GetEdid(reader.read_obj().map_err(|_| Error::DescriptorReadFailed)?)
            }
            VIRTIO_GPU_CMD_RESOURCE_CREATE_2D => {
                ResourceCreate2d(reader.read_obj().map_err(|_| Error::DescriptorReadFailed)?)
            }
            VIRTIO_GPU_CMD_RESOURCE_UNREF => {
                ResourceUnref(reader.read_obj().map_err(|_| Error::DescriptorReadFailed)?)
            }
            VIRTIO_GPU_CMD_SET_SCANOUT => {
                SetScanout(reader.read_obj().map_err(|_| Error::DescriptorReadFailed)?)
            }
            VIRTIO_GPU_CMD_RESOURCE_FLUSH => {
                ResourceFlush(reader.read_obj().map_err(|_| Error::DescriptorReadFailed)?)
            }
            VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D => {
                TransferToHost2d(reader.read_obj().map_err(|_| Error::DescriptorReadFailed)?)
            }
            VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING => {
                let info: virtio_gpu_resource_attach_backing =
                    reader.read_obj().map_err(|_| Error::DescriptorReadFailed)?;
                let nr_entries = <Le32 as Into<u32>>::into(info.nr_entries) as usize;
                let mut entries =
                    Vec::with_capacity(nr_entries.min(crate::mapper::MAX_BACKING_ENTRIES));
                for _ in 0..nr_entries {
                    let entry: virtio_gpu_mem_entry =
                        reader.read_obj().map_err(|_| Error::DescriptorReadFailed)?;
                    entries.push((
                        GuestAddress(entry.addr.into()),
                        <Le32 as Into<u32>>::into(entry.length) as usize,
                    ));
                }
                ResourceAttachBacking(info, entries)
            }
            VIRTIO_GPU_CMD_RESOURCE_DETACH_BACKING => {
                ResourceDetachBacking(reader.read_obj().map_err(|_| Error::DescriptorReadFailed)?)
            }
            VIRTIO_GPU_CMD_UPDATE_CURSOR => {
                UpdateCursor(reader.read_obj().map_err(|_| Error::DescriptorReadFailed)?)
            }
            VIRTIO_GPU_CMD_MOVE_CURSOR => {
                MoveCursor(reader.read_obj().map_err(|_| Error::DescriptorReadFailed)?)
            }
            _ => return Err(GpuCommandDecodeError::InvalidType(hdr.type_.into())),
        };

        Ok((hdr, cmd))
    }
}

/// A response to a `GpuCommand`. These correspond to `VIRTIO_GPU_RESP_*`.
#[derive(Debug, PartialEq, Eq)]
pub enum GpuResponse {
    OkNoData,
    OkDisplayInfo(Vec<(u32, u32, bool)>),
    ErrUnspec,
    ErrInvalidScanoutId,
    ErrInvalidResourceId,
    ErrInvalidParameter,
}

impl Display for GpuResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::OkNoData => write!(f, "ok: no data"),
            Self::OkDisplayInfo(_) => write!(f, "ok: display info"),
            Self::ErrUnspec => write!(f, "error: unspecified"),
            Self::ErrInvalidScanoutId => write!(f, "error: invalid scanout id"),
            Self::ErrInvalidResourceId => write!(f, "error: invalid resource id"),
            Self::ErrInvalidParameter => write!(f, "error: invalid parameter"),
        }
    }
}

/// An error indicating something went wrong encoding a `GpuResponse`.
#[derive(Error, Debug)]
pub enum GpuResponseEncodeError {
    /// An I/O error occurred.
    #[error("an I/O error occurred: {0}")]
    IO(io::Error),
    /// Size conversion failed
    #[error("Size conversion failed")]
    SizeOverflow,
    /// More displays than are valid were in a `OkDisplayInfo`.
    #[error("{0} is more displays than are valid")]
    TooManyDisplays(usize),
    #[error("Descriptor write failed")]
    DescriptorWriteFailed,
}

impl From<io::Error> for GpuResponseEncodeError {
    fn from(e: io::Error) -> Self {
        Self::IO(e)
    }
}

pub type VirtioGpuResult = std::result::Result<GpuResponse, GpuResponse>;

impl GpuResponse {
    /// Encodes this `GpuResponse` into the device-writable part of the
    /// descriptor chain. The response header carries only the type; fence
    /// and context fields stay zeroed.
    ///
    /// A response that does not fit is truncated, the guest still sees the
    /// bytes that made it through.
    pub fn encode(&self, writer: &mut Writer) -> Result<u32, GpuResponseEncodeError> {
        let hdr = virtio_gpu_ctrl_hdr {
            type_: self.get_type().into(),
            ..Default::default()
        };
        let written = match *self {
            Self::OkDisplayInfo(ref info) => {
                if info.len() > VIRTIO_GPU_MAX_SCANOUTS as usize {
                    return Err(GpuResponseEncodeError::TooManyDisplays(info.len()));
                }
                let mut disp_info = virtio_gpu_resp_display_info {
                    hdr,
                    pmodes: Default::default(),
                };
                for (disp_mode, &(width, height, enabled)) in disp_info.pmodes.iter_mut().zip(info)
                {
                    disp_mode.r.width = width.into();
                    disp_mode.r.height = height.into();
                    disp_mode.enabled = u32::from(enabled).into();
                }
                let n = writer
                    .write(disp_info.as_slice())
                    .map_err(|_| Error::DescriptorWriteFailed)?;
                if n < size_of_val(&disp_info) {
                    warn!(
                        "Truncated display info response: wrote {n} of {} bytes",
                        size_of_val(&disp_info)
                    );
                }
                n
            }
            _ => {
                let n = writer
                    .write(hdr.as_slice())
                    .map_err(|_| Error::DescriptorWriteFailed)?;
                if n < size_of::<virtio_gpu_ctrl_hdr>() {
                    warn!(
                        "Truncated response header: wrote {n} of {} bytes",
                        size_of::<virtio_gpu_ctrl_hdr>()
                    );
                }
                n
            }
        };
        let len = u32::try_from(written).map_err(|_| GpuResponseEncodeError::SizeOverflow)?;

        Ok(len)
    }

    /// Gets the `VIRTIO_GPU_*` enum value that corresponds to this variant.
    pub const fn get_type(&self) -> u32 {
        match self {
            Self::OkNoData => VIRTIO_GPU_RESP_OK_NODATA,
            Self::OkDisplayInfo(_) => VIRTIO_GPU_RESP_OK_DISPLAY_INFO,
            Self::ErrUnspec => VIRTIO_GPU_RESP_ERR_UNSPEC,
            Self::ErrInvalidScanoutId => VIRTIO_GPU_RESP_ERR_INVALID_SCANOUT_ID,
            Self::ErrInvalidResourceId => VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID,
            Self::ErrInvalidParameter => VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER,
        }
    }
}
