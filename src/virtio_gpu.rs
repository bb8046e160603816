// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::collections::BTreeMap;

use log::{debug, error, warn};
use vm_memory::{GuestAddress, GuestMemoryMmap};

use crate::{
    mapper::{self, GuestBacking},
    protocol::{
        virtio_gpu_rect,
        GpuResponse::{
            self, ErrInvalidParameter, ErrInvalidResourceId, ErrInvalidScanoutId, ErrUnspec,
            OkDisplayInfo, OkNoData,
        },
        VirtioGpuResult, VIRTIO_GPU_MAX_SCANOUTS,
    },
    sink::{DisplaySink, FrameBufferDesc, FrameBufferTarget},
    GpuConfig,
};

const BYTES_PER_PIXEL: u32 = 4;

/// Scanout rectangles narrower or shorter than this are rejected by
/// set_scanout.
const MIN_SCANOUT_RECT: u32 = 16;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct Rectangle {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl From<virtio_gpu_rect> for Rectangle {
    fn from(r: virtio_gpu_rect) -> Self {
        Self {
            x: r.x.into(),
            y: r.y.into(),
            width: r.width.into(),
            height: r.height.into(),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
// We need to specify some lifetimes explicitly, for mockall::automock attribute to compile
#[allow(clippy::needless_lifetimes)]
pub trait VirtioGpu {
    /// Returns the requested geometry of every enabled scanout.
    fn display_info(&self) -> VirtioGpuResult;

    /// Returns the EDID blob for the given scanout.
    fn get_edid(&self, scanout_id: u32) -> VirtioGpuResult;

    /// Creates a 2D resource with the given properties and `resource_id`.
    fn resource_create_2d(
        &mut self,
        resource_id: u32,
        format: u32,
        width: u32,
        height: u32,
    ) -> VirtioGpuResult;

    /// Releases guest kernel reference on the resource.
    fn unref_resource(&mut self, resource_id: u32) -> VirtioGpuResult;

    /// Sets the given resource id as the source of scanout to the display.
    fn set_scanout(&mut self, scanout_id: u32, resource_id: u32, rect: Rectangle)
        -> VirtioGpuResult;

    /// Composites the staged transfer window of the resource into every
    /// framebuffer the resource is scanned out on.
    fn flush_resource(
        &mut self,
        resource_id: u32,
        rect: Rectangle,
        mem: &GuestMemoryMmap,
    ) -> VirtioGpuResult;

    /// Stages a transfer window on the resource. No bytes move until the
    /// next flush.
    fn transfer_to_host_2d(
        &mut self,
        resource_id: u32,
        rect: Rectangle,
        offset: u64,
    ) -> VirtioGpuResult;

    /// Attaches backing guest pages to the resource.
    fn attach_backing(
        &mut self,
        resource_id: u32,
        mem: &GuestMemoryMmap,
        entries: Vec<(GuestAddress, usize)>,
    ) -> VirtioGpuResult;

    /// Detaches any backing pages from the resource.
    fn detach_backing(&mut self, resource_id: u32) -> VirtioGpuResult;

    fn update_cursor(&mut self, scanout_id: u32, resource_id: u32) -> VirtioGpuResult;

    fn move_cursor(&mut self, scanout_id: u32, resource_id: u32) -> VirtioGpuResult;
}

/// Host memory footprint of a `width` x `height` image at 32 bits per pixel,
/// rows padded to a 4-byte aligned stride.
const fn calc_image_hostmem(width: u32, height: u32) -> u64 {
    let stride = ((width as u64 * 32 + 31) >> 5) * 4;
    height as u64 * stride
}

#[derive(Copy, Clone, Debug, Default)]
struct AssociatedScanouts(u32);

impl AssociatedScanouts {
    fn enable(&mut self, scanout_id: u32) {
        self.0 |= 1 << scanout_id;
    }

    fn disable(&mut self, scanout_id: u32) {
        self.0 &= !(1 << scanout_id);
    }

    const fn has_any_enabled(self) -> bool {
        self.0 != 0
    }

    fn iter_enabled(self) -> impl Iterator<Item = u32> {
        (0..VIRTIO_GPU_MAX_SCANOUTS).filter(move |i| ((self.0 >> i) & 1) == 1)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct PendingTransfer {
    rect: Rectangle,
    offset: u64,
}

#[derive(Default)]
pub struct GpuResource {
    id: u32,
    width: u32,
    height: u32,
    format: u32,
    hostmem: u64,
    backing: Option<GuestBacking>,
    /// Stores information about which scanouts are associated with the given
    /// resource. Resource could be used for multiple scanouts (the displays
    /// are mirrored).
    scanouts: AssociatedScanouts,
    transfer: Option<PendingTransfer>,
}

impl GpuResource {
    fn new(resource_id: u32, format: u32, width: u32, height: u32, hostmem: u64) -> Self {
        Self {
            id: resource_id,
            width,
            height,
            format,
            hostmem,
            backing: None,
            scanouts: AssociatedScanouts::default(),
            transfer: None,
        }
    }
}

struct FrameBuffer {
    desc: FrameBufferDesc,
    target: Option<FrameBufferTarget>,
}

#[derive(Default)]
struct GpuScanout {
    resource_id: u32,
    rect: Rectangle,
    framebuffer: Option<FrameBuffer>,
    cursor_resource_id: u32,
}

/// The 2D virtio-gpu device model: resources, their guest backing, and the
/// scanout framebuffers they are composited into.
pub struct ZoneVirtioGpu {
    resources: BTreeMap<u32, GpuResource>,
    scanouts: Vec<GpuScanout>,
    requested_states: Vec<crate::DisplayState>,
    enabled_scanouts: u32,
    hostmem: u64,
    max_hostmem: u64,
    sink: Box<dyn DisplaySink + Send>,
}

impl ZoneVirtioGpu {
    pub fn new(config: &GpuConfig, sink: Box<dyn DisplaySink + Send>) -> Self {
        let num_scanouts = config.displays().len();
        let mut scanouts = Vec::with_capacity(num_scanouts);
        scanouts.resize_with(num_scanouts, GpuScanout::default);

        Self {
            resources: BTreeMap::new(),
            scanouts,
            requested_states: config.displays().to_vec(),
            enabled_scanouts: (1_u32 << num_scanouts) - 1,
            hostmem: 0,
            max_hostmem: config.max_hostmem(),
            sink,
        }
    }

    /// Resolves a resource id for an operation that is about to touch its
    /// pixels: the resource must exist, carry backing pages and have a
    /// non-empty footprint.
    fn checked_resource(
        resources: &BTreeMap<u32, GpuResource>,
        resource_id: u32,
    ) -> Result<&GpuResource, GpuResponse> {
        let resource = resources.get(&resource_id).ok_or(ErrInvalidResourceId)?;
        if resource.backing.is_none() || resource.hostmem == 0 {
            return Err(ErrUnspec);
        }
        Ok(resource)
    }

    fn checked_resource_mut(
        resources: &mut BTreeMap<u32, GpuResource>,
        resource_id: u32,
    ) -> Result<&mut GpuResource, GpuResponse> {
        let resource = resources
            .get_mut(&resource_id)
            .ok_or(ErrInvalidResourceId)?;
        if resource.backing.is_none() || resource.hostmem == 0 {
            return Err(ErrUnspec);
        }
        Ok(resource)
    }

    fn validate_rect(rect: Rectangle, width: u32, height: u32) -> Result<(), GpuResponse> {
        if rect.x > width
            || rect.y > height
            || rect.width > width
            || rect.height > height
            || u64::from(rect.x) + u64::from(rect.width) > u64::from(width)
            || u64::from(rect.y) + u64::from(rect.height) > u64::from(height)
        {
            return Err(ErrInvalidParameter);
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn framebuffer_pixels(&self, scanout_id: u32) -> Option<&[u8]> {
        self.scanouts
            .get(scanout_id as usize)?
            .framebuffer
            .as_ref()?
            .target
            .as_ref()
            .map(FrameBufferTarget::as_slice)
    }

    /// Releases the pixel target a scanout holds, if any.
    pub fn remove_framebuffer(&mut self, scanout_id: u32) -> VirtioGpuResult {
        let scanout = self
            .scanouts
            .get_mut(scanout_id as usize)
            .ok_or(ErrInvalidScanoutId)?;
        let target = scanout
            .framebuffer
            .as_mut()
            .and_then(|fb| fb.target.take())
            .ok_or(ErrUnspec)?;
        self.sink.release(scanout_id, target);
        Ok(OkNoData)
    }

    fn copy_and_flush(
        fb: &mut FrameBuffer,
        resource: &GpuResource,
        mem: &GuestMemoryMmap,
    ) -> Result<(), GpuResponse> {
        let backing = resource.backing.as_ref().ok_or(ErrUnspec)?;
        let target = fb.target.as_mut().ok_or(ErrUnspec)?;
        let Some(transfer) = resource.transfer else {
            // Nothing staged for this resource yet.
            return Ok(());
        };

        let bpp = fb.desc.bytes_pp as usize;
        let stride = fb.desc.stride as usize;
        let rect = transfer.rect;
        let offset = transfer.offset as usize;
        let pixels = target.as_mut_slice();

        if rect.x == 0 && rect.width == resource.width {
            // Full rows: one contiguous copy covers the whole window.
            let len = stride * rect.height as usize;
            let dst = rect.y as usize * stride;
            let out = pixels.get_mut(dst..dst + len).ok_or(ErrUnspec)?;
            let copied = backing.read_at(mem, offset, out).map_err(|e| {
                error!("Reading backing of resource {} failed: {e}", resource.id);
                ErrUnspec
            })?;
            if copied < len {
                warn!(
                    "Backing of resource {} ended {} bytes short of the staged window",
                    resource.id,
                    len - copied
                );
            }
        } else {
            let len = rect.width as usize * bpp;
            for h in 0..rect.height as usize {
                let src = offset + stride * h;
                let dst = (rect.y as usize + h) * stride + rect.x as usize * bpp;
                let out = pixels.get_mut(dst..dst + len).ok_or(ErrUnspec)?;
                let copied = backing.read_at(mem, src, out).map_err(|e| {
                    error!("Reading backing of resource {} failed: {e}", resource.id);
                    ErrUnspec
                })?;
                if copied < len {
                    warn!(
                        "Backing of resource {} ended {} bytes short of the staged window",
                        resource.id,
                        len - copied
                    );
                    break;
                }
            }
        }
        Ok(())
    }
}

impl VirtioGpu for ZoneVirtioGpu {
    fn display_info(&self) -> VirtioGpuResult {
        let info = (0..VIRTIO_GPU_MAX_SCANOUTS)
            .map(|scanout_id| {
                if (self.enabled_scanouts >> scanout_id) & 1 == 1 {
                    let state = &self.requested_states[scanout_id as usize];
                    (state.width, state.height, true)
                } else {
                    (0, 0, false)
                }
            })
            .collect();
        Ok(OkDisplayInfo(info))
    }

    fn get_edid(&self, scanout_id: u32) -> VirtioGpuResult {
        error!("EDID data is not available for scanout {scanout_id}");
        Err(ErrUnspec)
    }

    fn resource_create_2d(
        &mut self,
        resource_id: u32,
        format: u32,
        width: u32,
        height: u32,
    ) -> VirtioGpuResult {
        if resource_id == 0 || self.resources.contains_key(&resource_id) {
            return Err(ErrInvalidResourceId);
        }

        let hostmem = calc_image_hostmem(width, height);
        if self.hostmem + hostmem >= self.max_hostmem {
            // The front-end treats this as a dropped create, not a failure.
            // The guest keeps a dangling resource id.
            warn!(
                "Resource {resource_id} ({width}x{height}, {hostmem} bytes) would exceed the \
                 host memory budget of {} bytes, dropping create",
                self.max_hostmem
            );
            return Ok(OkNoData);
        }

        self.resources.insert(
            resource_id,
            GpuResource::new(resource_id, format, width, height, hostmem),
        );
        self.hostmem += hostmem;
        Ok(OkNoData)
    }

    fn unref_resource(&mut self, resource_id: u32) -> VirtioGpuResult {
        match self.resources.get(&resource_id) {
            None => return Err(ErrInvalidResourceId),
            Some(resource) if resource.scanouts.has_any_enabled() => {
                warn!(
                    "The driver requested unref_resource, but resource {resource_id} has \
                     associated scanouts, refusing to delete the resource."
                );
                return Err(ErrUnspec);
            }
            Some(_) => (),
        }

        let resource = self
            .resources
            .remove(&resource_id)
            .ok_or(ErrInvalidResourceId)?;
        self.hostmem -= resource.hostmem;
        Ok(OkNoData)
    }

    fn set_scanout(
        &mut self,
        scanout_id: u32,
        resource_id: u32,
        rect: Rectangle,
    ) -> VirtioGpuResult {
        if scanout_id as usize >= self.scanouts.len() {
            return Err(ErrInvalidScanoutId);
        }

        let resource = Self::checked_resource(&self.resources, resource_id)?;
        let fb_width = resource.width;
        let fb_height = resource.height;
        let stride = (resource.hostmem / u64::from(resource.height)) as u32;
        let format = resource.format;

        // The y origin is bounded by the width here, matching what the
        // front-end validates against.
        if rect.x > fb_width
            || rect.y > fb_width
            || rect.width < MIN_SCANOUT_RECT
            || rect.height < MIN_SCANOUT_RECT
            || rect.width > fb_width
            || rect.height > fb_height
            || u64::from(rect.x) + u64::from(rect.width) > u64::from(fb_width)
            || u64::from(rect.y) + u64::from(rect.height) > u64::from(fb_height)
        {
            error!(
                "Invalid scanout rectangle {rect:?} for resource {resource_id} \
                 ({fb_width}x{fb_height})"
            );
            return Err(ErrInvalidParameter);
        }

        let desc = FrameBufferDesc {
            format,
            bytes_pp: BYTES_PER_PIXEL,
            width: fb_width,
            height: fb_height,
            stride,
            offset: rect.x * BYTES_PER_PIXEL + rect.y * stride,
        };

        debug!("Enabling scanout scanout_id={scanout_id}, resource_id={resource_id}: {rect:?}");

        let scanout = &mut self.scanouts[scanout_id as usize];

        // If a resource is already associated with this scanout, make sure to
        // disable this scanout for that resource
        if scanout.resource_id != 0 {
            if let Some(previous) = self.resources.get_mut(&scanout.resource_id) {
                previous.scanouts.disable(scanout_id);
            }
        }

        // An active framebuffer is replaced wholesale, its target goes back
        // to the sink.
        if let Some(fb) = scanout.framebuffer.take() {
            if let Some(target) = fb.target {
                self.sink.release(scanout_id, target);
            }
        }

        if let Some(resource) = self.resources.get_mut(&resource_id) {
            resource.scanouts.enable(scanout_id);
        }
        let scanout = &mut self.scanouts[scanout_id as usize];
        scanout.resource_id = resource_id;
        scanout.rect = rect;
        scanout.framebuffer = Some(FrameBuffer { desc, target: None });
        Ok(OkNoData)
    }

    fn flush_resource(
        &mut self,
        resource_id: u32,
        rect: Rectangle,
        mem: &GuestMemoryMmap,
    ) -> VirtioGpuResult {
        let resource = Self::checked_resource(&self.resources, resource_id)?;
        Self::validate_rect(rect, resource.width, resource.height)?;

        let mut result = Ok(OkNoData);
        for scanout_id in resource.scanouts.iter_enabled() {
            let Some(fb) = self.scanouts[scanout_id as usize].framebuffer.as_mut() else {
                error!("Scanout {scanout_id} has no framebuffer, skipping flush");
                result = Err(ErrUnspec);
                continue;
            };

            if fb.target.is_none() {
                match self.sink.acquire(scanout_id, &fb.desc) {
                    Ok(target) => fb.target = Some(target),
                    Err(e) => {
                        error!(
                            "Failed to acquire framebuffer target for scanout {scanout_id}: {e}"
                        );
                        result = Err(ErrUnspec);
                        continue;
                    }
                }
            }

            if let Err(response) = Self::copy_and_flush(fb, resource, mem) {
                error!("Failed to flush resource {resource_id} to scanout {scanout_id}");
                result = Err(response);
            }
        }
        result
    }

    fn transfer_to_host_2d(
        &mut self,
        resource_id: u32,
        rect: Rectangle,
        offset: u64,
    ) -> VirtioGpuResult {
        let resource = Self::checked_resource_mut(&mut self.resources, resource_id)?;
        Self::validate_rect(rect, resource.width, resource.height)?;

        resource.transfer = Some(PendingTransfer { rect, offset });
        Ok(OkNoData)
    }

    fn attach_backing(
        &mut self,
        resource_id: u32,
        mem: &GuestMemoryMmap,
        entries: Vec<(GuestAddress, usize)>,
    ) -> VirtioGpuResult {
        let resource = self
            .resources
            .get_mut(&resource_id)
            .ok_or(ErrInvalidResourceId)?;
        if resource.backing.is_some() {
            warn!("Resource {resource_id} already has backing attached");
            return Err(ErrUnspec);
        }

        let backing = mapper::map_backing(mem, &entries).map_err(|e| {
            error!("Failed to map backing for resource {resource_id}: {e}");
            ErrUnspec
        })?;
        resource.backing = Some(backing);
        Ok(OkNoData)
    }

    fn detach_backing(&mut self, resource_id: u32) -> VirtioGpuResult {
        let resource = self
            .resources
            .get_mut(&resource_id)
            .ok_or(ErrInvalidResourceId)?;
        if resource.backing.take().is_none() {
            warn!("Resource {resource_id} has no backing to detach");
            return Err(ErrUnspec);
        }
        resource.transfer = None;
        Ok(OkNoData)
    }

    fn update_cursor(&mut self, scanout_id: u32, resource_id: u32) -> VirtioGpuResult {
        let scanout = self
            .scanouts
            .get_mut(scanout_id as usize)
            .ok_or(ErrInvalidScanoutId)?;
        debug!("Cursor resource for scanout {scanout_id} set to {resource_id}");
        scanout.cursor_resource_id = resource_id;
        Ok(OkNoData)
    }

    fn move_cursor(&mut self, scanout_id: u32, resource_id: u32) -> VirtioGpuResult {
        if scanout_id as usize >= self.scanouts.len() {
            return Err(ErrInvalidScanoutId);
        }
        if resource_id == 0 {
            debug!("Cursor on scanout {scanout_id} hidden");
        }
        Ok(OkNoData)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use vm_memory::Bytes;

    use super::*;
    use crate::{sink::MemorySink, DisplayState};

    const MEM_SIZE: usize = 4 * 1024 * 1024;
    const BACKING_ADDR: GuestAddress = GuestAddress(0x100_000);

    const DISPLAY_WIDTH: u32 = 1280;
    const DISPLAY_HEIGHT: u32 = 720;

    fn test_mem() -> GuestMemoryMmap {
        GuestMemoryMmap::<()>::from_ranges(&[(GuestAddress(0), MEM_SIZE)]).unwrap()
    }

    fn new_gpu() -> ZoneVirtioGpu {
        new_gpu_with_budget(crate::DEFAULT_MAX_HOSTMEM)
    }

    fn new_gpu_with_budget(max_hostmem: u64) -> ZoneVirtioGpu {
        let config = GpuConfig::new(
            vec![DisplayState {
                width: DISPLAY_WIDTH,
                height: DISPLAY_HEIGHT,
            }],
            max_hostmem,
        )
        .unwrap();
        ZoneVirtioGpu::new(&config, Box::new(MemorySink))
    }

    fn full_rect(width: u32, height: u32) -> Rectangle {
        Rectangle {
            x: 0,
            y: 0,
            width,
            height,
        }
    }

    /// Writes a recognizable byte pattern over `len` bytes of guest memory.
    fn write_pattern(mem: &GuestMemoryMmap, addr: GuestAddress, len: usize) -> Vec<u8> {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        mem.write(&data, addr).unwrap();
        data
    }

    fn create_and_attach(gpu: &mut ZoneVirtioGpu, mem: &GuestMemoryMmap, id: u32, w: u32, h: u32) {
        gpu.resource_create_2d(id, 67, w, h).unwrap();
        let len = (w * h * BYTES_PER_PIXEL) as usize;
        gpu.attach_backing(id, mem, vec![(BACKING_ADDR, len)])
            .unwrap();
    }

    #[test]
    fn test_associated_scanouts() {
        let mut scanouts = AssociatedScanouts::default();
        assert!(!scanouts.has_any_enabled());

        scanouts.enable(0);
        scanouts.enable(3);
        assert!(scanouts.has_any_enabled());
        assert_eq!(scanouts.iter_enabled().collect::<Vec<_>>(), vec![0, 3]);

        scanouts.disable(0);
        assert_eq!(scanouts.iter_enabled().collect::<Vec<_>>(), vec![3]);
        scanouts.disable(3);
        // Disabling twice must not flip the bit back on.
        scanouts.disable(3);
        assert!(!scanouts.has_any_enabled());
    }

    #[test]
    fn test_hostmem_footprint() {
        assert_eq!(calc_image_hostmem(1000, 500), 2_000_000);
        assert_eq!(calc_image_hostmem(64, 64), 64 * 64 * 4);
        assert_eq!(calc_image_hostmem(0, 100), 0);
    }

    #[test]
    fn test_create_resource_id_zero_rejected() {
        let mut gpu = new_gpu();
        let result = gpu.resource_create_2d(0, 67, 64, 64);
        assert_matches!(result, Err(ErrInvalidResourceId));
        assert_eq!(gpu.hostmem, 0);
        assert!(gpu.resources.is_empty());
    }

    #[test]
    fn test_create_duplicate_resource_rejected() {
        let mut gpu = new_gpu();
        gpu.resource_create_2d(1, 67, 64, 64).unwrap();
        let result = gpu.resource_create_2d(1, 67, 32, 32);
        assert_matches!(result, Err(ErrInvalidResourceId));
        assert_eq!(gpu.resources.len(), 1);
        assert_eq!(gpu.resources[&1].width, 64);
    }

    #[test]
    fn test_create_debits_footprint() {
        let mut gpu = new_gpu();
        gpu.resource_create_2d(1, 67, 1000, 500).unwrap();
        assert_eq!(gpu.hostmem, 2_000_000);

        gpu.unref_resource(1).unwrap();
        assert_eq!(gpu.hostmem, 0);
        assert!(gpu.resources.is_empty());
    }

    #[test]
    fn test_create_over_budget_is_a_silent_no_op() {
        let mut gpu = new_gpu_with_budget(1024 * 1024);
        let result = gpu.resource_create_2d(1, 67, 1024, 1024);
        assert_matches!(result, Ok(OkNoData));
        assert!(gpu.resources.is_empty());
        assert_eq!(gpu.hostmem, 0);
    }

    #[test]
    fn test_unref_unknown_resource() {
        let mut gpu = new_gpu();
        assert_matches!(gpu.unref_resource(7), Err(ErrInvalidResourceId));
    }

    #[test]
    fn test_unref_refused_while_scanned_out() {
        let mem = test_mem();
        let mut gpu = new_gpu();
        create_and_attach(&mut gpu, &mem, 1, 64, 64);
        gpu.set_scanout(0, 1, full_rect(64, 64)).unwrap();

        assert_matches!(gpu.unref_resource(1), Err(ErrUnspec));
        assert!(gpu.resources.contains_key(&1));
        assert_eq!(gpu.hostmem, 64 * 64 * 4);
    }

    #[test]
    fn test_double_attach_backing_rejected() {
        let mem = test_mem();
        let mut gpu = new_gpu();
        create_and_attach(&mut gpu, &mem, 1, 64, 64);

        let result = gpu.attach_backing(1, &mem, vec![(GuestAddress(0x200_000), 0x1000)]);
        assert_matches!(result, Err(ErrUnspec));
        // The original backing stays in place.
        let backing = gpu.resources[&1].backing.as_ref().unwrap();
        assert_eq!(backing.segments()[0].addr, BACKING_ADDR);
    }

    #[test]
    fn test_attach_backing_invalid_entry_rejected() {
        let mem = test_mem();
        let mut gpu = new_gpu();
        gpu.resource_create_2d(1, 67, 64, 64).unwrap();

        let result = gpu.attach_backing(1, &mem, vec![(GuestAddress(MEM_SIZE as u64), 0x1000)]);
        assert_matches!(result, Err(ErrUnspec));
        assert!(gpu.resources[&1].backing.is_none());
    }

    #[test]
    fn test_detach_backing_allows_reattach() {
        let mem = test_mem();
        let mut gpu = new_gpu();
        create_and_attach(&mut gpu, &mem, 1, 64, 64);
        gpu.transfer_to_host_2d(1, full_rect(64, 64), 0).unwrap();

        gpu.detach_backing(1).unwrap();
        assert!(gpu.resources[&1].backing.is_none());
        assert!(gpu.resources[&1].transfer.is_none());
        assert_matches!(gpu.detach_backing(1), Err(ErrUnspec));

        gpu.attach_backing(1, &mem, vec![(BACKING_ADDR, 64 * 64 * 4)])
            .unwrap();
        assert!(gpu.resources[&1].backing.is_some());
    }

    #[test]
    fn test_transfer_requires_backing() {
        let mut gpu = new_gpu();
        gpu.resource_create_2d(1, 67, 64, 64).unwrap();
        let result = gpu.transfer_to_host_2d(1, full_rect(64, 64), 0);
        assert_matches!(result, Err(ErrUnspec));
    }

    #[test]
    fn test_transfer_rect_out_of_bounds() {
        let mem = test_mem();
        let mut gpu = new_gpu();
        create_and_attach(&mut gpu, &mem, 1, 64, 64);

        let rect = Rectangle {
            x: 32,
            y: 0,
            width: 64,
            height: 64,
        };
        assert_matches!(
            gpu.transfer_to_host_2d(1, rect, 0),
            Err(ErrInvalidParameter)
        );
        assert!(gpu.resources[&1].transfer.is_none());
    }

    #[test]
    fn test_set_scanout_invalid_ids() {
        let mem = test_mem();
        let mut gpu = new_gpu();
        create_and_attach(&mut gpu, &mem, 1, 64, 64);

        assert_matches!(
            gpu.set_scanout(1, 1, full_rect(64, 64)),
            Err(ErrInvalidScanoutId)
        );
        assert_matches!(
            gpu.set_scanout(0, 99, full_rect(64, 64)),
            Err(ErrInvalidResourceId)
        );
    }

    #[test]
    fn test_set_scanout_rejects_small_or_oversized_rects() {
        let mem = test_mem();
        let mut gpu = new_gpu();
        create_and_attach(&mut gpu, &mem, 1, 64, 64);
        create_and_attach(&mut gpu, &mem, 2, 64, 64);
        gpu.set_scanout(0, 1, full_rect(64, 64)).unwrap();

        // Too small.
        let result = gpu.set_scanout(0, 2, full_rect(8, 8));
        assert_matches!(result, Err(ErrInvalidParameter));

        // Out of bounds.
        let rect = Rectangle {
            x: 32,
            y: 32,
            width: 48,
            height: 48,
        };
        assert_matches!(gpu.set_scanout(0, 2, rect), Err(ErrInvalidParameter));

        // The prior binding is untouched.
        assert_eq!(gpu.scanouts[0].resource_id, 1);
        assert!(gpu.resources[&1].scanouts.has_any_enabled());
        assert!(!gpu.resources[&2].scanouts.has_any_enabled());
    }

    #[test]
    fn test_set_scanout_rebinds_resource() {
        let mem = test_mem();
        let mut gpu = new_gpu();
        create_and_attach(&mut gpu, &mem, 1, 64, 64);
        create_and_attach(&mut gpu, &mem, 2, 64, 64);

        gpu.set_scanout(0, 1, full_rect(64, 64)).unwrap();
        assert!(gpu.resources[&1].scanouts.has_any_enabled());

        gpu.set_scanout(0, 2, full_rect(64, 64)).unwrap();
        assert!(!gpu.resources[&1].scanouts.has_any_enabled());
        assert!(gpu.resources[&2].scanouts.has_any_enabled());
        assert_eq!(gpu.scanouts[0].resource_id, 2);

        // Resource 1 is no longer pinned by a scanout and can go away.
        assert_matches!(gpu.unref_resource(1), Ok(OkNoData));
    }

    #[test]
    fn test_set_scanout_framebuffer_descriptor() {
        let mem = test_mem();
        let mut gpu = new_gpu();
        create_and_attach(&mut gpu, &mem, 1, 64, 64);

        let rect = Rectangle {
            x: 16,
            y: 16,
            width: 32,
            height: 32,
        };
        gpu.set_scanout(0, 1, rect).unwrap();

        let fb = gpu.scanouts[0].framebuffer.as_ref().unwrap();
        assert_eq!(
            fb.desc,
            FrameBufferDesc {
                format: 67,
                bytes_pp: 4,
                width: 64,
                height: 64,
                stride: 256,
                offset: 16 * 4 + 16 * 256,
            }
        );
        assert!(fb.target.is_none());
    }

    #[test]
    fn test_transfer_and_flush_full_rows() {
        const W: u32 = 64;
        const H: u32 = 64;
        let mem = test_mem();
        let mut gpu = new_gpu();
        create_and_attach(&mut gpu, &mem, 1, W, H);
        let data = write_pattern(&mem, BACKING_ADDR, (W * H * 4) as usize);

        gpu.set_scanout(0, 1, full_rect(W, H)).unwrap();
        gpu.transfer_to_host_2d(1, full_rect(W, H), 0).unwrap();
        gpu.flush_resource(1, full_rect(W, H), &mem).unwrap();

        let fb = gpu.scanouts[0].framebuffer.as_ref().unwrap();
        let pixels = fb.target.as_ref().unwrap().as_slice();
        assert_eq!(pixels, &data[..]);
    }

    #[test]
    fn test_transfer_and_flush_partial_rows() {
        const W: u32 = 64;
        const H: u32 = 64;
        const STRIDE: usize = (W * 4) as usize;
        let mem = test_mem();
        let mut gpu = new_gpu();
        create_and_attach(&mut gpu, &mem, 1, W, H);
        let data = write_pattern(&mem, BACKING_ADDR, (W * H * 4) as usize);

        let rect = Rectangle {
            x: 16,
            y: 8,
            width: 32,
            height: 16,
        };
        let offset = (rect.y as usize) * STRIDE + (rect.x as usize) * 4;

        gpu.set_scanout(0, 1, full_rect(W, H)).unwrap();
        gpu.transfer_to_host_2d(1, rect, offset as u64).unwrap();
        gpu.flush_resource(1, full_rect(W, H), &mem).unwrap();

        let fb = gpu.scanouts[0].framebuffer.as_ref().unwrap();
        let pixels = fb.target.as_ref().unwrap().as_slice();

        let row_len = rect.width as usize * 4;
        for h in 0..rect.height as usize {
            let src = offset + STRIDE * h;
            let dst = (rect.y as usize + h) * STRIDE + rect.x as usize * 4;
            assert_eq!(
                &pixels[dst..dst + row_len],
                &data[src..src + row_len],
                "row {h} differs"
            );
        }
        // Pixels outside the window stay untouched.
        assert!(pixels[..rect.y as usize * STRIDE].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_flush_requires_backing() {
        let mem = test_mem();
        let mut gpu = new_gpu();
        gpu.resource_create_2d(1, 67, 64, 64).unwrap();
        assert_matches!(
            gpu.flush_resource(1, full_rect(64, 64), &mem),
            Err(ErrUnspec)
        );
    }

    #[test]
    fn test_flush_unknown_resource() {
        let mem = test_mem();
        let gpu = &mut new_gpu();
        assert_matches!(
            gpu.flush_resource(9, full_rect(64, 64), &mem),
            Err(ErrInvalidResourceId)
        );
    }

    #[test]
    fn test_display_info_reports_requested_state() {
        let gpu = new_gpu();
        let result = gpu.display_info().unwrap();
        let OkDisplayInfo(info) = result else {
            panic!("expected OkDisplayInfo");
        };
        assert_eq!(info.len(), VIRTIO_GPU_MAX_SCANOUTS as usize);
        assert_eq!(info[0], (DISPLAY_WIDTH, DISPLAY_HEIGHT, true));
        for entry in &info[1..] {
            assert_eq!(*entry, (0, 0, false));
        }
    }

    #[test]
    fn test_display_info_all_scanouts_disabled() {
        let mut gpu = new_gpu();
        gpu.enabled_scanouts = 0;
        let result = gpu.display_info().unwrap();
        let OkDisplayInfo(info) = result else {
            panic!("expected OkDisplayInfo");
        };
        assert!(info.iter().all(|&entry| entry == (0, 0, false)));
    }

    #[test]
    fn test_get_edid_unsupported() {
        let gpu = new_gpu();
        assert_matches!(gpu.get_edid(0), Err(ErrUnspec));
    }

    #[test]
    fn test_remove_framebuffer() {
        let mem = test_mem();
        let mut gpu = new_gpu();
        create_and_attach(&mut gpu, &mem, 1, 64, 64);
        gpu.set_scanout(0, 1, full_rect(64, 64)).unwrap();

        // No target acquired yet.
        assert_matches!(gpu.remove_framebuffer(0), Err(ErrUnspec));

        gpu.transfer_to_host_2d(1, full_rect(64, 64), 0).unwrap();
        gpu.flush_resource(1, full_rect(64, 64), &mem).unwrap();
        assert_matches!(gpu.remove_framebuffer(0), Ok(OkNoData));
        assert!(gpu.scanouts[0]
            .framebuffer
            .as_ref()
            .unwrap()
            .target
            .is_none());

        assert_matches!(gpu.remove_framebuffer(5), Err(ErrInvalidScanoutId));
    }

    #[test]
    fn test_cursor_plumbing() {
        let mut gpu = new_gpu();
        assert_matches!(gpu.update_cursor(0, 5), Ok(OkNoData));
        assert_eq!(gpu.scanouts[0].cursor_resource_id, 5);
        assert_matches!(gpu.update_cursor(3, 5), Err(ErrInvalidScanoutId));

        assert_matches!(gpu.move_cursor(0, 0), Ok(OkNoData));
        assert_matches!(gpu.move_cursor(3, 1), Err(ErrInvalidScanoutId));
    }
}
