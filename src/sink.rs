// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Display output seam. The device model composites into pixel memory handed
//! out by a [`DisplaySink`]; what happens to those pixels afterwards is the
//! sink's business.

use log::debug;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum SinkError {
    #[error("no display target available for scanout {0}")]
    TargetUnavailable(u32),
}

/// Geometry of a framebuffer as derived from the scanned-out resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameBufferDesc {
    pub format: u32,
    pub bytes_pp: u32,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub offset: u32,
}

impl FrameBufferDesc {
    pub const fn size(&self) -> usize {
        self.stride as usize * self.height as usize
    }
}

/// Pixel memory owned by a sink for the lifetime of one framebuffer binding.
#[derive(Debug)]
pub struct FrameBufferTarget {
    pixels: Box<[u8]>,
}

impl FrameBufferTarget {
    pub fn as_slice(&self) -> &[u8] {
        &self.pixels
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.pixels
    }
}

pub trait DisplaySink {
    /// Hands out a pixel-memory target matching `desc` for the given scanout.
    fn acquire(&mut self, scanout_id: u32, desc: &FrameBufferDesc)
        -> Result<FrameBufferTarget, SinkError>;

    /// Returns a target once the scanout stops using it.
    fn release(&mut self, scanout_id: u32, target: FrameBufferTarget);
}

/// Sink that composites into plain host memory. Stands in until a real
/// display path is wired up.
#[derive(Debug, Default)]
pub struct MemorySink;

impl DisplaySink for MemorySink {
    fn acquire(
        &mut self,
        scanout_id: u32,
        desc: &FrameBufferDesc,
    ) -> Result<FrameBufferTarget, SinkError> {
        debug!(
            "Allocating {} byte framebuffer target for scanout {scanout_id}",
            desc.size()
        );
        Ok(FrameBufferTarget {
            pixels: vec![0; desc.size()].into_boxed_slice(),
        })
    }

    fn release(&mut self, scanout_id: u32, target: FrameBufferTarget) {
        debug!(
            "Releasing {} byte framebuffer target for scanout {scanout_id}",
            target.as_slice().len()
        );
        drop(target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_allocates_zeroed_target() {
        let desc = FrameBufferDesc {
            format: 67,
            bytes_pp: 4,
            width: 64,
            height: 32,
            stride: 256,
            offset: 0,
        };
        let mut sink = MemorySink;

        let target = sink.acquire(0, &desc).unwrap();
        assert_eq!(target.as_slice().len(), 256 * 32);
        assert!(target.as_slice().iter().all(|&b| b == 0));

        sink.release(0, target);
    }
}
