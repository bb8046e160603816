// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Translation of guest backing-store entry lists into validated
//! scatter-gather segments.

use log::error;
use thiserror::Error as ThisError;
use vm_memory::{Bytes, GuestAddress, GuestMemory, GuestMemoryMmap};

/// Upper bound on the number of mem entries a single attach-backing request
/// may carry.
pub const MAX_BACKING_ENTRIES: usize = 16384;

#[derive(Debug, ThisError)]
pub enum MapError {
    #[error("backing list has {0} entries, limit is {MAX_BACKING_ENTRIES}")]
    TooManyEntries(usize),
    #[error("backing entry {addr:?} len {len:#x} is not accessible guest memory")]
    InvalidEntry { addr: GuestAddress, len: usize },
    #[error("reading backing segment {addr:?} failed: {source}")]
    ReadFailed {
        addr: GuestAddress,
        source: vm_memory::GuestMemoryError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackingSegment {
    pub addr: GuestAddress,
    pub len: usize,
}

/// A validated scatter-gather view of the guest pages backing a resource.
///
/// Entry lengths are preserved as-is: one segment per mem entry, no merging
/// and no copying at mapping time.
#[derive(Debug, Clone, Default)]
pub struct GuestBacking {
    segments: Vec<BackingSegment>,
    total_len: usize,
}

impl GuestBacking {
    pub fn segments(&self) -> &[BackingSegment] {
        &self.segments
    }

    pub const fn total_len(&self) -> usize {
        self.total_len
    }

    /// Copies `buf.len()` bytes out of the backing starting at `offset`,
    /// walking segments as needed. Returns the number of bytes copied,
    /// which is short when the backing ends before the buffer is full.
    pub fn read_at(
        &self,
        mem: &GuestMemoryMmap,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<usize, MapError> {
        let mut skip = offset;
        let mut done = 0;
        for segment in &self.segments {
            if done == buf.len() {
                break;
            }
            if skip >= segment.len {
                skip -= segment.len;
                continue;
            }
            let len = (segment.len - skip).min(buf.len() - done);
            let addr = GuestAddress(segment.addr.0 + skip as u64);
            mem.read_slice(&mut buf[done..done + len], addr)
                .map_err(|source| MapError::ReadFailed { addr, source })?;
            done += len;
            skip = 0;
        }
        Ok(done)
    }
}

/// Builds a [`GuestBacking`] from a decoded mem-entry list.
///
/// Every entry is validated against the zone's memory map before anything is
/// retained, so a bad entry in the middle of the list leaves no partial
/// mapping behind.
pub fn map_backing(
    mem: &GuestMemoryMmap,
    entries: &[(GuestAddress, usize)],
) -> Result<GuestBacking, MapError> {
    if entries.len() > MAX_BACKING_ENTRIES {
        return Err(MapError::TooManyEntries(entries.len()));
    }

    let mut segments = Vec::with_capacity(entries.len());
    let mut total_len = 0_usize;
    for &(addr, len) in entries {
        if mem.get_slice(addr, len).is_err() {
            error!("Backing entry {addr:?} len {len:#x} rejected by the zone memory map");
            return Err(MapError::InvalidEntry { addr, len });
        }
        segments.push(BackingSegment { addr, len });
        total_len += len;
    }

    Ok(GuestBacking {
        segments,
        total_len,
    })
}
