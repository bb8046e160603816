// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

pub mod device;
pub mod mapper;
pub mod protocol;
pub mod sink;
pub mod virtio_gpu;

use std::path::Path;

use log::info;
use thiserror::Error as ThisError;
use vhost_user_backend::VhostUserDaemon;
use vm_memory::{GuestMemoryAtomic, GuestMemoryMmap};

use crate::{device::VhostUserGpuBackend, protocol::VIRTIO_GPU_MAX_SCANOUTS};

/// Host memory budget for guest resources when none is configured.
pub const DEFAULT_MAX_HOSTMEM: u64 = 256 * 1024 * 1024;

/// Requested geometry of one scanout, advertised to the guest through
/// get-display-info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayState {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, ThisError)]
pub enum GpuConfigError {
    #[error("At least one display must be configured")]
    NoDisplays,
    #[error("{0} displays requested, at most {VIRTIO_GPU_MAX_SCANOUTS} are supported")]
    TooManyDisplays(usize),
    #[error("Display geometry must be non-zero")]
    ZeroDisplayGeometry,
    #[error("Host memory budget must be non-zero")]
    ZeroHostmem,
}

/// This structure holds the configuration for the GPU backend
#[derive(Debug, Clone)]
pub struct GpuConfig {
    displays: Vec<DisplayState>,
    max_hostmem: u64,
}

impl GpuConfig {
    /// Create a new instance of the `GpuConfig` struct, containing the
    /// parameters to be fed into the gpu-backend server.
    pub fn new(displays: Vec<DisplayState>, max_hostmem: u64) -> Result<Self, GpuConfigError> {
        if displays.is_empty() {
            return Err(GpuConfigError::NoDisplays);
        }
        if displays.len() > VIRTIO_GPU_MAX_SCANOUTS as usize {
            return Err(GpuConfigError::TooManyDisplays(displays.len()));
        }
        if displays.iter().any(|d| d.width == 0 || d.height == 0) {
            return Err(GpuConfigError::ZeroDisplayGeometry);
        }
        if max_hostmem == 0 {
            return Err(GpuConfigError::ZeroHostmem);
        }

        Ok(Self {
            displays,
            max_hostmem,
        })
    }

    pub fn displays(&self) -> &[DisplayState] {
        &self.displays
    }

    pub fn num_scanouts(&self) -> u32 {
        self.displays.len() as u32
    }

    pub const fn max_hostmem(&self) -> u64 {
        self.max_hostmem
    }
}

#[derive(Debug, ThisError)]
pub enum StartError {
    #[error("Could not create backend: {0}")]
    CouldNotCreateBackend(device::Error),
    #[error("Could not create daemon: {0}")]
    CouldNotCreateDaemon(vhost_user_backend::Error),
    #[error("Fatal error: {0}")]
    ServeFailed(vhost_user_backend::Error),
}

pub fn start_backend(socket_path: &Path, config: GpuConfig) -> Result<(), StartError> {
    info!("Starting backend");
    let backend = VhostUserGpuBackend::new(config).map_err(StartError::CouldNotCreateBackend)?;

    let mut daemon = VhostUserDaemon::new(
        "zone-device-gpu-backend".to_string(),
        backend,
        GuestMemoryAtomic::new(GuestMemoryMmap::new()),
    )
    .map_err(StartError::CouldNotCreateDaemon)?;

    daemon.serve(socket_path).map_err(StartError::ServeFailed)?;
    Ok(())
}
