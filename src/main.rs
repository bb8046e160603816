// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{path::PathBuf, process::exit};

use clap::Parser;
use log::error;
use zone_device_gpu::{
    start_backend, DisplayState, GpuConfig, GpuConfigError, DEFAULT_MAX_HOSTMEM,
};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct GpuArgs {
    /// vhost-user Unix domain socket.
    #[clap(short, long, value_name = "SOCKET")]
    pub socket_path: PathBuf,

    /// Requested width of the display, in pixels
    #[clap(long, default_value_t = 1280)]
    pub width: u32,

    /// Requested height of the display, in pixels
    #[clap(long, default_value_t = 720)]
    pub height: u32,

    /// Host memory budget for guest resources, in bytes
    #[clap(short = 'm', long, default_value_t = DEFAULT_MAX_HOSTMEM)]
    pub max_hostmem: u64,
}

pub fn config_from_args(args: GpuArgs) -> Result<(PathBuf, GpuConfig), GpuConfigError> {
    let displays = vec![DisplayState {
        width: args.width,
        height: args.height,
    }];
    let config = GpuConfig::new(displays, args.max_hostmem)?;
    Ok((args.socket_path, config))
}

pub fn main() {
    env_logger::init();

    let args = GpuArgs::parse();

    let (socket_path, config) = match config_from_args(args) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            exit(1);
        }
    };

    if let Err(e) = start_backend(&socket_path, config) {
        error!("{e}");
        exit(1);
    }
}
