//! Dk demo viewer
//!
//! Clears the window to an animated colour through the full frame loop, and
//! uploads a small vertex buffer at start-up.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p dk-viewer -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--frames <N>`: Exit after rendering N frames
//! - `--vsync`: Present with FIFO instead of MAILBOX
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;

use dk_app::{run_app, AppConfig};

use crate::app::{Viewer, ViewerParams};

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;

fn main() -> anyhow::Result<()> {
    // Check for help flag before starting the app
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    let params = ViewerParams::from_env()?;

    run_app::<Viewer>(
        AppConfig::new("Dk Viewer")
            .with_size(WIDTH, HEIGHT)
            .with_vsync(params.vsync),
    )
}

fn print_help() {
    eprintln!(
        "Dk demo viewer

USAGE:
    cargo run -p dk-viewer -- [OPTIONS]

OPTIONS:
    --frames <N>            Exit after rendering N frames
    --vsync                 Present with FIFO instead of MAILBOX
    -h, --help              Print this help message

EXAMPLES:
    # Run until the window is closed
    cargo run -p dk-viewer

    # Render 300 frames with vsync, then exit
    cargo run -p dk-viewer -- --vsync --frames 300

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)"
    );
}
