//! Cinder demo viewer
//!
//! Draws a spinning triangle through the full resource path: a host-visible
//! vertex buffer swapped through deferred deletion, per-frame data bound
//! through descriptor sets (a uniform buffer, or a bindless storage array when
//! the device supports it), push constants and a preset graphics pipeline.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p cinder-viewer -- [CONFIG.toml]
//! ```
//!
//! The vertex and fragment shaders live in `apps/cinder-viewer/shaders/` as
//! GLSL. Compile them to `triangle.vert.spv`, `triangle_bindless.vert.spv` and
//! `triangle.frag.spv` inside the configured shader folder
//! (`glslc triangle.vert -o triangle.vert.spv`).
//! Without them the viewer only clears the screen.
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;

use cinder_app::run_app;
use cinder_core::EngineConfig;

use crate::app::Viewer;

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;

fn main() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::new("Cinder Viewer").with_size(WIDTH, HEIGHT),
    };

    run_app::<Viewer>(config)
}
