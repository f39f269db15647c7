//! Application runner for the Cinder renderer.
//!
//! This crate handles the boilerplate around the GPU layer:
//! - Logging initialization
//! - Window, device and renderer creation
//! - The per-frame begin/record/end loop
//! - Resize handling
//! - Orderly teardown
//!
//! # Example
//!
//! ```no_run
//! use cinder_app::{run_app, AppContext, CinderApp, EngineConfig, FrameContext};
//!
//! struct MyApp;
//!
//! impl CinderApp for MyApp {
//!     fn init(_ctx: &mut AppContext) -> anyhow::Result<Self> {
//!         Ok(MyApp)
//!     }
//!
//!     fn update(&mut self, _ctx: &mut AppContext, _dt: f32) {}
//!
//!     fn render(&mut self, _ctx: &AppContext, _frame: &mut FrameContext) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<MyApp>(EngineConfig::new("My App"))
//! }
//! ```

mod app;
mod context;
mod frame;
mod runner;

pub use app::CinderApp;
pub use context::AppContext;
pub use frame::FrameContext;
pub use runner::{init_logging, run_app};

// Re-export commonly used types for convenience
pub use cinder_core::EngineConfig;
pub use cinder_gpu::{Device, Renderer};
pub use cinder_platform::PlatformWindow;
pub use winit::event::WindowEvent;
