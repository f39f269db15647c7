//! Application runner and event loop.

use std::sync::Arc;
use std::time::Instant;

use cinder_core::EngineConfig;
use cinder_gpu::{DeviceBuilder, Renderer, SwapChainOptions};
use cinder_platform::PlatformWindow;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::WindowId;

use crate::app::CinderApp;
use crate::context::AppContext;
use crate::frame::FrameContext;

/// Install the `tracing` subscriber.
///
/// Honors `RUST_LOG`, falling back to `info`. Calling it twice is harmless.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}

/// Run a [`CinderApp`] with the given configuration.
///
/// Initializes logging, creates the window, device and renderer, and runs
/// the event loop until the window is closed. Initialization failures are
/// returned once the loop has exited.
pub fn run_app<A: CinderApp + 'static>(config: EngineConfig) -> anyhow::Result<()> {
    init_logging();
    config.validate()?;

    info!("{} starting...", config.window.title);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner::<A> {
        config,
        state: None,
        init_error: None,
    };

    event_loop.run_app(&mut runner)?;

    match runner.init_error.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Internal application runner that implements winit's `ApplicationHandler`.
struct AppRunner<A: CinderApp> {
    config: EngineConfig,
    state: Option<AppState<A>>,
    init_error: Option<anyhow::Error>,
}

/// Internal application state.
struct AppState<A: CinderApp> {
    ctx: AppContext,
    app: A,
    stats: FrameStats,
}

impl<A: CinderApp + 'static> ApplicationHandler for AppRunner<A> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        info!("Creating application state...");

        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Application ready!");
            }
            Err(e) => {
                error!("Failed to initialize application: {e:#}");
                self.init_error = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        if let Some(state) = &mut self.state {
            if state.app.on_event(&event) {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                if let Some(mut state) = self.state.take() {
                    state.cleanup();
                }
                event_loop.exit();
            }
            WindowEvent::RedrawRequested => {
                if let Some(state) = &mut self.state {
                    if let Err(e) = state.render_frame() {
                        error!("Render error: {e:#}");
                        if let Some(mut state) = self.state.take() {
                            state.cleanup();
                        }
                        event_loop.exit();
                    }
                }
            }
            WindowEvent::Resized(size) => {
                if let Some(state) = &mut self.state {
                    if let Err(e) = state.handle_resize(size.width, size.height) {
                        error!("Resize error: {e:#}");
                    }
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.ctx.window.request_redraw();
        }
    }
}

impl<A: CinderApp + 'static> AppRunner<A> {
    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState<A>> {
        let window = Arc::new(PlatformWindow::create(event_loop, &self.config.window)?);

        let device = Arc::new(
            DeviceBuilder::new()
                .app_name(&self.config.window.title)
                .validation(self.config.validation)
                .build(window.as_ref())?,
        );

        info!("GPU: {}", device.capabilities().summary());

        let renderer = Renderer::new(
            &device,
            Arc::clone(&window),
            SwapChainOptions {
                vsync: self.config.vsync,
                frames_in_flight: self.config.frames_in_flight,
            },
        )?;

        let mut ctx = AppContext::new(renderer, device, window, self.config.clone());
        let app = A::init(&mut ctx)?;

        Ok(AppState {
            ctx,
            app,
            stats: FrameStats::default(),
        })
    }
}

impl<A: CinderApp> AppState<A> {
    #[cfg_attr(
        feature = "trace-spans",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn render_frame(&mut self) -> anyhow::Result<()> {
        if self.ctx.window.is_minimized() {
            return Ok(());
        }

        let now = Instant::now();
        let dt = now.duration_since(self.ctx.last_frame_time).as_secs_f32();
        self.ctx.last_frame_time = now;
        self.stats.record(dt);

        self.app.update(&mut self.ctx, dt);

        let Some(cmd) = self.ctx.renderer.begin_frame()? else {
            return Ok(());
        };

        let mut frame = FrameContext::new(
            cmd,
            self.ctx.renderer.current_image_index(),
            self.ctx.renderer.frame_index(),
            dt,
            self.ctx.frame_count,
        );

        // The frame is always ended so the renderer never stays mid-frame.
        let recorded = self.record(&mut frame);
        self.ctx.renderer.end_frame()?;
        recorded?;

        self.ctx.frame_count += 1;
        self.ctx.deletion_queue.process(self.ctx.frame_count);
        Ok(())
    }

    fn record(&mut self, frame: &mut FrameContext) -> anyhow::Result<()> {
        self.app.prepare(&self.ctx, frame)?;

        self.ctx
            .renderer
            .begin_swap_chain_render_pass(frame.command_buffer)?;
        let rendered = self.app.render(&self.ctx, frame);
        self.ctx
            .renderer
            .end_swap_chain_render_pass(frame.command_buffer);
        rendered
    }

    fn handle_resize(&mut self, width: u32, height: u32) -> anyhow::Result<()> {
        if width == 0 || height == 0 {
            return Ok(());
        }

        self.ctx.renderer.mark_resized();
        self.app.on_resize(&mut self.ctx, width, height)?;

        info!("Resized to {}x{}", width, height);
        Ok(())
    }

    fn cleanup(&mut self) {
        if let Some(summary) = self.stats.summary() {
            info!("FPS Statistics:");
            info!("  Min: {:.1}", summary.min_fps);
            info!("  Max: {:.1}", summary.max_fps);
            info!("  Avg: {:.1}", summary.avg_fps);
            info!("  Total frames: {}", self.ctx.frame_count);
        }

        info!("Starting cleanup...");
        if let Err(e) = self.ctx.device.wait_idle() {
            error!("Failed to wait idle: {e}");
        }

        self.app.cleanup(&mut self.ctx);
        self.ctx.deletion_queue.flush();

        info!("Cleanup complete");
    }
}

/// Running frame-rate statistics.
#[derive(Debug, Default)]
struct FrameStats {
    min_fps: Option<f64>,
    max_fps: f64,
    fps_sum: f64,
    samples: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct FpsSummary {
    min_fps: f64,
    max_fps: f64,
    avg_fps: f64,
}

impl FrameStats {
    fn record(&mut self, dt: f32) {
        if dt <= 0.0 {
            return;
        }
        let fps = 1.0 / f64::from(dt);
        self.min_fps = Some(self.min_fps.map_or(fps, |min| min.min(fps)));
        self.max_fps = self.max_fps.max(fps);
        self.fps_sum += fps;
        self.samples += 1;
    }

    fn summary(&self) -> Option<FpsSummary> {
        let min_fps = self.min_fps?;
        Some(FpsSummary {
            min_fps,
            max_fps: self.max_fps,
            avg_fps: self.fps_sum / self.samples as f64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn stats_track_min_max_avg() {
        let mut stats = FrameStats::default();
        stats.record(0.5);
        stats.record(0.25);
        stats.record(0.0);

        let summary = stats.summary().unwrap();
        assert_relative_eq!(summary.min_fps, 2.0);
        assert_relative_eq!(summary.max_fps, 4.0);
        assert_relative_eq!(summary.avg_fps, 3.0);
    }

    #[test]
    fn empty_stats_have_no_summary() {
        assert!(FrameStats::default().summary().is_none());
    }
}
