//! flmap: live camera filter viewer CLI.

use anyhow::Result;
use clap::Parser;
use flmap::capture::{opener_for, BackendOpener, CaptureConfig, TestPatternCapture};
use flmap::config::{Config, OutputMode, Overrides, SourceKind};
use flmap::orchestrator::Orchestrator;
use flmap::processing::{FrameProcessor, ProcessingMode};
use flmap::render::{RenderBackend, RenderPipeline, WgpuBackend};
use flmap::utils::FpsCounter;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{Window, WindowAttributes, WindowId};

/// Live camera filter viewer.
#[derive(Parser, Debug)]
#[command(name = "flmap")]
#[command(about = "Show a camera feed through a grayscale or edge-detection filter in real time")]
struct Args {
    /// YAML configuration file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Camera device index
    #[arg(short, long)]
    input: Option<u32>,

    /// Frame width
    #[arg(long)]
    width: Option<u32>,

    /// Frame height
    #[arg(long)]
    height: Option<u32>,

    /// Target frames per second
    #[arg(long)]
    fps: Option<u32>,

    /// Initial processing mode
    #[arg(short, long, value_enum)]
    mode: Option<ProcessingMode>,

    /// Frame source
    #[arg(long, value_enum)]
    source: Option<SourceKind>,

    /// Output mode: window or headless
    #[arg(long, value_enum)]
    output: Option<OutputMode>,

    /// List available cameras and exit
    #[arg(long)]
    list_devices: bool,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            device_index: self.input,
            width: self.width,
            height: self.height,
            fps: self.fps,
            mode: self.mode,
            source: self.source,
            output: self.output,
        }
    }
}

#[cfg(any(target_os = "macos", target_os = "windows", target_os = "linux"))]
fn camera_opener(config: CaptureConfig) -> BackendOpener {
    opener_for::<flmap::capture::NokhwaCapture>(config)
}

#[cfg(not(any(target_os = "macos", target_os = "windows", target_os = "linux")))]
fn camera_opener(_config: CaptureConfig) -> BackendOpener {
    Arc::new(|| {
        Err(flmap::capture::CaptureError::Unavailable(
            "no camera backend on this platform".to_string(),
        ))
    })
}

fn backend_opener(config: &Config) -> BackendOpener {
    match config.source {
        SourceKind::Camera => camera_opener(config.capture_config()),
        SourceKind::TestPattern => opener_for::<TestPatternCapture>(config.capture_config()),
    }
}

fn list_devices() {
    #[cfg(any(target_os = "macos", target_os = "windows", target_os = "linux"))]
    {
        use flmap::capture::{CaptureBackend, NokhwaCapture};

        println!("Available cameras:");
        match NokhwaCapture::list_devices() {
            Ok(devices) => {
                for device in devices {
                    println!("  [{}] {}", device.index, device.name);
                }
            }
            Err(e) => {
                eprintln!("Failed to list devices: {}", e);
            }
        }
    }
    #[cfg(not(any(target_os = "macos", target_os = "windows", target_os = "linux")))]
    eprintln!("No camera backend on this platform");
}

/// Application state for the event loop.
struct FlmapApp {
    config: Config,
    orchestrator: Orchestrator,
    window: Option<Arc<Window>>,
    pipeline: Option<RenderPipeline<WgpuBackend>>,
    // Capture toggled off with Space stays off across suspend/resume.
    capture_paused: bool,
    fps: FpsCounter,
}

impl FlmapApp {
    fn new(config: Config, orchestrator: Orchestrator) -> Self {
        Self {
            config,
            orchestrator,
            window: None,
            pipeline: None,
            capture_paused: false,
            fps: FpsCounter::new(),
        }
    }

    fn update_title(&self) {
        if let Some(window) = &self.window {
            let state = if self.orchestrator.is_running() { "" } else { " (paused)" };
            window.set_title(&format!(
                "{} - {}{}",
                self.config.title,
                self.orchestrator.processing_mode(),
                state
            ));
        }
    }

    fn start_capture(&mut self) {
        if let Err(e) = self.orchestrator.start() {
            error!("Failed to start capture: {}", e);
        }
        self.update_title();
    }

    fn initialize(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window_attrs = WindowAttributes::default()
            .with_title(self.config.title.clone())
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));
        let window = Arc::new(event_loop.create_window(window_attrs)?);

        let backend = WgpuBackend::new(window.clone())?;
        let mut pipeline = RenderPipeline::new(backend, self.orchestrator.slot());
        pipeline.on_surface_created()?;
        let size = window.inner_size();
        pipeline.on_surface_resized(size.width, size.height)?;
        info!("Window created successfully");

        self.window = Some(window);
        self.pipeline = Some(pipeline);
        Ok(())
    }

    fn handle_key(&mut self, event_loop: &ActiveEventLoop, event: KeyEvent) {
        if event.state != ElementState::Pressed || event.repeat {
            return;
        }
        let PhysicalKey::Code(code) = event.physical_key else {
            return;
        };
        match code {
            KeyCode::KeyG => self.orchestrator.set_processing_mode(ProcessingMode::Grayscale),
            KeyCode::KeyE => self.orchestrator.set_processing_mode(ProcessingMode::EdgeDetect),
            KeyCode::KeyP => self.orchestrator.set_processing_mode(ProcessingMode::Passthrough),
            KeyCode::Space => {
                if self.orchestrator.is_running() {
                    self.orchestrator.stop();
                    self.capture_paused = true;
                } else {
                    self.capture_paused = false;
                    self.start_capture();
                }
            }
            KeyCode::Escape => {
                info!("Escape pressed, exiting");
                event_loop.exit();
                return;
            }
            _ => return,
        }
        self.update_title();
    }

    fn render(&mut self) {
        let Some(pipeline) = &mut self.pipeline else {
            return;
        };
        if let Err(e) = pipeline.on_render_tick() {
            error!("Render error: {}", e);
        }

        if let Some(fps) = self.fps.update() {
            let (w, h) = pipeline.backend().texture_size().unwrap_or((0, 0));
            debug!(
                "[Perf] Rendering at {:.2} FPS (Resolution: {}x{}, mode {}, dropped {})",
                fps,
                w,
                h,
                self.orchestrator.processing_mode(),
                self.orchestrator.slot().stats().dropped
            );
        }
    }
}

impl ApplicationHandler for FlmapApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.pipeline.is_some() {
            return;
        }

        if let Err(e) = self.initialize(event_loop) {
            error!("Initialization error: {:#}", e);
            event_loop.exit();
            return;
        }
        if !self.capture_paused {
            self.start_capture();
        }
    }

    fn suspended(&mut self, _event_loop: &ActiveEventLoop) {
        // Capture keeps feeding the slot; the next surface picks up the latest frame.
        if let Some(mut pipeline) = self.pipeline.take() {
            if let Err(e) = pipeline.teardown() {
                error!("Teardown failed: {}", e);
            }
        }
        self.window = None;
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Window closed");
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Some(pipeline) = &mut self.pipeline {
                    if let Err(e) = pipeline.on_surface_resized(size.width, size.height) {
                        error!("Resize failed: {}", e);
                    }
                }
            }
            WindowEvent::KeyboardInput { event, .. } => self.handle_key(event_loop, event),
            WindowEvent::RedrawRequested => {
                self.render();
                if let Some(window) = &self.window {
                    window.request_redraw();
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.orchestrator.stop();
        if let Some(mut pipeline) = self.pipeline.take() {
            if let Err(e) = pipeline.teardown() {
                error!("Teardown failed: {}", e);
            }
        }
        let stats = self.orchestrator.stats();
        info!(
            "Processed {} frames, {} failed",
            stats.frames_processed, stats.frames_failed
        );
    }
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    if args.list_devices {
        list_devices();
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Config::load(path)?
        }
        None => Config::default(),
    }
    .apply(&args.overrides())?;

    info!(
        "Starting flmap ({:?} source, {}x{} @ {} fps, mode {})",
        config.source, config.width, config.height, config.fps, config.mode
    );

    let orchestrator = Orchestrator::new(
        backend_opener(&config),
        FrameProcessor::cpu(),
        config.mode,
        config.max_consecutive_errors,
    );

    match config.output {
        OutputMode::Window => run_window_mode(config, orchestrator)?,
        OutputMode::Headless => run_headless_mode(config, orchestrator)?,
    }

    Ok(())
}

/// Run in window output mode (default).
fn run_window_mode(config: Config, orchestrator: Orchestrator) -> Result<()> {
    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = FlmapApp::new(config, orchestrator);
    event_loop.run_app(&mut app)?;

    Ok(())
}

/// Run without a window, draining the slot at the configured rate.
fn run_headless_mode(config: Config, mut orchestrator: Orchestrator) -> Result<()> {
    // Set up signal handler for graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Received interrupt signal, shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    orchestrator.start()?;
    let slot = orchestrator.slot();

    let frame_duration = Duration::from_secs_f64(1.0 / config.fps as f64);
    let mut fps = FpsCounter::new();
    let mut latest_size = None;
    info!("Headless consumer running at {} fps", config.fps);

    while running.load(Ordering::SeqCst) {
        let tick_start = Instant::now();

        if let Some(frame) = slot.drain_if_dirty() {
            latest_size = Some((frame.width, frame.height));
        }

        if let Some(rate) = fps.update() {
            let stats = slot.stats();
            match latest_size {
                Some((w, h)) => info!(
                    "Headless: {:.2} FPS (Resolution: {}x{}, drained {}, dropped {})",
                    rate, w, h, stats.drained, stats.dropped
                ),
                None => warn!("Headless: no frames received yet"),
            }
            if !orchestrator.is_running() {
                warn!("Capture is not running; no new frames will arrive");
            }
        }

        let elapsed = tick_start.elapsed();
        if elapsed < frame_duration {
            thread::sleep(frame_duration - elapsed);
        }
    }

    orchestrator.stop();
    let stats = orchestrator.stats();
    info!(
        "Headless run stopped: {} frames processed, {} failed",
        stats.frames_processed, stats.frames_failed
    );
    Ok(())
}
