//! Camera capture backends and the capture thread that drives them.

#[cfg(any(target_os = "macos", target_os = "windows", target_os = "linux"))]
mod nokhwa_backend;
mod test_pattern;

#[cfg(any(target_os = "macos", target_os = "windows", target_os = "linux"))]
pub use nokhwa_backend::NokhwaCapture;
pub use test_pattern::TestPatternCapture;

use crate::frame::RawFrame;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Consecutive frame errors tolerated before the capture thread gives up.
pub const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 30;

/// Delay between retries after a failed frame grab.
const ERROR_RETRY_DELAY: Duration = Duration::from_millis(100);

/// How long `stop` waits for a backend stuck inside `capture_frame`.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(2);

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Errors reported by capture backends.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The device could not be opened
    #[error("capture device unavailable: {0}")]
    Unavailable(String),
    /// The device went away mid-stream
    #[error("capture device disconnected")]
    Disconnected,
    /// A single frame could not be grabbed or decoded
    #[error("frame capture failed: {0}")]
    Frame(String),
    /// No frame arrived within the backend's wait window; not an error
    #[error("timed out waiting for a frame")]
    Timeout,
}

/// Trait for webcam capture backends.
pub trait CaptureBackend {
    /// Returns a list of available camera devices.
    fn list_devices() -> Result<Vec<CameraInfo>, CaptureError>
    where
        Self: Sized;

    /// Opens the camera with the specified configuration.
    fn open(config: CaptureConfig) -> Result<Self, CaptureError>
    where
        Self: Sized;

    /// Blocks until the next frame is available and returns it.
    fn capture_frame(&mut self) -> Result<RawFrame, CaptureError>;

    /// Returns the current frame dimensions.
    fn frame_size(&self) -> (u32, u32);
}

/// Information about a camera device.
#[derive(Debug, Clone)]
pub struct CameraInfo {
    /// Device index
    pub index: u32,
    /// Human-readable name
    pub name: String,
}

/// Configuration for camera capture.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Camera device index
    pub device_index: u32,
    /// Desired frame width
    pub width: u32,
    /// Desired frame height
    pub height: u32,
    /// Desired frame rate
    pub fps: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            width: 1280,
            height: 720,
            fps: 30,
        }
    }
}

/// Opens a backend. Called on the capture thread, once per `start`.
pub type BackendOpener = Arc<dyn Fn() -> Result<Box<dyn CaptureBackend>, CaptureError> + Send + Sync>;

/// Builds an opener for a concrete backend type.
pub fn opener_for<B>(config: CaptureConfig) -> BackendOpener
where
    B: CaptureBackend + 'static,
{
    Arc::new(move || B::open(config.clone()).map(|b| Box::new(b) as Box<dyn CaptureBackend>))
}

/// Runs a capture backend on a dedicated thread and hands every frame to a
/// callback on that thread.
///
/// Each frame is moved into the callback exactly once; the callback owns it
/// for the duration of the call.
pub struct CaptureSource {
    opener: BackendOpener,
    max_consecutive_errors: u32,
    stop_timeout: Duration,
    should_stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    frame_size: Option<(u32, u32)>,
}

impl CaptureSource {
    pub fn new(opener: BackendOpener, max_consecutive_errors: u32) -> Self {
        Self {
            opener,
            max_consecutive_errors: max_consecutive_errors.max(1),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            should_stop: Arc::new(AtomicBool::new(false)),
            thread: None,
            frame_size: None,
        }
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// True while the capture thread is alive.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Frame size reported by the backend when it was last opened.
    pub fn frame_size(&self) -> Option<(u32, u32)> {
        self.frame_size
    }

    /// Opens the backend on a new capture thread and starts delivering frames.
    ///
    /// Returns once the device is open, or with the open error. Calling this
    /// while already running is a no-op.
    pub fn start<F>(&mut self, on_frame: F) -> Result<(), CaptureError>
    where
        F: FnMut(RawFrame) + Send + 'static,
    {
        if self.is_running() {
            debug!("Capture already running");
            return Ok(());
        }
        // Reap a thread that ended on its own (device lost, too many errors).
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }

        let should_stop = Arc::new(AtomicBool::new(false));
        self.should_stop = should_stop.clone();
        let opener = self.opener.clone();
        let max_errors = self.max_consecutive_errors;
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let handle = thread::Builder::new()
            .name("flmap-capture".to_string())
            .spawn(move || {
                let backend = match opener() {
                    Ok(backend) => {
                        let _ = ready_tx.send(Ok(backend.frame_size()));
                        backend
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                run_capture_loop(backend, &should_stop, max_errors, on_frame);
            })
            .map_err(|e| CaptureError::Unavailable(format!("failed to spawn capture thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok((width, height))) => {
                info!("Capture started at {}x{}", width, height);
                self.frame_size = Some((width, height));
                self.thread = Some(handle);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(CaptureError::Unavailable("capture thread exited while opening".to_string()))
            }
        }
    }

    /// Stops the capture thread and releases the device. Idempotent.
    ///
    /// The stop flag is only seen between frames. A thread still blocked in
    /// the backend after the stop timeout is detached; it exits on its own
    /// once the backend returns.
    pub fn stop(&mut self) {
        self.should_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            debug!("Stopping capture thread...");
            let deadline = Instant::now() + self.stop_timeout;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(STOP_POLL_INTERVAL);
            }
            if handle.is_finished() {
                let _ = handle.join();
                info!("Capture stopped");
            } else {
                warn!(
                    "Capture backend still blocked after {:?}, detaching capture thread",
                    self.stop_timeout
                );
            }
        }
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_capture_loop<F>(mut backend: Box<dyn CaptureBackend>, should_stop: &AtomicBool, max_errors: u32, mut on_frame: F)
where
    F: FnMut(RawFrame),
{
    let mut consecutive_errors = 0u32;

    while !should_stop.load(Ordering::SeqCst) {
        match backend.capture_frame() {
            Ok(frame) => {
                consecutive_errors = 0;
                on_frame(frame);
            }
            Err(CaptureError::Timeout) => {}
            Err(CaptureError::Disconnected) => {
                error!("Capture device disconnected; no new frames until restarted");
                break;
            }
            Err(e) => {
                consecutive_errors += 1;
                if consecutive_errors >= max_errors {
                    error!(
                        "Capture failed after {} consecutive errors, last: {}; no new frames until restarted",
                        consecutive_errors, e
                    );
                    break;
                } else if consecutive_errors == 1 || consecutive_errors % 10 == 0 {
                    warn!("Frame capture error ({}/{}): {}", consecutive_errors, max_errors, e);
                }
                thread::sleep(ERROR_RETRY_DELAY);
            }
        }
    }

    debug!("Capture loop exited");
}
