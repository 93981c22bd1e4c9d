//! Camera frame source.
//!
//! A [`FrameSource`] owns at most one [`FrameDevice`]. Devices may buffer
//! frames, so every capture reads and discards `warmup_frames` (never fewer
//! than [`MIN_WARMUP_FRAMES`]) before returning the next one. Captures are
//! blocking and are expected to run on a worker thread.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use vistalk_core::config::{CameraConfig, CameraSourceConfig, MIN_WARMUP_FRAMES};
use vistalk_core::types::Frame;

/// Why a capture produced no frame.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CaptureFailure {
    #[error("no camera device available")]
    NoDevice,

    #[error("failed to read frame: {0}")]
    ReadFailed(String),
}

/// A device that yields one decoded frame per read.
pub trait FrameDevice: Send + Sync {
    /// Human-readable description for logs and diagnostics.
    fn describe(&self) -> String;

    fn read_frame(&self) -> anyhow::Result<Frame>;
}

pub struct FrameSource {
    device: Mutex<Option<Arc<dyn FrameDevice>>>,
    warmup_frames: u32,
    /// Width and height of the last frame returned.
    last_dimensions: Mutex<Option<(u32, u32)>>,
}

impl FrameSource {
    /// `warmup_frames` is raised to [`MIN_WARMUP_FRAMES`] if lower.
    pub fn new(device: Option<Arc<dyn FrameDevice>>, warmup_frames: u32) -> Self {
        Self {
            device: Mutex::new(device),
            warmup_frames: warmup_frames.max(MIN_WARMUP_FRAMES),
            last_dimensions: Mutex::new(None),
        }
    }

    /// Open the device described by the camera configuration.
    ///
    /// `runtime` drives HTTP snapshot fetches from worker threads.
    pub fn from_config(config: &CameraConfig, runtime: Handle) -> Self {
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let device: Option<Arc<dyn FrameDevice>> = match &config.source {
            CameraSourceConfig::None => None,
            CameraSourceConfig::SnapshotUrl { url } => {
                Some(Arc::new(SnapshotUrlDevice::new(url, timeout, runtime)))
            }
            CameraSourceConfig::File { path } => Some(Arc::new(FileDevice::new(path))),
            CameraSourceConfig::Command { command, args } => {
                Some(Arc::new(CommandDevice::new(command, args, timeout)))
            }
        };

        match &device {
            Some(d) => info!(
                device = %d.describe(),
                warmup = config.warmup_frames,
                "Camera configured"
            ),
            None => info!("No camera configured; grounded requests will fail to capture"),
        }

        Self::new(device, config.warmup_frames)
    }

    pub fn is_available(&self) -> bool {
        self.device.lock().map(|d| d.is_some()).unwrap_or(false)
    }

    /// Description of the open device, if any.
    pub fn describe(&self) -> Option<String> {
        self.device
            .lock()
            .ok()
            .and_then(|d| d.as_ref().map(|d| d.describe()))
    }

    /// Dimensions of the most recently captured frame, if any.
    pub fn last_dimensions(&self) -> Option<(u32, u32)> {
        self.last_dimensions.lock().ok().and_then(|d| *d)
    }

    /// Capture the most recent frame.
    ///
    /// Concurrent callers are serialized so warm-up reads from one capture
    /// never interleave with another's.
    pub fn capture(&self) -> Result<Frame, CaptureFailure> {
        let guard = self
            .device
            .lock()
            .map_err(|_| CaptureFailure::ReadFailed("camera lock poisoned".into()))?;
        let device = guard.as_ref().ok_or(CaptureFailure::NoDevice)?;

        let start = Instant::now();
        for skipped in 0..self.warmup_frames {
            if let Err(e) = device.read_frame() {
                debug!(skipped, %e, "Warm-up read failed");
            }
        }

        let frame = device
            .read_frame()
            .map_err(|e| CaptureFailure::ReadFailed(format!("{e:#}")))?;
        debug!(
            width = frame.width(),
            height = frame.height(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Frame captured"
        );
        if let Ok(mut last) = self.last_dimensions.lock() {
            *last = Some((frame.width(), frame.height()));
        }
        Ok(frame)
    }

    /// Release the device. Later captures fail with [`CaptureFailure::NoDevice`].
    pub fn shutdown(&self) {
        match self.device.lock() {
            Ok(mut guard) => {
                if let Some(device) = guard.take() {
                    info!(device = %device.describe(), "Camera released");
                }
            }
            Err(_) => warn!("Camera lock poisoned during shutdown"),
        }
    }
}

/// Fetches the current frame from an HTTP snapshot endpoint.
pub struct SnapshotUrlDevice {
    url: String,
    timeout: Duration,
    client: reqwest::Client,
    runtime: Handle,
}

impl SnapshotUrlDevice {
    pub fn new(url: &str, timeout: Duration, runtime: Handle) -> Self {
        Self {
            url: url.to_string(),
            timeout,
            client: reqwest::Client::new(),
            runtime,
        }
    }

    async fn fetch(&self) -> anyhow::Result<Vec<u8>> {
        let response = self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("snapshot endpoint returned {}", response.status());
        }
        Ok(response.bytes().await?.to_vec())
    }
}

impl FrameDevice for SnapshotUrlDevice {
    fn describe(&self) -> String {
        format!("snapshot:{}", self.url)
    }

    fn read_frame(&self) -> anyhow::Result<Frame> {
        let bytes = self.runtime.block_on(self.fetch())?;
        Frame::decode(&bytes)
    }
}

/// Reads an image file that an external grabber keeps refreshing.
pub struct FileDevice {
    path: PathBuf,
}

impl FileDevice {
    pub fn new(path: &str) -> Self {
        Self {
            path: vistalk_core::config::expand_home(path),
        }
    }
}

impl FrameDevice for FileDevice {
    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }

    fn read_frame(&self) -> anyhow::Result<Frame> {
        let bytes = std::fs::read(&self.path)
            .map_err(|e| anyhow::anyhow!("reading {}: {e}", self.path.display()))?;
        Frame::decode(&bytes)
    }
}

/// Runs a grabber command that prints one encoded frame on stdout.
pub struct CommandDevice {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandDevice {
    pub fn new(program: &str, args: &[String], timeout: Duration) -> Self {
        Self {
            program: program.to_string(),
            args: args.to_vec(),
            timeout,
        }
    }
}

impl FrameDevice for CommandDevice {
    fn describe(&self) -> String {
        format!("command:{}", self.program)
    }

    fn read_frame(&self) -> anyhow::Result<Frame> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| anyhow::anyhow!("spawning {}: {e}", self.program))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("grabber stdout unavailable"))?;
        let reader = std::thread::spawn(move || {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).map(|_| buf)
        });

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                anyhow::bail!("grabber timed out after {}s", self.timeout.as_secs());
            }
            std::thread::sleep(Duration::from_millis(10));
        };

        let bytes = reader
            .join()
            .map_err(|_| anyhow::anyhow!("grabber reader thread panicked"))??;
        if !status.success() {
            anyhow::bail!("grabber exited with {status}");
        }
        Frame::decode(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    /// Yields frames whose width is the read count, so tests can see which
    /// read was returned.
    struct CountingDevice {
        reads: AtomicU32,
    }

    impl FrameDevice for CountingDevice {
        fn describe(&self) -> String {
            "counting".into()
        }

        fn read_frame(&self) -> anyhow::Result<Frame> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Frame::new(image::RgbImage::new(n, 1)))
        }
    }

    struct BrokenDevice;

    impl FrameDevice for BrokenDevice {
        fn describe(&self) -> String {
            "broken".into()
        }

        fn read_frame(&self) -> anyhow::Result<Frame> {
            anyhow::bail!("device unplugged")
        }
    }

    fn png_bytes(w: u32, h: u32) -> Vec<u8> {
        let mut out = std::io::Cursor::new(Vec::new());
        image::RgbImage::new(w, h)
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn test_capture_discards_warmup_frames() {
        let device = Arc::new(CountingDevice {
            reads: AtomicU32::new(0),
        });
        let source = FrameSource::new(Some(device.clone()), 2);

        assert!(source.last_dimensions().is_none());
        let frame = source.capture().unwrap();
        assert_eq!(frame.width(), 3);
        assert_eq!(device.reads.load(Ordering::SeqCst), 3);
        assert_eq!(source.last_dimensions(), Some((3, 1)));
    }

    #[test]
    fn test_short_warmup_is_raised_to_minimum() {
        for warmup in [0, 1] {
            let device = Arc::new(CountingDevice {
                reads: AtomicU32::new(0),
            });
            let source = FrameSource::new(Some(device.clone()), warmup);

            let frame = source.capture().unwrap();
            assert_eq!(frame.width(), MIN_WARMUP_FRAMES + 1);
            assert_eq!(device.reads.load(Ordering::SeqCst), MIN_WARMUP_FRAMES + 1);
        }
    }

    #[test]
    fn test_no_device_fails_immediately() {
        let source = FrameSource::new(None, 2);
        assert!(!source.is_available());
        assert!(matches!(source.capture(), Err(CaptureFailure::NoDevice)));
    }

    #[test]
    fn test_read_failure_is_reported() {
        let source = FrameSource::new(Some(Arc::new(BrokenDevice)), 0);
        let err = source.capture().unwrap_err();
        assert!(err.to_string().contains("device unplugged"));
    }

    #[test]
    fn test_shutdown_releases_device() {
        let source = FrameSource::new(
            Some(Arc::new(CountingDevice {
                reads: AtomicU32::new(0),
            })),
            0,
        );
        assert!(source.is_available());
        assert_eq!(source.describe().as_deref(), Some("counting"));
        source.shutdown();
        assert!(!source.is_available());
        assert!(source.describe().is_none());
        assert!(matches!(source.capture(), Err(CaptureFailure::NoDevice)));
    }

    #[test]
    fn test_file_device_reads_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");
        std::fs::write(&path, png_bytes(4, 3)).unwrap();

        let device = FileDevice::new(path.to_str().unwrap());
        let frame = device.read_frame().unwrap();
        assert_eq!((frame.width(), frame.height()), (4, 3));
    }

    #[test]
    fn test_file_device_missing_file() {
        let device = FileDevice::new("/nonexistent/vistalk/frame.png");
        assert!(device.read_frame().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_command_device_reads_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");
        std::fs::write(&path, png_bytes(5, 2)).unwrap();

        let device = CommandDevice::new(
            "cat",
            &[path.to_string_lossy().into_owned()],
            Duration::from_secs(5),
        );
        let frame = device.read_frame().unwrap();
        assert_eq!(frame.width(), 5);
    }

    #[cfg(unix)]
    #[test]
    fn test_command_device_failure_status() {
        let device = CommandDevice::new("false", &[], Duration::from_secs(5));
        assert!(device.read_frame().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_snapshot_device_fetches_frame() {
        use axum::{Router, routing::get};

        let png = png_bytes(6, 6);
        let app = Router::new().route("/snap", get(move || async move { png.clone() }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let config = CameraConfig {
            source: CameraSourceConfig::SnapshotUrl {
                url: format!("http://{addr}/snap"),
            },
            ..CameraConfig::default()
        };
        let source = Arc::new(FrameSource::from_config(&config, Handle::current()));
        assert!(source.is_available());

        let frame = tokio::task::spawn_blocking(move || source.capture())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.width(), 6);
    }
}
