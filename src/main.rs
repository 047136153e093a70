//! duocam demo: stream preview from a V4L2 camera, take one photo, save it.
//!
//! Usage: `duocam [config.toml] [output.png]`

use std::path::PathBuf;
use std::time::{Duration, Instant};

use color_eyre::{eyre::eyre, Result};
use tracing::{debug, info, warn};

use duocam::capture::decoder::rgb565_to_rgb24;
use duocam::capture::V4l2Driver;
use duocam::{
    utils, AbortReason, CaptureKind, CaptureListener, CaptureSession, Config, Facing, PreviewFrame, StillImage,
};

const WARMUP_FRAMES: u64 = 30;
const CAPTURE_TIMEOUT: Duration = Duration::from_secs(10);
const POLL: Duration = Duration::from_millis(100);

#[derive(Default)]
struct Recorder {
    frames: u64,
    still: Option<StillImage>,
    aborted: Option<AbortReason>,
}

impl CaptureListener for Recorder {
    fn on_preview_frame(&mut self, frame: PreviewFrame<'_>) {
        self.frames += 1;
        if frame.sequence % 30 == 0 {
            debug!(
                sequence = frame.sequence,
                size = %frame.size,
                bytes = frame.data.len(),
                facing = %frame.facing,
                "Preview frame"
            );
        }
    }

    fn on_still_captured(&mut self, still: StillImage) {
        self.still = Some(still);
    }

    fn on_capture_aborted(&mut self, kind: CaptureKind, reason: AbortReason) {
        warn!(%kind, ?reason, "Capture aborted");
        self.aborted = Some(reason);
    }
}

fn run(config: Config, output: PathBuf, stop: flume::Receiver<()>) -> Result<()> {
    let mut session = CaptureSession::new(V4l2Driver::new(), Recorder::default(), &config);
    let size = session.resume(Facing::Back)?;
    info!(%size, facing = %session.facing(), "Preview running");

    while session.listener().frames < WARMUP_FRAMES {
        if stop.try_recv().is_ok() {
            return Ok(());
        }
        session.wait_event(POLL);
    }

    session.capture(CaptureKind::Photo)?;
    let deadline = Instant::now() + CAPTURE_TIMEOUT;
    while session.listener().still.is_none() && session.listener().aborted.is_none() {
        if stop.try_recv().is_ok() || Instant::now() > deadline {
            session.pause();
            return Err(eyre!("Photo not captured"));
        }
        session.wait_event(POLL);
    }
    session.pause();

    let recorder = session.listener_mut();
    let still = recorder
        .still
        .take()
        .ok_or_else(|| eyre!("Capture aborted: {:?}", recorder.aborted))?;
    let rgb = rgb565_to_rgb24(&still.data);
    let image = image::RgbImage::from_raw(still.size.width(), still.size.height(), rgb)
        .ok_or_else(|| eyre!("Still buffer does not match {}", still.size))?;
    image.save(&output)?;
    info!(path = %output.display(), size = %still.size, "Photo saved");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    let mut args = std::env::args().skip(1);
    let config_path = args.next().map(PathBuf::from);
    let output = args.next().map_or_else(|| PathBuf::from("duocam-photo.png"), PathBuf::from);

    let config = Config::load(config_path.as_deref())?;
    utils::init_tracing(&config.logging);

    info!("duocam launching...");

    let (stop_tx, stop_rx) = flume::bounded(1);
    let mut task = tokio::task::spawn_blocking(move || run(config, output, stop_rx));

    tokio::select! {
        result = &mut task => result??,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping camera");
            let _ = stop_tx.send(());
            task.await??;
        }
    }

    info!("duocam shutting down");
    Ok(())
}
