//! Frame acquisition from the live video source.
//!
//! One capture attempt opens a pull connection, polls for a decodable frame
//! with a bounded timeout, closes the connection, and persists the frame as
//! a timestamped file plus a `latest.jpg` pointer in the position's
//! directory. Connections are never pooled — vendor stream endpoints are
//! typically single-consumer.

use async_trait::async_trait;
use chrono::Local;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, Rgb, RgbImage};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use url::Url;

use crate::cycle::ModuleStatus;
use crate::error::{OurError, OurResult};

/// Upper bound on one capture attempt.
pub const FRAME_TIMEOUT: Duration = Duration::from_secs(5);
/// Poll interval while waiting for a decodable frame.
pub const FRAME_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A pull-based source of single frames.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Pull one decodable frame, waiting at most [`FRAME_TIMEOUT`].
    async fn pull_frame(&self) -> OurResult<DynamicImage>;
}

/// HTTP snapshot puller against the camera's fixed stream URL.
pub struct HttpFrameSource {
    client: reqwest::Client,
    url: Url,
}

impl HttpFrameSource {
    pub fn new(url: Url) -> OurResult<Self> {
        // pool_max_idle_per_host(0) drops the connection as soon as the
        // response is read; the camera endpoint is single-consumer.
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(0)
            .timeout(FRAME_TIMEOUT)
            .build()?;
        Ok(Self { client, url })
    }

    async fn pull_once(&self) -> OurResult<DynamicImage> {
        let response = self.client.get(self.url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(OurError::Capture(format!(
                "Stream endpoint returned HTTP {status}"
            )));
        }
        let bytes = response.bytes().await?;
        let image = image::load_from_memory(&bytes)?;
        Ok(image)
    }
}

#[async_trait]
impl FrameSource for HttpFrameSource {
    async fn pull_frame(&self) -> OurResult<DynamicImage> {
        // The outer timeout caps the whole attempt; an in-flight request
        // started near the deadline is cut off rather than allowed to run
        // its own full request timeout on top.
        match timeout(FRAME_TIMEOUT, self.poll_until_decodable()).await {
            Ok(image) => Ok(image),
            Err(_) => Err(OurError::Capture(format!(
                "No decodable frame within {}s",
                FRAME_TIMEOUT.as_secs()
            ))),
        }
    }
}

impl HttpFrameSource {
    async fn poll_until_decodable(&self) -> DynamicImage {
        loop {
            match self.pull_once().await {
                Ok(image) => return image,
                Err(e) => debug!("Frame poll failed: {e}"),
            }
            sleep(FRAME_POLL_INTERVAL).await;
        }
    }
}

/// Persistent frame storage, laid out as
/// `<root>/position_<id>/position_<id>_<YYYYMMDD_HHMMSS>.jpg` plus a
/// `latest.jpg` pointer per position.
pub struct FrameStore {
    root: PathBuf,
    frame_width: u32,
    frame_height: u32,
    jpeg_quality: u8,
}

impl FrameStore {
    /// Resolve the writable frames root once, probing candidates in order
    /// (create + test-write + delete), and create per-position directories.
    ///
    /// `latest.jpg` files are never pre-seeded; a position without one gets
    /// a transient placeholder from [`FrameStore::placeholder`] at serve
    /// time instead.
    pub fn open(
        candidates: &[PathBuf],
        position_ids: &[u8],
        frame_width: u32,
        frame_height: u32,
        jpeg_quality: u8,
    ) -> OurResult<Self> {
        let root = candidates
            .iter()
            .find(|candidate| match probe_writable(candidate) {
                Ok(()) => {
                    info!("Using frames directory {}", candidate.display());
                    true
                }
                Err(e) => {
                    warn!("Frames directory {} unusable: {e}", candidate.display());
                    false
                }
            })
            .cloned()
            .ok_or_else(|| {
                OurError::Capture("No writable frames directory among candidates".to_string())
            })?;

        let store = Self {
            root,
            frame_width,
            frame_height,
            jpeg_quality,
        };

        for id in position_ids {
            let dir = store.position_dir(*id);
            fs::create_dir_all(&dir)?;
            debug!("Prepared frame directory {}", dir.display());
        }

        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn position_dir(&self, position_id: u8) -> PathBuf {
        self.root.join(format!("position_{position_id}"))
    }

    pub fn latest_path(&self, position_id: u8) -> PathBuf {
        self.position_dir(position_id).join("latest.jpg")
    }

    pub fn latest_exists(&self, position_id: u8) -> bool {
        self.latest_path(position_id).exists()
    }

    /// Persist a captured frame: timestamped history file plus `latest.jpg`.
    /// Returns the path of the history file.
    pub fn save_frame(&self, position_id: u8, frame: &DynamicImage) -> OurResult<PathBuf> {
        let frame = self.resized(frame);
        let encoded = self.encode_jpeg(&frame)?;

        let dir = self.position_dir(position_id);
        fs::create_dir_all(&dir)?;

        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        let history_path = dir.join(format!("position_{position_id}_{timestamp}.jpg"));
        fs::write(&history_path, &encoded)?;
        fs::write(self.latest_path(position_id), &encoded)?;

        info!(
            "Saved frame for position {position_id} to {}",
            history_path.display()
        );
        Ok(history_path)
    }

    fn resized(&self, frame: &DynamicImage) -> DynamicImage {
        if self.frame_width > 0
            && self.frame_height > 0
            && (frame.width() != self.frame_width || frame.height() != self.frame_height)
        {
            frame.resize_exact(
                self.frame_width,
                self.frame_height,
                image::imageops::FilterType::Triangle,
            )
        } else {
            frame.clone()
        }
    }

    fn encode_jpeg(&self, frame: &DynamicImage) -> OurResult<Vec<u8>> {
        // JPEG has no alpha; normalise to RGB before encoding.
        let rgb = DynamicImage::ImageRgb8(frame.to_rgb8());
        let mut buffer = Vec::new();
        let encoder = JpegEncoder::new_with_quality(&mut buffer, self.jpeg_quality);
        rgb.write_with_encoder(encoder)?;
        Ok(buffer)
    }

    /// Synthetic stand-in image for positions that have never captured.
    ///
    /// Solid colour canvas reflecting the module status, with the status
    /// name captioned across the centre. The caller serves it transiently
    /// and must never write it over an existing `latest.jpg`.
    pub fn placeholder(&self, status: ModuleStatus) -> OurResult<Vec<u8>> {
        let width = if self.frame_width > 0 { self.frame_width } else { 640 };
        let height = if self.frame_height > 0 { self.frame_height } else { 480 };

        let (shade, caption) = match status {
            ModuleStatus::Initializing => (Rgb([30u8, 46, 78]), "INITIALIZING"),
            ModuleStatus::Error => (Rgb([84u8, 24, 24]), "ERROR"),
            ModuleStatus::Ok | ModuleStatus::Warning => (Rgb([40u8, 40, 40]), "NO DATA"),
        };
        let mut canvas = RgbImage::from_pixel(width, height, shade);
        draw_caption(&mut canvas, caption);

        self.encode_jpeg(&DynamicImage::ImageRgb8(canvas))
    }
}

/// 5x7 uppercase glyphs for the placeholder captions, one row bitmap per
/// scanline with bit 4 as the leftmost column. Only the letters the three
/// captions need are defined; anything else renders as a blank cell.
fn caption_glyph(c: char) -> [u8; 7] {
    match c {
        'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'D' => [0x1E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x1E],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'G' => [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0E],
        'I' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x1F],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'N' => [0x11, 0x19, 0x15, 0x13, 0x11, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'Z' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
        _ => [0; 7],
    }
}

/// Draw a caption centred on the canvas, scaled to the canvas width.
fn draw_caption(canvas: &mut RgbImage, caption: &str) {
    const GLYPH_WIDTH: u32 = 5;
    const GLYPH_HEIGHT: u32 = 7;
    const CELL_WIDTH: u32 = GLYPH_WIDTH + 1;

    let (width, height) = canvas.dimensions();
    let chars: Vec<char> = caption.chars().collect();
    let text_cells = chars.len() as u32 * CELL_WIDTH;
    if text_cells == 0 {
        return;
    }

    let scale = (width / (text_cells * 2)).min(height / (GLYPH_HEIGHT * 2)).max(1);
    let text_width = text_cells * scale;
    let text_height = GLYPH_HEIGHT * scale;
    let x0 = width.saturating_sub(text_width) / 2;
    let y0 = height.saturating_sub(text_height) / 2;
    let ink = Rgb([230u8, 230, 230]);

    for (index, c) in chars.iter().enumerate() {
        let glyph = caption_glyph(*c);
        let cell_x = x0 + index as u32 * CELL_WIDTH * scale;
        for (row, bits) in glyph.iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                if bits & (1 << (GLYPH_WIDTH - 1 - col)) == 0 {
                    continue;
                }
                for dy in 0..scale {
                    for dx in 0..scale {
                        let x = cell_x + col * scale + dx;
                        let y = y0 + row as u32 * scale + dy;
                        if x < width && y < height {
                            canvas.put_pixel(x, y, ink);
                        }
                    }
                }
            }
        }
    }
}

fn probe_writable(dir: &Path) -> OurResult<()> {
    fs::create_dir_all(dir)?;
    let probe = dir.join(".write_probe");
    fs::write(&probe, b"probe")?;
    fs::remove_file(&probe)?;
    Ok(())
}
