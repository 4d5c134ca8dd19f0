//! Synthetic `stub://` sources for tests and demos.
//!
//! `stub://<name>?frames=N&width=W&height=H&fps=F`
//!
//! - `frames`: number of frames before end of stream (unbounded when absent
//!   for cameras)
//! - `width`/`height`: frame size, defaulting to the capture settings
//! - `fps`: simulated device delivery rate for live sources (0 = as fast as
//!   possible); ignored for clips, which are paced by the session

use anyhow::{anyhow, Context, Result};
use std::time::{Duration, Instant};
use url::Url;

use crate::frame::Frame;

/// Largest synthetic edge, in pixels (4K).
pub(crate) const MAX_SYNTHETIC_DIMENSION: u32 = 4096;

pub(crate) struct SyntheticSource {
    origin: String,
    width: u32,
    height: u32,
    frame_limit: Option<u64>,
    frame_interval: Duration,
    frame_count: u64,
    /// Simulated scene state, bumped every 50 frames.
    scene_state: u8,
    last_frame_at: Option<Instant>,
}

impl SyntheticSource {
    pub(crate) fn from_url(
        origin: &str,
        default_width: u32,
        default_height: u32,
        default_fps: u32,
        default_limit: Option<u64>,
        live: bool,
    ) -> Result<Self> {
        let url = Url::parse(origin).with_context(|| format!("invalid stub url '{origin}'"))?;
        if url.scheme() != "stub" {
            return Err(anyhow!("synthetic sources require the stub:// scheme"));
        }

        let mut width = default_width;
        let mut height = default_height;
        let mut fps = default_fps;
        let mut frame_limit = default_limit;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "frames" => frame_limit = Some(parse_u(&key, &value)?),
                "width" => width = parse_u32(&key, &value)?,
                "height" => height = parse_u32(&key, &value)?,
                "fps" => fps = parse_u32(&key, &value)?,
                _ => log::debug!("SyntheticSource: ignoring query parameter '{}'", key),
            }
        }
        if width == 0 || height == 0 {
            return Err(anyhow!("synthetic frame size must be non-zero"));
        }
        if width > MAX_SYNTHETIC_DIMENSION || height > MAX_SYNTHETIC_DIMENSION {
            return Err(anyhow!(
                "synthetic frame size {}x{} exceeds {}x{}",
                width,
                height,
                MAX_SYNTHETIC_DIMENSION,
                MAX_SYNTHETIC_DIMENSION
            ));
        }

        let frame_interval = if live && fps > 0 {
            Duration::from_millis((1000 / fps).max(1) as u64)
        } else {
            Duration::ZERO
        };

        Ok(Self {
            origin: origin.to_string(),
            width,
            height,
            frame_limit,
            frame_interval,
            frame_count: 0,
            scene_state: 0,
            last_frame_at: None,
        })
    }

    pub(crate) fn connect(&mut self) -> Result<()> {
        log::info!(
            "SyntheticSource: connected to {} ({}x{})",
            self.origin,
            self.width,
            self.height
        );
        Ok(())
    }

    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>> {
        if let Some(limit) = self.frame_limit {
            if self.frame_count >= limit {
                return Ok(None);
            }
        }
        self.wait_for_device();

        self.frame_count += 1;
        let pixels = self.generate_synthetic_pixels()?;
        let frame = Frame::from_rgb(pixels, self.width, self.height, self.frame_count)?;
        self.last_frame_at = Some(Instant::now());
        Ok(Some(frame))
    }

    pub(crate) fn frames_captured(&self) -> u64 {
        self.frame_count
    }

    pub(crate) fn origin(&self) -> &str {
        &self.origin
    }

    /// Simulates a camera that only delivers a frame every `frame_interval`.
    fn wait_for_device(&self) {
        if self.frame_interval.is_zero() {
            return;
        }
        if let Some(last) = self.last_frame_at {
            let elapsed = last.elapsed();
            if elapsed < self.frame_interval {
                std::thread::sleep(self.frame_interval - elapsed);
            }
        }
    }

    /// Diagonal gradient that shifts every frame.
    fn generate_synthetic_pixels(&mut self) -> Result<Vec<u8>> {
        let pixel_count = (self.width as usize)
            .checked_mul(self.height as usize)
            .and_then(|n| n.checked_mul(3))
            .ok_or_else(|| anyhow!("synthetic frame size overflow"))?;
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64 * 40) % 256) as u8;
        }
        Ok(pixels)
    }
}

fn parse_u(key: &str, value: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|_| anyhow!("stub parameter '{}' must be an unsigned integer", key))
}

fn parse_u32(key: &str, value: &str) -> Result<u32> {
    u32::try_from(parse_u(key, value)?)
        .map_err(|_| anyhow!("stub parameter '{}' is out of range", key))
}
