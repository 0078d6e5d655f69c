#![allow(dead_code)]

/// Registers FFmpeg components. Call once at startup before building
/// pipelines.
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))
}

pub mod decoder;
pub mod encoder;
pub mod frame;
pub mod resampler;
pub mod transcoder;
