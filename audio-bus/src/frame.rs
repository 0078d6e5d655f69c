use bytes::Bytes;

/// Describes the encoded audio input feeding a pipeline.
#[derive(Debug, Clone)]
pub struct AudioTrack {
    pub codec_id: ffmpeg_next::codec::Id,
    pub sample_rate: u32,
    pub channels: u16,
}

/// One encoded audio frame, on either side of the pipeline. PTS is in
/// milliseconds.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Bytes,
    pub pts_ms: i64,
}

impl EncodedFrame {
    pub fn new(data: impl Into<Bytes>, pts_ms: i64) -> Self {
        Self { data: data.into(), pts_ms }
    }
}

/// Copies a packed (interleaved) f32 frame out as a flat sample vector,
/// `samples * channels` long.
pub fn interleaved_f32(frame: &ffmpeg_next::frame::Audio) -> Vec<f32> {
    let count = frame.samples() * usize::from(frame.channels());
    let data = frame.data(0);
    let mut out = Vec::with_capacity(count);
    for chunk in data.chunks_exact(4).take(count) {
        out.push(f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    out
}
