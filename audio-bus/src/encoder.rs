use std::collections::VecDeque;

use bytes::Bytes;
use ffmpeg_next::format::sample::Type as SampleType;
use ffmpeg_next::format::Sample;
use ffmpeg_next::{ChannelLayout, Rational};

use crate::frame::EncodedFrame;

/// Encoder frame granularity in milliseconds.
pub const FRAME_MS: u32 = 20;

/// Samples per channel in one encoder frame.
pub fn frame_size(sample_rate: u32) -> usize {
    (sample_rate * FRAME_MS / 1000) as usize
}

pub(crate) fn pts_samples_to_ms(pts_samples: i64, sample_rate: u32) -> i64 {
    pts_samples * 1000 / sample_rate as i64
}

/// Interleaved f32 staging buffer in front of the encoder.
///
/// Overflow policy: past ten frames of backlog, the two oldest frames are
/// dropped before the write so latency stays bounded.
pub(crate) struct SampleFifo {
    buf: VecDeque<f32>,
    frame_samples: usize,
}

impl SampleFifo {
    pub(crate) fn new(frame_samples: usize) -> Self {
        Self { buf: VecDeque::new(), frame_samples }
    }

    /// Appends samples, returning how many old samples were dropped.
    pub(crate) fn push(&mut self, samples: &[f32]) -> usize {
        let high_water = self.frame_samples * 10;
        let mut dropped = 0;
        if self.buf.len() + samples.len() > high_water {
            dropped = (self.frame_samples * 2).min(self.buf.len());
            self.buf.drain(..dropped);
        }
        self.buf.extend(samples);
        dropped
    }

    pub(crate) fn pop_frame(&mut self) -> Option<Vec<f32>> {
        if self.buf.len() < self.frame_samples {
            return None;
        }
        Some(self.buf.drain(..self.frame_samples).collect())
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }
}

/// Encodes f32 interleaved PCM into the target codec at 20 ms frames.
/// PTS is carried through the encoder as a cumulative sample count and
/// rewritten to milliseconds on output.
pub struct AudioEncoder {
    inner: ffmpeg_next::codec::encoder::audio::Encoder,
    fifo: SampleFifo,
    /// per channel
    frame_size: usize,
    channels: u16,
    sample_rate: u32,
    pts_samples: i64,
}

impl AudioEncoder {
    pub fn new(codec_name: &str, sample_rate: u32, channels: u16, bitrate: usize) -> anyhow::Result<Self> {
        let codec = ffmpeg_next::encoder::find_by_name(codec_name)
            .ok_or_else(|| anyhow::anyhow!("encoder not found: {}", codec_name))?;
        let encoder_ctx = ffmpeg_next::codec::Context::new_with_codec(codec);

        let mut encoder = encoder_ctx.encoder().audio()?;
        encoder.set_rate(sample_rate as i32);
        encoder.set_format(Sample::F32(SampleType::Packed));
        encoder.set_channel_layout(if channels == 1 { ChannelLayout::MONO } else { ChannelLayout::STEREO });
        encoder.set_bit_rate(bitrate);
        encoder.set_time_base(Rational(1, sample_rate as i32));
        let inner = encoder.open()?;

        let frame_size = frame_size(sample_rate);
        Ok(Self {
            inner,
            fifo: SampleFifo::new(frame_size * usize::from(channels)),
            frame_size,
            channels,
            sample_rate,
            pts_samples: 0,
        })
    }

    /// Buffers interleaved samples and encodes every complete frame.
    pub fn write_samples(&mut self, samples: &[f32]) -> anyhow::Result<Vec<EncodedFrame>> {
        let dropped = self.fifo.push(samples);
        if dropped > 0 {
            log::warn!("audio fifo overflow, dropped {} samples", dropped);
        }

        let mut out = Vec::new();
        while let Some(chunk) = self.fifo.pop_frame() {
            let mut frame = ffmpeg_next::frame::Audio::new(
                Sample::F32(SampleType::Packed),
                self.frame_size,
                if self.channels == 1 { ChannelLayout::MONO } else { ChannelLayout::STEREO },
            );
            frame.set_rate(self.sample_rate);
            frame.set_pts(Some(self.pts_samples));

            let data = frame.data_mut(0);
            for (i, sample) in chunk.iter().enumerate() {
                data[i * 4..(i + 1) * 4].copy_from_slice(&sample.to_ne_bytes());
            }

            self.pts_samples += self.frame_size as i64;
            self.inner.send_frame(&frame)?;
            self.receive_packets(&mut out)?;
        }
        Ok(out)
    }

    /// Drains the encoder at end of stream.
    pub fn flush(&mut self) -> anyhow::Result<Vec<EncodedFrame>> {
        let mut out = Vec::new();
        self.inner.send_eof()?;
        self.receive_packets(&mut out)?;
        Ok(out)
    }

    fn receive_packets(&mut self, out: &mut Vec<EncodedFrame>) -> anyhow::Result<()> {
        loop {
            let mut packet = ffmpeg_next::codec::packet::Packet::empty();
            match self.inner.receive_packet(&mut packet) {
                Ok(()) => {
                    let data = Bytes::copy_from_slice(packet.data().unwrap_or_default());
                    let pts_ms = pts_samples_to_ms(packet.pts().unwrap_or(0), self.sample_rate);
                    out.push(EncodedFrame { data, pts_ms });
                }
                Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
                    return Ok(());
                }
                Err(ffmpeg_next::Error::Eof) => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        }
    }
}
