use crate::frame::{AudioTrack, EncodedFrame};

/// Decodes one encoded audio stream to PCM frames.
pub struct AudioDecoder {
    inner: ffmpeg_next::codec::decoder::Audio,
}

impl AudioDecoder {
    pub fn new(track: &AudioTrack) -> anyhow::Result<Self> {
        let codec = ffmpeg_next::decoder::find(track.codec_id)
            .ok_or_else(|| anyhow::anyhow!("decoder not found: {:?}", track.codec_id))?;
        let decoder_ctx = ffmpeg_next::codec::Context::new_with_codec(codec);
        let inner = decoder_ctx.decoder().audio()?;
        Ok(Self { inner })
    }

    pub fn send_frame(&mut self, frame: &EncodedFrame) -> anyhow::Result<()> {
        let mut packet = ffmpeg_next::codec::packet::Packet::copy(&frame.data);
        packet.set_pts(Some(frame.pts_ms));
        packet.set_dts(Some(frame.pts_ms));
        self.inner.send_packet(&packet)?;
        Ok(())
    }

    pub fn receive_frame(&mut self) -> anyhow::Result<Option<ffmpeg_next::frame::Audio>> {
        let mut frame = ffmpeg_next::frame::Audio::empty();
        match self.inner.receive_frame(&mut frame) {
            Ok(()) => Ok(Some(frame)),
            Err(ffmpeg_next::Error::Eof) => Ok(None),
            Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Enters drain mode; pending frames stay retrievable via
    /// `receive_frame`.
    pub fn flush(&mut self) -> anyhow::Result<()> {
        self.inner.send_eof()?;
        Ok(())
    }
}
