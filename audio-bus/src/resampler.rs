use ffmpeg_next::format::sample::Type as SampleType;
use ffmpeg_next::format::Sample;
use ffmpeg_next::ChannelLayout;

/// Converts decoded PCM to the pipeline's working format: 32-bit float
/// interleaved at the target rate and channel layout. The conversion context
/// is built lazily from the first frame and rebuilt if the source format
/// changes.
pub struct Resampler {
    target_rate: u32,
    target_layout: ChannelLayout,
    context: Option<ffmpeg_next::software::resampling::Context>,
    source: Option<(Sample, ChannelLayout, u32)>,
}

impl Resampler {
    pub fn new(target_rate: u32, target_channels: u16) -> Self {
        let target_layout = if target_channels == 1 { ChannelLayout::MONO } else { ChannelLayout::STEREO };
        Self { target_rate, target_layout, context: None, source: None }
    }

    pub fn run(&mut self, frame: &ffmpeg_next::frame::Audio) -> anyhow::Result<ffmpeg_next::frame::Audio> {
        let source = (frame.format(), frame.channel_layout(), frame.rate());
        if self.context.is_none() || self.source != Some(source) {
            self.context = Some(ffmpeg_next::software::resampling::Context::get(
                source.0,
                source.1,
                source.2,
                Sample::F32(SampleType::Packed),
                self.target_layout,
                self.target_rate,
            )?);
            self.source = Some(source);
        }

        let context = self
            .context
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("resampler context missing"))?;
        let mut out = ffmpeg_next::frame::Audio::empty();
        context.run(frame, &mut out)?;
        out.set_rate(self.target_rate);
        out.set_pts(frame.pts());
        Ok(out)
    }
}

unsafe impl Send for Resampler {}
