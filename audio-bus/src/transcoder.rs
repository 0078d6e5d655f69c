use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::decoder::AudioDecoder;
use crate::encoder::AudioEncoder;
use crate::frame::{interleaved_f32, AudioTrack, EncodedFrame};
use crate::resampler::Resampler;

const OUTPUT_CODEC: &str = "libopus";
const ENCODER_QUEUE_DEPTH: usize = 64;

pub type OnOutput = Arc<dyn Fn(&EncodedFrame) + Send + Sync>;

struct Front {
    decoder: AudioDecoder,
    resampler: Resampler,
}

/// In-process audio transcoder: decodes the input track, resamples to the
/// target rate and channel layout as f32 interleaved, and re-encodes to Opus
/// in 20 ms frames, delivering encoded frames through the output callback.
///
/// Decoding happens synchronously on the input path; encoding runs on a
/// dedicated worker fed by a bounded queue. Teardown order matters: clear the
/// callback, stop the encoder worker, then drop the decode front.
pub struct AudioTranscoder {
    cancel: CancellationToken,
    front: Mutex<Front>,
    encoder_tx: Mutex<Option<SyncSender<Vec<f32>>>>,
    encoder_worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
    on_output: Arc<Mutex<Option<OnOutput>>>,
    input_frames: AtomicU64,
    output_frames: Arc<AtomicU64>,
}

impl AudioTranscoder {
    pub fn new(
        track: &AudioTrack,
        target_sample_rate: u32,
        target_channels: u16,
        target_bitrate: usize,
    ) -> anyhow::Result<Self> {
        log::info!(
            "creating audio transcoder: {:?} -> opus, {}Hz, {}ch, {}bps",
            track.codec_id,
            target_sample_rate,
            target_channels,
            target_bitrate
        );

        let decoder = AudioDecoder::new(track)?;
        let resampler = Resampler::new(target_sample_rate, target_channels);
        let encoder = AudioEncoder::new(OUTPUT_CODEC, target_sample_rate, target_channels, target_bitrate)?;

        let cancel = CancellationToken::new();
        let on_output: Arc<Mutex<Option<OnOutput>>> = Arc::new(Mutex::new(None));
        let output_frames = Arc::new(AtomicU64::new(0));

        let (tx, rx) = std::sync::mpsc::sync_channel::<Vec<f32>>(ENCODER_QUEUE_DEPTH);
        let worker_cancel = cancel.clone();
        let worker_output = Arc::clone(&on_output);
        let worker_count = Arc::clone(&output_frames);
        let worker = tokio::task::spawn_blocking(move || {
            encoder_loop(encoder, rx, worker_cancel, worker_output, worker_count)
        });

        Ok(Self {
            cancel,
            front: Mutex::new(Front { decoder, resampler }),
            encoder_tx: Mutex::new(Some(tx)),
            encoder_worker: Mutex::new(Some(worker)),
            on_output,
            input_frames: AtomicU64::new(0),
            output_frames,
        })
    }

    pub fn set_on_output(&self, cb: OnOutput) {
        *self.on_output.lock().unwrap() = Some(cb);
    }

    /// Feeds one encoded input frame synchronously to the decoder; resampled
    /// PCM is queued for the encoder worker.
    pub fn input_frame(&self, frame: &EncodedFrame) -> bool {
        self.input_frames.fetch_add(1, Ordering::Relaxed);

        let samples = match self.decode_and_resample(|front| front.decoder.send_frame(frame)) {
            Ok(samples) => samples,
            Err(e) => {
                log::warn!("audio decode failed: {:#}", e);
                return false;
            }
        };
        self.queue_samples(samples)
    }

    /// Flushes the decoder; drained PCM still reaches the encoder worker.
    pub fn flush(&self) -> bool {
        let samples = match self.decode_and_resample(|front| front.decoder.flush()) {
            Ok(samples) => samples,
            Err(e) => {
                log::warn!("audio decoder flush failed: {:#}", e);
                return false;
            }
        };
        self.queue_samples(samples)
    }

    /// Ordered teardown: callback, encoder worker, then the decode front
    /// falls with self.
    pub async fn close(&self) {
        *self.on_output.lock().unwrap() = None;
        self.encoder_tx.lock().unwrap().take();
        self.cancel.cancel();

        let worker = self.encoder_worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }

        let input = self.input_frames.load(Ordering::Relaxed);
        if input > 0 {
            log::info!(
                "audio transcoder closed, in={}, out={}",
                input,
                self.output_frames.load(Ordering::Relaxed)
            );
        }
    }

    pub fn input_frame_count(&self) -> u64 {
        self.input_frames.load(Ordering::Relaxed)
    }

    pub fn output_frame_count(&self) -> u64 {
        self.output_frames.load(Ordering::Relaxed)
    }

    fn decode_and_resample(
        &self,
        feed: impl FnOnce(&mut Front) -> anyhow::Result<()>,
    ) -> anyhow::Result<Vec<f32>> {
        let mut front = self.front.lock().unwrap();
        feed(&mut front)?;

        let mut samples = Vec::new();
        loop {
            match front.decoder.receive_frame() {
                Ok(Some(pcm)) => {
                    let resampled = front.resampler.run(&pcm)?;
                    samples.extend(interleaved_f32(&resampled));
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!("audio decoder receive error: {:#}", e);
                    break;
                }
            }
        }
        Ok(samples)
    }

    fn queue_samples(&self, samples: Vec<f32>) -> bool {
        let tx = self.encoder_tx.lock().unwrap();
        let Some(tx) = tx.as_ref() else {
            return false;
        };
        if samples.is_empty() {
            return true;
        }
        tx.send(samples).is_ok()
    }
}

impl Drop for AudioTranscoder {
    fn drop(&mut self) {
        *self.on_output.lock().unwrap() = None;
        self.cancel.cancel();
    }
}

fn encoder_loop(
    mut encoder: AudioEncoder,
    rx: std::sync::mpsc::Receiver<Vec<f32>>,
    cancel: CancellationToken,
    on_output: Arc<Mutex<Option<OnOutput>>>,
    output_frames: Arc<AtomicU64>,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        match rx.recv_timeout(Duration::from_millis(1)) {
            Ok(samples) => match encoder.write_samples(&samples) {
                Ok(frames) => deliver(&frames, &on_output, &output_frames),
                Err(e) => log::warn!("audio encode error: {:#}", e),
            },
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => {
                match encoder.flush() {
                    Ok(frames) => deliver(&frames, &on_output, &output_frames),
                    Err(e) => log::warn!("audio encoder flush error: {:#}", e),
                }
                break;
            }
        }
    }
    log::info!("audio encoder worker finished");
}

fn deliver(frames: &[EncodedFrame], on_output: &Arc<Mutex<Option<OnOutput>>>, output_frames: &AtomicU64) {
    for frame in frames {
        output_frames.fetch_add(1, Ordering::Relaxed);
        let cb = on_output.lock().unwrap().clone();
        if let Some(cb) = cb {
            cb(frame);
        }
    }
}
