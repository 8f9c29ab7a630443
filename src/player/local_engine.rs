//! Local-file media engine.
//!
//! Source ids are filesystem paths. A worker thread owns the `cpal` output
//! stream; each load is decoded with `symphonia` on its own thread and
//! resampled with `rubato` to the device format before playback starts.

use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
        mpsc::{self, Receiver, Sender},
        Arc, Mutex,
    },
    thread,
};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{debug, error, info, warn};
use rubato::{FftFixedIn, Resampler};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use super::engine::{
    EngineCallbacks, EngineError, MediaEngine, ERROR_HTML5_FAULT, ERROR_INVALID_PARAMETERS,
    ERROR_NOT_FOUND, STATE_CUED, STATE_ENDED, STATE_PAUSED, STATE_PLAYING, STATE_UNSTARTED,
};

const PREFERRED_SAMPLE_RATE: u32 = 48_000;
const PREFERRED_CHANNELS: u16 = 2;
const RESAMPLE_CHUNK_FRAMES: usize = 1024;

enum WorkerCommand {
    Load {
        source_id: String,
        autoplay: bool,
        generation: u64,
        token: u64,
    },
    Play,
    Pause,
    Stop,
    Seek(f64),
    Decoded {
        token: u64,
        result: Result<Vec<f32>, DecodeFailure>,
    },
    ReachedEnd {
        token: u64,
    },
    Shutdown,
}

#[derive(Debug)]
struct DecodeFailure {
    code: i32,
    message: String,
}

impl DecodeFailure {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            code: ERROR_NOT_FOUND,
            message: message.into(),
        }
    }

    fn fault(message: impl Into<String>) -> Self {
        Self {
            code: ERROR_HTML5_FAULT,
            message: message.into(),
        }
    }
}

/// State shared between the worker, the output callback and the engine
/// handle.
struct SharedOutput {
    samples: Mutex<Vec<f32>>,
    cursor: AtomicUsize,
    playing: AtomicBool,
    gain_bits: AtomicU32,
    sample_rate: AtomicU32,
    channels: AtomicUsize,
    frames: AtomicUsize,
    buffer_token: AtomicU64,
    load_token: AtomicU64,
}

impl SharedOutput {
    fn new() -> Self {
        Self {
            samples: Mutex::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            playing: AtomicBool::new(false),
            gain_bits: AtomicU32::new(1.0f32.to_bits()),
            sample_rate: AtomicU32::new(0),
            channels: AtomicUsize::new(0),
            frames: AtomicUsize::new(0),
            buffer_token: AtomicU64::new(0),
            load_token: AtomicU64::new(0),
        }
    }

    fn replace_samples(&self, samples: Vec<f32>, token: u64) {
        let channels = self.channels.load(Ordering::Relaxed).max(1);
        self.playing.store(false, Ordering::Relaxed);
        self.frames.store(samples.len() / channels, Ordering::Relaxed);
        match self.samples.lock() {
            Ok(mut buffer) => *buffer = samples,
            Err(poisoned) => *poisoned.into_inner() = samples,
        }
        self.cursor.store(0, Ordering::Relaxed);
        self.buffer_token.store(token, Ordering::Relaxed);
    }

    fn seconds_at(&self, sample_index: usize) -> f64 {
        let rate = self.sample_rate.load(Ordering::Relaxed);
        let channels = self.channels.load(Ordering::Relaxed);
        if rate == 0 || channels == 0 {
            return 0.0;
        }
        (sample_index / channels) as f64 / rate as f64
    }
}

struct ActiveLoad {
    token: u64,
    generation: u64,
    autoplay: bool,
    decoded: bool,
}

/// Handle to the local engine worker. Dropping it stops the worker.
pub struct LocalEngine {
    command_sender: Option<Sender<WorkerCommand>>,
    shared: Arc<SharedOutput>,
}

impl LocalEngine {
    /// Starts the worker thread. Readiness is reported through
    /// `callbacks.on_ready()` once the output device has been opened.
    pub fn spawn(callbacks: Arc<dyn EngineCallbacks>) -> Self {
        let shared = Arc::new(SharedOutput::new());
        let (command_sender, inbox) = mpsc::channel();
        let worker_shared = Arc::clone(&shared);
        let worker_sender = command_sender.clone();

        let spawn_result = thread::Builder::new()
            .name("local-engine".to_string())
            .spawn(move || run_worker(inbox, worker_sender, worker_shared, callbacks));

        let command_sender = match spawn_result {
            Ok(_) => Some(command_sender),
            Err(err) => {
                error!("LocalEngine: failed to spawn worker thread: {}", err);
                None
            }
        };

        Self {
            command_sender,
            shared,
        }
    }

    fn send(&self, command: WorkerCommand) -> Result<(), EngineError> {
        self.command_sender
            .as_ref()
            .ok_or(EngineError::Disconnected)?
            .send(command)
            .map_err(|_| EngineError::Disconnected)
    }
}

impl Drop for LocalEngine {
    fn drop(&mut self) {
        let _ = self.send(WorkerCommand::Shutdown);
    }
}

impl MediaEngine for LocalEngine {
    fn load(
        &mut self,
        source_id: &str,
        autoplay: bool,
        generation: u64,
    ) -> Result<(), EngineError> {
        // Bumped on the caller's thread so that replies still queued for the
        // previous load are recognizably stale once this returns.
        let token = self.shared.load_token.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.playing.store(false, Ordering::Relaxed);
        self.send(WorkerCommand::Load {
            source_id: source_id.to_string(),
            autoplay,
            generation,
            token,
        })
    }

    fn play(&mut self) -> Result<(), EngineError> {
        self.send(WorkerCommand::Play)
    }

    fn pause(&mut self) -> Result<(), EngineError> {
        self.send(WorkerCommand::Pause)
    }

    fn stop(&mut self) -> Result<(), EngineError> {
        self.shared.load_token.fetch_add(1, Ordering::SeqCst);
        self.shared.playing.store(false, Ordering::Relaxed);
        self.send(WorkerCommand::Stop)
    }

    fn seek_to(&mut self, seconds: f64) -> Result<(), EngineError> {
        self.send(WorkerCommand::Seek(seconds))
    }

    fn set_volume(&mut self, volume: u8) -> Result<(), EngineError> {
        let gain = f32::from(volume.min(100)) / 100.0;
        self.shared
            .gain_bits
            .store(gain.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    fn current_time(&self) -> f64 {
        self.shared
            .seconds_at(self.shared.cursor.load(Ordering::Relaxed))
    }

    fn duration(&self) -> f64 {
        let channels = self.shared.channels.load(Ordering::Relaxed);
        self.shared
            .seconds_at(self.shared.frames.load(Ordering::Relaxed) * channels)
    }
}

fn select_output_config(device: &cpal::Device) -> Result<cpal::SupportedStreamConfig, String> {
    let preferred = device
        .supported_output_configs()
        .map_err(|err| format!("failed to query output configs: {}", err))?
        .find(|config| {
            config.sample_format() == cpal::SampleFormat::F32
                && config.channels() == PREFERRED_CHANNELS
                && config.min_sample_rate().0 <= PREFERRED_SAMPLE_RATE
                && config.max_sample_rate().0 >= PREFERRED_SAMPLE_RATE
        })
        .map(|config| config.with_sample_rate(cpal::SampleRate(PREFERRED_SAMPLE_RATE)));
    if let Some(config) = preferred {
        return Ok(config);
    }

    let fallback = device
        .default_output_config()
        .map_err(|err| format!("failed to query default output config: {}", err))?;
    if fallback.sample_format() != cpal::SampleFormat::F32 {
        return Err(format!(
            "default output format {:?} is not supported",
            fallback.sample_format()
        ));
    }
    Ok(fallback)
}

fn open_output_stream(
    shared: &Arc<SharedOutput>,
    worker_sender: Sender<WorkerCommand>,
) -> Result<cpal::Stream, String> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| "no output device available".to_string())?;
    let supported = select_output_config(&device)?;
    let channels = usize::from(supported.channels());
    let sample_rate = supported.sample_rate().0;
    shared.sample_rate.store(sample_rate, Ordering::Relaxed);
    shared.channels.store(channels, Ordering::Relaxed);

    let callback_shared = Arc::clone(shared);
    let stream = device
        .build_output_stream(
            &supported.config(),
            move |output: &mut [f32], _: &cpal::OutputCallbackInfo| {
                fill_output(&callback_shared, &worker_sender, output);
            },
            |err| error!("LocalEngine: audio stream error: {}", err),
            None,
        )
        .map_err(|err| format!("failed to build output stream: {}", err))?;
    stream
        .play()
        .map_err(|err| format!("failed to start output stream: {}", err))?;

    info!(
        "LocalEngine: output opened sample_rate={} channels={}",
        sample_rate, channels
    );
    Ok(stream)
}

fn fill_output(shared: &SharedOutput, worker_sender: &Sender<WorkerCommand>, output: &mut [f32]) {
    if !shared.playing.load(Ordering::Relaxed) {
        output.fill(0.0);
        return;
    }
    let Ok(samples) = shared.samples.try_lock() else {
        output.fill(0.0);
        return;
    };

    let gain = f32::from_bits(shared.gain_bits.load(Ordering::Relaxed));
    let start = shared.cursor.load(Ordering::Relaxed).min(samples.len());
    let copied = (samples.len() - start).min(output.len());
    for (out, sample) in output[..copied]
        .iter_mut()
        .zip(&samples[start..start + copied])
    {
        *out = sample * gain;
    }
    output[copied..].fill(0.0);
    shared.cursor.store(start + copied, Ordering::Relaxed);

    if start + copied >= samples.len() && shared.playing.swap(false, Ordering::Relaxed) {
        let _ = worker_sender.send(WorkerCommand::ReachedEnd {
            token: shared.buffer_token.load(Ordering::Relaxed),
        });
    }
}

fn run_worker(
    inbox: Receiver<WorkerCommand>,
    worker_sender: Sender<WorkerCommand>,
    shared: Arc<SharedOutput>,
    callbacks: Arc<dyn EngineCallbacks>,
) {
    let stream = match open_output_stream(&shared, worker_sender.clone()) {
        Ok(stream) => Some(stream),
        Err(err) => {
            error!("LocalEngine: {}", err);
            None
        }
    };
    callbacks.on_ready();

    let mut active: Option<ActiveLoad> = None;
    while let Ok(command) = inbox.recv() {
        match command {
            WorkerCommand::Load {
                source_id,
                autoplay,
                generation,
                token,
            } => {
                shared.replace_samples(Vec::new(), 0);
                active = Some(ActiveLoad {
                    token,
                    generation,
                    autoplay,
                    decoded: false,
                });

                if source_id.trim().is_empty() {
                    callbacks.on_error(generation, ERROR_INVALID_PARAMETERS);
                    continue;
                }
                if stream.is_none() {
                    callbacks.on_error(generation, ERROR_HTML5_FAULT);
                    continue;
                }

                let sample_rate = shared.sample_rate.load(Ordering::Relaxed);
                let channels = shared.channels.load(Ordering::Relaxed);
                let decode_sender = worker_sender.clone();
                let spawn_result = thread::Builder::new()
                    .name("local-engine-decode".to_string())
                    .spawn(move || {
                        let result = decode_file(Path::new(&source_id), sample_rate, channels);
                        let _ = decode_sender.send(WorkerCommand::Decoded { token, result });
                    });
                if let Err(err) = spawn_result {
                    error!("LocalEngine: failed to spawn decode thread: {}", err);
                    callbacks.on_error(generation, ERROR_HTML5_FAULT);
                }
            }
            WorkerCommand::Decoded { token, result } => {
                let Some(load) = active.as_mut().filter(|load| load.token == token) else {
                    debug!("LocalEngine: dropping decode result for superseded load");
                    continue;
                };
                if shared.load_token.load(Ordering::SeqCst) != token {
                    continue;
                }
                match result {
                    Ok(samples) => {
                        shared.replace_samples(samples, token);
                        load.decoded = true;
                        if load.autoplay {
                            shared.playing.store(true, Ordering::Relaxed);
                            callbacks.on_state_change(load.generation, STATE_PLAYING);
                        } else {
                            callbacks.on_state_change(load.generation, STATE_CUED);
                        }
                    }
                    Err(failure) => {
                        warn!(
                            "LocalEngine: decode failed code={} error={}",
                            failure.code, failure.message
                        );
                        callbacks.on_error(load.generation, failure.code);
                    }
                }
            }
            WorkerCommand::Play => match active.as_mut() {
                Some(load) if load.decoded => {
                    let length = shared.frames.load(Ordering::Relaxed)
                        * shared.channels.load(Ordering::Relaxed);
                    if shared.cursor.load(Ordering::Relaxed) >= length {
                        shared.cursor.store(0, Ordering::Relaxed);
                    }
                    shared.playing.store(true, Ordering::Relaxed);
                    callbacks.on_state_change(load.generation, STATE_PLAYING);
                }
                Some(load) => load.autoplay = true,
                None => debug!("LocalEngine: play ignored, nothing loaded"),
            },
            WorkerCommand::Pause => match active.as_mut() {
                Some(load) if load.decoded => {
                    shared.playing.store(false, Ordering::Relaxed);
                    callbacks.on_state_change(load.generation, STATE_PAUSED);
                }
                Some(load) => load.autoplay = false,
                None => {}
            },
            WorkerCommand::Stop => {
                shared.replace_samples(Vec::new(), 0);
                if let Some(load) = active.take() {
                    callbacks.on_state_change(load.generation, STATE_UNSTARTED);
                }
            }
            WorkerCommand::Seek(seconds) => {
                if active.as_ref().is_some_and(|load| load.decoded) {
                    let rate = f64::from(shared.sample_rate.load(Ordering::Relaxed));
                    let channels = shared.channels.load(Ordering::Relaxed);
                    let frame = ((seconds.max(0.0) * rate) as usize)
                        .min(shared.frames.load(Ordering::Relaxed));
                    shared.cursor.store(frame * channels, Ordering::Relaxed);
                }
            }
            WorkerCommand::ReachedEnd { token } => {
                if let Some(load) = active.as_ref().filter(|load| load.token == token) {
                    callbacks.on_state_change(load.generation, STATE_ENDED);
                }
            }
            WorkerCommand::Shutdown => break,
        }
    }
    debug!("LocalEngine: worker stopped");
}

/// Decodes a whole file to interleaved `f32` in the output format.
fn decode_file(
    path: &Path,
    out_rate: u32,
    out_channels: usize,
) -> Result<Vec<f32>, DecodeFailure> {
    let file = std::fs::File::open(path)
        .map_err(|err| DecodeFailure::not_found(format!("{}: {}", path.display(), err)))?;
    let media_source = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
        hint.with_extension(extension);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            media_source,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|err| DecodeFailure::fault(format!("failed to probe media source: {}", err)))?;
    let mut format_reader = probed.format;

    let track = format_reader
        .default_track()
        .ok_or_else(|| DecodeFailure::fault("no default track found"))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();
    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|err| DecodeFailure::fault(format!("failed to create decoder: {}", err)))?;

    let mut source_rate = codec_params.sample_rate.unwrap_or(44_100);
    let mut source_channels = codec_params.channels.map(|c| c.count()).unwrap_or(0);
    let mut interleaved = Vec::new();

    loop {
        let packet = match format_reader.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref err))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break
            }
            Err(err) => {
                debug!("LocalEngine: stopping decode: {}", err);
                break;
            }
        };
        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                source_rate = spec.rate;
                source_channels = spec.channels.count();
                let mut sample_buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                sample_buffer.copy_interleaved_ref(decoded);
                interleaved.extend_from_slice(sample_buffer.samples());
            }
            Err(SymphoniaError::DecodeError(err)) => {
                debug!("LocalEngine: skipping corrupt packet: {}", err);
            }
            Err(err) => {
                return Err(DecodeFailure::fault(format!("decode error: {}", err)));
            }
        }
    }

    if interleaved.is_empty() || source_channels == 0 {
        return Err(DecodeFailure::fault("no audio decoded"));
    }

    let planar = remix_to_planar(&interleaved, source_channels, out_channels);
    let planar = if source_rate == out_rate {
        planar
    } else {
        resample_planar(&planar, source_rate, out_rate).map_err(DecodeFailure::fault)?
    };
    Ok(interleave(&planar))
}

/// Splits interleaved samples into `out_channels` planes. Mono is duplicated
/// across outputs; extra source channels are dropped.
fn remix_to_planar(samples: &[f32], in_channels: usize, out_channels: usize) -> Vec<Vec<f32>> {
    if in_channels == 0 || out_channels == 0 {
        return Vec::new();
    }
    let frames = samples.len() / in_channels;
    let mut planar = vec![Vec::with_capacity(frames); out_channels];
    for frame in samples.chunks_exact(in_channels) {
        for (channel, plane) in planar.iter_mut().enumerate() {
            plane.push(frame[channel.min(in_channels - 1)]);
        }
    }
    planar
}

fn resample_planar(planar: &[Vec<f32>], in_rate: u32, out_rate: u32) -> Result<Vec<Vec<f32>>, String> {
    let channels = planar.len();
    let total_frames = planar.first().map_or(0, Vec::len);
    let mut resampler = FftFixedIn::<f32>::new(
        in_rate as usize,
        out_rate as usize,
        RESAMPLE_CHUNK_FRAMES,
        4,
        channels,
    )
    .map_err(|err| format!("failed to create resampler: {}", err))?;

    let mut output: Vec<Vec<f32>> = vec![Vec::new(); channels];
    let mut position = 0;
    while position < total_frames {
        let needed = resampler.input_frames_next();
        let result = if position + needed <= total_frames {
            let chunk: Vec<&[f32]> = planar
                .iter()
                .map(|plane| &plane[position..position + needed])
                .collect();
            position += needed;
            resampler.process(&chunk, None)
        } else {
            let chunk: Vec<&[f32]> = planar.iter().map(|plane| &plane[position..]).collect();
            position = total_frames;
            resampler.process_partial(Some(chunk.as_slice()), None)
        };
        let processed = result.map_err(|err| format!("resampling failed: {}", err))?;

        for (plane, resampled) in output.iter_mut().zip(processed) {
            plane.extend_from_slice(&resampled);
        }
    }

    // Flush the filter tail, then drop the leading delay so the output lines
    // up with the input and ends where it does.
    let expected_frames =
        ((total_frames as u64 * out_rate as u64).div_ceil(in_rate as u64)) as usize;
    let delay = resampler.output_delay();
    while output.first().map_or(0, Vec::len) < delay + expected_frames {
        let flushed = resampler
            .process_partial(None::<&[Vec<f32>]>, None)
            .map_err(|err| format!("resampler flush failed: {}", err))?;
        if flushed.first().map_or(true, Vec::is_empty) {
            break;
        }
        for (plane, resampled) in output.iter_mut().zip(flushed) {
            plane.extend_from_slice(&resampled);
        }
    }
    for plane in &mut output {
        plane.drain(..delay.min(plane.len()));
        plane.truncate(expected_frames);
    }
    Ok(output)
}

fn interleave(planar: &[Vec<f32>]) -> Vec<f32> {
    let frames = planar.first().map_or(0, Vec::len);
    let mut interleaved = Vec::with_capacity(frames * planar.len());
    for frame in 0..frames {
        for plane in planar {
            interleaved.push(plane[frame]);
        }
    }
    interleaved
}
