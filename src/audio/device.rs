//! Audio device abstraction and its `cpal` implementation.
//!
//! The capture and playback cores never touch `cpal` directly; they talk to
//! an [`InputDevice`] or [`OutputDevice`].  [`CpalInput`] and [`CpalOutput`]
//! are the production implementations.
//!
//! `cpal::Stream` is not `Send` on every platform, so each stream is built,
//! played and dropped on a dedicated thread owned by a [`DeviceThread`].  The
//! handles handed back to callers are plain `Send` values and can be stopped
//! from any thread.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use thiserror::Error;

use super::convert::{FormatConverter, StreamConverter};
use super::format::{AudioFormat, PcmBuffer, SampleEncoding};
use super::playback::Completion;

/// Callback invoked on the audio thread with every captured buffer.
pub type BufferCallback = Box<dyn FnMut(PcmBuffer) + Send + 'static>;

// ---------------------------------------------------------------------------
// DeviceSetupError
// ---------------------------------------------------------------------------

/// An audio device could not be opened or configured.
#[derive(Debug, Error)]
pub enum DeviceSetupError {
    #[error("no input device available ({0})")]
    NoInputDevice(String),

    #[error("no output device available ({0})")]
    NoOutputDevice(String),

    #[error("failed to enumerate audio devices: {0}")]
    Enumerate(#[from] cpal::DevicesError),

    #[error("failed to query default stream config: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),

    #[error("failed to build audio stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("failed to start audio stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[error("unsupported device sample format: {0}")]
    UnsupportedSampleFormat(String),

    #[error("audio device thread failed: {0}")]
    Thread(String),
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// A source of captured audio.
pub trait InputDevice: Send + Sync {
    /// Native format reported by the device.
    fn format(&self) -> AudioFormat;

    /// Start capturing.  `on_buffer` runs on the device's audio thread for
    /// every hardware buffer and must return quickly.
    fn open(&self, on_buffer: BufferCallback) -> Result<Box<dyn ActiveStream>, DeviceSetupError>;
}

/// A running input stream.  Dropping it also stops the device.
pub trait ActiveStream: Send {
    /// Halt the device and wait until no further callbacks can run.
    fn stop(&mut self);
}

/// A sink that plays scheduled buffers in the order they were scheduled.
///
/// Implementations call [`Completion::complete`] exactly once per buffer,
/// after its last frame has been consumed.  Tokens of buffers discarded by
/// [`stop`](OutputDevice::stop) are simply dropped.
pub trait OutputDevice: Send + Sync {
    /// Native format reported by the device.
    fn format(&self) -> AudioFormat;

    /// Start the output stream.  A no-op when it is already running.
    fn start(&self) -> Result<(), DeviceSetupError>;

    /// Append `buffer` to the play-out queue.
    fn schedule(&self, buffer: PcmBuffer, done: Completion);

    /// Stop output and discard every queued buffer.  Must not block on the
    /// audio thread: it may be called from inside a completion.
    fn stop(&self);
}

// ---------------------------------------------------------------------------
// DeviceThread
// ---------------------------------------------------------------------------

/// Owns a `cpal::Stream` on its own thread until told to stop.
pub struct DeviceThread {
    stop_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl DeviceThread {
    /// Spawn a thread that runs `build` and keeps the resulting stream alive.
    ///
    /// Blocks until `build` has returned so setup errors reach the caller.
    pub fn spawn<F>(name: &str, build: F) -> Result<Self, DeviceSetupError>
    where
        F: FnOnce() -> Result<cpal::Stream, DeviceSetupError> + Send + 'static,
    {
        let (ready_tx, ready_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Returns once the sender is dropped.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| DeviceSetupError::Thread(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop_tx: Some(stop_tx),
                handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(DeviceSetupError::Thread(
                    "device thread exited during setup".into(),
                ))
            }
        }
    }

    /// Signal the thread to drop its stream without waiting for it.
    pub fn detach(mut self) {
        self.stop_tx.take();
        self.handle.take();
    }
}

impl ActiveStream for DeviceThread {
    fn stop(&mut self) {
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("audio device thread panicked");
            }
        }
    }
}

impl Drop for DeviceThread {
    fn drop(&mut self) {
        self.stop_tx.take();
    }
}

// ---------------------------------------------------------------------------
// Device lookup
// ---------------------------------------------------------------------------

/// Names of the devices on the default host.
#[derive(Debug, Clone, Default)]
pub struct DeviceList {
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

/// Enumerate input and output devices on the default host.
pub fn list_devices() -> Result<DeviceList, DeviceSetupError> {
    let host = cpal::default_host();
    let inputs = host
        .input_devices()?
        .filter_map(|d| d.name().ok())
        .collect();
    let outputs = host
        .output_devices()?
        .filter_map(|d| d.name().ok())
        .collect();
    Ok(DeviceList { inputs, outputs })
}

fn find_input(name: Option<&str>) -> Result<cpal::Device, DeviceSetupError> {
    let host = cpal::default_host();
    match name {
        Some(wanted) => host
            .input_devices()?
            .find(|d| d.name().is_ok_and(|n| n == wanted))
            .ok_or_else(|| DeviceSetupError::NoInputDevice(wanted.to_owned())),
        None => host
            .default_input_device()
            .ok_or_else(|| DeviceSetupError::NoInputDevice("default".into())),
    }
}

fn find_output(name: Option<&str>) -> Result<cpal::Device, DeviceSetupError> {
    let host = cpal::default_host();
    match name {
        Some(wanted) => host
            .output_devices()?
            .find(|d| d.name().is_ok_and(|n| n == wanted))
            .ok_or_else(|| DeviceSetupError::NoOutputDevice(wanted.to_owned())),
        None => host
            .default_output_device()
            .ok_or_else(|| DeviceSetupError::NoOutputDevice("default".into())),
    }
}

/// Describe a cpal sample format.  Formats other than `i16` are converted
/// sample-by-sample in the stream callbacks.
fn encoding_of(format: SampleFormat) -> SampleEncoding {
    match format {
        SampleFormat::I16 => SampleEncoding::I16,
        _ => SampleEncoding::F32,
    }
}

// ---------------------------------------------------------------------------
// CpalInput
// ---------------------------------------------------------------------------

/// Microphone input built on `cpal`.
///
/// Captured buffers are delivered as 16-bit PCM at the device's native rate
/// and channel count.
pub struct CpalInput {
    device_name: Option<String>,
    config: cpal::StreamConfig,
    sample_format: SampleFormat,
}

impl CpalInput {
    /// Resolve `device_name` (or the system default) and read its preferred
    /// stream configuration.
    ///
    /// # Errors
    ///
    /// [`DeviceSetupError::NoInputDevice`] when the device does not exist, or
    /// [`DeviceSetupError::DefaultConfig`] when it reports no configuration.
    pub fn new(device_name: Option<&str>) -> Result<Self, DeviceSetupError> {
        let device = find_input(device_name)?;
        let supported = device.default_input_config()?;
        let sample_format = supported.sample_format();
        let config: cpal::StreamConfig = supported.into();

        log::info!(
            "input device {:?}: {} Hz, {} channel(s), {sample_format:?}",
            device.name().unwrap_or_default(),
            config.sample_rate.0,
            config.channels
        );

        Ok(Self {
            device_name: device_name.map(str::to_owned),
            config,
            sample_format,
        })
    }
}

impl InputDevice for CpalInput {
    fn format(&self) -> AudioFormat {
        AudioFormat::new(self.config.sample_rate.0, self.config.channels)
            .with_encoding(encoding_of(self.sample_format))
    }

    fn open(&self, on_buffer: BufferCallback) -> Result<Box<dyn ActiveStream>, DeviceSetupError> {
        let name = self.device_name.clone();
        let config = self.config.clone();
        let sample_format = self.sample_format;
        let format = AudioFormat::new(config.sample_rate.0, config.channels);

        let thread = DeviceThread::spawn("audio-capture", move || {
            let device = find_input(name.as_deref())?;
            let stream = match sample_format {
                SampleFormat::F32 => build_input::<f32>(&device, &config, format, on_buffer)?,
                SampleFormat::I16 => build_input::<i16>(&device, &config, format, on_buffer)?,
                SampleFormat::U16 => build_input::<u16>(&device, &config, format, on_buffer)?,
                other => {
                    return Err(DeviceSetupError::UnsupportedSampleFormat(format!("{other:?}")))
                }
            };
            stream.play()?;
            Ok(stream)
        })?;

        Ok(Box::new(thread))
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    format: AudioFormat,
    mut on_buffer: BufferCallback,
) -> Result<cpal::Stream, DeviceSetupError>
where
    T: SizedSample,
    i16: FromSample<T>,
{
    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let samples = data.iter().map(|&s| i16::from_sample(s)).collect();
            on_buffer(PcmBuffer::new(format, samples));
        },
        |err: cpal::StreamError| {
            log::error!("cpal input stream error: {err}");
        },
        None,
    )?;
    Ok(stream)
}

// ---------------------------------------------------------------------------
// CpalOutput
// ---------------------------------------------------------------------------

struct Scheduled {
    samples: Vec<i16>,
    pos: usize,
    done: Option<Completion>,
}

type OutputQueue = Arc<Mutex<VecDeque<Scheduled>>>;

struct ActiveOutput {
    queue: OutputQueue,
    /// Locked across conversion and enqueue so buffers keep their order.
    converter: Mutex<StreamConverter>,
    thread: DeviceThread,
}

/// Speaker output built on `cpal`.
///
/// Scheduled buffers are converted to the device's rate and layout, queued
/// FIFO, and pulled by the output callback.  Each [`start`](OutputDevice::start)
/// opens a fresh stream with a fresh queue and converter, so a stream still
/// shutting down can never consume buffers meant for the next one.
///
/// Consecutive buffers share one resampler.  When rates differ, the last
/// resampler chunk (under 2 ms) of a stream is not played.
pub struct CpalOutput {
    device_name: Option<String>,
    config: cpal::StreamConfig,
    sample_format: SampleFormat,
    converter: FormatConverter,
    active: Mutex<Option<ActiveOutput>>,
}

impl CpalOutput {
    /// Resolve `device_name` (or the system default) and read its preferred
    /// stream configuration.  The stream itself opens on the first `start`.
    pub fn new(
        device_name: Option<&str>,
        converter: FormatConverter,
    ) -> Result<Self, DeviceSetupError> {
        let device = find_output(device_name)?;
        let supported = device.default_output_config()?;
        let sample_format = supported.sample_format();
        let config: cpal::StreamConfig = supported.into();

        log::info!(
            "output device {:?}: {} Hz, {} channel(s), {sample_format:?}",
            device.name().unwrap_or_default(),
            config.sample_rate.0,
            config.channels
        );

        Ok(Self {
            device_name: device_name.map(str::to_owned),
            config,
            sample_format,
            converter,
            active: Mutex::new(None),
        })
    }

    fn mix_format(&self) -> AudioFormat {
        AudioFormat::new(self.config.sample_rate.0, self.config.channels)
    }
}

impl OutputDevice for CpalOutput {
    fn format(&self) -> AudioFormat {
        self.mix_format()
            .with_encoding(encoding_of(self.sample_format))
    }

    fn start(&self) -> Result<(), DeviceSetupError> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.is_some() {
            return Ok(());
        }

        let queue: OutputQueue = Arc::new(Mutex::new(VecDeque::new()));
        let callback_queue = Arc::clone(&queue);
        let name = self.device_name.clone();
        let config = self.config.clone();
        let sample_format = self.sample_format;

        let thread = DeviceThread::spawn("audio-playback", move || {
            let device = find_output(name.as_deref())?;
            let stream = match sample_format {
                SampleFormat::F32 => build_output::<f32>(&device, &config, callback_queue)?,
                SampleFormat::I16 => build_output::<i16>(&device, &config, callback_queue)?,
                SampleFormat::U16 => build_output::<u16>(&device, &config, callback_queue)?,
                other => {
                    return Err(DeviceSetupError::UnsupportedSampleFormat(format!("{other:?}")))
                }
            };
            stream.play()?;
            Ok(stream)
        })?;

        log::debug!("output stream started");
        *active = Some(ActiveOutput {
            queue,
            converter: Mutex::new(self.converter.stream(self.mix_format())),
            thread,
        });
        Ok(())
    }

    fn schedule(&self, buffer: PcmBuffer, done: Completion) {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(output) = active.as_ref() {
            let mut converter = output
                .converter
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            // A buffer that cannot be converted still goes through the queue
            // (empty) so its completion fires in order.
            let samples = match converter.process(buffer) {
                Ok(converted) => converted.into_samples(),
                Err(e) => {
                    log::warn!("playback: dropping unconvertible buffer: {e}");
                    Vec::new()
                }
            };
            enqueue(
                &output.queue,
                Scheduled {
                    samples,
                    pos: 0,
                    done: Some(done),
                },
            );
            return;
        }
        drop(active);

        log::warn!("playback: buffer scheduled while output is stopped");
        complete_detached(done);
    }

    fn stop(&self) {
        let taken = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(output) = taken {
            output
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
            // Never join here: this may be running on the output callback.
            output.thread.detach();
            log::debug!("output stream stopped");
        }
    }
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: OutputQueue,
) -> Result<cpal::Stream, DeviceSetupError>
where
    T: SizedSample + FromSample<i16>,
{
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            // Completions run after the queue lock is released.
            for done in fill_output(&queue, data) {
                done.complete();
            }
        },
        |err: cpal::StreamError| {
            log::error!("cpal output stream error: {err}");
        },
        None,
    )?;
    Ok(stream)
}

fn enqueue(queue: &Mutex<VecDeque<Scheduled>>, scheduled: Scheduled) {
    queue
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push_back(scheduled);
}

/// Redeem `done` off the calling thread.  Callers schedule while holding
/// their own locks, and a completion may re-enter them.
fn complete_detached(done: Completion) {
    let spawned = thread::Builder::new()
        .name("playback-complete".into())
        .spawn(move || done.complete());
    if let Err(e) = spawned {
        log::error!("playback: failed to spawn completion thread: {e}");
    }
}

/// Copy queued samples into `data`, padding with silence, and return the
/// completions of every buffer that was fully consumed.
fn fill_output<T>(queue: &Mutex<VecDeque<Scheduled>>, data: &mut [T]) -> Vec<Completion>
where
    T: Sample + FromSample<i16>,
{
    let mut finished = Vec::new();
    let mut queue = queue.lock().unwrap_or_else(PoisonError::into_inner);

    for slot in data.iter_mut() {
        *slot = match next_sample(&mut queue, &mut finished) {
            Some(s) => T::from_sample(s),
            None => T::EQUILIBRIUM,
        };
    }

    while queue.front().is_some_and(|s| s.pos >= s.samples.len()) {
        if let Some(done) = queue.pop_front().and_then(|s| s.done) {
            finished.push(done);
        }
    }
    finished
}

fn next_sample(queue: &mut VecDeque<Scheduled>, finished: &mut Vec<Completion>) -> Option<i16> {
    loop {
        let current = queue.front_mut()?;
        if let Some(&s) = current.samples.get(current.pos) {
            current.pos += 1;
            return Some(s);
        }
        if let Some(done) = queue.pop_front().and_then(|s| s.done) {
            finished.push(done);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduled(samples: Vec<i16>) -> Scheduled {
        Scheduled {
            samples,
            pos: 0,
            done: None,
        }
    }

    #[test]
    fn fill_output_plays_in_order_and_pads_with_silence() {
        let queue = Mutex::new(VecDeque::from([
            scheduled(vec![1, 2]),
            scheduled(vec![]),
            scheduled(vec![3]),
        ]));
        let mut data = [9_i16; 5];
        fill_output(&queue, &mut data);
        assert_eq!(data, [1, 2, 3, 0, 0]);
        assert!(queue.lock().unwrap().is_empty());
    }

    #[test]
    fn fill_output_keeps_partially_played_buffer() {
        let queue = Mutex::new(VecDeque::from([scheduled(vec![5, 6, 7])]));
        let mut data = [0_i16; 2];
        fill_output(&queue, &mut data);
        assert_eq!(data, [5, 6]);

        let queue = queue.into_inner().unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].pos, 2);
    }

    #[test]
    fn fill_output_converts_to_float() {
        let queue = Mutex::new(VecDeque::from([scheduled(vec![i16::MIN, 0])]));
        let mut data = [1.0_f32; 2];
        fill_output(&queue, &mut data);
        assert!((data[0] + 1.0).abs() < 1e-4);
        assert_eq!(data[1], 0.0);
    }

    #[test]
    fn enqueue_and_fill_recover_a_poisoned_queue() {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let poisoner = Arc::clone(&queue);
        let _ = thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison the queue");
        })
        .join();
        assert!(queue.is_poisoned());

        enqueue(&queue, scheduled(vec![4, 5]));
        let mut data = [0_i16; 3];
        fill_output(&queue, &mut data);
        assert_eq!(data, [4, 5, 0]);
    }

    #[test]
    fn detached_completion_still_finishes_playback() {
        use std::time::Duration;

        use crate::audio::{PlaybackEvent, PlaybackSequencer};
        use crate::testing::MockOutput;

        let mock = Arc::new(MockOutput::default());
        let sequencer = PlaybackSequencer::new(mock.clone());
        let events = sequencer.subscribe();
        sequencer.play(&[1, 0, 2, 0]).unwrap();

        let mut tokens = mock.take_completions();
        assert_eq!(tokens.len(), 1);
        complete_detached(tokens.remove(0));

        assert_eq!(
            events.recv_timeout(Duration::from_secs(5)),
            Ok(PlaybackEvent::Complete)
        );
        assert_eq!(sequencer.pending(), 0);
    }

    #[test]
    fn device_thread_reports_build_errors() {
        let result = DeviceThread::spawn("test-device", || {
            Err(DeviceSetupError::NoInputDevice("missing".into()))
        });
        assert!(matches!(result, Err(DeviceSetupError::NoInputDevice(_))));
    }

    #[test]
    fn traits_are_object_safe() {
        fn _input(_: Box<dyn InputDevice>) {}
        fn _output(_: Box<dyn OutputDevice>) {}
        fn _stream(_: Box<dyn ActiveStream>) {}
    }
}
