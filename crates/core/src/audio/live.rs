use std::thread::JoinHandle;

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    FromSample, SampleFormat, SizedSample,
};
use crossbeam_channel::{bounded, select, Receiver, Sender};

use super::{to_i16, AudioSource};
use crate::{Result, StageError};

/// Capacity of the callback-to-reader channel, in callback blocks.
const CAPTURE_QUEUE: usize = 64;

/// Captures the default input device through cpal.
///
/// The cpal stream lives on its own thread because it cannot cross threads
/// on every backend. Callback blocks are mixed to mono and handed over a
/// bounded channel; a full channel drops the block.
pub struct LiveSource {
    sample_rate: u32,
    buffer_size: usize,
    data: Receiver<Vec<f32>>,
    errors: Receiver<String>,
    pending: Vec<i16>,
    stop: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl LiveSource {
    pub fn open_default(sample_rate: u32, buffer_size: usize) -> Result<Self> {
        if buffer_size == 0 {
            return Err(StageError::InvalidInput("buffer size must be positive"));
        }

        let (data_tx, data) = bounded(CAPTURE_QUEUE);
        let (error_tx, errors) = bounded(8);
        let (stop, stop_rx) = bounded::<()>(0);
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);

        let worker = std::thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                let stream = match build_stream(sample_rate, data_tx, error_tx) {
                    Ok(stream) => stream,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Blocks until the sender is dropped.
                let _ = stop_rx.recv();
                drop(stream);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = worker.join();
                return Err(err);
            }
            Err(_) => {
                let _ = worker.join();
                return Err(StageError::TaskPanicked("audio capture"));
            }
        }

        tracing::info!(sample_rate, buffer_size, "live capture started");
        Ok(Self {
            sample_rate,
            buffer_size,
            data,
            errors,
            pending: Vec::with_capacity(buffer_size * 2),
            stop: Some(stop),
            worker: Some(worker),
        })
    }
}

impl AudioSource for LiveSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read_buffer(&mut self) -> Result<Option<Vec<i16>>> {
        while self.pending.len() < self.buffer_size {
            select! {
                recv(self.data) -> block => match block {
                    Ok(block) => self.pending.extend(block.into_iter().map(to_i16)),
                    Err(_) => return Err(StageError::AudioDevice("capture stream closed".into())),
                },
                recv(self.errors) -> err => {
                    let reason = err.unwrap_or_else(|_| "capture stream closed".into());
                    return Err(StageError::AudioDevice(reason));
                }
            }
        }

        let rest = self.pending.split_off(self.buffer_size);
        Ok(Some(std::mem::replace(&mut self.pending, rest)))
    }
}

impl Drop for LiveSource {
    fn drop(&mut self) {
        self.stop.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn build_stream(
    sample_rate: u32,
    data: Sender<Vec<f32>>,
    errors: Sender<String>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| unavailable("default input device", "no input device present"))?;
    let name = device.name().unwrap_or_else(|_| "input device".into());

    let supported = device
        .default_input_config()
        .map_err(|err| unavailable(&name, err))?;
    let format = supported.sample_format();
    let mut config: cpal::StreamConfig = supported.into();
    config.sample_rate = cpal::SampleRate(sample_rate);

    tracing::debug!(device = %name, ?format, channels = config.channels, "opening input stream");

    let stream = match format {
        SampleFormat::F32 => input_stream::<f32>(&device, &config, data, errors),
        SampleFormat::I16 => input_stream::<i16>(&device, &config, data, errors),
        SampleFormat::U16 => input_stream::<u16>(&device, &config, data, errors),
        SampleFormat::I32 => input_stream::<i32>(&device, &config, data, errors),
        other => {
            return Err(unavailable(&name, format!("unsupported sample format {other:?}")));
        }
    }
    .map_err(|err| unavailable(&name, err))?;

    stream.play().map_err(|err| unavailable(&name, err))?;
    Ok(stream)
}

fn input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    data: Sender<Vec<f32>>,
    errors: Sender<String>,
) -> std::result::Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = usize::from(config.channels.max(1));
    device.build_input_stream(
        config,
        move |input: &[T], _info: &cpal::InputCallbackInfo| {
            let block: Vec<f32> = input
                .chunks(channels)
                .map(|frame| {
                    frame.iter().map(|&s| f32::from_sample(s)).sum::<f32>() / frame.len() as f32
                })
                .collect();
            if data.try_send(block).is_err() {
                tracing::trace!("capture queue full, dropping block");
            }
        },
        move |err| {
            let _ = errors.try_send(err.to_string());
        },
        None,
    )
}

fn unavailable(device: &str, reason: impl ToString) -> StageError {
    StageError::DeviceUnavailable {
        device: device.to_string(),
        reason: reason.to_string(),
    }
}
