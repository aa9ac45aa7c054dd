//! DMX512 channel buffer and output.
//!
//! Fixtures write into a shared [`DmxBuffer`]; a [`DmxOutput`] thread
//! snapshots it at a fixed rate and hands the frame to a [`Transmitter`].
//! Addresses are 0-based here; operators see them 1-based in the simulator.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::{timeline::ShutdownTrigger, Result, StageError};

/// Channels in one DMX universe.
pub const UNIVERSE_SIZE: usize = 512;

/// Break and mark-after-break held before every frame.
const BREAK_TIME: Duration = Duration::from_micros(110);
const MARK_AFTER_BREAK: Duration = Duration::from_micros(16);

/// Shared 512-channel value store. Writes are clamped to 0..=255 and
/// addresses outside the universe are ignored.
#[derive(Debug)]
pub struct DmxBuffer {
    channels: Mutex<[u8; UNIVERSE_SIZE]>,
}

impl DmxBuffer {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new([0; UNIVERSE_SIZE]),
        }
    }

    pub fn set_value(&self, address: usize, value: i32) {
        if address >= UNIVERSE_SIZE {
            return;
        }
        self.lock()[address] = value.clamp(0, 255) as u8;
    }

    /// Current value at `address`, 0 outside the universe.
    pub fn get_value(&self, address: usize) -> u8 {
        if address >= UNIVERSE_SIZE {
            return 0;
        }
        self.lock()[address]
    }

    pub fn snapshot(&self) -> [u8; UNIVERSE_SIZE] {
        *self.lock()
    }

    pub fn clear(&self) {
        *self.lock() = [0; UNIVERSE_SIZE];
    }

    // Every write leaves the array valid, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, [u8; UNIVERSE_SIZE]> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for DmxBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Sends complete frames to a device or a log.
pub trait Transmitter: Send {
    fn transmit(&mut self, frame: &[u8; UNIVERSE_SIZE]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

/// Low-level serial adapter driving the DMX line.
pub trait DmxPort: Send {
    fn set_baud_rate(&mut self, baud: u32) -> Result<()>;

    fn set_line_properties(&mut self, data_bits: u8, stop_bits: u8, parity: Parity) -> Result<()>;

    fn set_break(&mut self, on: bool) -> Result<()>;

    fn write_all(&mut self, bytes: &[u8]) -> Result<()>;
}

/// Start code 0 followed by the 512 channel values.
pub fn encode_frame(frame: &[u8; UNIVERSE_SIZE]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(UNIVERSE_SIZE + 1);
    packet.push(0);
    packet.extend_from_slice(frame);
    packet
}

/// DMX512 over a serial adapter: 250 kbaud, 8 data bits, 2 stop bits, no
/// parity, with a break before every packet.
#[derive(Debug)]
pub struct SerialTransmitter<P> {
    port: P,
}

impl<P: DmxPort> SerialTransmitter<P> {
    pub fn new(mut port: P, baud: u32) -> Result<Self> {
        port.set_baud_rate(baud)?;
        port.set_line_properties(8, 2, Parity::None)?;
        Ok(Self { port })
    }

    pub fn port(&self) -> &P {
        &self.port
    }
}

impl<P: DmxPort> Transmitter for SerialTransmitter<P> {
    fn transmit(&mut self, frame: &[u8; UNIVERSE_SIZE]) -> Result<()> {
        self.port.set_break(true)?;
        thread::sleep(BREAK_TIME);
        self.port.set_break(false)?;
        thread::sleep(MARK_AFTER_BREAK);
        self.port.write_all(&encode_frame(frame))
    }
}

/// Writes packets to a character device such as `/dev/ttyUSB0`.
///
/// The line itself (baud, framing, break) has to be configured on the device
/// node beforehand; requests for those settings are only logged.
#[derive(Debug)]
pub struct FilePort {
    path: PathBuf,
    file: File,
}

impl FilePort {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|err| StageError::DeviceUnavailable {
                device: path.display().to_string(),
                reason: err.to_string(),
            })?;
        info!(device = %path.display(), "dmx port opened");
        Ok(Self { path, file })
    }
}

impl DmxPort for FilePort {
    fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        debug!(device = %self.path.display(), baud, "baud rate must be set on the device node");
        Ok(())
    }

    fn set_line_properties(&mut self, data_bits: u8, stop_bits: u8, parity: Parity) -> Result<()> {
        debug!(
            device = %self.path.display(),
            data_bits,
            stop_bits,
            ?parity,
            "line properties must be set on the device node"
        );
        Ok(())
    }

    fn set_break(&mut self, _on: bool) -> Result<()> {
        Ok(())
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.file.write_all(bytes)?;
        self.file.flush()?;
        Ok(())
    }
}

/// Logs the active channels of every frame instead of driving hardware.
#[derive(Debug, Default)]
pub struct SimulatedTransmitter {
    frames: u64,
}

impl SimulatedTransmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

/// Non-zero channels as `(channel, value)` with 1-based channel numbers.
pub fn active_channels(frame: &[u8; UNIVERSE_SIZE]) -> Vec<(usize, u8)> {
    frame
        .iter()
        .enumerate()
        .filter(|(_, value)| **value > 0)
        .map(|(address, &value)| (address + 1, value))
        .collect()
}

impl Transmitter for SimulatedTransmitter {
    fn transmit(&mut self, frame: &[u8; UNIVERSE_SIZE]) -> Result<()> {
        self.frames += 1;
        let active = active_channels(frame);
        if active.is_empty() {
            return Ok(());
        }

        let listing = active
            .iter()
            .map(|(channel, value)| format!("{channel}={value}"))
            .collect::<Vec<_>>()
            .join(" ");
        info!(frame = self.frames, active = active.len(), "{listing}");
        Ok(())
    }
}

/// Periodic transmit thread.
#[derive(Debug)]
pub struct DmxOutput {
    shutdown: ShutdownTrigger,
    worker: Option<JoinHandle<Result<()>>>,
}

impl DmxOutput {
    pub fn spawn(
        buffer: Arc<DmxBuffer>,
        mut transmitter: Box<dyn Transmitter>,
        frame_rate: f32,
    ) -> Result<Self> {
        if !(frame_rate > 0.0 && frame_rate.is_finite()) {
            return Err(StageError::InvalidInput("frame rate must be positive"));
        }

        let interval = Duration::from_secs_f32(1.0 / frame_rate);
        let shutdown = ShutdownTrigger::new();
        let token = shutdown.token();

        let worker = thread::Builder::new()
            .name("dmx-output".into())
            .spawn(move || {
                let mut next = Instant::now();
                loop {
                    if let Err(err) = transmitter.transmit(&buffer.snapshot()) {
                        warn!(error = %err, "dmx transmit failed");
                        return Err(err);
                    }
                    next += interval;
                    if !token.sleep_until(next) {
                        return Ok(());
                    }
                }
            })?;

        info!(frame_rate, "dmx output started");
        Ok(Self {
            shutdown,
            worker: Some(worker),
        })
    }

    /// Stops transmitting and joins the thread.
    pub fn stop(&mut self) -> Result<()> {
        self.shutdown.trigger();
        match self.worker.take() {
            Some(worker) => worker
                .join()
                .map_err(|_| StageError::TaskPanicked("dmx output"))?,
            None => Ok(()),
        }
    }
}

impl Drop for DmxOutput {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(error = %err, "dmx output stopped with an error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct RecordingPort {
        calls: Vec<String>,
        written: Vec<Vec<u8>>,
    }

    impl DmxPort for RecordingPort {
        fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
            self.calls.push(format!("baud {baud}"));
            Ok(())
        }

        fn set_line_properties(&mut self, data_bits: u8, stop_bits: u8, parity: Parity) -> Result<()> {
            self.calls.push(format!("line {data_bits}{parity:?}{stop_bits}"));
            Ok(())
        }

        fn set_break(&mut self, on: bool) -> Result<()> {
            self.calls.push(format!("break {on}"));
            Ok(())
        }

        fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
            self.calls.push("write".into());
            self.written.push(bytes.to_vec());
            Ok(())
        }
    }

    struct CountingTransmitter(Arc<Mutex<Vec<u8>>>);

    impl Transmitter for CountingTransmitter {
        fn transmit(&mut self, frame: &[u8; UNIVERSE_SIZE]) -> Result<()> {
            self.0.lock().unwrap().push(frame[0]);
            Ok(())
        }
    }

    #[test]
    fn values_are_clamped() {
        let buffer = DmxBuffer::new();
        buffer.set_value(0, 300);
        buffer.set_value(1, -5);
        buffer.set_value(2, 128);

        assert_eq!(buffer.get_value(0), 255);
        assert_eq!(buffer.get_value(1), 0);
        assert_eq!(buffer.get_value(2), 128);
    }

    #[test]
    fn out_of_range_addresses_are_ignored() {
        let buffer = DmxBuffer::new();
        buffer.set_value(512, 99);
        buffer.set_value(usize::MAX, 99);

        assert_eq!(buffer.get_value(512), 0);
        assert!(buffer.snapshot().iter().all(|&value| value == 0));
    }

    #[test]
    fn clear_zeroes_everything() {
        let buffer = DmxBuffer::new();
        buffer.set_value(10, 200);
        buffer.clear();
        assert_eq!(buffer.get_value(10), 0);
    }

    #[test]
    fn frame_has_start_code() {
        let mut frame = [0; UNIVERSE_SIZE];
        frame[511] = 7;
        let packet = encode_frame(&frame);
        assert_eq!(packet.len(), 513);
        assert_eq!(packet[0], 0);
        assert_eq!(packet[512], 7);
    }

    #[test]
    fn serial_transmitter_configures_line_and_breaks_before_data() {
        let mut transmitter = SerialTransmitter::new(RecordingPort::default(), 250_000).unwrap();
        transmitter.transmit(&[1; UNIVERSE_SIZE]).unwrap();

        let port = transmitter.port();
        assert_eq!(
            port.calls,
            vec!["baud 250000", "line 8None2", "break true", "break false", "write"]
        );
        assert_eq!(port.written[0].len(), 513);
    }

    #[test]
    fn active_channels_are_one_based() {
        let mut frame = [0; UNIVERSE_SIZE];
        frame[0] = 255;
        frame[60] = 12;
        assert_eq!(active_channels(&frame), vec![(1, 255), (61, 12)]);
    }

    #[test]
    fn opening_a_missing_device_is_actionable() {
        let err = FilePort::open("/nonexistent/dmx-device").unwrap_err();
        assert!(matches!(err, StageError::DeviceUnavailable { .. }));
        assert!(err.to_string().contains("simulator"));
    }

    #[test]
    fn output_thread_transmits_until_stopped() {
        let buffer = Arc::new(DmxBuffer::new());
        buffer.set_value(0, 42);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut output =
            DmxOutput::spawn(buffer, Box::new(CountingTransmitter(seen.clone())), 200.0).unwrap();
        thread::sleep(Duration::from_millis(50));
        output.stop().unwrap();

        let frames = seen.lock().unwrap().clone();
        assert!(frames.len() >= 2);
        assert!(frames.iter().all(|&first| first == 42));
    }
}
