//! V4L2 device implementation using the v4l crate.
//!
//! V4L2 capture devices free-run, so the trigger and cycle modes are held
//! host-side: software triggering simply means the next dequeued frame is
//! the snapshot. Pixel encodings are the FourCC codes the driver lists.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::rc::Rc;

use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream as V4lCaptureStream;
use v4l::video::Capture;
use v4l::Device as V4lDevice;

use crate::traits::{
    BufferQueue, CameraError, CommandFeature, Device, EnumFeature, FrameBuffer, IntegerFeature,
    QueueRejected, Result, WaitTimeout, ACQUISITION_START, ACQUISITION_STOP, CYCLE_MODE,
    IMAGE_SIZE_BYTES, PIXEL_ENCODING, SOFTWARE_TRIGGER, TRIGGER_MODE,
};

const TRIGGER_MODES: [&str; 2] = ["Internal", "Software"];
const CYCLE_MODES: [&str; 2] = ["Fixed", "Continuous"];

/// Device capability flags.
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Whether the device can capture video.
    pub can_capture: bool,
    /// Whether the device supports streaming.
    pub can_stream: bool,
}

impl DeviceCapabilities {
    fn require_streaming_capture(&self, index: u32) -> Result<()> {
        if self.can_capture && self.can_stream {
            return Ok(());
        }
        Err(CameraError::DeviceOpenFailed(format!(
            "/dev/video{index} ({}) does not support streaming capture",
            self.card
        )))
    }
}

struct Inner {
    device: V4lDevice,
    buffer_count: u32,
    trigger_mode: usize,
    cycle_mode: usize,
    stream: Option<Stream<'static>>,
    queued: VecDeque<FrameBuffer>,
}

impl Inner {
    fn stream_error(err: &std::io::Error) -> CameraError {
        CameraError::StreamError(err.to_string())
    }

    fn fourccs(&self) -> Result<Vec<v4l::FourCC>> {
        let formats = self
            .device
            .enum_formats()
            .map_err(|err| Self::stream_error(&err))?;
        Ok(formats.into_iter().map(|desc| desc.fourcc).collect())
    }
}

fn fourcc_label(repr: &[u8; 4]) -> String {
    String::from_utf8_lossy(repr).trim_end().to_owned()
}

/// Copy the `bytesused` payload of a dequeued frame into `dst`.
///
/// The payload must fill `dst` exactly; a short or oversized frame is an
/// error rather than a buffer holding stale or truncated data.
fn copy_frame(dst: &mut [u8], data: &[u8], bytesused: u32) -> Result<()> {
    let used = usize::try_from(bytesused)
        .ok()
        .filter(|&used| used > 0)
        .unwrap_or(data.len());
    let payload = data.get(..used).ok_or_else(|| {
        CameraError::StreamError(format!(
            "driver reported {used} bytes in a {} byte buffer",
            data.len()
        ))
    })?;
    if payload.len() != dst.len() {
        return Err(CameraError::StreamError(format!(
            "frame holds {} bytes, expected {}",
            payload.len(),
            dst.len()
        )));
    }
    dst.copy_from_slice(payload);
    Ok(())
}

/// V4L2 device implementation wrapping the v4l crate.
pub struct V4L2Device {
    inner: Rc<RefCell<Inner>>,
    capabilities: DeviceCapabilities,
}

impl V4L2Device {
    /// Open a V4L2 device by index (e.g., 0 for /dev/video0).
    ///
    /// `buffer_count` is the number of driver buffers mapped while
    /// acquisition runs.
    pub fn open(index: u32, buffer_count: u32) -> Result<Self> {
        let device = V4lDevice::new(index as usize)
            .map_err(|err| CameraError::DeviceOpenFailed(err.to_string()))?;

        let caps = device
            .query_caps()
            .map_err(|err| CameraError::DeviceOpenFailed(err.to_string()))?;

        let capabilities = DeviceCapabilities {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            can_capture: caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE),
            can_stream: caps.capabilities.contains(v4l::capability::Flags::STREAMING),
        };
        capabilities.require_streaming_capture(index)?;
        tracing::info!(
            index,
            card = %capabilities.card,
            driver = %capabilities.driver,
            bus = %capabilities.bus_info,
            "opened V4L2 device"
        );

        Ok(Self {
            inner: Rc::new(RefCell::new(Inner {
                device,
                buffer_count,
                trigger_mode: 0,
                cycle_mode: 0,
                stream: None,
                queued: VecDeque::new(),
            })),
            capabilities,
        })
    }

    /// Get device capabilities.
    pub const fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }
}

/// Image size handle.
pub struct V4L2Integer {
    inner: Rc<RefCell<Inner>>,
}

impl IntegerFeature for V4L2Integer {
    fn get(&self) -> Result<i64> {
        let inner = self.inner.borrow();
        let fmt = inner
            .device
            .format()
            .map_err(|err| Inner::stream_error(&err))?;
        Ok(i64::from(fmt.size))
    }
}

#[derive(Debug, Clone, Copy)]
enum EnumKind {
    Trigger,
    Cycle,
    Encoding,
}

/// Enumerated feature handle.
pub struct V4L2Enum {
    inner: Rc<RefCell<Inner>>,
    kind: EnumKind,
    name: &'static str,
}

impl V4L2Enum {
    fn invalid(&self, value: String) -> CameraError {
        CameraError::InvalidValue {
            feature: self.name.to_owned(),
            value,
        }
    }

    fn fixed_labels(&self) -> Option<&'static [&'static str]> {
        match self.kind {
            EnumKind::Trigger => Some(&TRIGGER_MODES),
            EnumKind::Cycle => Some(&CYCLE_MODES),
            EnumKind::Encoding => None,
        }
    }
}

impl EnumFeature for V4L2Enum {
    fn index(&self) -> Result<usize> {
        let inner = self.inner.borrow();
        match self.kind {
            EnumKind::Trigger => Ok(inner.trigger_mode),
            EnumKind::Cycle => Ok(inner.cycle_mode),
            EnumKind::Encoding => {
                let current = inner
                    .device
                    .format()
                    .map_err(|err| Inner::stream_error(&err))?
                    .fourcc;
                inner
                    .fourccs()?
                    .iter()
                    .position(|fourcc| fourcc.repr == current.repr)
                    .ok_or_else(|| self.invalid(fourcc_label(&current.repr)))
            }
        }
    }

    fn set_index(&mut self, index: usize) -> Result<()> {
        if index >= self.count()? {
            return Err(self.invalid(index.to_string()));
        }
        let mut inner = self.inner.borrow_mut();
        match self.kind {
            EnumKind::Trigger => inner.trigger_mode = index,
            EnumKind::Cycle => inner.cycle_mode = index,
            EnumKind::Encoding => {
                if inner.stream.is_some() {
                    return Err(CameraError::Device(
                        "cannot change pixel encoding while acquiring".to_owned(),
                    ));
                }
                let fourcc = inner
                    .fourccs()?
                    .into_iter()
                    .nth(index)
                    .ok_or_else(|| self.invalid(index.to_string()))?;
                let wanted = fourcc.repr;
                let mut fmt = inner
                    .device
                    .format()
                    .map_err(|err| Inner::stream_error(&err))?;
                fmt.fourcc = fourcc;
                let actual = inner
                    .device
                    .set_format(&fmt)
                    .map_err(|err| Inner::stream_error(&err))?;
                if actual.fourcc.repr != wanted {
                    return Err(self.invalid(fourcc_label(&wanted)));
                }
            }
        }
        tracing::debug!(feature = self.name, index, "enum feature set");
        Ok(())
    }

    fn label_at(&self, index: usize) -> Result<String> {
        match self.fixed_labels() {
            Some(labels) => labels
                .get(index)
                .map(|&label| label.to_owned())
                .ok_or_else(|| self.invalid(index.to_string())),
            None => self
                .inner
                .borrow()
                .fourccs()?
                .get(index)
                .map(|fourcc| fourcc_label(&fourcc.repr))
                .ok_or_else(|| self.invalid(index.to_string())),
        }
    }

    fn count(&self) -> Result<usize> {
        match self.fixed_labels() {
            Some(labels) => Ok(labels.len()),
            None => Ok(self.inner.borrow().fourccs()?.len()),
        }
    }

    fn set(&mut self, label: &str) -> Result<()> {
        let index = self
            .labels()?
            .iter()
            .position(|known| known == label)
            .ok_or_else(|| self.invalid(label.to_owned()))?;
        self.set_index(index)
    }
}

#[derive(Debug, Clone, Copy)]
enum CommandKind {
    Start,
    Stop,
    SoftwareTrigger,
}

/// Command handle.
pub struct V4L2Command {
    inner: Rc<RefCell<Inner>>,
    kind: CommandKind,
}

impl CommandFeature for V4L2Command {
    fn execute(&mut self) -> Result<()> {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        match self.kind {
            CommandKind::Start => {
                if inner.stream.is_none() {
                    let stream =
                        Stream::with_buffers(&inner.device, Type::VideoCapture, inner.buffer_count)
                            .map_err(|err| Inner::stream_error(&err))?;
                    inner.stream = Some(stream);
                    tracing::debug!(buffers = inner.buffer_count, "V4L2 stream opened");
                }
            }
            CommandKind::Stop => {
                if inner.stream.take().is_some() {
                    tracing::debug!("V4L2 stream closed");
                }
            }
            // Frames free-run; the next dequeue is the triggered frame.
            CommandKind::SoftwareTrigger => {}
        }
        Ok(())
    }
}

/// Buffer queue handle.
pub struct V4L2Buffers {
    inner: Rc<RefCell<Inner>>,
}

impl BufferQueue for V4L2Buffers {
    fn queue(&mut self, buffer: FrameBuffer) -> std::result::Result<(), QueueRejected> {
        self.inner.borrow_mut().queued.push_back(buffer);
        Ok(())
    }

    fn wait(&mut self, timeout: WaitTimeout) -> Result<FrameBuffer> {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        let stream = inner.stream.as_mut().ok_or(CameraError::NoFrame)?;
        let mut buffer = inner.queued.pop_front().ok_or(CameraError::NoFrame)?;

        match timeout {
            WaitTimeout::Infinite => stream.clear_timeout(),
            WaitTimeout::After(duration) => stream.set_timeout(duration),
        }

        match stream.next() {
            Ok((data, meta)) => {
                if let Err(err) = copy_frame(&mut buffer, data, meta.bytesused) {
                    tracing::warn!(error = %err, sequence = meta.sequence, "dropping frame");
                    inner.queued.push_front(buffer);
                    return Err(err);
                }
                tracing::trace!(
                    sequence = meta.sequence,
                    bytes = meta.bytesused,
                    "frame dequeued"
                );
                Ok(buffer)
            }
            Err(err) => {
                inner.queued.push_front(buffer);
                if err.kind() == ErrorKind::TimedOut {
                    Err(CameraError::Timeout)
                } else {
                    Err(Inner::stream_error(&err))
                }
            }
        }
    }

    fn flush(&mut self) -> Result<Vec<FrameBuffer>> {
        Ok(self.inner.borrow_mut().queued.drain(..).collect())
    }
}

impl Device for V4L2Device {
    type Integer = V4L2Integer;
    type Enum = V4L2Enum;
    type Command = V4L2Command;
    type Buffers = V4L2Buffers;

    fn integer(&self, name: &str) -> Result<V4L2Integer> {
        match name {
            IMAGE_SIZE_BYTES => Ok(V4L2Integer {
                inner: Rc::clone(&self.inner),
            }),
            _ => Err(CameraError::FeatureNotFound(name.to_owned())),
        }
    }

    fn enumerated(&self, name: &str) -> Result<V4L2Enum> {
        let (kind, name) = match name {
            TRIGGER_MODE => (EnumKind::Trigger, TRIGGER_MODE),
            CYCLE_MODE => (EnumKind::Cycle, CYCLE_MODE),
            PIXEL_ENCODING => (EnumKind::Encoding, PIXEL_ENCODING),
            _ => return Err(CameraError::FeatureNotFound(name.to_owned())),
        };
        Ok(V4L2Enum {
            inner: Rc::clone(&self.inner),
            kind,
            name,
        })
    }

    fn command(&self, name: &str) -> Result<V4L2Command> {
        let kind = match name {
            ACQUISITION_START => CommandKind::Start,
            ACQUISITION_STOP => CommandKind::Stop,
            SOFTWARE_TRIGGER => CommandKind::SoftwareTrigger,
            _ => return Err(CameraError::FeatureNotFound(name.to_owned())),
        };
        Ok(V4L2Command {
            inner: Rc::clone(&self.inner),
            kind,
        })
    }

    fn buffer_queue(&self) -> Result<V4L2Buffers> {
        Ok(V4L2Buffers {
            inner: Rc::clone(&self.inner),
        })
    }
}
