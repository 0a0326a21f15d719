//! Core traits and types for the camera capability interface.
//!
//! A [`Device`] hands out named capability handles. Each handle is an owned
//! value; dropping it releases the capability, so a handle is released
//! exactly once no matter how the owner exits.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;

/// Integer feature holding the byte size of one frame.
pub const IMAGE_SIZE_BYTES: &str = "ImageSizeBytes";
/// Enumerated feature selecting the trigger source.
pub const TRIGGER_MODE: &str = "TriggerMode";
/// Enumerated feature selecting the acquisition cycle.
pub const CYCLE_MODE: &str = "CycleMode";
/// Enumerated feature selecting the pixel layout of returned buffers.
pub const PIXEL_ENCODING: &str = "PixelEncoding";
/// Command starting acquisition.
pub const ACQUISITION_START: &str = "AcquisitionStart";
/// Command stopping acquisition.
pub const ACQUISITION_STOP: &str = "AcquisitionStop";
/// Command capturing a frame immediately when software triggered.
pub const SOFTWARE_TRIGGER: &str = "SoftwareTrigger";

/// Trigger mode label: the sensor clocks itself.
pub const TRIGGER_INTERNAL: &str = "Internal";
/// Trigger mode label: frames are pulled by [`SOFTWARE_TRIGGER`].
pub const TRIGGER_SOFTWARE: &str = "Software";
/// Cycle mode label: acquisition runs until stopped.
pub const CYCLE_CONTINUOUS: &str = "Continuous";
/// Pixel encoding label: two 12-bit pixels packed into three bytes.
pub const ENCODING_MONO12_PACKED: &str = "Mono12Packed";

/// Error type for camera operations.
#[derive(Debug, Error)]
pub enum CameraError {
    /// The device does not expose the named feature.
    #[error("Feature {0} not found")]
    FeatureNotFound(String),
    /// The device rejected a value written to a feature.
    #[error("Feature {feature} rejected value {value}")]
    InvalidValue {
        /// Feature name.
        feature: String,
        /// Rejected value.
        value: String,
    },
    /// Failed to open device.
    #[error("Failed to open device: {0}")]
    DeviceOpenFailed(String),
    /// A device command or query failed.
    #[error("Device error: {0}")]
    Device(String),
    /// Error during streaming operation.
    #[error("Stream error: {0}")]
    StreamError(String),
    /// The buffer queue had nothing to deliver.
    #[error("No frame available")]
    NoFrame,
    /// Operation timed out.
    #[error("Operation timed out")]
    Timeout,
    /// The controller is already poised for snapshots.
    #[error("Controller is already poised")]
    AlreadyPoised,
    /// The controller is not poised for snapshots.
    #[error("Controller is not poised")]
    NotPoised,
    /// Configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CameraError {
    /// Whether this error means a wait ended without a frame.
    #[must_use]
    pub const fn is_missed_frame(&self) -> bool {
        matches!(self, Self::NoFrame | Self::Timeout)
    }
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;

/// How long a blocking buffer wait may last.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WaitTimeout {
    /// Block until the device delivers a frame.
    #[default]
    Infinite,
    /// Give up after the given duration.
    After(Duration),
}

impl From<Option<Duration>> for WaitTimeout {
    fn from(timeout: Option<Duration>) -> Self {
        timeout.map_or(Self::Infinite, Self::After)
    }
}

/// Process-unique identity of a [`FrameBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(u64);

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Heap buffer circulating between a controller and a device queue.
///
/// Freed when dropped.
#[derive(Debug)]
pub struct FrameBuffer {
    id: BufferId,
    data: Box<[u8]>,
}

impl FrameBuffer {
    /// Allocate a zero-filled buffer of `len` bytes.
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self {
            id: BufferId(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed)),
            data: vec![0u8; len].into_boxed_slice(),
        }
    }

    /// Identity of this buffer.
    #[must_use]
    pub const fn id(&self) -> BufferId {
        self.id
    }
}

impl Deref for FrameBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for FrameBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// A buffer the device refused to queue, handed back to the caller.
#[derive(Debug)]
pub struct QueueRejected {
    /// The rejected buffer.
    pub buffer: FrameBuffer,
    /// Why the device refused it.
    pub error: CameraError,
}

impl From<QueueRejected> for CameraError {
    fn from(rejected: QueueRejected) -> Self {
        rejected.error
    }
}

/// Read access to an integer feature.
pub trait IntegerFeature {
    /// Current value.
    fn get(&self) -> Result<i64>;
}

/// Access to an enumerated feature with string labels.
pub trait EnumFeature {
    /// Index of the current value.
    fn index(&self) -> Result<usize>;

    /// Select the value at `index`.
    fn set_index(&mut self, index: usize) -> Result<()>;

    /// Label of the value at `index`.
    fn label_at(&self, index: usize) -> Result<String>;

    /// Number of values.
    fn count(&self) -> Result<usize>;

    /// Select the value with the given label.
    fn set(&mut self, label: &str) -> Result<()>;

    /// Label of the current value.
    fn current(&self) -> Result<String> {
        self.label_at(self.index()?)
    }

    /// All labels in index order.
    fn labels(&self) -> Result<Vec<String>> {
        (0..self.count()?).map(|index| self.label_at(index)).collect()
    }
}

/// A stateless device command.
pub trait CommandFeature {
    /// Fire the command.
    fn execute(&mut self) -> Result<()>;
}

/// Queue of frame buffers owned by the device while queued.
pub trait BufferQueue {
    /// Hand a buffer to the device to be filled.
    ///
    /// A refused buffer is returned inside the error.
    fn queue(&mut self, buffer: FrameBuffer) -> std::result::Result<(), QueueRejected>;

    /// Block until a queued buffer has been filled and return it.
    ///
    /// On failure the buffer stays queued.
    fn wait(&mut self, timeout: WaitTimeout) -> Result<FrameBuffer>;

    /// Drop every pending buffer, returning them to the caller.
    fn flush(&mut self) -> Result<Vec<FrameBuffer>>;
}

/// Provider of named device capabilities.
pub trait Device {
    /// Integer handle type.
    type Integer: IntegerFeature;
    /// Enumerated handle type.
    type Enum: EnumFeature;
    /// Command handle type.
    type Command: CommandFeature;
    /// Buffer queue handle type.
    type Buffers: BufferQueue;

    /// Acquire an integer feature.
    fn integer(&self, name: &str) -> Result<Self::Integer>;

    /// Acquire an enumerated feature.
    fn enumerated(&self, name: &str) -> Result<Self::Enum>;

    /// Acquire a command.
    fn command(&self, name: &str) -> Result<Self::Command>;

    /// Acquire the buffer queue.
    fn buffer_queue(&self) -> Result<Self::Buffers>;
}
