//! Cam-Snapshot: on-demand single-frame capture from streaming cameras
//!
//! This library temporarily reconfigures a continuously clocked camera so a
//! caller can pull exactly one frame at a time, then restores the trigger
//! setup it changed. Devices are reached through trait-based capability
//! handles, enabling both production use with real hardware and testing with
//! mock devices.

pub mod config;
pub mod device;
pub mod pixel;
pub mod snapshot;
pub mod traits;

#[cfg(test)]
pub mod mock;

pub use config::CaptureConfig;
pub use device::V4L2Device;
pub use snapshot::{Snapshot, SnapshotController, TriggerSource};
pub use traits::{
    BufferQueue, CameraError, CommandFeature, Device, EnumFeature, FrameBuffer, IntegerFeature,
    WaitTimeout,
};
