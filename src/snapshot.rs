//! Single-frame acquisition on demand.
//!
//! [`SnapshotController`] reconfigures a continuously clocked camera so that
//! one frame can be pulled at a time, and restores the trigger setup it
//! changed when the caller leaves poised mode:
//!
//! ```text
//! new() -> poise() -> take_snapshot()* -> leave_poise() -> drop
//! ```
//!
//! Exactly one [`FrameBuffer`] circulates while poised. It is allocated by
//! [`SnapshotController::poise`], lent to the caller through [`Snapshot`],
//! re-queued when that guard goes away, and freed by
//! [`SnapshotController::leave_poise`].
//!
//! The controller is not internally synchronized. Callers serialize access,
//! typically with one capture thread per device.

use std::ops::Deref;

use crate::pixel::{unpack_mono12_packed, unpack_mono16};
use crate::traits::{
    BufferId, BufferQueue, CameraError, CommandFeature, Device, EnumFeature, FrameBuffer,
    IntegerFeature, Result, WaitTimeout, ACQUISITION_START, ACQUISITION_STOP, CYCLE_CONTINUOUS,
    CYCLE_MODE, ENCODING_MONO12_PACKED, IMAGE_SIZE_BYTES, PIXEL_ENCODING, SOFTWARE_TRIGGER,
    TRIGGER_INTERNAL, TRIGGER_MODE, TRIGGER_SOFTWARE,
};

/// How frames are triggered during a poised session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    /// The controller fires the software trigger for each snapshot.
    Software,
    /// Frames arrive on external trigger pulses; snapshots only wait.
    External,
}

/// Controller for on-demand single-frame capture.
pub struct SnapshotController<D: Device> {
    image_size_bytes: D::Integer,
    trigger_mode: D::Enum,
    cycle_mode: D::Enum,
    pixel_encoding: D::Enum,
    start_acquisition: D::Command,
    stop_acquisition: D::Command,
    software_trigger: D::Command,
    buffers: D::Buffers,

    frame_buffer: Option<BufferId>,
    parked: Option<FrameBuffer>,
    frame_size: usize,
    poised: bool,
    trigger_override_applied: bool,
    trigger_source: Option<TriggerSource>,
    encoding: Option<String>,
    packed_12bit: bool,
}

impl<D: Device> SnapshotController<D> {
    /// Bind to every capability the controller needs.
    ///
    /// Fails with the device's error if any feature is missing. Handles
    /// acquired before the failure are released.
    pub fn new(device: &D) -> Result<Self> {
        let controller = Self {
            image_size_bytes: device.integer(IMAGE_SIZE_BYTES)?,
            trigger_mode: device.enumerated(TRIGGER_MODE)?,
            cycle_mode: device.enumerated(CYCLE_MODE)?,
            buffers: device.buffer_queue()?,
            start_acquisition: device.command(ACQUISITION_START)?,
            stop_acquisition: device.command(ACQUISITION_STOP)?,
            software_trigger: device.command(SOFTWARE_TRIGGER)?,
            pixel_encoding: device.enumerated(PIXEL_ENCODING)?,
            frame_buffer: None,
            parked: None,
            frame_size: 0,
            poised: false,
            trigger_override_applied: false,
            trigger_source: None,
            encoding: None,
            packed_12bit: false,
        };
        tracing::debug!("snapshot controller bound to device");
        Ok(controller)
    }

    /// Reconfigure the device for on-demand capture.
    ///
    /// Forces continuous cycling, switches internal triggering to software
    /// triggering (other trigger modes are left alone), queues the frame
    /// buffer and starts acquisition. On failure every step already taken is
    /// undone and the controller stays unpoised.
    pub fn poise(&mut self) -> Result<()> {
        if self.poised {
            return Err(CameraError::AlreadyPoised);
        }
        if let Err(err) = self.poise_steps() {
            tracing::warn!(error = %err, "poise failed, unwinding");
            if let Err(unwind_err) = self.teardown() {
                tracing::warn!(error = %unwind_err, "unwind after failed poise also failed");
            }
            return Err(err);
        }
        tracing::info!(
            trigger = ?self.trigger_source,
            override_applied = self.trigger_override_applied,
            encoding = self.encoding.as_deref().unwrap_or(""),
            frame_size = self.frame_size,
            "poised for snapshot"
        );
        Ok(())
    }

    fn poise_steps(&mut self) -> Result<()> {
        self.cycle_mode.set(CYCLE_CONTINUOUS)?;
        self.setup_trigger_mode()?;

        let size = self.image_size_bytes.get()?;
        let size = usize::try_from(size).map_err(|_| CameraError::InvalidValue {
            feature: IMAGE_SIZE_BYTES.to_owned(),
            value: size.to_string(),
        })?;
        if self.frame_buffer.is_none() {
            let buffer = FrameBuffer::zeroed(size);
            let id = buffer.id();
            self.buffers.queue(buffer)?;
            self.frame_buffer = Some(id);
            tracing::debug!(?id, size, "frame buffer queued");
        }
        self.frame_size = size;

        self.start_acquisition.execute()?;

        let encoding = self.pixel_encoding.current()?;
        self.packed_12bit = encoding == ENCODING_MONO12_PACKED;
        self.encoding = Some(encoding);
        self.poised = true;
        Ok(())
    }

    fn setup_trigger_mode(&mut self) -> Result<()> {
        let mode = self.trigger_mode.current()?;
        let source = match mode.as_str() {
            TRIGGER_INTERNAL => {
                self.trigger_mode.set(TRIGGER_SOFTWARE)?;
                self.trigger_override_applied = true;
                TriggerSource::Software
            }
            // A restore still pending from a failed leave_poise stays pending.
            TRIGGER_SOFTWARE => TriggerSource::Software,
            _ => {
                // The user reconfigured the trigger; never restore over it.
                self.trigger_override_applied = false;
                TriggerSource::External
            }
        };
        tracing::debug!(%mode, ?source, "trigger mode classified");
        self.trigger_source = Some(source);
        Ok(())
    }

    /// Capture one frame.
    ///
    /// Fires the software trigger when software triggered, then waits for
    /// the device to fill the buffer. The returned guard lends the buffer
    /// until it is dropped, at which point the same buffer is queued again.
    /// A failed wait leaves the buffer queued, so calling again is the way
    /// to retry.
    pub fn take_snapshot(&mut self, timeout: WaitTimeout) -> Result<Snapshot<'_, D::Buffers>> {
        if !self.poised {
            return Err(CameraError::NotPoised);
        }
        if let Some(buffer) = self.parked.take() {
            if let Err(rejected) = self.buffers.queue(buffer) {
                self.parked = Some(rejected.buffer);
                return Err(rejected.error);
            }
        }
        if self.trigger_source == Some(TriggerSource::Software) {
            self.software_trigger.execute()?;
        }
        let frame = self.buffers.wait(timeout)?;
        tracing::trace!(id = ?frame.id(), len = frame.len(), "frame delivered");
        Ok(Snapshot {
            frame: Some(frame),
            buffers: &mut self.buffers,
            parked: &mut self.parked,
            packed_12bit: self.packed_12bit,
        })
    }

    /// Stop acquisition, release the frame buffer and restore the trigger
    /// mode if [`Self::poise`] overrode it.
    ///
    /// Safe to call when not poised. Every step runs even if an earlier one
    /// fails; the first error is returned.
    pub fn leave_poise(&mut self) -> Result<()> {
        let result = self.teardown();
        match &result {
            Ok(()) => tracing::info!("left poised mode"),
            Err(err) => tracing::warn!(error = %err, "left poised mode with errors"),
        }
        result
    }

    fn teardown(&mut self) -> Result<()> {
        let stopped = self.stop_acquisition.execute();
        let flushed = self.buffers.flush().map(drop);
        self.poised = false;
        self.parked = None;
        self.frame_buffer = None;
        self.trigger_source = None;
        self.encoding = None;
        self.packed_12bit = false;
        let restored = self.reset_trigger_mode();
        stopped.and(flushed).and(restored)
    }

    fn reset_trigger_mode(&mut self) -> Result<()> {
        if self.trigger_override_applied {
            self.trigger_mode.set(TRIGGER_INTERNAL)?;
            self.trigger_override_applied = false;
            tracing::debug!("trigger mode restored to internal");
        }
        Ok(())
    }

    /// Check that acquisition can be started and stopped at all.
    ///
    /// Leaves the device in continuous, software triggered mode. The buffer
    /// queue is not touched.
    pub fn prepare_camera(&mut self) -> Result<()> {
        if self.poised {
            return Err(CameraError::AlreadyPoised);
        }
        self.cycle_mode.set(CYCLE_CONTINUOUS)?;
        self.trigger_mode.set(TRIGGER_SOFTWARE)?;
        self.start_acquisition.execute()?;
        self.stop_acquisition.execute()?;
        tracing::debug!("camera prepared");
        Ok(())
    }

    /// Whether the device is configured for on-demand capture.
    pub const fn is_poised(&self) -> bool {
        self.poised
    }

    /// Whether poise switched the trigger mode from internal to software.
    pub const fn trigger_override_applied(&self) -> bool {
        self.trigger_override_applied
    }

    /// Trigger classification of the current poised session.
    pub const fn trigger_source(&self) -> Option<TriggerSource> {
        self.trigger_source
    }

    /// Whether snapshots fire the software trigger.
    pub fn is_software_triggered(&self) -> bool {
        self.trigger_source == Some(TriggerSource::Software)
    }

    /// Whether snapshots wait for an external trigger pulse.
    pub fn is_externally_triggered(&self) -> bool {
        self.trigger_source == Some(TriggerSource::External)
    }

    /// Whether the encoding read at poise time was `Mono12Packed`. False
    /// once poised mode is left.
    pub const fn uses_packed_12bit_encoding(&self) -> bool {
        self.packed_12bit
    }

    /// Pixel encoding label read at poise time, while poised.
    pub fn pixel_encoding(&self) -> Option<&str> {
        self.encoding.as_deref()
    }

    /// Frame size in bytes read at the last poise.
    pub const fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Identity of the circulating frame buffer, if one is allocated.
    pub const fn frame_buffer_id(&self) -> Option<BufferId> {
        self.frame_buffer
    }
}

impl<D: Device> Drop for SnapshotController<D> {
    fn drop(&mut self) {
        if self.poised {
            tracing::warn!("snapshot controller dropped while poised; leave_poise was not called");
        }
    }
}

/// A captured frame lent by [`SnapshotController::take_snapshot`].
///
/// Dereferences to the raw frame bytes. Dropping the guard queues the buffer
/// for the next capture; use [`Snapshot::requeue`] to observe queue errors.
pub struct Snapshot<'a, Q: BufferQueue> {
    frame: Option<FrameBuffer>,
    buffers: &'a mut Q,
    parked: &'a mut Option<FrameBuffer>,
    packed_12bit: bool,
}

impl<Q: BufferQueue> Snapshot<'_, Q> {
    /// Raw frame bytes.
    pub fn data(&self) -> &[u8] {
        self.frame.as_deref().unwrap_or_default()
    }

    /// Identity of the lent buffer.
    pub fn buffer_id(&self) -> Option<BufferId> {
        self.frame.as_ref().map(FrameBuffer::id)
    }

    /// Whether the data is `Mono12Packed`.
    pub const fn is_packed_12bit(&self) -> bool {
        self.packed_12bit
    }

    /// Decode the frame into 16-bit samples.
    ///
    /// Packed 12-bit data is unpacked; anything else is read as
    /// little-endian 16-bit words.
    pub fn pixels(&self) -> Vec<u16> {
        if self.packed_12bit {
            unpack_mono12_packed(self.data())
        } else {
            unpack_mono16(self.data())
        }
    }

    /// Queue the buffer again now and report the outcome.
    ///
    /// On failure the buffer is kept by the controller and queued at the
    /// start of the next snapshot.
    pub fn requeue(mut self) -> Result<()> {
        self.give_back()
    }

    fn give_back(&mut self) -> Result<()> {
        let Some(frame) = self.frame.take() else {
            return Ok(());
        };
        self.buffers.queue(frame).map_err(|rejected| {
            tracing::warn!(
                id = ?rejected.buffer.id(),
                error = %rejected.error,
                "re-queue failed, parking frame buffer"
            );
            *self.parked = Some(rejected.buffer);
            rejected.error
        })
    }
}

impl<Q: BufferQueue> Deref for Snapshot<'_, Q> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data()
    }
}

impl<Q: BufferQueue> Drop for Snapshot<'_, Q> {
    fn drop(&mut self) {
        // Errors are logged and the buffer parked by give_back.
        let _ = self.give_back();
    }
}
