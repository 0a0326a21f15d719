//! Mock device implementation for testing without hardware.
//!
//! Every capability operation is appended to an event log so tests can
//! assert the exact sequence of device interactions. Waits never block:
//! when no frame is available they fail with [`CameraError::Timeout`].

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use crate::traits::{
    BufferId, BufferQueue, CameraError, CommandFeature, Device, EnumFeature, FrameBuffer,
    IntegerFeature, QueueRejected, Result, WaitTimeout, ACQUISITION_START, ACQUISITION_STOP,
    CYCLE_MODE, IMAGE_SIZE_BYTES, PIXEL_ENCODING, SOFTWARE_TRIGGER, TRIGGER_INTERNAL,
    TRIGGER_MODE, TRIGGER_SOFTWARE,
};

/// Name under which the buffer queue appears in the event log.
pub const BUFFER_CONTROL: &str = "BufferControl";
/// Failure key for [`BufferQueue::queue`].
pub const QUEUE_OP: &str = "BufferControl.Queue";
/// Failure key for [`BufferQueue::wait`].
pub const WAIT_OP: &str = "BufferControl.Wait";
/// Failure key for [`BufferQueue::flush`].
pub const FLUSH_OP: &str = "BufferControl.Flush";

/// A recorded device interaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A capability handle was acquired.
    Acquired(String),
    /// A capability handle was released.
    Released(String),
    /// An enumerated feature was written.
    EnumSet {
        /// Feature name.
        feature: String,
        /// Label written.
        label: String,
    },
    /// A command was executed.
    Command(String),
    /// A buffer was queued.
    Queued {
        /// Buffer identity.
        id: BufferId,
        /// Buffer length in bytes.
        len: usize,
    },
    /// A wait was started.
    Waited,
    /// A wait returned a filled buffer.
    Delivered(BufferId),
    /// The queue was flushed, dropping this many buffers.
    Flushed(usize),
}

#[derive(Debug)]
struct MockEnum {
    labels: Vec<String>,
    index: usize,
}

impl MockEnum {
    fn new(labels: &[&str], current: &str) -> Self {
        Self {
            labels: labels.iter().map(|&label| label.to_owned()).collect(),
            index: labels.iter().position(|&label| label == current).unwrap_or(0),
        }
    }

    fn current(&self) -> &str {
        self.labels.get(self.index).map_or("", String::as_str)
    }
}

#[derive(Debug, Default)]
struct MockState {
    integers: HashMap<String, i64>,
    enums: HashMap<String, MockEnum>,
    commands: HashSet<String>,
    has_buffer_queue: bool,
    failing: HashSet<String>,
    events: Vec<Event>,
    queue: VecDeque<FrameBuffer>,
    acquiring: bool,
    pending_triggers: usize,
    frames_delivered: u32,
    peak_queue_depth: usize,
    live_handles: usize,
}

impl MockState {
    fn check(&self, name: &str) -> Result<()> {
        if self.failing.contains(name) {
            Err(CameraError::Device(format!("{name} failed")))
        } else {
            Ok(())
        }
    }

    fn acquire(&mut self, name: &str) {
        self.live_handles += 1;
        self.events.push(Event::Acquired(name.to_owned()));
    }

    fn release(&mut self, name: &str) {
        self.live_handles = self.live_handles.saturating_sub(1);
        self.events.push(Event::Released(name.to_owned()));
    }

    fn trigger_label(&self) -> &str {
        self.enums.get(TRIGGER_MODE).map_or("", MockEnum::current)
    }

    fn frame_ready(&self) -> bool {
        self.acquiring && (self.trigger_label() == TRIGGER_INTERNAL || self.pending_triggers > 0)
    }
}

/// Mock device for testing without hardware.
#[derive(Debug, Clone)]
pub struct MockDevice {
    state: Rc<RefCell<MockState>>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// Create a mock camera with a 1024-byte frame, internal triggering,
    /// fixed cycle mode and `Mono16` encoding.
    #[must_use]
    pub fn new() -> Self {
        let mut state = MockState {
            has_buffer_queue: true,
            ..MockState::default()
        };
        state.integers.insert(IMAGE_SIZE_BYTES.to_owned(), 1024);
        state.enums.insert(
            TRIGGER_MODE.to_owned(),
            MockEnum::new(
                &[
                    "Internal",
                    "Software",
                    "External",
                    "External Start",
                    "External Exposure",
                ],
                "Internal",
            ),
        );
        state.enums.insert(
            CYCLE_MODE.to_owned(),
            MockEnum::new(&["Fixed", "Continuous"], "Fixed"),
        );
        state.enums.insert(
            PIXEL_ENCODING.to_owned(),
            MockEnum::new(&["Mono12", "Mono12Packed", "Mono16", "Mono32"], "Mono16"),
        );
        for command in [ACQUISITION_START, ACQUISITION_STOP, SOFTWARE_TRIGGER] {
            state.commands.insert(command.to_owned());
        }

        Self {
            state: Rc::new(RefCell::new(state)),
        }
    }

    /// Set an integer feature value.
    #[must_use]
    pub fn with_integer(self, name: &str, value: i64) -> Self {
        self.state.borrow_mut().integers.insert(name.to_owned(), value);
        self
    }

    /// Select the current value of an enumerated feature without logging it.
    #[must_use]
    pub fn with_enum_value(self, name: &str, label: &str) -> Self {
        self.set_enum_value(name, label);
        self
    }

    /// Remove a feature so acquiring it fails.
    #[must_use]
    pub fn without_feature(self, name: &str) -> Self {
        {
            let mut state = self.state.borrow_mut();
            state.integers.remove(name);
            state.enums.remove(name);
            state.commands.remove(name);
            if name == BUFFER_CONTROL {
                state.has_buffer_queue = false;
            }
        }
        self
    }

    /// Make every operation on `name` fail until [`Self::recover`] is called.
    pub fn fail(&self, name: &str) {
        self.state.borrow_mut().failing.insert(name.to_owned());
    }

    /// Undo [`Self::fail`].
    pub fn recover(&self, name: &str) {
        self.state.borrow_mut().failing.remove(name);
    }

    /// Change an enumerated feature behind the controller's back.
    pub fn set_enum_value(&self, name: &str, label: &str) {
        if let Some(feature) = self.state.borrow_mut().enums.get_mut(name) {
            if let Some(index) = feature.labels.iter().position(|known| known == label) {
                feature.index = index;
            }
        }
    }

    /// Current label of an enumerated feature.
    #[must_use]
    pub fn enum_value(&self, name: &str) -> Option<String> {
        self.state
            .borrow()
            .enums
            .get(name)
            .map(|feature| feature.current().to_owned())
    }

    /// Deliver an external trigger pulse.
    pub fn fire_external_trigger(&self) {
        let mut state = self.state.borrow_mut();
        if state.acquiring && state.trigger_label().starts_with("External") {
            state.pending_triggers += 1;
        }
    }

    /// Snapshot of the event log.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.state.borrow().events.clone()
    }

    /// Empty the event log.
    pub fn clear_events(&self) {
        self.state.borrow_mut().events.clear();
    }

    /// Number of executions of the named command.
    #[must_use]
    pub fn command_count(&self, name: &str) -> usize {
        self.state
            .borrow()
            .events
            .iter()
            .filter(|event| matches!(event, Event::Command(command) if command == name))
            .count()
    }

    /// Writes to the named enumerated feature, in order.
    #[must_use]
    pub fn enum_writes(&self, name: &str) -> Vec<String> {
        self.state
            .borrow()
            .events
            .iter()
            .filter_map(|event| match event {
                Event::EnumSet { feature, label } if feature == name => Some(label.clone()),
                _ => None,
            })
            .collect()
    }

    /// Identities of queued buffers, in queue order.
    #[must_use]
    pub fn queued_ids(&self) -> Vec<BufferId> {
        self.state
            .borrow()
            .events
            .iter()
            .filter_map(|event| match event {
                Event::Queued { id, .. } => Some(*id),
                _ => None,
            })
            .collect()
    }

    /// Buffers currently held by the device.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.state.borrow().queue.len()
    }

    /// Largest number of buffers the device ever held at once.
    #[must_use]
    pub fn peak_queue_depth(&self) -> usize {
        self.state.borrow().peak_queue_depth
    }

    /// Whether acquisition is running.
    #[must_use]
    pub fn acquiring(&self) -> bool {
        self.state.borrow().acquiring
    }

    /// Capability handles acquired and not yet released.
    #[must_use]
    pub fn live_handles(&self) -> usize {
        self.state.borrow().live_handles
    }

    fn handle(&self, name: &str) -> Handle {
        self.state.borrow_mut().acquire(name);
        Handle {
            name: name.to_owned(),
            state: Rc::clone(&self.state),
        }
    }
}

/// Capability handle shared by every mock feature kind.
#[derive(Debug)]
pub struct Handle {
    name: String,
    state: Rc<RefCell<MockState>>,
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.state.borrow_mut().release(&self.name);
    }
}

impl IntegerFeature for Handle {
    fn get(&self) -> Result<i64> {
        let state = self.state.borrow();
        state.check(&self.name)?;
        state
            .integers
            .get(&self.name)
            .copied()
            .ok_or_else(|| CameraError::FeatureNotFound(self.name.clone()))
    }
}

impl Handle {
    fn with_enum<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&MockEnum) -> Result<T>,
    {
        let state = self.state.borrow();
        state.check(&self.name)?;
        let feature = state
            .enums
            .get(&self.name)
            .ok_or_else(|| CameraError::FeatureNotFound(self.name.clone()))?;
        op(feature)
    }

    fn write_enum(&self, index: usize) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.check(&self.name)?;
        let feature = state
            .enums
            .get_mut(&self.name)
            .ok_or_else(|| CameraError::FeatureNotFound(self.name.clone()))?;
        let label = feature
            .labels
            .get(index)
            .cloned()
            .ok_or_else(|| CameraError::InvalidValue {
                feature: self.name.clone(),
                value: index.to_string(),
            })?;
        feature.index = index;
        state.events.push(Event::EnumSet {
            feature: self.name.clone(),
            label,
        });
        Ok(())
    }
}

impl EnumFeature for Handle {
    fn index(&self) -> Result<usize> {
        self.with_enum(|feature| Ok(feature.index))
    }

    fn set_index(&mut self, index: usize) -> Result<()> {
        self.write_enum(index)
    }

    fn label_at(&self, index: usize) -> Result<String> {
        self.with_enum(|feature| {
            feature
                .labels
                .get(index)
                .cloned()
                .ok_or_else(|| CameraError::InvalidValue {
                    feature: self.name.clone(),
                    value: index.to_string(),
                })
        })
    }

    fn count(&self) -> Result<usize> {
        self.with_enum(|feature| Ok(feature.labels.len()))
    }

    fn set(&mut self, label: &str) -> Result<()> {
        let index = self.with_enum(|feature| {
            feature
                .labels
                .iter()
                .position(|known| known == label)
                .ok_or_else(|| CameraError::InvalidValue {
                    feature: self.name.clone(),
                    value: label.to_owned(),
                })
        })?;
        self.write_enum(index)
    }
}

impl CommandFeature for Handle {
    fn execute(&mut self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.check(&self.name)?;
        state.events.push(Event::Command(self.name.clone()));
        match self.name.as_str() {
            ACQUISITION_START => state.acquiring = true,
            ACQUISITION_STOP => {
                state.acquiring = false;
                state.pending_triggers = 0;
            }
            SOFTWARE_TRIGGER => {
                if state.acquiring && state.trigger_label() == TRIGGER_SOFTWARE {
                    state.pending_triggers += 1;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

impl BufferQueue for Handle {
    fn queue(&mut self, buffer: FrameBuffer) -> std::result::Result<(), QueueRejected> {
        let mut state = self.state.borrow_mut();
        if let Err(error) = state.check(QUEUE_OP) {
            return Err(QueueRejected { buffer, error });
        }
        state.events.push(Event::Queued {
            id: buffer.id(),
            len: buffer.len(),
        });
        state.queue.push_back(buffer);
        state.peak_queue_depth = state.peak_queue_depth.max(state.queue.len());
        Ok(())
    }

    fn wait(&mut self, _timeout: WaitTimeout) -> Result<FrameBuffer> {
        let mut state = self.state.borrow_mut();
        state.events.push(Event::Waited);
        if state.failing.contains(WAIT_OP) {
            return Err(CameraError::Timeout);
        }
        if !state.frame_ready() {
            return Err(CameraError::Timeout);
        }
        let mut buffer = state.queue.pop_front().ok_or(CameraError::NoFrame)?;
        state.pending_triggers = state.pending_triggers.saturating_sub(1);
        let seed = state.frames_delivered;
        state.frames_delivered += 1;
        for (offset, byte) in buffer.iter_mut().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            {
                *byte = (seed as usize).wrapping_add(offset) as u8;
            }
        }
        state.events.push(Event::Delivered(buffer.id()));
        Ok(buffer)
    }

    fn flush(&mut self) -> Result<Vec<FrameBuffer>> {
        let mut state = self.state.borrow_mut();
        state.check(FLUSH_OP)?;
        let flushed: Vec<FrameBuffer> = state.queue.drain(..).collect();
        state.events.push(Event::Flushed(flushed.len()));
        Ok(flushed)
    }
}

impl Device for MockDevice {
    type Integer = Handle;
    type Enum = Handle;
    type Command = Handle;
    type Buffers = Handle;

    fn integer(&self, name: &str) -> Result<Handle> {
        if !self.state.borrow().integers.contains_key(name) {
            return Err(CameraError::FeatureNotFound(name.to_owned()));
        }
        Ok(self.handle(name))
    }

    fn enumerated(&self, name: &str) -> Result<Handle> {
        if !self.state.borrow().enums.contains_key(name) {
            return Err(CameraError::FeatureNotFound(name.to_owned()));
        }
        Ok(self.handle(name))
    }

    fn command(&self, name: &str) -> Result<Handle> {
        if !self.state.borrow().commands.contains(name) {
            return Err(CameraError::FeatureNotFound(name.to_owned()));
        }
        Ok(self.handle(name))
    }

    fn buffer_queue(&self) -> Result<Handle> {
        if !self.state.borrow().has_buffer_queue {
            return Err(CameraError::FeatureNotFound(BUFFER_CONTROL.to_owned()));
        }
        Ok(self.handle(BUFFER_CONTROL))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_device_defaults() {
        let device = MockDevice::new();
        assert_eq!(device.enum_value(TRIGGER_MODE).as_deref(), Some("Internal"));
        assert_eq!(device.enum_value(CYCLE_MODE).as_deref(), Some("Fixed"));
        let size = device.integer(IMAGE_SIZE_BYTES).expect("integer should exist");
        assert_eq!(size.get().expect("get should succeed"), 1024);
    }

    #[test]
    fn test_mock_handles_release_on_drop() {
        let device = MockDevice::new();
        let handle = device.command(ACQUISITION_START).expect("command should exist");
        assert_eq!(device.live_handles(), 1);
        drop(handle);
        assert_eq!(device.live_handles(), 0);
        assert_eq!(
            device.events().last(),
            Some(&Event::Released(ACQUISITION_START.to_owned()))
        );
    }

    #[test]
    fn test_mock_enum_rejects_unknown_label() {
        let device = MockDevice::new();
        let mut mode = device.enumerated(TRIGGER_MODE).expect("enum should exist");
        let err = mode.set("Bogus").expect_err("unknown label should fail");
        assert!(matches!(err, CameraError::InvalidValue { .. }));
        assert_eq!(mode.current().expect("current should succeed"), "Internal");
    }

    #[test]
    fn test_mock_missing_feature() {
        let device = MockDevice::new().without_feature(SOFTWARE_TRIGGER);
        assert!(matches!(
            device.command(SOFTWARE_TRIGGER),
            Err(CameraError::FeatureNotFound(name)) if name == SOFTWARE_TRIGGER
        ));
    }

    #[test]
    fn test_mock_wait_without_trigger_times_out() {
        let device = MockDevice::new().with_enum_value(TRIGGER_MODE, "Software");
        let mut start = device.command(ACQUISITION_START).expect("command should exist");
        let mut queue = device.buffer_queue().expect("queue should exist");
        queue.queue(FrameBuffer::zeroed(8)).expect("queue should succeed");
        start.execute().expect("start should succeed");

        assert!(matches!(
            queue.wait(WaitTimeout::Infinite),
            Err(CameraError::Timeout)
        ));
        assert_eq!(device.queue_depth(), 1);
    }

    #[test]
    fn test_mock_external_pulse_delivers_frame() {
        let device = MockDevice::new().with_enum_value(TRIGGER_MODE, "External");
        let mut start = device.command(ACQUISITION_START).expect("command should exist");
        let mut queue = device.buffer_queue().expect("queue should exist");
        let buffer = FrameBuffer::zeroed(8);
        let id = buffer.id();
        queue.queue(buffer).expect("queue should succeed");
        start.execute().expect("start should succeed");
        device.fire_external_trigger();

        let frame = queue.wait(WaitTimeout::Infinite).expect("frame should arrive");
        assert_eq!(frame.id(), id);
        assert_eq!(frame.first(), Some(&0));
        assert_eq!(frame.get(1), Some(&1));
    }
}
