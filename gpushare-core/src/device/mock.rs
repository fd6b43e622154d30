//! Mock device implementation for testing

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    DeviceError, DeviceInterface, DeviceType, FaultEvent, FaultEventSet, PhysicalDevice,
    RegistrationError, WaitError,
};

/// Scripted result of one `wait` call
#[derive(Debug, Clone)]
pub enum MockWait {
    /// Deliver an event
    Event(FaultEvent),
    /// Fail the wait with a non-timeout error
    Error(String),
    /// Fail the wait but still hand back event data
    ErrorWithEvent(FaultEvent, String),
}

type WaitHook = Box<dyn Fn(u32) + Send + Sync>;

#[derive(Default)]
struct MockState {
    events: Mutex<VecDeque<MockWait>>,
    unsupported: Mutex<HashSet<String>>,
    failing: Mutex<HashSet<String>>,
    registered: Mutex<Vec<String>>,
    wait_hook: Mutex<Option<WaitHook>>,
    waits: AtomicU32,
    sets_created: AtomicU32,
    sets_released: AtomicU32,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Mock device for testing
pub struct MockDevice {
    devices: Vec<PhysicalDevice>,
    state: Arc<MockState>,
    /// Configurable enumeration failure
    pub fail_enumeration: AtomicBool,
    /// Configurable event set creation failure
    pub fail_event_set: AtomicBool,
}

impl MockDevice {
    /// Create a new mock device with default 2 GPUs
    pub fn new() -> Self {
        Self::with_device_count(2)
    }

    /// Create a mock device with specified number of GPUs
    pub fn with_device_count(count: u32) -> Self {
        Self::with_uuids((0..count).map(|i| format!("GPU-MOCK-{:04}", i)))
    }

    /// Create a mock device with explicit UUIDs, indexed in order
    pub fn with_uuids<I, S>(uuids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let devices = uuids
            .into_iter()
            .enumerate()
            .map(|(i, uuid)| PhysicalDevice {
                index: i as u32,
                real_id: uuid.into(),
                name: format!("Mock GPU {}", i),
            })
            .collect();

        Self {
            devices,
            state: Arc::new(MockState::default()),
            fail_enumeration: AtomicBool::new(false),
            fail_event_set: AtomicBool::new(false),
        }
    }

    /// Set whether enumeration should fail
    pub fn set_fail_enumeration(&self, fail: bool) {
        self.fail_enumeration.store(fail, Ordering::SeqCst);
    }

    /// Set whether creating an event set should fail
    pub fn set_fail_event_set(&self, fail: bool) {
        self.fail_event_set.store(fail, Ordering::SeqCst);
    }

    /// Report "not supported" when this UUID is registered for events
    pub fn mark_unsupported(&self, real_id: &str) {
        lock(&self.state.unsupported).insert(real_id.to_string());
    }

    /// Fail registration of this UUID with a hard error
    pub fn mark_registration_failure(&self, real_id: &str) {
        lock(&self.state.failing).insert(real_id.to_string());
    }

    /// Queue an event for a future `wait`
    pub fn push_event(&self, event: FaultEvent) {
        lock(&self.state.events).push_back(MockWait::Event(event));
    }

    /// Queue a non-timeout wait error
    pub fn push_wait_error(&self, message: &str) {
        lock(&self.state.events).push_back(MockWait::Error(message.to_string()));
    }

    /// Queue a wait error that still carries an event
    pub fn push_wait_error_with_event(&self, event: FaultEvent, message: &str) {
        lock(&self.state.events).push_back(MockWait::ErrorWithEvent(event, message.to_string()));
    }

    /// Number of queued waits not yet consumed
    pub fn pending_events(&self) -> usize {
        lock(&self.state.events).len()
    }

    /// Run a callback after every `wait`, with the 1-based wait count
    pub fn on_wait<F>(&self, hook: F)
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        *lock(&self.state.wait_hook) = Some(Box::new(hook));
    }

    /// UUIDs successfully registered for events, in registration order
    pub fn registered(&self) -> Vec<String> {
        lock(&self.state.registered).clone()
    }

    /// Number of `wait` calls so far
    pub fn wait_count(&self) -> u32 {
        self.state.waits.load(Ordering::SeqCst)
    }

    /// Number of event sets created
    pub fn sets_created(&self) -> u32 {
        self.state.sets_created.load(Ordering::SeqCst)
    }

    /// Number of event sets released
    pub fn sets_released(&self) -> u32 {
        self.state.sets_released.load(Ordering::SeqCst)
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceInterface for MockDevice {
    async fn device_count(&self) -> Result<u32, DeviceError> {
        if self.fail_enumeration.load(Ordering::SeqCst) {
            return Err(DeviceError::QueryError("Mock enumeration failure".to_string()));
        }
        Ok(self.devices.len() as u32)
    }

    async fn device_by_index(&self, index: u32) -> Result<PhysicalDevice, DeviceError> {
        self.devices
            .get(index as usize)
            .cloned()
            .ok_or_else(|| DeviceError::DeviceNotFound(format!("Device {} not found", index)))
    }

    fn new_event_set(&self) -> Result<Box<dyn FaultEventSet>, DeviceError> {
        if self.fail_event_set.load(Ordering::SeqCst) {
            return Err(DeviceError::EventError("Mock event set failure".to_string()));
        }
        self.state.sets_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockEventSet {
            state: self.state.clone(),
        }))
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Mock
    }
}

struct MockEventSet {
    state: Arc<MockState>,
}

impl FaultEventSet for MockEventSet {
    fn register_critical_faults(&mut self, real_id: &str) -> Result<(), RegistrationError> {
        if lock(&self.state.unsupported).contains(real_id) {
            return Err(RegistrationError::NotSupported);
        }
        if lock(&self.state.failing).contains(real_id) {
            let message = format!("Mock registration failure for {}", real_id);
            return Err(DeviceError::EventError(message).into());
        }
        lock(&self.state.registered).push(real_id.to_string());
        Ok(())
    }

    fn wait(&mut self, timeout: Duration) -> Result<FaultEvent, WaitError> {
        let next = lock(&self.state.events).pop_front();

        let result = match next {
            Some(MockWait::Event(event)) => Ok(event),
            Some(MockWait::Error(message)) => Err(DeviceError::EventError(message).into()),
            Some(MockWait::ErrorWithEvent(event, message)) => Err(WaitError::with_event(
                event,
                DeviceError::EventError(message),
            )),
            None => {
                // Nothing queued: behave like a real wait that timed out
                std::thread::sleep(timeout);
                Err(DeviceError::Timeout(timeout).into())
            }
        };

        let count = self.state.waits.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(hook) = lock(&self.state.wait_hook).as_ref() {
            hook(count);
        }

        result
    }
}

impl Drop for MockEventSet {
    fn drop(&mut self) {
        self.state.sets_released.fetch_add(1, Ordering::SeqCst);
    }
}
