//! In-memory backends
//!
//! Scriptable stand-ins for the cloud and health capabilities. Compiled for
//! the crate's own tests and behind the `test` feature for the `unit` suite.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use url::Url;

use crate::cloud::{CloudConnector, CommandChannel, ComputeBackend, ParameterStore};
use crate::errors::CloudError;
use crate::health::probe::{HealthProbe, ProbeResult};
use crate::models::command::{CommandHandle, CommandReport, CommandStatus, RemoteScript, SubmitOptions};
use crate::models::instance::{InstanceDescription, InstanceState};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Pop the next scripted item, repeating the last one forever
fn next_scripted<T: Clone>(queue: &mut VecDeque<T>) -> Option<T> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

// ---------------------------------------------------------------------------
// Parameter store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct FakeParameterStore {
    values: HashMap<String, String>,
    failure: Option<CloudError>,
    calls: AtomicU32,
}

impl FakeParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.values.insert(name.to_string(), value.to_string());
        self
    }

    /// Every lookup fails with `error`
    pub fn failing(mut self, error: CloudError) -> Self {
        self.failure = Some(error);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ParameterStore for FakeParameterStore {
    async fn get_parameters(&self, names: &[String]) -> Result<HashMap<String, String>, CloudError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        Ok(names
            .iter()
            .filter_map(|n| self.values.get(n).map(|v| (n.clone(), v.clone())))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Compute
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ComputeState {
    state: InstanceState,
    address: String,
    boot_polls: u32,
    boot_remaining: u32,
    stopping_polls: u32,
    stopping_remaining: u32,
    describe_failures: VecDeque<CloudError>,
    start_failures: VecDeque<CloudError>,
}

/// Instance that walks Stopped -> Pending -> Running (and back down) as it is polled
#[derive(Debug)]
pub struct FakeCompute {
    inner: Mutex<ComputeState>,
    start_calls: AtomicU32,
    describe_calls: AtomicU32,
    stop_calls: AtomicU32,
}

impl FakeCompute {
    pub fn new(state: InstanceState) -> Self {
        Self {
            inner: Mutex::new(ComputeState {
                state,
                address: "10.0.0.5".to_string(),
                boot_polls: 1,
                boot_remaining: 1,
                stopping_polls: 0,
                stopping_remaining: 0,
                describe_failures: VecDeque::new(),
                start_failures: VecDeque::new(),
            }),
            start_calls: AtomicU32::new(0),
            describe_calls: AtomicU32::new(0),
            stop_calls: AtomicU32::new(0),
        }
    }

    /// Describes reporting Pending after a start, before Running
    pub fn boot_polls(self, polls: u32) -> Self {
        {
            let mut inner = locked(&self.inner);
            inner.boot_polls = polls;
            inner.boot_remaining = polls;
        }
        self
    }

    /// Describes reporting Stopping before Stopped
    pub fn stopping_polls(self, polls: u32) -> Self {
        {
            let mut inner = locked(&self.inner);
            inner.stopping_polls = polls;
            inner.stopping_remaining = polls;
        }
        self
    }

    pub fn with_address(self, address: &str) -> Self {
        locked(&self.inner).address = address.to_string();
        self
    }

    /// The next `count` describes fail with `error`
    pub fn fail_describes(self, count: u32, error: CloudError) -> Self {
        {
            let mut inner = locked(&self.inner);
            for _ in 0..count {
                inner.describe_failures.push_back(error.clone());
            }
        }
        self
    }

    /// The next `count` start requests fail with `error`
    pub fn fail_starts(self, count: u32, error: CloudError) -> Self {
        {
            let mut inner = locked(&self.inner);
            for _ in 0..count {
                inner.start_failures.push_back(error.clone());
            }
        }
        self
    }

    pub fn state(&self) -> InstanceState {
        locked(&self.inner).state
    }

    pub fn start_calls(&self) -> u32 {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn describe_calls(&self) -> u32 {
        self.describe_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> u32 {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ComputeBackend for FakeCompute {
    async fn start(&self, _instance_id: &str) -> Result<(), CloudError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        let mut inner = locked(&self.inner);
        if let Some(error) = inner.start_failures.pop_front() {
            return Err(error);
        }
        match inner.state {
            InstanceState::Stopped | InstanceState::Unknown => {
                inner.state = InstanceState::Pending;
                inner.boot_remaining = inner.boot_polls;
                Ok(())
            }
            InstanceState::Terminated => Err(CloudError::Rejected("IncorrectInstanceState: terminated".into())),
            InstanceState::Stopping => Err(CloudError::Rejected("IncorrectInstanceState: stopping".into())),
            InstanceState::Pending | InstanceState::Running => Ok(()),
        }
    }

    async fn describe(&self, instance_id: &str) -> Result<InstanceDescription, CloudError> {
        self.describe_calls.fetch_add(1, Ordering::SeqCst);
        let mut inner = locked(&self.inner);
        if let Some(error) = inner.describe_failures.pop_front() {
            return Err(error);
        }

        match inner.state {
            InstanceState::Pending if inner.boot_remaining == 0 => inner.state = InstanceState::Running,
            InstanceState::Pending => inner.boot_remaining = inner.boot_remaining.saturating_sub(1),
            InstanceState::Stopping if inner.stopping_remaining == 0 => inner.state = InstanceState::Stopped,
            InstanceState::Stopping => inner.stopping_remaining -= 1,
            _ => {}
        }

        let address = (inner.state == InstanceState::Running).then(|| inner.address.clone());
        Ok(InstanceDescription::new(instance_id, inner.state, address))
    }

    async fn stop(&self, _instance_id: &str) -> Result<(), CloudError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        let mut inner = locked(&self.inner);
        if matches!(inner.state, InstanceState::Running | InstanceState::Pending) {
            inner.state = InstanceState::Stopping;
            inner.stopping_remaining = inner.stopping_polls;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Command channel
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ChannelState {
    submit_failures: VecDeque<CloudError>,
    replies: VecDeque<Result<CommandReport, CloudError>>,
    scripts: Vec<RemoteScript>,
    options: Vec<SubmitOptions>,
    cancelled: Vec<String>,
}

/// Command channel answering polls from a scripted sequence.
///
/// The last scripted reply repeats; with nothing scripted every command succeeds.
#[derive(Debug, Default)]
pub struct FakeChannel {
    inner: Mutex<ChannelState>,
    submit_calls: AtomicU32,
    status_calls: AtomicU32,
}

impl FakeChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a report carrying `status`, with the exit code the status implies
    pub fn report(status: CommandStatus) -> CommandReport {
        CommandReport {
            status: Some(status),
            exit_code: match status {
                CommandStatus::Success => Some(0),
                CommandStatus::Failed => Some(1),
                _ => None,
            },
            ..CommandReport::default()
        }
    }

    pub fn reply(self, report: CommandReport) -> Self {
        locked(&self.inner).replies.push_back(Ok(report));
        self
    }

    pub fn reply_status(self, status: CommandStatus) -> Self {
        self.reply(Self::report(status))
    }

    /// Queue a failing poll
    pub fn poll_error(self, error: CloudError) -> Self {
        locked(&self.inner).replies.push_back(Err(error));
        self
    }

    /// Queue a failing submission
    pub fn submit_error(self, error: CloudError) -> Self {
        locked(&self.inner).submit_failures.push_back(error);
        self
    }

    pub fn submit_calls(&self) -> u32 {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> u32 {
        self.status_calls.load(Ordering::SeqCst)
    }

    /// Scripts that were accepted, in order
    pub fn scripts(&self) -> Vec<RemoteScript> {
        locked(&self.inner).scripts.clone()
    }

    pub fn submit_options(&self) -> Vec<SubmitOptions> {
        locked(&self.inner).options.clone()
    }

    /// Ids of commands a cancel was requested for
    pub fn cancelled(&self) -> Vec<String> {
        locked(&self.inner).cancelled.clone()
    }
}

#[async_trait]
impl CommandChannel for FakeChannel {
    async fn submit(
        &self,
        instance_id: &str,
        script: &RemoteScript,
        options: &SubmitOptions,
    ) -> Result<CommandHandle, CloudError> {
        let call = self.submit_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let mut inner = locked(&self.inner);
        if let Some(error) = inner.submit_failures.pop_front() {
            return Err(error);
        }
        inner.scripts.push(script.clone());
        inner.options.push(options.clone());

        Ok(CommandHandle {
            command_id: format!("cmd-{:04}", call),
            instance_id: instance_id.to_string(),
            submitted_at: Utc::now(),
        })
    }

    async fn get_status(&self, _handle: &CommandHandle) -> Result<CommandReport, CloudError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let mut inner = locked(&self.inner);
        next_scripted(&mut inner.replies).unwrap_or_else(|| Ok(Self::report(CommandStatus::Success)))
    }

    async fn cancel(&self, handle: &CommandHandle) -> Result<(), CloudError> {
        locked(&self.inner).cancelled.push(handle.command_id.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Cloud connector
// ---------------------------------------------------------------------------

/// Connector handing out one shared fake compute and channel for every region
#[derive(Debug, Clone)]
pub struct FakeCloud {
    pub compute: Arc<FakeCompute>,
    pub channel: Arc<FakeChannel>,
    regions: Arc<Mutex<Vec<String>>>,
}

impl FakeCloud {
    pub fn new(compute: FakeCompute, channel: FakeChannel) -> Self {
        Self {
            compute: Arc::new(compute),
            channel: Arc::new(channel),
            regions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Regions backends were requested for
    pub fn regions(&self) -> Vec<String> {
        locked(&self.regions).clone()
    }
}

impl CloudConnector for FakeCloud {
    fn compute(&self, region: &str) -> Arc<dyn ComputeBackend> {
        locked(&self.regions).push(region.to_string());
        self.compute.clone()
    }

    fn channel(&self, region: &str) -> Arc<dyn CommandChannel> {
        locked(&self.regions).push(region.to_string());
        self.channel.clone()
    }
}

// ---------------------------------------------------------------------------
// Health probe
// ---------------------------------------------------------------------------

/// Probe answering from a scripted sequence; the last answer repeats
#[derive(Debug, Default)]
pub struct FakeProbe {
    replies: Mutex<VecDeque<ProbeResult>>,
    urls: Mutex<Vec<Url>>,
    calls: AtomicU32,
}

impl FakeProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(self, status: u16) -> Self {
        self.respond(status, "")
    }

    pub fn respond(self, status: u16, body: &str) -> Self {
        locked(&self.replies).push_back(ProbeResult::Response {
            status,
            body: body.to_string(),
        });
        self
    }

    pub fn unreachable(self, reason: &str) -> Self {
        locked(&self.replies).push_back(ProbeResult::Unreachable(reason.to_string()));
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<Url> {
        locked(&self.urls).clone()
    }
}

#[async_trait]
impl HealthProbe for FakeProbe {
    async fn get(&self, url: &Url) -> ProbeResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        locked(&self.urls).push(url.clone());
        next_scripted(&mut locked(&self.replies)).unwrap_or(ProbeResult::Response {
            status: 200,
            body: String::new(),
        })
    }
}
