//! Shared helpers for converge integration tests.
//!
//! `FakeCloud` is a scripted, in-memory resource family: every describe call
//! consumes one step of the instance's status script, so tests decide
//! exactly what each probe observes.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use converge::{
    CloudResource, CodeClassifier, CodedError, ConvergeConfig, ErrorClassifier, Event,
    IdempotencyToken, Observer, Page, PageCursor, TagSet,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeError {
    Throttled,
    /// Connection dropped; the request may or may not have been applied.
    Timeout,
    NotFound,
    Invalid(String),
}

impl fmt::Display for FakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FakeError::Throttled => {
                f.write_str("Throttling: request was denied due to flow control")
            }
            FakeError::Timeout => f.write_str("connection reset"),
            FakeError::NotFound => f.write_str("InvalidInstanceId.NotFound"),
            FakeError::Invalid(msg) => write!(f, "InvalidParameter: {msg}"),
        }
    }
}

impl std::error::Error for FakeError {}

impl CodedError for FakeError {
    fn code(&self) -> Option<&str> {
        match self {
            FakeError::Throttled => Some("Throttling"),
            FakeError::NotFound => Some("InvalidInstanceId.NotFound"),
            FakeError::Invalid(_) => Some("InvalidParameter"),
            FakeError::Timeout => None,
        }
    }

    fn is_transport(&self) -> bool {
        matches!(self, FakeError::Timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Creating,
    Available,
    Modifying,
    Deleting,
    Failed,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One describe answer; `None` means "not found".
pub type Step = Option<Status>;

#[derive(Debug, Default)]
struct Instance {
    script: VecDeque<Step>,
    tags: TagSet,
}

#[derive(Debug, Default)]
struct State {
    next_id: u32,
    instances: BTreeMap<String, Instance>,
    tokens: HashMap<String, String>,
    create_script: Vec<Step>,
    create_faults: VecDeque<FakeError>,
    /// Creates that succeed remotely but report `Timeout` to the caller.
    ambiguous_creates: u32,
    describe_faults: VecDeque<FakeError>,
    listing: Vec<u32>,
    create_tokens: Vec<IdempotencyToken>,
    describes: u32,
    list_calls: Vec<PageCursor>,
    calls: Vec<String>,
}

pub struct FakeCloud {
    classifier: CodeClassifier,
    state: Mutex<State>,
}

impl FakeCloud {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            classifier: CodeClassifier::default(),
            state: Mutex::new(State {
                create_script: vec![
                    Some(Status::Creating),
                    Some(Status::Creating),
                    Some(Status::Available),
                ],
                ..State::default()
            }),
        })
    }

    pub fn script_creates(&self, script: Vec<Step>) {
        self.state.lock().unwrap().create_script = script;
    }

    pub fn fail_next_creates(&self, faults: Vec<FakeError>) {
        self.state.lock().unwrap().create_faults = faults.into();
    }

    pub fn ambiguous_creates(&self, count: u32) {
        self.state.lock().unwrap().ambiguous_creates = count;
    }

    pub fn fail_next_describes(&self, faults: Vec<FakeError>) {
        self.state.lock().unwrap().describe_faults = faults.into();
    }

    pub fn set_listing(&self, items: Vec<u32>) {
        self.state.lock().unwrap().listing = items;
    }

    /// Add an instance directly, bypassing the create API.
    pub fn seed(&self, id: &str, script: Vec<Step>, tags: TagSet) {
        self.state.lock().unwrap().instances.insert(
            id.to_string(),
            Instance {
                script: script.into(),
                tags,
            },
        );
    }

    pub fn instance_count(&self) -> usize {
        self.state.lock().unwrap().instances.len()
    }

    pub fn create_tokens(&self) -> Vec<IdempotencyToken> {
        self.state.lock().unwrap().create_tokens.clone()
    }

    pub fn describes(&self) -> u32 {
        self.state.lock().unwrap().describes
    }

    pub fn list_calls(&self) -> Vec<PageCursor> {
        self.state.lock().unwrap().list_calls.clone()
    }

    pub fn tags_of(&self, id: &str) -> TagSet {
        self.state
            .lock()
            .unwrap()
            .instances
            .get(id)
            .map(|i| i.tags.clone())
            .unwrap_or_default()
    }

    /// Mutating calls in the order they reached the fake.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }
}

#[async_trait]
impl CloudResource for FakeCloud {
    type Spec = String;
    type Status = Status;
    type Item = u32;
    type Error = FakeError;

    fn kind(&self) -> &str {
        "Instance"
    }

    fn classifier(&self) -> &dyn ErrorClassifier<FakeError> {
        &self.classifier
    }

    fn ready_statuses(&self) -> Vec<Status> {
        vec![Status::Available]
    }

    fn failed_statuses(&self) -> Vec<Status> {
        vec![Status::Failed]
    }

    async fn create(&self, name: &String, token: &IdempotencyToken) -> Result<String, FakeError> {
        let mut state = self.state.lock().unwrap();
        state.create_tokens.push(token.clone());
        if let Some(fault) = state.create_faults.pop_front() {
            return Err(fault);
        }
        if let Some(id) = state.tokens.get(token.as_str()) {
            return Ok(id.clone());
        }

        state.next_id += 1;
        let id = format!("i-{:04}", state.next_id);
        let script = state.create_script.clone().into();
        state.instances.insert(id.clone(), Instance { script, tags: TagSet::new() });
        state.tokens.insert(token.as_str().to_string(), id.clone());
        state.calls.push(format!("create {name}"));

        if state.ambiguous_creates > 0 {
            state.ambiguous_creates -= 1;
            return Err(FakeError::Timeout);
        }
        Ok(id)
    }

    async fn update(
        &self,
        id: &str,
        _spec: &String,
        _token: &IdempotencyToken,
    ) -> Result<(), FakeError> {
        let mut state = self.state.lock().unwrap();
        let instance = state.instances.get_mut(id).ok_or(FakeError::NotFound)?;
        instance.script = vec![Some(Status::Modifying), Some(Status::Available)].into();
        state.calls.push(format!("update {id}"));
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), FakeError> {
        let mut state = self.state.lock().unwrap();
        let instance = state.instances.get_mut(id).ok_or(FakeError::NotFound)?;
        instance.script = vec![Some(Status::Deleting), None].into();
        state.calls.push(format!("delete {id}"));
        Ok(())
    }

    async fn describe(&self, id: &str) -> Result<Status, FakeError> {
        let mut state = self.state.lock().unwrap();
        state.describes += 1;
        if let Some(fault) = state.describe_faults.pop_front() {
            return Err(fault);
        }
        let instance = state.instances.get_mut(id).ok_or(FakeError::NotFound)?;
        let step = if instance.script.len() > 1 {
            instance.script.pop_front().flatten()
        } else {
            instance.script.front().copied().flatten()
        };
        match step {
            Some(status) => Ok(status),
            None => {
                state.instances.remove(id);
                Err(FakeError::NotFound)
            }
        }
    }

    async fn list_page(&self, cursor: PageCursor, page_size: u32) -> Result<Page<u32>, FakeError> {
        let mut state = self.state.lock().unwrap();
        state.list_calls.push(cursor.clone());
        let page = cursor.page_number().unwrap_or(1) as usize;
        let items = state
            .listing
            .iter()
            .copied()
            .skip((page - 1) * page_size as usize)
            .take(page_size as usize)
            .collect();
        Ok(Page::new(items))
    }

    async fn list_tags(&self, id: &str) -> Result<TagSet, FakeError> {
        let state = self.state.lock().unwrap();
        state
            .instances
            .get(id)
            .map(|i| i.tags.clone())
            .ok_or(FakeError::NotFound)
    }

    async fn untag(&self, id: &str, keys: Vec<String>) -> Result<(), FakeError> {
        let mut state = self.state.lock().unwrap();
        let instance = state.instances.get_mut(id).ok_or(FakeError::NotFound)?;
        for key in &keys {
            instance.tags.remove(key);
        }
        state.calls.push(format!("untag {}", keys.join(",")));
        Ok(())
    }

    async fn tag(&self, id: &str, tags: TagSet) -> Result<(), FakeError> {
        let mut state = self.state.lock().unwrap();
        let instance = state.instances.get_mut(id).ok_or(FakeError::NotFound)?;
        let keys: Vec<&str> = tags.keys().collect();
        let line = format!("tag {}", keys.join(","));
        for (key, value) in tags.iter() {
            instance.tags.insert(key, value);
        }
        state.calls.push(line);
        Ok(())
    }
}

/// Config with one-second polls, no initial poll delay and one-second backoff.
pub fn fast_config() -> ConvergeConfig {
    ConvergeConfig::from_json_str(
        r#"{
            "poll_interval_ms": 1000,
            "poll_delay_ms": 0,
            "page_size": 100,
            "read_backoff": { "initial_ms": 1000, "increment_ms": 0 },
            "mutate_backoff": { "initial_ms": 1000, "increment_ms": 1000 },
            "tag_backoff": { "initial_ms": 500, "increment_ms": 0 }
        }"#,
    )
    .unwrap()
}

/// Observer that records every event.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Statuses reported by each probe, in order.
    pub fn probes(&self) -> Vec<Option<String>> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Polled { status, .. } => Some(status),
                _ => None,
            })
            .collect()
    }
}

impl Observer for Recorder {
    fn observe(&self, event: &Event) {
        self.events.lock().unwrap().push(event.clone());
    }
}
