//! In-memory, eventually-consistent cloud control plane.
//!
//! Mutating calls return as soon as they are accepted; the resource then
//! moves through intermediate statuses, one stage every `settle_polls`
//! describe calls. Any call may be throttled, and create calls may be
//! applied while the caller sees a transport error.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use converge::TagSet;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::error::SimError;

/// Tags per resource accepted by `tag`.
pub const MAX_TAGS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceStatus {
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Deleting,
    Failed,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Pending => "Pending",
            InstanceStatus::Starting => "Starting",
            InstanceStatus::Running => "Running",
            InstanceStatus::Stopping => "Stopping",
            InstanceStatus::Stopped => "Stopped",
            InstanceStatus::Deleting => "Deleting",
            InstanceStatus::Failed => "Failed",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub name: String,
    pub instance_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceSummary {
    pub id: String,
    pub name: String,
    pub instance_type: String,
    pub status: InstanceStatus,
    pub created_at: String,
}

/// Fault injection and pacing knobs.
#[derive(Debug, Clone)]
pub struct SimOptions {
    pub seed: u64,
    /// Probability that any call is rejected with `Throttling`.
    pub throttle_rate: f64,
    /// Probability that an applied create reports a transport error.
    pub ambiguous_rate: f64,
    /// Describe calls per status stage.
    pub settle_polls: u32,
    /// New instances end in `Failed` instead of `Running`.
    pub fail_creates: bool,
    /// Artificial latency per call.
    pub latency: Duration,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            seed: 0,
            throttle_rate: 0.0,
            ambiguous_rate: 0.0,
            settle_polls: 2,
            fail_creates: false,
            latency: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Status(InstanceStatus),
    Gone,
}

#[derive(Debug)]
struct Instance {
    summary: InstanceSummary,
    stages: VecDeque<Stage>,
    polls: u32,
    tags: TagSet,
}

#[derive(Debug, Default)]
struct CloudInner {
    instances: BTreeMap<String, Instance>,
    /// Client token -> instance id
    tokens: HashMap<String, String>,
    /// Issued list tokens -> offset of the next item
    page_tokens: HashMap<String, usize>,
    requests: u64,
    creates_applied: u64,
}

pub struct SimCloud {
    options: SimOptions,
    inner: RwLock<CloudInner>,
    rng: Mutex<StdRng>,
}

impl fmt::Debug for SimCloud {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimCloud").field("options", &self.options).finish()
    }
}

impl SimCloud {
    pub fn new(options: SimOptions) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(options.seed)),
            options,
            inner: RwLock::new(CloudInner::default()),
        }
    }

    fn roll(&self, probability: f64) -> bool {
        if probability <= 0.0 {
            return false;
        }
        match self.rng.lock() {
            Ok(mut rng) => rng.gen_bool(probability.min(1.0)),
            Err(_) => false,
        }
    }

    /// Entry point of every API call: latency, accounting and throttling.
    async fn gate(&self, action: &str) -> Result<(), SimError> {
        if !self.options.latency.is_zero() {
            tokio::time::sleep(self.options.latency).await;
        }
        self.inner.write().await.requests += 1;
        if self.roll(self.options.throttle_rate) {
            debug!(action, "Throttling request");
            return Err(SimError::throttled());
        }
        Ok(())
    }

    /// Insert `count` running instances without going through the API.
    pub async fn seed_instances(&self, count: usize, name_prefix: &str) {
        let mut inner = self.inner.write().await;
        for n in 0..count {
            let id = new_instance_id();
            let mut tags = TagSet::new();
            tags.insert("acs:rm:rgId", "rg-default");
            tags.insert("index", n.to_string());
            inner.instances.insert(
                id.clone(),
                Instance {
                    summary: InstanceSummary {
                        id,
                        name: format!("{name_prefix}-{n:03}"),
                        instance_type: "ecs.g7.large".to_string(),
                        status: InstanceStatus::Running,
                        created_at: chrono::Utc::now().to_rfc3339(),
                    },
                    stages: VecDeque::new(),
                    polls: 0,
                    tags,
                },
            );
        }
    }

    pub async fn request_count(&self) -> u64 {
        self.inner.read().await.requests
    }

    pub async fn instance_count(&self) -> usize {
        self.inner.read().await.instances.len()
    }

    /// Creates actually applied, however many requests were sent.
    pub async fn creates_applied(&self) -> u64 {
        self.inner.read().await.creates_applied
    }

    pub async fn run_instance(
        &self,
        spec: &InstanceSpec,
        client_token: &str,
    ) -> Result<String, SimError> {
        self.gate("RunInstances").await?;
        if spec.instance_type.is_empty() {
            return Err(SimError::api(
                "InvalidInstanceType.ValueNotSupported",
                "The specified InstanceType is not supported.",
            ));
        }

        let mut inner = self.inner.write().await;
        if let Some(id) = inner.tokens.get(client_token) {
            debug!(token = client_token, id = %id, "Replayed create");
            return Ok(id.clone());
        }

        let id = new_instance_id();
        let settled = if self.options.fail_creates {
            InstanceStatus::Failed
        } else {
            InstanceStatus::Running
        };
        inner.instances.insert(
            id.clone(),
            Instance {
                summary: InstanceSummary {
                    id: id.clone(),
                    name: spec.name.clone(),
                    instance_type: spec.instance_type.clone(),
                    status: InstanceStatus::Pending,
                    created_at: chrono::Utc::now().to_rfc3339(),
                },
                stages: [Stage::Status(InstanceStatus::Starting), Stage::Status(settled)].into(),
                polls: 0,
                tags: TagSet::new(),
            },
        );
        inner.tokens.insert(client_token.to_string(), id.clone());
        inner.creates_applied += 1;
        drop(inner);

        if self.roll(self.options.ambiguous_rate) {
            debug!(id = %id, "Dropping create response");
            return Err(SimError::Transport("connection reset by peer".to_string()));
        }
        Ok(id)
    }

    pub async fn modify_instance(
        &self,
        id: &str,
        spec: &InstanceSpec,
        client_token: &str,
    ) -> Result<(), SimError> {
        self.gate("ModifyInstanceSpec").await?;
        let mut inner = self.inner.write().await;
        if inner.tokens.contains_key(client_token) {
            return Ok(());
        }
        let instance = inner
            .instances
            .get_mut(id)
            .ok_or_else(|| SimError::instance_not_found(id))?;
        if !matches!(instance.summary.status, InstanceStatus::Running | InstanceStatus::Stopped) {
            return Err(SimError::api(
                "IncorrectInstanceStatus",
                format!(
                    "The current status {} does not support this operation.",
                    instance.summary.status
                ),
            ));
        }
        instance.summary.status = InstanceStatus::Stopping;
        instance.summary.instance_type = spec.instance_type.clone();
        instance.stages = [
            Stage::Status(InstanceStatus::Stopped),
            Stage::Status(InstanceStatus::Starting),
            Stage::Status(InstanceStatus::Running),
        ]
        .into();
        instance.polls = 0;
        inner.tokens.insert(client_token.to_string(), id.to_string());
        Ok(())
    }

    pub async fn delete_instance(&self, id: &str) -> Result<(), SimError> {
        self.gate("DeleteInstance").await?;
        let mut inner = self.inner.write().await;
        let instance = inner
            .instances
            .get_mut(id)
            .ok_or_else(|| SimError::instance_not_found(id))?;
        if instance.summary.status != InstanceStatus::Deleting {
            instance.summary.status = InstanceStatus::Deleting;
            instance.stages = [Stage::Gone].into();
            instance.polls = 0;
        }
        Ok(())
    }

    /// Current status; each call advances the instance towards its next stage.
    pub async fn describe_instance(&self, id: &str) -> Result<InstanceStatus, SimError> {
        self.gate("DescribeInstanceAttribute").await?;
        let mut inner = self.inner.write().await;
        let settle_polls = self.options.settle_polls;
        let instance = inner
            .instances
            .get_mut(id)
            .ok_or_else(|| SimError::instance_not_found(id))?;

        instance.polls += 1;
        if instance.polls >= settle_polls && !instance.stages.is_empty() {
            instance.polls = 0;
            match instance.stages.pop_front() {
                Some(Stage::Status(next)) => instance.summary.status = next,
                Some(Stage::Gone) => {
                    inner.instances.remove(id);
                    return Err(SimError::instance_not_found(id));
                }
                None => {}
            }
        }
        Ok(instance.summary.status)
    }

    /// Page-number listing. Returns the page and the total instance count.
    pub async fn describe_instances(
        &self,
        page_number: u32,
        page_size: u32,
    ) -> Result<(Vec<InstanceSummary>, u64), SimError> {
        self.gate("DescribeInstances").await?;
        if page_number == 0 {
            return Err(SimError::api("InvalidPageNumber", "PageNumber starts at 1."));
        }
        let inner = self.inner.read().await;
        let offset = (page_number as usize - 1).saturating_mul(page_size as usize);
        let items = inner
            .instances
            .values()
            .skip(offset)
            .take(page_size as usize)
            .map(|i| i.summary.clone())
            .collect();
        Ok((items, inner.instances.len() as u64))
    }

    /// Token listing. Returns the page and the token for the next one.
    pub async fn list_instances(
        &self,
        next_token: Option<&str>,
        max_results: u32,
    ) -> Result<(Vec<InstanceSummary>, Option<String>), SimError> {
        self.gate("ListInstances").await?;
        let mut inner = self.inner.write().await;
        let offset = match next_token {
            None => 0,
            Some(token) => *inner.page_tokens.get(token).ok_or_else(|| {
                SimError::api("InvalidNextToken", "The specified NextToken is not valid.")
            })?,
        };

        let items: Vec<InstanceSummary> = inner
            .instances
            .values()
            .skip(offset)
            .take(max_results as usize)
            .map(|i| i.summary.clone())
            .collect();
        let end = offset + items.len();
        let next = if end < inner.instances.len() {
            let token = Uuid::new_v4().simple().to_string();
            inner.page_tokens.insert(token.clone(), end);
            Some(token)
        } else {
            None
        };
        Ok((items, next))
    }

    pub async fn list_tag_resources(&self, id: &str) -> Result<TagSet, SimError> {
        self.gate("ListTagResources").await?;
        let inner = self.inner.read().await;
        inner
            .instances
            .get(id)
            .map(|i| i.tags.clone())
            .ok_or_else(|| SimError::instance_not_found(id))
    }

    pub async fn untag_resources(&self, id: &str, keys: &[String]) -> Result<(), SimError> {
        self.gate("UnTagResources").await?;
        let mut inner = self.inner.write().await;
        let instance = inner
            .instances
            .get_mut(id)
            .ok_or_else(|| SimError::instance_not_found(id))?;
        for key in keys {
            instance.tags.remove(key);
        }
        Ok(())
    }

    pub async fn tag_resources(&self, id: &str, tags: &TagSet) -> Result<(), SimError> {
        self.gate("TagResources").await?;
        let mut inner = self.inner.write().await;
        let instance = inner
            .instances
            .get_mut(id)
            .ok_or_else(|| SimError::instance_not_found(id))?;

        let added = tags.keys().filter(|k| !instance.tags.contains_key(k)).count();
        if instance.tags.len() + added > MAX_TAGS {
            return Err(SimError::api(
                "InvalidTagCount",
                format!("A resource can have at most {MAX_TAGS} tags."),
            ));
        }
        for (key, value) in tags.iter() {
            instance.tags.insert(key, value);
        }
        Ok(())
    }
}

fn new_instance_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("i-{}", &id[..20])
}
