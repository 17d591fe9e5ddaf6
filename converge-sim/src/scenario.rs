//! Scenarios that drive the engine against the simulated cloud.

use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result};
use converge::{Converger, Event, Observer, TagSet, TracingObserver};
use serde::Serialize;
use tokio::time::Instant;
use tracing::info;

use crate::cloud::{InstanceSpec, SimCloud};
use crate::resource::Instances;

/// Counts engine events and forwards them to the tracing log.
#[derive(Debug, Default)]
pub struct EventCounter {
    retries: AtomicU32,
    probes: AtomicU32,
    pages: AtomicU32,
}

impl EventCounter {
    pub fn snapshot(&self) -> EventCounts {
        EventCounts {
            retries: self.retries.load(Ordering::Relaxed),
            probes: self.probes.load(Ordering::Relaxed),
            pages: self.pages.load(Ordering::Relaxed),
        }
    }
}

impl Observer for EventCounter {
    fn observe(&self, event: &Event) {
        let counter = match event {
            Event::RetryScheduled { .. } => Some(&self.retries),
            Event::Polled { .. } => Some(&self.probes),
            Event::PageFetched { .. } => Some(&self.pages),
            _ => None,
        };
        if let Some(counter) = counter {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        TracingObserver.observe(event);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EventCounts {
    pub retries: u32,
    pub probes: u32,
    pub pages: u32,
}

/// Outcome of one scenario run, printed as JSON.
#[derive(Debug, Default, Serialize)]
pub struct Report {
    pub scenario: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub statuses: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<usize>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags_removed: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags_created: Vec<String>,
    pub creates_applied: u64,
    /// Instances still present when the scenario ended.
    pub instances_left: usize,
    pub api_requests: u64,
    pub elapsed_ms: u128,
    pub events: EventCounts,
}

impl Report {
    async fn finish(mut self, cloud: &SimCloud, counter: &EventCounter, start: Instant) -> Self {
        self.creates_applied = cloud.creates_applied().await;
        self.instances_left = cloud.instance_count().await;
        self.api_requests = cloud.request_count().await;
        self.elapsed_ms = start.elapsed().as_millis();
        self.events = counter.snapshot();
        self
    }
}

/// Create an instance, optionally resize it, then delete it.
pub async fn lifecycle(
    converger: &Converger<Instances>,
    cloud: &SimCloud,
    counter: &EventCounter,
    spec: InstanceSpec,
    resize_to: Option<String>,
) -> Result<Report> {
    let start = Instant::now();
    let mut report = Report {
        scenario: "lifecycle",
        ..Report::default()
    };

    let (id, status) = converger
        .create(&spec)
        .await
        .with_context(|| format!("failed to create instance {}", spec.name))?;
    info!(id = %id, status = %status, "Instance ready");
    report.instance_id = Some(id.clone());
    report.statuses.push(status.to_string());

    if let Some(instance_type) = resize_to {
        let resized = InstanceSpec { instance_type, ..spec };
        let status = converger
            .update(&id, &resized)
            .await
            .with_context(|| format!("failed to resize instance {id}"))?;
        report.statuses.push(status.to_string());
    }

    converger
        .delete(&id)
        .await
        .with_context(|| format!("failed to delete instance {id}"))?;
    report.statuses.push("Deleted".to_string());

    Ok(report.finish(cloud, counter, start).await)
}

/// Seed `count` instances and list them back, optionally by name prefix.
pub async fn list(
    converger: &Converger<Instances>,
    cloud: &SimCloud,
    counter: &EventCounter,
    count: usize,
    prefix: Option<String>,
) -> Result<Report> {
    let start = Instant::now();
    cloud.seed_instances(count, "node").await;

    let items = match prefix {
        Some(prefix) => converger.list_where(move |i| i.name.starts_with(&prefix)).await,
        None => converger.list().await,
    }
    .context("failed to list instances")?;
    info!(items = items.len(), "Listed instances");

    let report = Report {
        scenario: "list",
        items: Some(items.len()),
        ..Report::default()
    };
    Ok(report.finish(cloud, counter, start).await)
}

/// Create an instance, converge its tags to `first` and then to `second`.
pub async fn tags(
    converger: &Converger<Instances>,
    cloud: &SimCloud,
    counter: &EventCounter,
    spec: InstanceSpec,
    first: TagSet,
    second: TagSet,
) -> Result<Report> {
    let start = Instant::now();
    let (id, _) = converger
        .create(&spec)
        .await
        .with_context(|| format!("failed to create instance {}", spec.name))?;

    let mut report = Report {
        scenario: "tags",
        instance_id: Some(id.clone()),
        ..Report::default()
    };
    for declared in [first, second] {
        let diff = converger
            .reconcile_tags(&id, &declared)
            .await
            .with_context(|| format!("failed to tag instance {id} with {declared}"))?;
        report.tags_removed.extend(diff.removed_keys());
        report.tags_created.extend(diff.created_keys());
    }

    Ok(report.finish(cloud, counter, start).await)
}
