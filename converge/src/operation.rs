//! Resource operations composed from the engine components.
//!
//! A resource family implements [`CloudResource`] with its raw API calls;
//! [`Converger`] wraps each of them in retries, idempotency tokens, polling,
//! pagination and tag reconciliation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::backoff::BackoffPolicy;
use crate::classify::ErrorClassifier;
use crate::config::ConvergeConfig;
use crate::error::{ConfigError, Error};
use crate::observe::{Observer, default_observer};
use crate::paginate::{Page, PageCursor, Paginator};
use crate::poll::{Converged, Observation, Poller, ResourceStatus, StateProbe};
use crate::retry::Retrier;
use crate::tags::{ReservedPrefixes, TagDiff, TagReconciler, TagSet};
use crate::token::{ClientTokenGenerator, IdempotencyToken, TokenGenerator};

/// Raw API calls of one resource family.
///
/// Implementations issue exactly one request per call and never retry; a
/// "not found" answer is reported as an error the classifier recognises.
#[async_trait]
pub trait CloudResource: Send + Sync {
    /// Declared configuration passed to create and update.
    type Spec: Send + Sync;
    type Status: ResourceStatus;
    /// Element returned by list calls.
    type Item: Send + 'static;
    type Error: fmt::Display + Send + Sync + 'static;

    /// Resource kind used to name operations, e.g. `Instance`.
    fn kind(&self) -> &str;

    fn classifier(&self) -> &dyn ErrorClassifier<Self::Error>;

    /// Statuses in which the resource is usable.
    fn ready_statuses(&self) -> Vec<Self::Status>;

    /// Terminal statuses from which the resource will not recover.
    fn failed_statuses(&self) -> Vec<Self::Status>;

    /// Statuses expected while the resource settles. Empty means any
    /// status other than ready or failed is waited through.
    fn pending_statuses(&self) -> Vec<Self::Status> {
        Vec::new()
    }

    fn first_cursor(&self) -> PageCursor {
        PageCursor::first_index()
    }

    /// Returns the id of the new resource.
    async fn create(
        &self,
        spec: &Self::Spec,
        token: &IdempotencyToken,
    ) -> Result<String, Self::Error>;

    async fn update(
        &self,
        id: &str,
        spec: &Self::Spec,
        token: &IdempotencyToken,
    ) -> Result<(), Self::Error>;

    async fn delete(&self, id: &str) -> Result<(), Self::Error>;

    async fn describe(&self, id: &str) -> Result<Self::Status, Self::Error>;

    async fn list_page(
        &self,
        cursor: PageCursor,
        page_size: u32,
    ) -> Result<Page<Self::Item>, Self::Error>;

    async fn list_tags(&self, id: &str) -> Result<TagSet, Self::Error>;

    async fn untag(&self, id: &str, keys: Vec<String>) -> Result<(), Self::Error>;

    async fn tag(&self, id: &str, tags: TagSet) -> Result<(), Self::Error>;
}

type ItemFilter<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

/// Probes a resource through `describe`, retrying transient errors and
/// turning "not found" into [`Observation::NotFound`].
struct DescribeProbe<'a, R> {
    resource: &'a R,
    retrier: Retrier,
}

#[async_trait]
impl<'a, R: CloudResource> StateProbe<R::Status, R::Error> for DescribeProbe<'a, R> {
    async fn probe(&self, id: &str) -> Result<Observation<R::Status>, Error<R::Error>> {
        let observed = self
            .retrier
            .execute_ignoring_not_found(self.resource.classifier(), || self.resource.describe(id))
            .await?;
        Ok(match observed {
            Some(status) => Observation::Status(status),
            None => Observation::NotFound,
        })
    }
}

/// Drives [`CloudResource`] operations to convergence.
pub struct Converger<R> {
    resource: Arc<R>,
    config: ConvergeConfig,
    tokens: Arc<dyn TokenGenerator>,
    observer: Arc<dyn Observer>,
    cancel: Option<CancellationToken>,
}

impl<R> fmt::Debug for Converger<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Converger")
            .field("config", &self.config)
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

impl<R: CloudResource> Converger<R> {
    pub fn new(resource: Arc<R>, config: ConvergeConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            resource,
            config,
            tokens: Arc::new(ClientTokenGenerator::default()),
            observer: default_observer(),
            cancel: None,
        })
    }

    pub fn with_tokens(mut self, tokens: Arc<dyn TokenGenerator>) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn resource(&self) -> &R {
        &self.resource
    }

    pub fn config(&self) -> &ConvergeConfig {
        &self.config
    }

    fn retrier(&self, action: &str, budget: Duration, backoff: BackoffPolicy) -> Retrier {
        let retrier = Retrier::new(format!("{}{}", action, self.resource.kind()), budget, backoff)
            .with_observer(Arc::clone(&self.observer));
        match &self.cancel {
            Some(token) => retrier.with_cancellation(token.clone()),
            None => retrier,
        }
    }

    fn poller(&self) -> Poller {
        let poller = Poller::new().with_observer(Arc::clone(&self.observer));
        match &self.cancel {
            Some(token) => poller.with_cancellation(token.clone()),
            None => poller,
        }
    }

    fn probe(&self) -> DescribeProbe<'_, R> {
        DescribeProbe {
            resource: &self.resource,
            retrier: self.retrier(
                "Describe",
                self.config.read_timeout(),
                self.config.read_backoff(),
            ),
        }
    }

    async fn wait_ready(&self, id: &str, timeout: Duration) -> Result<R::Status, Error<R::Error>> {
        let spec = self
            .config
            .poll_spec(self.resource.ready_statuses(), self.resource.failed_statuses(), timeout)?
            .with_pending(self.resource.pending_statuses());
        match self.poller().wait_for(id, &spec, &self.probe()).await? {
            Converged::Status(status) => Ok(status),
            Converged::Absent => Err(Error::Vanished {
                id: id.to_string(),
                checks: 0,
            }),
        }
    }

    /// Create the resource and wait until it is ready.
    ///
    /// Every create attempt carries the same idempotency token, so a retry
    /// after an ambiguous failure cannot create a second resource.
    pub async fn create(&self, spec: &R::Spec) -> Result<(String, R::Status), Error<R::Error>> {
        let start = Instant::now();
        let timeout = self.config.create_timeout();
        let retrier = self.retrier("Create", timeout, self.config.mutate_backoff());
        let resource = &*self.resource;

        let id = retrier
            .execute_idempotent(resource.classifier(), &*self.tokens, |token| async move {
                resource.create(spec, &token).await
            })
            .await?;
        info!(kind = resource.kind(), id = %id, "Create accepted, waiting for resource");

        let remaining = timeout.saturating_sub(start.elapsed());
        let status = self.wait_ready(&id, remaining).await?;
        info!(
            kind = resource.kind(),
            id = %id,
            status = %status,
            elapsed_ms = start.elapsed().as_millis(),
            "Created resource"
        );
        Ok((id, status))
    }

    /// Update the resource and wait until it is ready again.
    pub async fn update(&self, id: &str, spec: &R::Spec) -> Result<R::Status, Error<R::Error>> {
        let start = Instant::now();
        let timeout = self.config.update_timeout();
        let retrier = self.retrier("Modify", timeout, self.config.mutate_backoff());
        let resource = &*self.resource;

        retrier
            .execute_idempotent(resource.classifier(), &*self.tokens, |token| async move {
                resource.update(id, spec, &token).await
            })
            .await?;

        let remaining = timeout.saturating_sub(start.elapsed());
        let status = self.wait_ready(id, remaining).await?;
        info!(
            kind = resource.kind(),
            id = %id,
            status = %status,
            elapsed_ms = start.elapsed().as_millis(),
            "Updated resource"
        );
        Ok(status)
    }

    /// Delete the resource and wait until it is gone.
    ///
    /// A resource that is already gone counts as deleted.
    pub async fn delete(&self, id: &str) -> Result<(), Error<R::Error>> {
        let start = Instant::now();
        let timeout = self.config.delete_timeout();
        let retrier = self.retrier("Delete", timeout, self.config.mutate_backoff());
        let resource = &*self.resource;

        let deleted = retrier
            .execute_ignoring_not_found(resource.classifier(), || resource.delete(id))
            .await?;
        if deleted.is_none() {
            info!(kind = resource.kind(), id = %id, "Resource already deleted");
            return Ok(());
        }

        let remaining = timeout.saturating_sub(start.elapsed());
        let spec = self
            .config
            .absence_spec::<R::Status>(remaining)?;
        self.poller().wait_for(id, &spec, &self.probe()).await?;
        info!(
            kind = resource.kind(),
            id = %id,
            elapsed_ms = start.elapsed().as_millis(),
            "Deleted resource"
        );
        Ok(())
    }

    /// Current status, or `None` when the resource does not exist.
    pub async fn read(&self, id: &str) -> Result<Option<R::Status>, Error<R::Error>> {
        let resource = &*self.resource;
        self.retrier("Describe", self.config.read_timeout(), self.config.read_backoff())
            .execute_ignoring_not_found(resource.classifier(), || resource.describe(id))
            .await
    }

    /// Every item of the listing.
    pub async fn list(&self) -> Result<Vec<R::Item>, Error<R::Error>> {
        self.collect_listing(None).await
    }

    /// Items of the listing that match `keep`.
    pub async fn list_where(
        &self,
        keep: impl Fn(&R::Item) -> bool + Send + Sync + 'static,
    ) -> Result<Vec<R::Item>, Error<R::Error>> {
        self.collect_listing(Some(Box::new(keep))).await
    }

    async fn collect_listing(
        &self,
        keep: Option<ItemFilter<R::Item>>,
    ) -> Result<Vec<R::Item>, Error<R::Error>> {
        let resource = &*self.resource;
        let retrier = self.retrier("List", self.config.read_timeout(), self.config.read_backoff());
        let retrier = &retrier;
        let fetch = move |cursor: PageCursor, size: u32| async move {
            retrier
                .execute(resource.classifier(), || resource.list_page(cursor.clone(), size))
                .await
        };

        let mut paginator = Paginator::new(self.config.page_size, resource.first_cursor(), fetch)?
            .with_observer(Arc::clone(&self.observer));
        if let Some(keep) = keep {
            paginator = paginator.with_filter(keep);
        }
        let items = paginator.collect().await?;
        info!(kind = resource.kind(), items = items.len(), "Listed resources");
        Ok(items)
    }

    /// Converge the resource's tags to `declared`. Reserved keys are ignored.
    pub async fn reconcile_tags(
        &self,
        id: &str,
        declared: &TagSet,
    ) -> Result<TagDiff, Error<R::Error>> {
        let resource = &*self.resource;
        let remote = self
            .retrier("ListTag", self.config.read_timeout(), self.config.read_backoff())
            .execute(resource.classifier(), || resource.list_tags(id))
            .await?;

        let retrier = self.retrier("Tag", self.config.update_timeout(), self.config.tag_backoff());
        let reconciler = TagReconciler::new(&retrier)
            .with_reserved(ReservedPrefixes::new(&self.config.reserved_tag_prefixes))
            .with_observer(Arc::clone(&self.observer));

        reconciler
            .reconcile(
                &remote,
                declared,
                resource.classifier(),
                |keys| resource.untag(id, keys),
                |tags| resource.tag(id, tags),
            )
            .await
    }
}
