//! Instance resource family on top of the simulated cloud.

use std::sync::Arc;

use async_trait::async_trait;
use clap::ValueEnum;
use converge::{
    CloudResource, CodeClassifier, ErrorClassifier, IdempotencyToken, Page, PageCursor, TagSet,
};

use crate::cloud::{InstanceSpec, InstanceStatus, InstanceSummary, SimCloud};
use crate::error::SimError;

/// Which list API to page through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Paging {
    /// `DescribeInstances` with PageNumber/PageSize
    Index,
    /// `ListInstances` with NextToken/MaxResults
    Token,
}

pub struct Instances {
    cloud: Arc<SimCloud>,
    classifier: CodeClassifier,
    paging: Paging,
}

impl Instances {
    pub fn new(cloud: Arc<SimCloud>, paging: Paging) -> Self {
        Self {
            cloud,
            classifier: CodeClassifier::default(),
            paging,
        }
    }
}

#[async_trait]
impl CloudResource for Instances {
    type Spec = InstanceSpec;
    type Status = InstanceStatus;
    type Item = InstanceSummary;
    type Error = SimError;

    fn kind(&self) -> &str {
        "Instance"
    }

    fn classifier(&self) -> &dyn ErrorClassifier<SimError> {
        &self.classifier
    }

    fn ready_statuses(&self) -> Vec<InstanceStatus> {
        vec![InstanceStatus::Running]
    }

    fn failed_statuses(&self) -> Vec<InstanceStatus> {
        vec![InstanceStatus::Failed]
    }

    fn pending_statuses(&self) -> Vec<InstanceStatus> {
        vec![
            InstanceStatus::Pending,
            InstanceStatus::Starting,
            InstanceStatus::Stopping,
            InstanceStatus::Stopped,
        ]
    }

    fn first_cursor(&self) -> PageCursor {
        match self.paging {
            Paging::Index => PageCursor::first_index(),
            Paging::Token => PageCursor::first_token(),
        }
    }

    async fn create(
        &self,
        spec: &InstanceSpec,
        token: &IdempotencyToken,
    ) -> Result<String, SimError> {
        self.cloud.run_instance(spec, token.as_str()).await
    }

    async fn update(
        &self,
        id: &str,
        spec: &InstanceSpec,
        token: &IdempotencyToken,
    ) -> Result<(), SimError> {
        self.cloud.modify_instance(id, spec, token.as_str()).await
    }

    async fn delete(&self, id: &str) -> Result<(), SimError> {
        self.cloud.delete_instance(id).await
    }

    async fn describe(&self, id: &str) -> Result<InstanceStatus, SimError> {
        self.cloud.describe_instance(id).await
    }

    async fn list_page(
        &self,
        cursor: PageCursor,
        page_size: u32,
    ) -> Result<Page<InstanceSummary>, SimError> {
        match cursor {
            PageCursor::Index(page_number) => {
                let (items, total) = self.cloud.describe_instances(page_number, page_size).await?;
                Ok(Page::new(items).with_total_count(total))
            }
            PageCursor::Token(token) => {
                let (items, next) = self.cloud.list_instances(token.as_deref(), page_size).await?;
                let page = Page::new(items);
                Ok(match next {
                    Some(next) => page.with_next_token(next),
                    None => page,
                })
            }
        }
    }

    async fn list_tags(&self, id: &str) -> Result<TagSet, SimError> {
        self.cloud.list_tag_resources(id).await
    }

    async fn untag(&self, id: &str, keys: Vec<String>) -> Result<(), SimError> {
        self.cloud.untag_resources(id, &keys).await
    }

    async fn tag(&self, id: &str, tags: TagSet) -> Result<(), SimError> {
        self.cloud.tag_resources(id, &tags).await
    }
}
