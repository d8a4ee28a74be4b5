use super::{campaign_stats, failed_instances, list_campaign_operations, CampaignStats};
use crate::error::Result;
use crate::storage::OperationStorage;
use crate::types::{CampaignId, Operation, OperationFilter, Page};
use std::sync::Arc;

/// Campaign status queries over a storage backend.
pub struct CampaignStatus {
    storage: Arc<dyn OperationStorage>,
    max_page_size: u32,
}

impl CampaignStatus {
    #[must_use]
    pub fn new(storage: Arc<dyn OperationStorage>, max_page_size: u32) -> Self {
        Self {
            storage,
            max_page_size,
        }
    }

    /// # Errors
    /// Returns an error if the campaign operations cannot be read.
    pub async fn stats(&self, campaign_id: &CampaignId) -> Result<CampaignStats> {
        let operations = self.storage.list_by_campaign(campaign_id).await?;
        Ok(campaign_stats(&operations))
    }

    /// # Errors
    /// Returns an error if the campaign operations cannot be read.
    pub async fn failed_instances(&self, campaign_id: &CampaignId) -> Result<Vec<Operation>> {
        let operations = self.storage.list_by_campaign(campaign_id).await?;
        Ok(failed_instances(&operations))
    }

    /// Lists campaign operations with the page size capped at the configured maximum.
    ///
    /// # Errors
    /// Returns an error if the campaign operations cannot be read.
    pub async fn list(
        &self,
        campaign_id: &CampaignId,
        filter: OperationFilter,
    ) -> Result<Page<Operation>> {
        let filter = filter
            .with_campaign(campaign_id.clone())
            .normalized(self.max_page_size);
        let operations = self.storage.list_by_campaign(campaign_id).await?;
        Ok(list_campaign_operations(&operations, &filter))
    }
}

#[cfg(test)]
mod bdd_tests {
    #![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

    use super::CampaignStatus;
    use crate::storage::{MemoryOperationStorage, OperationStorage};
    use crate::types::{
        CampaignId, InstanceId, Operation, OperationFilter, OperationId, OperationState,
        OperationType,
    };
    use chrono::{Duration, Utc};
    use std::sync::Arc;

    async fn given_campaign(storage: &MemoryOperationStorage, failed: usize) {
        let start = Utc::now();
        for i in 0..failed {
            let minutes = i64::try_from(i).unwrap();
            let mut op = Operation::new(
                OperationId::new(format!("op-{i}")),
                OperationType::UpgradeCluster,
                InstanceId::new(format!("inst-{i}")),
                start + Duration::minutes(minutes),
            )
            .with_campaign(CampaignId::new("camp-1"));
            op.state = OperationState::Failed;
            storage.insert(&op).await.unwrap();
        }
        let unrelated = Operation::new(
            OperationId::new("other"),
            OperationType::UpgradeCluster,
            InstanceId::new("inst-x"),
            start,
        );
        storage.insert(&unrelated).await.unwrap();
    }

    #[tokio::test]
    async fn when_listing_failed_then_page_size_is_capped() {
        let storage = MemoryOperationStorage::new();
        given_campaign(&storage, 5).await;
        let status = CampaignStatus::new(Arc::new(storage), 2);
        let campaign = CampaignId::new("camp-1");

        let page = status
            .list(
                &campaign,
                OperationFilter::default()
                    .with_states([OperationState::Failed])
                    .with_page(1, 50),
            )
            .await
            .unwrap();

        assert_eq!(page.count, 2);
        assert_eq!(page.total_count, 5);
        assert_eq!(status.stats(&campaign).await.unwrap()[&OperationState::Failed], 5);
        assert_eq!(status.failed_instances(&campaign).await.unwrap().len(), 5);
    }
}
