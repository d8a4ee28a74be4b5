use super::identifiers::{CampaignId, InstanceId};
use super::operation::{Operation, OperationState, OperationType};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Selection criteria for paginated operation listings.
///
/// Empty collections mean "no restriction" for that field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationFilter {
    pub page: u32,
    pub page_size: u32,
    pub states: Vec<OperationState>,
    pub types: Vec<OperationType>,
    pub instance_ids: Vec<InstanceId>,
    pub campaign_id: Option<CampaignId>,
}

impl Default for OperationFilter {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            states: Vec::new(),
            types: Vec::new(),
            instance_ids: Vec::new(),
            campaign_id: None,
        }
    }
}

impl OperationFilter {
    #[must_use]
    pub fn with_states(mut self, states: impl IntoIterator<Item = OperationState>) -> Self {
        self.states = states.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_types(mut self, types: impl IntoIterator<Item = OperationType>) -> Self {
        self.types = types.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_campaign(mut self, campaign_id: CampaignId) -> Self {
        self.campaign_id = Some(campaign_id);
        self
    }

    #[must_use]
    pub const fn with_page(mut self, page: u32, page_size: u32) -> Self {
        self.page = page;
        self.page_size = page_size;
        self
    }

    /// Clamps paging to `1..=max_page_size` and pages to at least 1.
    #[must_use]
    pub fn normalized(mut self, max_page_size: u32) -> Self {
        let max = max_page_size.max(1);
        self.page = self.page.max(1);
        self.page_size = if self.page_size == 0 {
            max
        } else {
            self.page_size.min(max)
        };
        self
    }

    #[must_use]
    pub const fn offset(&self) -> u64 {
        (self.page.saturating_sub(1) as u64) * (self.page_size as u64)
    }

    #[must_use]
    pub fn includes_state(&self, state: OperationState) -> bool {
        self.states.is_empty() || self.states.contains(&state)
    }

    /// Every criterion except the state restriction.
    #[must_use]
    pub fn matches_ignoring_state(&self, operation: &Operation) -> bool {
        (self.types.is_empty() || self.types.contains(&operation.operation_type))
            && (self.instance_ids.is_empty() || self.instance_ids.contains(&operation.instance_id))
            && self
                .campaign_id
                .as_ref()
                .map_or(true, |campaign| operation.campaign_id.as_ref() == Some(campaign))
    }

    #[must_use]
    pub fn matches(&self, operation: &Operation) -> bool {
        self.includes_state(operation.state) && self.matches_ignoring_state(operation)
    }

    /// Slices an already filtered and ordered result set into the requested page.
    #[must_use]
    pub fn paginate<T>(&self, items: Vec<T>) -> Page<T> {
        let total_count = items.len();
        let offset = usize::try_from(self.offset()).unwrap_or(usize::MAX);
        let data: Vec<T> = items
            .into_iter()
            .skip(offset)
            .take(self.page_size as usize)
            .collect();
        Page {
            count: data.len(),
            data,
            total_count,
        }
    }
}

/// One page of a listing with the size of the full result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub count: usize,
    pub total_count: usize,
}

impl<T> Page<T> {
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            data: Vec::new(),
            count: 0,
            total_count: 0,
        }
    }
}
