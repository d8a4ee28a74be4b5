use broker::types::{OperationState, OperationType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    Help,
    InitDb {
        url: Option<String>,
    },
    Show {
        operation_id: String,
    },
    History {
        instance_id: String,
    },
    CampaignStatus {
        campaign_id: String,
        states: Vec<OperationState>,
        page: Option<u32>,
        page_size: Option<u32>,
    },
    /// Lists what a restart would re-enqueue. All queues unless a type is given.
    Recover {
        operation_type: Option<OperationType>,
    },
}

impl CliCommand {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Help => "help",
            Self::InitDb { .. } => "init-db",
            Self::Show { .. } => "show",
            Self::History { .. } => "history",
            Self::CampaignStatus { .. } => "campaign-status",
            Self::Recover { .. } => "recover",
        }
    }
}
