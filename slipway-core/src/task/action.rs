use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};

/// Every operation a task can carry.
///
/// The first block is accepted from clients and decomposed by the engine.
/// The second block is executed by drivers; each may also be submitted
/// directly, in which case it runs as a single step per unit.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Action {
    // Orchestrator actions
    Noop,
    ValidateDesign,
    VerifySite,
    PrepareSite,
    VerifyNodes,
    PrepareNodes,
    DeployNodes,
    DestroyNodes,
    RelabelNodes,
    BootactionReport,

    // Driver actions
    ValidateOobServices,
    ConfigNodePxe,
    SetNodeBoot,
    PowerOffNode,
    PowerOnNode,
    PowerCycleNode,
    InterrogateOob,
    ValidateNodeServices,
    CreateNetworkTemplate,
    CreateStorageTemplate,
    CreateBootMedia,
    ConfigureUserCredentials,
    PrepareHardwareConfig,
    IdentifyNode,
    ConfigureHardware,
    InterrogateNode,
    ApplyNodeNetworking,
    ApplyNodeStorage,
    ApplyNodePlatform,
    DeployNode,
    DestroyNode,
    RelabelNode,
}

/// How the engine fans an action out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionPlan {
    /// Executed by the engine itself with no subtasks.
    Leaf,
    /// One subtask for the whole site running these steps in order.
    PerSite(Vec<Action>),
    /// One subtask per targeted node running these steps in order.
    PerNode(Vec<Action>),
}

const VERIFY_SITE: &[Action] = &[Action::ValidateNodeServices, Action::ValidateOobServices];
const PREPARE_SITE: &[Action] = &[
    Action::CreateNetworkTemplate,
    Action::ConfigureUserCredentials,
];
const VERIFY_NODES: &[Action] = &[Action::InterrogateOob];
const PREPARE_NODES: &[Action] = &[
    Action::PowerOffNode,
    Action::SetNodeBoot,
    Action::PowerOnNode,
    Action::IdentifyNode,
    Action::ConfigureHardware,
];
const DEPLOY_NODES: &[Action] = &[
    Action::ApplyNodeNetworking,
    Action::ApplyNodeStorage,
    Action::ApplyNodePlatform,
    Action::DeployNode,
    Action::BootactionReport,
];
const DESTROY_NODES: &[Action] = &[Action::DestroyNode];
const RELABEL_NODES: &[Action] = &[Action::RelabelNode];
const BOOTACTION_REPORT: &[Action] = &[Action::BootactionReport];

impl Action {
    /// `true` for actions that drivers implement.
    pub fn is_driver_action(&self) -> bool {
        *self >= Action::ValidateOobServices
    }

    /// Driver actions that operate on the site rather than a node.
    pub fn is_site_scoped(&self) -> bool {
        matches!(
            self,
            Action::ValidateOobServices
                | Action::ValidateNodeServices
                | Action::CreateNetworkTemplate
                | Action::CreateStorageTemplate
                | Action::CreateBootMedia
                | Action::ConfigureUserCredentials
        )
    }

    pub fn plan(self) -> ActionPlan {
        match self {
            Action::Noop | Action::ValidateDesign => ActionPlan::Leaf,
            Action::VerifySite => ActionPlan::PerSite(VERIFY_SITE.to_vec()),
            Action::PrepareSite => ActionPlan::PerSite(PREPARE_SITE.to_vec()),
            Action::VerifyNodes => ActionPlan::PerNode(VERIFY_NODES.to_vec()),
            Action::PrepareNodes => ActionPlan::PerNode(PREPARE_NODES.to_vec()),
            Action::DeployNodes => ActionPlan::PerNode(DEPLOY_NODES.to_vec()),
            Action::DestroyNodes => ActionPlan::PerNode(DESTROY_NODES.to_vec()),
            Action::RelabelNodes => ActionPlan::PerNode(RELABEL_NODES.to_vec()),
            Action::BootactionReport => ActionPlan::PerNode(BOOTACTION_REPORT.to_vec()),
            driver if driver.is_site_scoped() => ActionPlan::PerSite(vec![driver]),
            driver => ActionPlan::PerNode(vec![driver]),
        }
    }

    /// All driver actions, in declaration order.
    pub fn driver_actions() -> impl Iterator<Item = Action> {
        Action::iter().filter(Action::is_driver_action)
    }
}
