/// Guardrails orchestrator for the Warden gateway.
///
/// Drives every request through the enforcement pipeline:
/// - **Gateway**: State machine from admission to terminal response, with one audit trail per request
/// - **Ledger**: Sliding-window request, token and cost budgets per identity
/// - **Plan**: Parses and validates model-proposed action plans against the tool catalog
/// - **Approval**: Timed human-in-the-loop gate for high-risk actions
/// - **Session**: Turn count and cumulative risk carried across a conversation
/// - **Model**: HTTP text-generation backend
pub mod approval;
pub mod gateway;
pub mod ledger;
pub mod model;
pub mod plan;
pub mod session;

pub use approval::{ChannelApprover, StaticApprover, TimedApprovalGate};
pub use gateway::{Gateway, GatewayDeps};
pub use ledger::{Admission, Ledger};
pub use plan::{PlanDecision, PlanRejection, PlanValidator};
pub use session::SessionStore;
