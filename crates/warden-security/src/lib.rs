/// Security subsystem for the Warden guardrails gateway.
///
/// This crate implements the checks that sit on the trust boundaries:
/// - **Rules**: the pattern library and two-tier scoring shared by both validators
/// - **Input validator**: normalizes, scans, redacts and scores caller input
/// - **Output filter**: scans model output, detects policy leaks, redacts or refuses
/// - **Leak detector**: lexical overlap between a response and the system policy
/// - **Audit sinks**: append-only, per-request ordered event trails
pub mod audit;
pub mod egress;
pub mod ingress;
pub mod leak_detector;
pub mod rules;

pub use audit::{InMemoryAuditSink, JsonlAuditSink};
pub use egress::DefaultOutputFilter;
pub use ingress::{digest_raw, DefaultInputValidator};
pub use leak_detector::LeakDetector;
pub use rules::{Rule, RuleSet};
