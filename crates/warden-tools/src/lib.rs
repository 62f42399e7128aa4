/// Tool subsystem for the Warden guardrails gateway.
///
/// Everything between a validated plan step and a tool backend:
/// - **Registry**: tool declarations and invocation functions
/// - **Schema**: parameter checks against declared schemas
/// - **Circuit breaker**: per-tool fail-fast on repeated backend failures
/// - **Sandbox**: authorization, approval, timeout, retry and audit per call
pub mod circuit_breaker;
pub mod registry;
pub mod sandbox;
pub mod schema;

pub use circuit_breaker::{CircuitBreakers, CircuitState, ToolCircuitBreaker};
pub use registry::{RegisteredTool, ToolRegistry};
pub use sandbox::{CallState, SandboxFailure, SandboxLimits, SandboxOutcome, ToolCall, ToolSandbox};
pub use schema::{validate_parameters, SchemaViolation};
