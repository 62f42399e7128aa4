/// Shared types, traits, and errors for the Warden guardrails gateway.
///
/// Every other Warden crate depends on this one. It contains:
/// - **Trait contracts** (`traits`) for validators, backends, sinks and gates
/// - **Shared data types** (`actions`) used across all subsystems
/// - **Error types** (`errors`) for unified error handling
/// - **Config types** (`config`, `config_loader`) for the config directory
/// - **Cancellation** (`cancel`) for propagating caller cancellation
pub mod actions;
pub mod cancel;
pub mod config;
pub mod config_loader;
pub mod errors;
pub mod traits;

// Re-export commonly used types at the crate root for convenience.
pub use actions::*;
pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use errors::{BudgetExceeded, GatewayFailure, WardenError, REFUSAL_TEXT};
pub use traits::*;
