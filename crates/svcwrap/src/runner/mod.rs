mod controller;
mod hooks;
mod supervisor;

pub use controller::{ProcessController, StopOutcome};
pub use hooks::HookRunner;
pub use supervisor::{
    ExitProcessTerminator, SERVICE_CONTROL_PRESHUTDOWN, Supervisor, SupervisorBuilder,
    SupervisorState, Terminator,
};
