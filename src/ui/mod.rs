//! Terminal output
//!
//! Uses `cliclack` and `indicatif` in an interactive terminal, with plain
//! line output in CI and in worker processes.

mod context;
mod output;
mod progress;

pub use context::UiContext;
pub use output::{
    intro, key_value, key_value_status, outro_success, section, step_error, step_info, step_ok,
    step_ok_detail, step_warn, step_warn_hint,
};
pub use progress::{StressProgress, TaskSpinner};
