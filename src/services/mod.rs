// StreamRelay Services
// Orchestration layer: compile, render, supervise

mod binary_locator;
mod config_renderer;
mod events;
mod log_manager;
mod platform_catalog;
mod process_supervisor;
mod relay_controller;
mod settings_manager;
mod topology_compiler;

pub use binary_locator::*;
pub use config_renderer::*;
pub use events::*;
pub use log_manager::*;
pub use platform_catalog::*;
pub use process_supervisor::*;
pub use relay_controller::*;
pub use settings_manager::*;
pub use topology_compiler::*;
