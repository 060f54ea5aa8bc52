// StreamRelay Commands
// String-error wrappers called by the control API

mod relay;
mod system;

pub use relay::*;
pub use system::*;
