// StreamRelay Models
// Data structures for the application

mod platform;
mod stream_key;
mod relay_config;
mod topology;
mod relay_status;
mod settings;

pub use platform::*;
pub use stream_key::*;
pub use relay_config::*;
pub use topology::*;
pub use relay_status::*;
pub use settings::*;
