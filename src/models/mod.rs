pub mod event;
pub mod state;
pub mod stats;
pub mod uplink;

pub use event::*;
pub use state::*;
pub use stats::*;
pub use uplink::*;
