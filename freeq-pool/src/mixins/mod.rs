//! Mixins installed by default (`ClientConfig::install_default_mixins`).

pub mod rate_limit;
pub mod room_state;
pub mod user_state;

pub use rate_limit::{ConnectGate, ConnectionRateLimiter};
pub use room_state::{RoomState, RoomStateTracker};
pub use user_state::{UserState, UserStateTracker};
