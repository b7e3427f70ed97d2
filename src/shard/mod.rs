//! Shard management module
//!
//! The [`ShardManager`] owns the fleet; sessions plug in through
//! [`SessionBuilder`]. [`TwilightSessionBuilder`] is the production session
//! layer.

mod manager;
mod session;
mod state;
mod twilight;

pub use manager::ShardManager;
pub use session::{DisposePolicy, Session, SessionBuilder, SessionContext};
pub use state::{ShardHealth, ShardSnapshot, ShardState};
pub use twilight::{default_intents, ShardEvent, TwilightSession, TwilightSessionBuilder};
