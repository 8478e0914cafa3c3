//! Batching, flushing and the consume loop.

mod bridge;
mod flush;
mod persister;

pub use bridge::{spawn_commit_timer, CallbackBridge, FatalErrors};
pub use flush::{FlushEngine, FlushOutcome, MIN_RATE_WINDOW};
pub use persister::Persister;
