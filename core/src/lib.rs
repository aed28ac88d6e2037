/// zulink - Zulip bridge core
///
/// Long-polls the Zulip event queue of every login, turns message, reaction
/// and topic events into host events, and rewrites rendered Zulip HTML into
/// the host's markup.

pub mod error;
pub mod config;
pub mod ids;
pub mod bridge;
pub mod html;
pub mod zulip;
pub mod msgconv;
pub mod dispatch;
pub mod poll;
pub mod store;
pub mod host;
pub mod login;
pub mod chat_info;
pub mod cli_app;

pub use error::{BridgeError, Result};
pub use config::Config;
pub use dispatch::Dispatcher;
pub use poll::{PollSupervisor, QueueManager};
