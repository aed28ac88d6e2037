/// Zulip wire types and REST client
pub mod client;
pub mod events;

pub use client::{
    Credentials, EventQueueApi, RegisterRequest, RegisterResponse, Stream, User, ZulipClient,
};
pub use events::{MessageData, RawEnvelope, ZulipEvent};
