//! Relation model for consumer services
//!
//! This module defines what a consumer declares when it relates to the proxy,
//! where those declarations are kept and how changes are delivered.

pub mod events;
mod store;
pub mod types;


pub use events::{
    parse_relation_file, ChannelEventSource, DirectoryEventSource, EventSource, RelationEvent,
};
pub use store::RelationStore;
pub use types::*;
