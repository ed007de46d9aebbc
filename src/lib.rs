//! Change detection and webhook dispatch for the brokerage dashboard.
//!
//! Watches the clients and proposals feeds, classifies each observed change
//! into an [`EventKind`], and notifies configured HTTP subscribers with
//! per-subscriber throttling. Delivery is best-effort and at-most-once.

pub mod config;
pub mod contact;
pub mod differ;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod labels;
pub mod listener;
pub mod payload;
pub mod records;
pub mod registry;
pub mod store;
pub mod throttle;
pub mod types;

pub use config::EngineConfig;
pub use engine::{EngineHandle, WebhookEngine};
pub use error::{EngineError, Result};
pub use types::{
    ChangeType, Collection, ContactInfo, EntitySnapshot, Event, EventKind, Role, SessionUser,
    WebhookSubscriber,
};
