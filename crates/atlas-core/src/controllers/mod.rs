//! Controller Registry
//!
//! Owns controller definitions: identity, kind, configuration template,
//! retry/schedule policy, and notification hooks. Controllers are created
//! and mutated only through explicit registry calls and are never deleted
//! while attachments reference them.

mod registry;
mod types;

pub use registry::ControllerRegistry;
pub use types::{
    ConfigTemplate, Controller, ControllerKind, ControllerUpdate, NewController, NotificationHook,
    NotificationTarget, RetryPolicy, SchedulePolicy,
};

pub(crate) use types::ControllerRow;
