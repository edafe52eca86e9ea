//! RORI: routes chat interactions to priority-ordered modules.

pub mod config;
pub mod emotion;
pub mod error;
pub mod interaction;
pub mod modules;
pub mod phrases;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod sink;
pub mod source;
pub mod store;
