//! Task orchestration backend for a standalone VR headset driven over ADB.
//!
//! [`engine::Engine`] is the entry point; everything it does is reported through
//! [`events::EventBus`].

pub mod adb;
pub mod archive;
pub mod backups;
pub mod downloader;
pub mod downloads_catalog;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod retry;
pub mod settings;
pub mod task;
pub mod utils;
pub mod version;

pub use engine::Engine;
pub use events::{EngineEvent, EngineHealth, EventBus};

pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
