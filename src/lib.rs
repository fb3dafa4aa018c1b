//! Offline-first storage and adaptive voice synthesis for SpellFun.
//!
//! [`persistence::PersistenceService`] keeps users, lessons and progress in a
//! versioned [`store::StructuredStore`]. [`coordinator::VoiceCoordinator`]
//! speaks practice words through either the device's speech engine or a
//! downloadable neural voice.

pub mod app;
pub mod backends;
pub mod config_loader;
pub mod coordinator;
pub mod engine;
pub mod models;
pub mod persistence;
pub mod store;
