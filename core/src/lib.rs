pub mod api;
pub mod completion;
pub mod config;
pub mod context;
pub mod continuation;
pub mod error;
pub mod events;
pub mod healing;
pub mod history;
pub mod memory;
pub mod orchestrator;
pub mod safety;
pub mod sandbox;
pub mod store;
pub mod task;
pub mod util;
