pub mod agents;
pub mod events;
pub mod health;
pub mod jarvis;
pub mod qa;
pub mod snapshot;
