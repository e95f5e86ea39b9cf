pub mod agents;
pub mod health;
pub mod jarvis;
pub mod qa;
pub mod snapshot;
pub mod watch;
