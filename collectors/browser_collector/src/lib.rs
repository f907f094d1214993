//! Browser-side dwell tracking and buffered upload to the usage server.

pub mod buffer;
pub mod clock;
pub mod events;
pub mod runner;
pub mod sync;
pub mod tracker;
