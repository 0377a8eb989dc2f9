//! On-disk JSON persistence helpers shared by the engine's stores.

mod atomic;

pub use atomic::{atomic_read_json, atomic_write_json};
