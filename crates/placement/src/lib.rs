#![forbid(unsafe_code, clippy::unwrap_used)]
#![allow(clippy::needless_return)]

pub mod materialize;
pub mod store;

pub use materialize::{generate_object_id, materialize_seed, upload_blob};
pub use store::{assign, lookup, remove, require_placed_on};
