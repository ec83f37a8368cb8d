#![allow(clippy::needless_return)]

mod args;

pub use args::{Args, Command, ConfigureRateLimitArgs, ServeArgs, WorkerArgs};
