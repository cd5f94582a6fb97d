//! Open Relay: resolves audio references, transcodes them to Opus and
//! streams the frames to remote destinations over a real-time voice link.

pub mod audio;
pub mod bot;
pub mod cache;
pub mod config;
pub mod error;
pub mod sources;
pub mod voice;

#[cfg(test)]
mod testing;

use tokio::time::Instant;

/// Sleeps until `deadline`, or forever when there is none.
pub(crate) async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
