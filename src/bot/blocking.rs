use std::{sync::Arc, time::Duration};
use tokio::runtime::Handle;

use crate::{
    audio::{
        player::{Enqueued, PlaybackManager, SessionStatus},
        queue::{LoopMode, Track},
    },
    error::PlaybackResult,
    voice::Destination,
};

/// Synchronous facade over [`PlaybackManager`].
///
/// Every call parks the calling thread until the session worker replies.
/// Must not be used from a thread that is already driving the runtime.
#[derive(Clone)]
pub struct BlockingClient {
    manager: Arc<PlaybackManager>,
    runtime: Handle,
}

impl BlockingClient {
    pub fn new(manager: Arc<PlaybackManager>, runtime: Handle) -> Self {
        Self { manager, runtime }
    }

    pub fn join(&self, destination: Destination) -> PlaybackResult<()> {
        self.runtime.block_on(self.manager.join(destination))
    }

    pub fn leave(&self, destination: Destination) -> PlaybackResult<()> {
        self.runtime.block_on(self.manager.leave(destination))
    }

    pub fn enqueue(&self, destination: Destination, reference: &str) -> PlaybackResult<Enqueued> {
        self.runtime.block_on(self.manager.enqueue(destination, reference, None))
    }

    pub fn skip(&self, destination: Destination) -> PlaybackResult<Track> {
        self.runtime.block_on(self.manager.skip(destination))
    }

    pub fn pause(&self, destination: Destination) -> PlaybackResult<()> {
        self.runtime.block_on(self.manager.pause(destination))
    }

    pub fn resume(&self, destination: Destination) -> PlaybackResult<()> {
        self.runtime.block_on(self.manager.resume(destination))
    }

    pub fn stop(&self, destination: Destination) -> PlaybackResult<()> {
        self.runtime.block_on(self.manager.stop(destination))
    }

    pub fn seek(&self, destination: Destination, position: Duration) -> PlaybackResult<()> {
        self.runtime.block_on(self.manager.seek(destination, position))
    }

    pub fn set_loop_mode(&self, destination: Destination, mode: LoopMode) -> PlaybackResult<()> {
        self.runtime.block_on(self.manager.set_loop_mode(destination, mode))
    }

    pub fn set_volume(&self, destination: Destination, volume: f32) -> PlaybackResult<f32> {
        self.runtime.block_on(self.manager.set_volume(destination, volume))
    }

    pub fn status(&self, destination: Destination) -> Option<SessionStatus> {
        self.runtime.block_on(self.manager.status(destination))
    }

    pub fn shutdown(&self) {
        self.runtime.block_on(self.manager.shutdown())
    }
}
