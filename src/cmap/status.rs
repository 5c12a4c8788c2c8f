use tokio::sync::watch;

use super::PoolGeneration;

/// Creates a channel for publishing the pool's generation to interested parties, e.g.
/// application threads verifying their connection is not stale.
pub(crate) fn channel(initial: PoolGeneration) -> (PoolGenerationPublisher, PoolGenerationSubscriber) {
    let (sender, receiver) = watch::channel(initial);
    (
        PoolGenerationPublisher { sender },
        PoolGenerationSubscriber { receiver },
    )
}

/// Struct used to publish the pool's current generation.
#[derive(Debug)]
pub(crate) struct PoolGenerationPublisher {
    sender: watch::Sender<PoolGeneration>,
}

impl PoolGenerationPublisher {
    pub(crate) fn publish(&self, new_generation: PoolGeneration) {
        // If nobody is listening, this isn't an error.
        let _: std::result::Result<_, _> = self.sender.send(new_generation);
    }
}

/// Subscriber used to get the latest generation of the pool.
#[derive(Clone, Debug)]
pub(crate) struct PoolGenerationSubscriber {
    receiver: watch::Receiver<PoolGeneration>,
}

impl PoolGenerationSubscriber {
    /// Get a copy of the latest generation.
    pub(crate) fn generation(&self) -> PoolGeneration {
        self.receiver.borrow().clone()
    }
}
