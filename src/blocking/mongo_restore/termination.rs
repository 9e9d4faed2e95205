use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use std::sync::Arc;

/// Shared stop signal of a restore run.
///
/// Raised once, by the first worker which hits a fatal error or from outside (e.g. on
/// Ctrl-C), and never lowered again.  It's a channel which never carries a message: raising
/// it drops the only sender, so every receiver becomes disconnected.  That lets producers
/// wait for it inside a `select!` next to their own channel operations.
#[derive(Clone, Debug)]
pub struct Termination {
    inner: Arc<TerminationInner>,
}

#[derive(Debug)]
struct TerminationInner {
    sender: Mutex<Option<Sender<()>>>,
    receiver: Receiver<()>,
}

impl Termination {
    /// create a signal which is not raised.
    pub fn new() -> Self {
        let (sender, receiver) = channel::bounded(0);
        Termination {
            inner: Arc::new(TerminationInner {
                sender: Mutex::new(Some(sender)),
                receiver,
            }),
        }
    }

    /// Raise the signal, calling it more than once is fine.
    pub fn terminate(&self) {
        self.inner.sender.lock().take();
    }

    /// true once the signal is raised.
    pub fn is_terminated(&self) -> bool {
        matches!(
            self.inner.receiver.try_recv(),
            Err(TryRecvError::Disconnected)
        )
    }

    /// A receiver which becomes ready (disconnected) when the signal is raised.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.inner.receiver
    }
}

impl Default for Termination {
    fn default() -> Self {
        Termination::new()
    }
}
