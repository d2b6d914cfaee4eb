//! Serialize-on-submit executor.
use std::sync::atomic::{AtomicBool, Ordering};

/// Runs submitted items one at a time on whichever thread submitted while
/// nothing else was running.
///
/// A submitter that finds another thread draining leaves its item in the
/// mailbox and returns immediately, the draining thread picks it up.
#[derive(Debug)]
pub struct SerializedExecutor<T> {
    sender: flume::Sender<T>,
    receiver: flume::Receiver<T>,
    draining: AtomicBool,
}

impl<T> SerializedExecutor<T> {
    pub fn new() -> Self {
        let (sender, receiver) = flume::unbounded();

        SerializedExecutor {
            sender,
            receiver,
            draining: AtomicBool::new(false),
        }
    }

    pub fn submit<F>(&self, item: T, mut process: F)
    where
        F: FnMut(T),
    {
        // Can't fail, we hold the receiver.
        let _ = self.sender.send(item);

        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }

            while let Ok(item) = self.receiver.try_recv() {
                process(item);
            }

            self.draining.store(false, Ordering::Release);

            // An item submitted between the last try_recv and the store
            // above would otherwise be stranded.
            if self.receiver.is_empty() {
                return;
            }
        }
    }

    /// Items waiting to be processed.
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }
}

impl<T> Default for SerializedExecutor<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    #[test]
    fn processes_everything_exactly_once() {
        let executor = Arc::new(SerializedExecutor::new());
        let processed = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let executor = executor.clone();
                let processed = processed.clone();
                let running = running.clone();

                std::thread::spawn(move || {
                    for i in 0..1000_usize {
                        executor.submit(i, |_| {
                            assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0);
                            processed.fetch_add(1, Ordering::SeqCst);
                            running.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().expect("thread panicked");
        }

        assert_eq!(executor.pending(), 0);
        assert_eq!(processed.load(Ordering::SeqCst), 8000);
    }
}
