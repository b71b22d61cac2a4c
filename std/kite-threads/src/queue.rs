//!
//! Completion Queue
//!
//! A single dedicated thread that runs "result ready" notifications in the
//! order they were posted. Posting never blocks on the notification itself,
//! so a job's submitter is free as soon as its result is stored.
//!
//! Shutdown drains: notifications already queued still run before the thread
//! exits, and anything posted afterwards is refused.
//!

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crate::error::AccessError;

pub type Notification = Box<dyn FnOnce() + Send + 'static>;

struct NoticeQueue {
    notices: Mutex<VecDeque<Notification>>,
    condvar: Condvar,
    shutdown: AtomicBool,
}

impl NoticeQueue {
    fn new() -> Self {
        Self {
            notices: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Notification>> {
        self.notices.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, notice: Notification) -> Result<(), AccessError> {
        let mut notices = self.lock();
        // Checked under the lock so a drained worker never misses a push.
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(AccessError::QueueClosed);
        }
        notices.push_back(notice);
        self.condvar.notify_one();
        Ok(())
    }

    fn pop(&self) -> Option<Notification> {
        let mut notices = self.lock();
        while notices.is_empty() && !self.shutdown.load(Ordering::SeqCst) {
            notices = self.condvar.wait(notices).unwrap_or_else(|e| e.into_inner());
        }
        notices.pop_front()
    }

    fn shutdown(&self) {
        let _notices = self.lock();
        self.shutdown.store(true, Ordering::SeqCst);
        self.condvar.notify_all();
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

pub struct CompletionQueue {
    queue: Arc<NoticeQueue>,
    worker: Mutex<Option<JoinHandle<()>>>,
    outstanding: Arc<AtomicUsize>,
    delivered: Arc<AtomicUsize>,
}

impl CompletionQueue {
    pub fn new(thread_name: &str) -> Result<Self, AccessError> {
        let queue = Arc::new(NoticeQueue::new());
        let outstanding = Arc::new(AtomicUsize::new(0));
        let delivered = Arc::new(AtomicUsize::new(0));

        let worker = {
            let queue = Arc::clone(&queue);
            let outstanding = Arc::clone(&outstanding);
            let delivered = Arc::clone(&delivered);
            thread::Builder::new()
                .name(thread_name.to_string())
                .spawn(move || worker_loop(queue, outstanding, delivered))?
        };
        tracing::debug!(thread = thread_name, "completion queue started");

        Ok(Self {
            queue,
            worker: Mutex::new(Some(worker)),
            outstanding,
            delivered,
        })
    }

    /// Queue `notice` for the completion thread.
    pub fn post<F>(&self, notice: F) -> Result<(), AccessError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        let result = self.queue.push(Box::new(notice));
        if result.is_err() {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
        }
        result
    }

    /// Notifications posted but not yet run.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }

    pub fn is_shutdown(&self) -> bool {
        self.queue.is_shutdown()
    }

    /// Spin until every posted notification has run.
    pub fn wait_idle(&self) {
        while self.outstanding() > 0 {
            thread::yield_now();
        }
    }

    /// Stop accepting notifications, run the ones already queued, and join
    /// the completion thread. Safe to call more than once.
    pub fn shutdown(&self) {
        self.queue.shutdown();
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = worker {
            // A notification that shuts its own queue down cannot join itself.
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!("completion thread terminated abnormally");
            }
            tracing::debug!(delivered = self.delivered(), "completion queue stopped");
        }
    }
}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(queue: Arc<NoticeQueue>, outstanding: Arc<AtomicUsize>, delivered: Arc<AtomicUsize>) {
    while let Some(notice) = queue.pop() {
        if panic::catch_unwind(AssertUnwindSafe(notice)).is_err() {
            tracing::warn!("completion notification panicked");
        }
        delivered.fetch_add(1, Ordering::SeqCst);
        outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_notifications_run_in_order_off_thread() {
        let queue = CompletionQueue::new("kite-test-completion").unwrap();
        let (tx, rx) = mpsc::channel();
        let caller = thread::current().id();

        for i in 0..5 {
            let tx = tx.clone();
            queue
                .post(move || {
                    tx.send((i, thread::current().id())).unwrap();
                })
                .unwrap();
        }
        queue.wait_idle();

        let seen: Vec<_> = rx.try_iter().collect();
        assert_eq!(seen.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        assert!(seen.iter().all(|(_, id)| *id != caller));
        assert_eq!(queue.delivered(), 5);
    }

    #[test]
    fn test_shutdown_drains_then_refuses() {
        let queue = CompletionQueue::new("kite-test-drain").unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let ran = Arc::clone(&ran);
            queue
                .post(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        queue.shutdown();
        assert_eq!(ran.load(Ordering::SeqCst), 10);
        assert!(matches!(queue.post(|| {}), Err(AccessError::QueueClosed)));
        assert_eq!(queue.outstanding(), 0);
        queue.shutdown();
    }

    #[test]
    fn test_panicking_notification_does_not_stop_queue() {
        let queue = CompletionQueue::new("kite-test-panic").unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        queue.post(|| panic!("listener failed")).unwrap();
        {
            let ran = Arc::clone(&ran);
            queue.post(move || ran.store(true, Ordering::SeqCst)).unwrap();
        }
        queue.wait_idle();
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(queue.delivered(), 2);
    }
}
