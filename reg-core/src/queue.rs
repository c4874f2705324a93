//! The task deque and its waiter (spec §3 "Task", §4.2.2, §5).
//!
//! New work is head-inserted so it is always preferred over a pending
//! retry that happens to share a ready time; retries are tail-inserted.
//! The waiter is a single-slot notification: a wakeup queued while nobody
//! is waiting is not lost, it is simply consumed by the next `wait` call.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::task::Task;

/// Thread-safe double-ended queue of [`Task`]s plus the dispatcher's waiter.
#[derive(Default)]
pub struct TaskQueue {
    tasks: Mutex<VecDeque<Task>>,
    waiter: Notify,
}

impl TaskQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
            waiter: Notify::new(),
        }
    }

    /// Head-inserts freshly submitted user work and wakes the dispatcher.
    pub fn add_new_task(&self, task: Task) {
        self.tasks.lock().push_front(task);
        self.waiter.notify_one();
    }

    /// Tail-inserts a task that is being retried after a failed attempt.
    /// Does not wake the dispatcher: the retry's `retry_time` is already
    /// accounted for by the dispatcher's timed wait.
    pub fn add_retry_task(&self, task: Task) {
        self.tasks.lock().push_back(task);
    }

    /// Returns the ready time of the task at the front of the queue, if any.
    #[must_use]
    pub fn peek_first_retry_time(&self) -> Option<Instant> {
        self.tasks.lock().front().map(Task::retry_time)
    }

    /// Removes and returns the front task if it is due by `now`.
    pub fn poll_first_if_due(&self, now: Instant) -> Option<Task> {
        let mut guard = self.tasks.lock();
        let due = matches!(guard.front(), Some(task) if task.retry_time() <= now);
        if due { guard.pop_front() } else { None }
    }

    /// Returns the number of queued tasks (test/diagnostic use).
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Returns `true` when the queue holds no tasks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Waits until either woken by [`TaskQueue::add_new_task`] or `timeout`
    /// elapses, whichever comes first.
    pub async fn wait(&self, timeout: Duration) {
        let notified = self.waiter.notified();
        tokio::select! {
            () = notified => {}
            () = tokio::time::sleep(timeout) => {}
        }
    }

    /// Wakes anyone waiting on the queue without enqueuing anything, used
    /// to make the dispatcher re-check `connected`/`is_open` promptly after
    /// an external state change (e.g. a successful reconnect).
    pub fn wake(&self) {
        self.waiter.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Completion, TaskKind};
    use reg_primitives::{RegistryUrl, UrlKey};
    use std::sync::Arc;

    fn dummy_task() -> Task {
        Task::new(
            TaskKind::Register,
            UrlKey::for_register(RegistryUrl::builder("rpc", "svc").build()),
            Completion::new(),
            Arc::new(|| Box::pin(async { Ok(true) })),
            None,
        )
    }

    #[test]
    fn new_task_precedes_stale_retry_at_equal_readiness() {
        let queue = TaskQueue::new();
        let retry = dummy_task();
        queue.add_retry_task(retry);

        let fresh = dummy_task();
        queue.add_new_task(fresh);

        let now = Instant::now();
        let first = queue.poll_first_if_due(now).unwrap();
        assert_eq!(first.kind(), TaskKind::Register);
        // Both tasks are `Register`, but the head-inserted one must come
        // off the deque first.
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn wait_returns_on_wakeup_before_timeout() {
        let queue = Arc::new(TaskQueue::new());
        let waiter = queue.clone();
        let handle = tokio::spawn(async move {
            waiter.wait(Duration::from_secs(5)).await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.wake();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("wait should return promptly after wake")
            .unwrap();
    }
}
