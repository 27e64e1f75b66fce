//! `async` tasks polled on the scheduler's FIFO queue.
//!
//! A spawned future is polled as an ordinary queued job. Waking it pushes one
//! poll job onto the same queue, so a task resumes in arrival order with
//! every other continuation. Awaiting a [`DeferredChain`] registers a
//! continuation that wakes the task once the value is known.

use std::cell::RefCell;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use futures::task::{waker, ArcWake};
use tracing::{debug, trace};

use crate::chain::DeferredChain;
use crate::scheduler::{Job, JobQueue, Scheduler};

/// Identifies a spawned task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

pub(crate) struct LocalTask {
    future: Pin<Box<dyn Future<Output = ()>>>,
    waker: Arc<TaskWaker>,
}

/// Pushes a poll job for its task. Repeated wakes before the poll runs are
/// coalesced into one job.
pub(crate) struct TaskWaker {
    id: TaskId,
    queue: JobQueue,
    queued: AtomicBool,
}

impl TaskWaker {
    fn schedule(&self) {
        if !self.queued.swap(true, Ordering::AcqRel) {
            self.queue.lock().push_back(Job::Poll(self.id));
        }
    }
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.schedule();
    }
}

impl Scheduler {
    /// Run `future` on this scheduler.
    ///
    /// The first poll is a queued job like any other. The returned chain
    /// resolves with the future's output. A future that needs the scheduler
    /// should capture [`Scheduler::downgrade`]: the task table owns the
    /// future, so a strong handle inside it keeps the scheduler alive until
    /// [`Scheduler::shutdown`].
    pub fn spawn<F>(&self, future: F) -> DeferredChain<F::Output>
    where
        F: Future + 'static,
        F::Output: Clone + 'static,
    {
        let output = DeferredChain::new(self);
        let done = output.clone();
        let id = TaskId(self.next_id());

        let task_waker = Arc::new(TaskWaker {
            id,
            queue: Arc::clone(&self.inner.queue),
            queued: AtomicBool::new(false),
        });
        let task = LocalTask {
            future: Box::pin(async move {
                let value = future.await;
                done.resolve(value);
            }),
            waker: Arc::clone(&task_waker),
        };

        self.inner.tasks.borrow_mut().insert(id, task);
        task_waker.schedule();
        debug!(task = id.0, "Task spawned");

        output
    }

    /// Spawned tasks that have not completed.
    pub fn live_tasks(&self) -> usize {
        self.inner.tasks.borrow().len()
    }

    pub(crate) fn poll_task(&self, id: TaskId) {
        let task = self.inner.tasks.borrow_mut().remove(&id);
        let Some(mut task) = task else {
            trace!(task = id.0, "Stale wake for finished task");
            return;
        };

        task.waker.queued.store(false, Ordering::Release);
        let waker = waker(Arc::clone(&task.waker));
        let mut cx = Context::from_waker(&waker);
        self.record(|s| s.task_polls += 1);

        match task.future.as_mut().poll(&mut cx) {
            Poll::Ready(()) => debug!(task = id.0, "Task completed"),
            Poll::Pending => {
                self.inner.tasks.borrow_mut().insert(id, task);
            }
        }
    }
}

/// Future returned by [`DeferredChain::settled`]; yields a clone of the
/// chain's value.
pub struct Settled<V> {
    chain: DeferredChain<V>,
    slot: Option<Rc<RefCell<Option<Waker>>>>,
}

impl<V: Clone + 'static> DeferredChain<V> {
    /// Await this chain's value.
    pub fn settled(&self) -> Settled<V> {
        Settled {
            chain: self.clone(),
            slot: None,
        }
    }
}

impl<V: Clone + 'static> Future for Settled<V> {
    type Output = V;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<V> {
        let this = self.get_mut();
        if let Some(value) = this.chain.peek() {
            return Poll::Ready(value);
        }

        match &this.slot {
            Some(slot) => {
                *slot.borrow_mut() = Some(cx.waker().clone());
            }
            None => {
                let slot = Rc::new(RefCell::new(Some(cx.waker().clone())));
                let notify = Rc::clone(&slot);
                this.chain.on_resolve(move |_| {
                    let waiting = notify.borrow_mut().take();
                    if let Some(waker) = waiting {
                        waker.wake();
                    }
                });
                this.slot = Some(slot);
            }
        }
        Poll::Pending
    }
}

impl<V: Clone + 'static> IntoFuture for DeferredChain<V> {
    type Output = V;
    type IntoFuture = Settled<V>;

    fn into_future(self) -> Settled<V> {
        self.settled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn first_poll_is_deferred() {
        let scheduler = Scheduler::new();
        let out = scheduler.spawn(async { 5 });

        assert_eq!(scheduler.live_tasks(), 1);
        assert_eq!(scheduler.pending_tasks(), 1);
        assert!(!out.is_resolved());

        scheduler.run_until_idle().unwrap();
        assert_eq!(out.peek(), Some(5));
        assert_eq!(scheduler.live_tasks(), 0);
    }

    #[test]
    fn awaiting_a_chain_resolved_later() {
        let scheduler = Scheduler::new();
        let input = DeferredChain::<u32>::new(&scheduler);

        let awaited = input.clone();
        let out = scheduler.spawn(async move { awaited.await + 1 });

        scheduler.run_until_idle().unwrap();
        assert!(!out.is_resolved());
        assert_eq!(scheduler.live_tasks(), 1);

        input.resolve(41);
        scheduler.run_until_idle().unwrap();
        assert_eq!(out.peek(), Some(42));
    }

    #[test]
    fn sequential_awaits_compose_like_plain_calls() {
        let scheduler = Scheduler::new();
        let handle = scheduler.downgrade();

        let out = scheduler.spawn(async move {
            let step1 = handle.resolved("step1".to_string()).await;
            let step2 = handle.resolved("step2".to_string()).await;
            format!("{step1}{step2}")
        });

        scheduler.run_until_idle().unwrap();
        assert_eq!(out.peek().as_deref(), Some("step1step2"));
    }

    #[test]
    fn repeated_wakes_coalesce_into_one_poll() {
        struct WakeTwice {
            polled: bool,
        }

        impl Future for WakeTwice {
            type Output = ();

            fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
                if self.polled {
                    return Poll::Ready(());
                }
                self.polled = true;
                cx.waker().wake_by_ref();
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }

        let scheduler = Scheduler::new();
        scheduler.spawn(WakeTwice { polled: false });
        scheduler.run_until_idle().unwrap();

        assert_eq!(scheduler.stats().task_polls, 2);
        assert_eq!(scheduler.live_tasks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn task_can_sleep_on_scheduler_timers() {
        let scheduler = Scheduler::new();
        let handle = scheduler.downgrade();

        let out = scheduler.spawn(async move {
            handle.sleep(Duration::from_millis(250)).await;
            "woke"
        });

        scheduler.run().await.unwrap();
        assert_eq!(out.peek(), Some("woke"));
    }

    #[test]
    fn dropping_scheduler_releases_stalled_task() {
        let scheduler = Scheduler::new();
        let token = Rc::new(());
        let never = DeferredChain::<()>::new(&scheduler);
        let handle = scheduler.downgrade();

        let held = Rc::clone(&token);
        let _out = scheduler.spawn(async move {
            let _keep = held;
            never.await;
            handle.sleep(Duration::from_millis(1)).await;
        });
        scheduler.run_until_idle().unwrap();
        assert_eq!(scheduler.live_tasks(), 1);
        assert_eq!(Rc::strong_count(&token), 2);

        drop(scheduler);
        assert_eq!(Rc::strong_count(&token), 1);
    }

    #[test]
    fn shutdown_releases_task_holding_strong_handle() {
        let scheduler = Scheduler::new();
        let token = Rc::new(());
        let never = DeferredChain::<()>::new(&scheduler);
        let handle = scheduler.clone();

        let held = Rc::clone(&token);
        let _out = scheduler.spawn(async move {
            let _keep = held;
            never.await;
            handle.sleep(Duration::from_millis(1)).await;
        });
        scheduler.set_timeout(Duration::from_secs(1), || {});
        scheduler.run_until_idle().unwrap();

        scheduler.shutdown();
        assert_eq!(scheduler.live_tasks(), 0);
        assert!(scheduler.is_idle());
        assert_eq!(Rc::strong_count(&token), 1);

        let weak = scheduler.downgrade();
        drop(scheduler);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn weak_handle_outlives_scheduler() {
        let scheduler = Scheduler::new();
        let handle = scheduler.downgrade();
        drop(scheduler);

        assert!(handle.upgrade().is_none());
        assert!(!handle.sleep(Duration::from_millis(1)).is_resolved());
        assert_eq!(handle.resolved(3).peek(), Some(3));
    }

    #[test]
    fn settled_yields_value_of_resolved_chain() {
        let scheduler = Scheduler::new();
        let chain = DeferredChain::resolved(&scheduler, 9u8);
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        let mut settled = chain.settled();
        assert_eq!(Pin::new(&mut settled).poll(&mut cx), Poll::Ready(9));
    }
}
