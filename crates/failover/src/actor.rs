//! Single-task work queue that owns mutable state.
//!
//! Every mutation of the state `S` runs as a named unit on one tokio task, in
//! submission order, so code inside a unit can treat `&mut S` as exclusively
//! its own. Units already running on the actor call each other directly with
//! the `&mut S` they were given; a blocking [`ActorHandle::call`] issued from
//! the actor's own task would wait on itself and is refused instead.

use common::{Error, Result};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, warn};

static NEXT_ACTOR_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    static CURRENT_ACTOR: u64;
}

type UnitFn<S> = Box<dyn for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, ()> + Send>;

struct Unit<S> {
    name: &'static str,
    run: UnitFn<S>,
}

fn unit<S, F>(name: &'static str, run: F) -> Unit<S>
where
    F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, ()> + Send + 'static,
{
    Unit {
        name,
        run: Box::new(run),
    }
}

/// Handle used to submit work to an actor
pub struct ActorHandle<S> {
    id: u64,
    name: Arc<str>,
    sender: Arc<Mutex<Option<mpsc::UnboundedSender<Unit<S>>>>>,
    stopped: watch::Receiver<bool>,
}

impl<S> Clone for ActorHandle<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            sender: self.sender.clone(),
            stopped: self.stopped.clone(),
        }
    }
}

impl<S> std::fmt::Debug for ActorHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// Spawn an actor whose state is built by `init`.
///
/// `init` receives the actor's own handle so the state can hand it to
/// timers and I/O tasks that feed work back in.
pub fn spawn<S, F>(name: impl Into<String>, init: F) -> ActorHandle<S>
where
    S: Send + 'static,
    F: FnOnce(ActorHandle<S>) -> S,
{
    let id = NEXT_ACTOR_ID.fetch_add(1, Ordering::Relaxed);
    let name: Arc<str> = Arc::from(name.into());
    let (tx, mut rx) = mpsc::unbounded_channel::<Unit<S>>();
    let (stopped_tx, stopped_rx) = watch::channel(false);

    let handle = ActorHandle {
        id,
        name: name.clone(),
        sender: Arc::new(Mutex::new(Some(tx))),
        stopped: stopped_rx,
    };
    let mut state = init(handle.clone());

    tokio::spawn(CURRENT_ACTOR.scope(id, async move {
        debug!(actor = %name, "Actor started");
        while let Some(unit) = rx.recv().await {
            run_unit(&name, &mut state, unit).await;
        }
        drop(state);
        debug!(actor = %name, "Actor stopped");
        let _ = stopped_tx.send(true);
    }));

    handle
}

async fn run_unit<S>(actor: &str, state: &mut S, unit: Unit<S>) {
    let Unit { name, run } = unit;
    let outcome = AssertUnwindSafe(async { run(state).await })
        .catch_unwind()
        .await;

    if let Err(panic) = outcome {
        error!(
            actor = %actor,
            unit = name,
            panic = %panic_message(panic.as_ref()),
            "Unit panicked"
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl<S: Send + 'static> ActorHandle<S> {
    /// Name given at spawn
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the actor still accepts work
    pub fn is_running(&self) -> bool {
        self.lock_sender().is_some()
    }

    /// Whether the caller is running on this actor's task
    pub fn on_actor(&self) -> bool {
        CURRENT_ACTOR.try_with(|id| *id == self.id).unwrap_or(false)
    }

    fn lock_sender(
        &self,
    ) -> std::sync::MutexGuard<'_, Option<mpsc::UnboundedSender<Unit<S>>>> {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, unit: Unit<S>) -> Result<()> {
        let name = unit.name;
        let guard = self.lock_sender();
        let sender = guard
            .as_ref()
            .ok_or_else(|| Error::stopped(format!("{} refused {}", self.name, name)))?;
        sender
            .send(unit)
            .map_err(|_| Error::stopped(format!("{} refused {}", self.name, name)))
    }

    /// Queue a unit without waiting for it.
    ///
    /// An error returned by the unit is logged on the actor.
    pub fn submit<F>(&self, name: &'static str, job: F) -> Result<()>
    where
        F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, Result<()>> + Send + 'static,
    {
        let actor = self.name.clone();
        self.enqueue(unit(name, move |state| {
            async move {
                if let Err(e) = job(state).await {
                    warn!(actor = %actor, unit = name, error = %e, "Unit failed");
                }
            }
            .boxed()
        }))
    }

    /// Queue a unit and wait for its result.
    ///
    /// Fails with [`Error::Reentrant`] when issued from the actor's own task.
    pub async fn call<R, F>(&self, name: &'static str, job: F) -> Result<R>
    where
        R: Send + 'static,
        F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, Result<R>> + Send + 'static,
    {
        if self.on_actor() {
            return Err(Error::Reentrant(format!(
                "{} called {} from inside the actor",
                self.name, name
            )));
        }

        let (tx, rx) = oneshot::channel();
        self.enqueue(unit(name, move |state| {
            async move {
                let _ = tx.send(job(state).await);
            }
            .boxed()
        }))?;

        rx.await
            .unwrap_or_else(|_| Err(Error::other(format!("{} aborted", name))))
    }

    /// Stop the actor.
    ///
    /// New submissions are refused from this point on. `last` runs after
    /// every unit already queued, and the call returns once the queue has
    /// drained and the state has been dropped. Stopping an actor that is
    /// already stopping only waits for it.
    pub async fn shutdown<F>(&self, name: &'static str, last: F) -> Result<()>
    where
        F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, Result<()>> + Send + 'static,
    {
        if self.on_actor() {
            return Err(Error::Reentrant(format!(
                "{} shut down from inside the actor",
                self.name
            )));
        }

        let (tx, rx) = oneshot::channel();
        let closed = self.close_with(unit(name, move |state| {
            async move {
                let _ = tx.send(last(state).await);
            }
            .boxed()
        }));

        let result = match closed {
            None => Ok(()),
            Some(Ok(())) => rx
                .await
                .unwrap_or_else(|_| Err(Error::other(format!("{} aborted", name)))),
            Some(Err(e)) => Err(e),
        };

        self.stopped().await;
        result
    }

    /// Stop the actor without waiting.
    ///
    /// Same ordering as [`shutdown`](Self::shutdown): new submissions are
    /// refused and `last` runs after everything already queued. Returns
    /// false when the actor was already stopping.
    pub fn close<F>(&self, name: &'static str, last: F) -> bool
    where
        F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, Result<()>> + Send + 'static,
    {
        let actor = self.name.clone();
        let closed = self.close_with(unit(name, move |state| {
            async move {
                if let Err(e) = last(state).await {
                    warn!(actor = %actor, unit = name, error = %e, "Final unit failed");
                }
            }
            .boxed()
        }));
        closed.is_some()
    }

    /// Take the sender, queue `last` and drop the sender so the queue ends
    /// behind it. `None` when the sender was already taken.
    fn close_with(&self, last: Unit<S>) -> Option<Result<()>> {
        let sender = self.lock_sender().take()?;
        let queued = sender
            .send(last)
            .map_err(|_| Error::stopped(format!("{} already exited", self.name)));
        Some(queued)
    }

    /// Wait until the actor task has exited
    pub async fn stopped(&self) {
        let mut stopped = self.stopped.clone();
        let _ = stopped.wait_for(|done| *done).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Default)]
    struct Journal {
        entries: Vec<u32>,
    }

    fn journal() -> ActorHandle<Journal> {
        spawn("journal", |_| Journal::default())
    }

    #[tokio::test]
    async fn test_units_run_in_submission_order() {
        let actor = journal();
        for i in 0..50u32 {
            actor
                .submit("append", move |j| {
                    async move {
                        // yield inside the unit; nothing else may interleave
                        tokio::task::yield_now().await;
                        j.entries.push(i);
                        Ok(())
                    }
                    .boxed()
                })
                .unwrap();
        }

        let entries = actor
            .call("read", |j| async move { Ok(j.entries.clone()) }.boxed())
            .await
            .unwrap();
        assert_eq!(entries, (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_failing_and_panicking_units_do_not_stop_the_actor() {
        let actor = journal();
        actor
            .submit("fail", |_| async { Err(Error::other("boom")) }.boxed())
            .unwrap();
        actor
            .submit("panic", |_| {
                async {
                    let blow_up = true;
                    if blow_up {
                        panic!("unit blew up");
                    }
                    Ok(())
                }
                .boxed()
            })
            .unwrap();

        let err = actor
            .call::<(), _>("fail", |_| async { Err(Error::rejected("nope")) }.boxed())
            .await
            .unwrap_err();
        assert!(err.is_rejected());

        let len = actor
            .call("len", |j| async move { Ok(j.entries.len()) }.boxed())
            .await
            .unwrap();
        assert_eq!(len, 0);
    }

    #[tokio::test]
    async fn test_call_from_inside_the_actor_is_refused() {
        let actor = journal();
        let inner = actor.clone();
        let nested = actor
            .call("outer", move |_| {
                async move {
                    let result = inner.call("inner", |_| async { Ok(()) }.boxed()).await;
                    Ok(matches!(result, Err(Error::Reentrant(_))))
                }
                .boxed()
            })
            .await
            .unwrap();
        assert!(nested);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue_before_last_unit() {
        let actor = journal();
        let (seen_tx, seen_rx) = oneshot::channel();

        for i in 0..10u32 {
            actor
                .submit("append", move |j| {
                    async move {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        j.entries.push(i);
                        Ok(())
                    }
                    .boxed()
                })
                .unwrap();
        }

        actor
            .shutdown("last", move |j| {
                async move {
                    let _ = seen_tx.send(j.entries.clone());
                    Ok(())
                }
                .boxed()
            })
            .await
            .unwrap();

        assert_eq!(seen_rx.await.unwrap(), (0..10).collect::<Vec<_>>());
        assert!(!actor.is_running());
    }

    #[tokio::test]
    async fn test_work_after_shutdown_is_refused() {
        let actor = journal();
        actor
            .shutdown("last", |_| async { Ok(()) }.boxed())
            .await
            .unwrap();

        let err = actor
            .submit("late", |_| async { Ok(()) }.boxed())
            .unwrap_err();
        assert!(matches!(err, Error::Stopped(_)));

        let err = actor
            .call("late", |_| async { Ok(()) }.boxed())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Stopped(_)));

        // second shutdown only waits
        actor
            .shutdown("again", |_| async { Ok(()) }.boxed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_runs_last_unit_without_waiting() {
        let actor = journal();
        let (seen_tx, seen_rx) = oneshot::channel();

        actor
            .submit("append", |j| {
                async move {
                    j.entries.push(7);
                    Ok(())
                }
                .boxed()
            })
            .unwrap();

        assert!(actor.close("last", move |j| {
            async move {
                let _ = seen_tx.send(j.entries.clone());
                Ok(())
            }
            .boxed()
        }));
        assert!(!actor.is_running());
        assert!(!actor.close("again", |_| async { Ok(()) }.boxed()));

        assert_eq!(seen_rx.await.unwrap(), vec![7]);
        tokio::time::timeout(Duration::from_secs(1), actor.stopped())
            .await
            .unwrap();
    }
}
