//! The underlying event-loop primitive the scheduler pumps onto.
//!
//! The scheduler never runs callbacks itself; it posts a drain closure to a
//! [`MainTaskRunner`] and the environment decides when that closure runs.
//! Production code uses [`TokioMainThread`], whose driver future executes
//! posted closures one at a time; tests use
//! [`crate::testing::ManualTaskRunner`].

use core::time::Duration;

use anyhow::{Context as _, Error};
use log::warn;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::time::sleep;

use crate::task::TaskClosure;

/// Ground truth for posting work to the main thread. Implementations must
/// run posted closures on exactly one thread, in post order for immediate
/// posts.
pub trait MainTaskRunner: Send + Sync {
    fn post(&self, task: TaskClosure);
    fn post_delayed(&self, task: TaskClosure, delay: Duration);
}

/// Tokio-backed main-thread runner. Posting sends on an unbounded channel;
/// the paired [`MainThreadDriver`] drains it.
pub struct TokioMainThread {
    sender: UnboundedSender<TaskClosure>,
    handle: Handle,
}

impl TokioMainThread {
    /// Creates the runner and its driver.
    ///
    /// # Errors
    ///
    /// Fails when called outside a tokio runtime, which is needed to spawn
    /// delayed posts.
    pub fn new() -> Result<(Self, MainThreadDriver), Error> {
        let handle =
            Handle::try_current().context("TokioMainThread requires a running tokio runtime")?;
        let (sender, receiver) = unbounded_channel();
        Ok((Self { sender, handle }, MainThreadDriver { receiver }))
    }
}

impl MainTaskRunner for TokioMainThread {
    fn post(&self, task: TaskClosure) {
        if self.sender.send(task).is_err() {
            warn!("task posted after the main thread driver stopped");
        }
    }

    fn post_delayed(&self, task: TaskClosure, delay: Duration) {
        let sender = self.sender.clone();
        drop(self.handle.spawn(async move {
            sleep(delay).await;
            if sender.send(task).is_err() {
                warn!("delayed task fired after the main thread driver stopped");
            }
        }));
    }
}

/// Drains and executes posted closures. Await [`MainThreadDriver::run`]
/// from a single task; that task becomes the scheduler's main thread.
pub struct MainThreadDriver {
    receiver: UnboundedReceiver<TaskClosure>,
}

impl MainThreadDriver {
    /// Runs until every [`TokioMainThread`] handle has been dropped.
    pub async fn run(mut self) {
        while let Some(task) = self.receiver.recv().await {
            task();
        }
    }
}
