//! Write fences.
//!
//! A fence collects the writes made on behalf of one method invocation.
//! Once armed, it fires when every write begun on it has been committed:
//! first its before-fire callbacks run (they may begin more writes), then
//! its completion callbacks run, once, in registration order.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use livedata_core::{Error, Result};
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::oneshot;

type FenceCallback = Box<dyn FnOnce() + Send>;

tokio::task_local! {
    static CURRENT_FENCE: Arc<WriteFence>;
}

/// Runs `future` with `fence` as the task's current fence.
pub async fn with_fence<F: Future>(fence: Arc<WriteFence>, future: F) -> F::Output {
    CURRENT_FENCE.scope(fence, future).await
}

/// Returns the fence of the running task, if any.
pub fn current_fence() -> Option<Arc<WriteFence>> {
    CURRENT_FENCE.try_with(Arc::clone).ok()
}

#[derive(Default)]
struct FenceState {
    armed: bool,
    fired: bool,
    retired: bool,
    outstanding: usize,
    before_fire: Vec<FenceCallback>,
    completion: Vec<FenceCallback>,
}

/// Barrier that holds back "writes done" until every write's downstream
/// notifications were processed.
#[derive(Default)]
pub struct WriteFence {
    state: Mutex<FenceState>,
    warning_timeout: Option<Duration>,
}

impl WriteFence {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates a fence whose [`arm_and_wait`](WriteFence::arm_and_wait)
    /// logs a warning every `timeout` while it stays unfired.
    pub fn with_warning_timeout(timeout: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FenceState::default()),
            warning_timeout: timeout,
        })
    }

    /// Registers a pending write.
    ///
    /// On a retired fence the returned write is inert. Beginning a write on
    /// a fence that already fired is an error: the write belongs to a later
    /// fence.
    pub fn begin_write(self: &Arc<Self>) -> Result<FenceWrite> {
        let mut state = self.state.lock();
        if state.retired {
            return Ok(FenceWrite::inert());
        }
        if state.fired {
            return Err(Error::fence(
                "fence has already activated, too late to add writes",
            ));
        }
        state.outstanding += 1;
        Ok(FenceWrite {
            fence: Some(self.clone()),
        })
    }

    /// Allows the fence to fire once all outstanding writes are committed.
    ///
    /// A task may not arm its own current fence: its writes would still be
    /// able to join it.
    pub fn arm(self: &Arc<Self>) -> Result<()> {
        if current_fence().map_or(false, |current| Arc::ptr_eq(&current, self)) {
            return Err(Error::fence("can't arm the current fence"));
        }
        let mut state = self.state.lock();
        state.armed = true;
        self.maybe_fire(state)
    }

    /// Registers a callback that runs when the fence is about to fire.
    pub fn on_before_fire(&self, f: impl FnOnce() + Send + 'static) -> Result<()> {
        let mut state = self.state.lock();
        if state.fired {
            return Err(Error::fence("fence has already activated"));
        }
        state.before_fire.push(Box::new(f));
        Ok(())
    }

    /// Registers a callback that runs when the fence fires.
    pub fn on_all_committed(&self, f: impl FnOnce() + Send + 'static) -> Result<()> {
        let mut state = self.state.lock();
        if state.fired {
            return Err(Error::fence("fence has already activated"));
        }
        state.completion.push(Box::new(f));
        Ok(())
    }

    /// Arms the fence and waits until it fires.
    pub async fn arm_and_wait(self: &Arc<Self>) -> Result<()> {
        let (tx, mut rx) = oneshot::channel();
        self.on_all_committed(move || {
            let _ = tx.send(());
        })?;
        self.arm()?;

        let Some(timeout) = self.warning_timeout else {
            return rx.await.map_err(|_| Error::fence("fence dropped before firing"));
        };
        loop {
            match tokio::time::timeout(timeout, &mut rx).await {
                Ok(fired) => return fired.map_err(|_| Error::fence("fence dropped before firing")),
                Err(_) => log::warn!(
                    "write fence still waiting for {} write(s) after {:?}",
                    self.outstanding(),
                    timeout
                ),
            }
        }
    }

    /// Marks a fired fence as finished; later writes against it are ignored.
    pub fn retire(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.fired {
            return Err(Error::fence("can't retire a fence that hasn't fired"));
        }
        state.retired = true;
        Ok(())
    }

    pub fn fired(&self) -> bool {
        self.state.lock().fired
    }

    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }

    fn committed(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.retired {
            return Ok(());
        }
        if state.outstanding == 0 {
            return Err(Error::invariant("write fence committed more writes than it began"));
        }
        state.outstanding -= 1;
        self.maybe_fire(state)
    }

    fn maybe_fire(&self, mut state: MutexGuard<'_, FenceState>) -> Result<()> {
        if state.fired {
            return Err(Error::fence("write fence already activated"));
        }
        if !state.armed || state.outstanding > 0 {
            return Ok(());
        }

        // Holding one write keeps a concurrent commit from firing while the
        // before-fire callbacks run unlocked.
        state.outstanding += 1;
        loop {
            let callbacks = std::mem::take(&mut state.before_fire);
            if callbacks.is_empty() {
                break;
            }
            MutexGuard::unlocked(&mut state, || {
                for callback in callbacks {
                    callback();
                }
            });
        }
        state.outstanding -= 1;
        if state.outstanding > 0 {
            return Ok(());
        }

        state.fired = true;
        let completion = std::mem::take(&mut state.completion);
        drop(state);
        for callback in completion {
            callback();
        }
        Ok(())
    }
}

/// One pending write on a fence.
///
/// Consumed by [`committed`](FenceWrite::committed). A write dropped
/// without being committed keeps its fence from ever firing.
#[must_use = "an uncommitted write keeps its fence from firing"]
pub struct FenceWrite {
    fence: Option<Arc<WriteFence>>,
}

impl FenceWrite {
    /// A write attached to no fence.
    pub fn inert() -> Self {
        Self { fence: None }
    }

    pub fn committed(mut self) -> Result<()> {
        match self.fence.take() {
            Some(fence) => fence.committed(),
            None => Ok(()),
        }
    }
}

impl Drop for FenceWrite {
    fn drop(&mut self) {
        if self.fence.is_some() {
            log::warn!("fence write dropped without being committed");
        }
    }
}
