//! Reactive computations.
//!
//! A `Computation` reruns its function after one of the `Dependency`s it
//! read during its last run reports a change. Reruns are deferred until
//! `Tracker::flush`, so a batch of changes causes one rerun.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use hashbrown::HashMap;

type ComputeFn = Box<dyn FnMut(&Computation)>;
type InvalidateFn = Box<dyn FnOnce(&Computation)>;

struct TrackerInner {
    current: RefCell<Option<Computation>>,
    pending: RefCell<Vec<Computation>>,
    next_id: Cell<u64>,
    flushing: Cell<bool>,
}

/// Scheduler for reactive computations.
///
/// # Example
///
/// ```ignore
/// let tracker = Tracker::new();
/// let dep = Dependency::new();
///
/// let t = tracker.clone();
/// let d = dep.clone();
/// tracker.autorun(move |_| {
///     d.depend(&t);
///     render();
/// });
///
/// dep.changed();
/// tracker.flush(); // render() runs again
/// ```
#[derive(Clone)]
pub struct Tracker {
    inner: Rc<TrackerInner>,
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracker {
    /// Creates a tracker with no computations.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(TrackerInner {
                current: RefCell::new(None),
                pending: RefCell::new(Vec::new()),
                next_id: Cell::new(1),
                flushing: Cell::new(false),
            }),
        }
    }

    /// Runs `f` now and again after every invalidation, until stopped.
    pub fn autorun<F>(&self, f: F) -> Computation
    where
        F: FnMut(&Computation) + 'static,
    {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);

        let computation = Computation {
            inner: Rc::new(ComputationInner {
                id,
                tracker: Rc::downgrade(&self.inner),
                func: RefCell::new(Some(Box::new(f))),
                invalidated: Cell::new(false),
                stopped: Cell::new(false),
                first_run: Cell::new(true),
                on_invalidate: RefCell::new(Vec::new()),
            }),
        };
        self.run(&computation);
        computation.inner.first_run.set(false);
        computation
    }

    /// Returns the computation currently running, if any.
    pub fn current(&self) -> Option<Computation> {
        self.inner.current.borrow().clone()
    }

    /// Returns true while a computation is running.
    pub fn active(&self) -> bool {
        self.inner.current.borrow().is_some()
    }

    /// Runs `f` with no current computation, so nothing it reads is tracked.
    pub fn nonreactive<R>(&self, f: impl FnOnce() -> R) -> R {
        let previous = self.inner.current.borrow_mut().take();
        let result = f();
        *self.inner.current.borrow_mut() = previous;
        result
    }

    /// Returns true if some invalidated computation awaits a rerun.
    pub fn has_pending(&self) -> bool {
        !self.inner.pending.borrow().is_empty()
    }

    /// Reruns invalidated computations until none are left.
    pub fn flush(&self) {
        if self.inner.flushing.get() {
            return;
        }
        self.inner.flushing.set(true);
        loop {
            let batch: Vec<Computation> = self.inner.pending.borrow_mut().drain(..).collect();
            if batch.is_empty() {
                break;
            }
            for computation in batch {
                if computation.inner.invalidated.get() && !computation.inner.stopped.get() {
                    self.run(&computation);
                }
            }
        }
        self.inner.flushing.set(false);
    }

    fn run(&self, computation: &Computation) {
        computation.inner.invalidated.set(false);
        let previous = self.inner.current.replace(Some(computation.clone()));
        let func = computation.inner.func.borrow_mut().take();
        if let Some(mut func) = func {
            func(computation);
            let mut slot = computation.inner.func.borrow_mut();
            if slot.is_none() && !computation.inner.stopped.get() {
                *slot = Some(func);
            }
        }
        *self.inner.current.borrow_mut() = previous;
    }
}

struct ComputationInner {
    id: u64,
    tracker: Weak<TrackerInner>,
    func: RefCell<Option<ComputeFn>>,
    invalidated: Cell<bool>,
    stopped: Cell<bool>,
    first_run: Cell<bool>,
    on_invalidate: RefCell<Vec<InvalidateFn>>,
}

/// A rerunnable unit of reactive work.
#[derive(Clone)]
pub struct Computation {
    inner: Rc<ComputationInner>,
}

impl Computation {
    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// True during the run made by `autorun` itself.
    #[inline]
    pub fn first_run(&self) -> bool {
        self.inner.first_run.get()
    }

    #[inline]
    pub fn invalidated(&self) -> bool {
        self.inner.invalidated.get()
    }

    #[inline]
    pub fn stopped(&self) -> bool {
        self.inner.stopped.get()
    }

    /// Schedules a rerun for the next flush and runs invalidation callbacks.
    pub fn invalidate(&self) {
        if self.inner.invalidated.get() {
            return;
        }
        self.inner.invalidated.set(true);
        if !self.inner.stopped.get() {
            if let Some(tracker) = self.inner.tracker.upgrade() {
                tracker.pending.borrow_mut().push(self.clone());
            }
        }
        let callbacks: Vec<InvalidateFn> = self.inner.on_invalidate.borrow_mut().drain(..).collect();
        for callback in callbacks {
            callback(self);
        }
    }

    /// Stops the computation for good.
    pub fn stop(&self) {
        if self.inner.stopped.replace(true) {
            return;
        }
        self.invalidate();
        self.inner.func.borrow_mut().take();
    }

    /// Registers a callback for the next invalidation. Runs it right away if
    /// the computation is already invalidated.
    pub fn on_invalidate(&self, f: impl FnOnce(&Computation) + 'static) {
        if self.inner.invalidated.get() {
            f(self);
        } else {
            self.inner.on_invalidate.borrow_mut().push(Box::new(f));
        }
    }

    fn downgrade(&self) -> Weak<ComputationInner> {
        Rc::downgrade(&self.inner)
    }
}

/// A reactive data source computations can depend on.
#[derive(Clone, Default)]
pub struct Dependency {
    dependents: Rc<RefCell<HashMap<u64, Weak<ComputationInner>>>>,
}

impl Dependency {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the current computation, if any. Returns true if it was
    /// not already registered.
    pub fn depend(&self, tracker: &Tracker) -> bool {
        let Some(computation) = tracker.current() else {
            return false;
        };
        let id = computation.id();
        if self.dependents.borrow().contains_key(&id) {
            return false;
        }
        self.dependents
            .borrow_mut()
            .insert(id, computation.downgrade());

        let dependents = Rc::downgrade(&self.dependents);
        computation.on_invalidate(move |c| {
            if let Some(dependents) = dependents.upgrade() {
                dependents.borrow_mut().remove(&c.id());
            }
        });
        true
    }

    /// Invalidates every dependent computation.
    pub fn changed(&self) {
        let dependents: Vec<Weak<ComputationInner>> =
            self.dependents.borrow().values().cloned().collect();
        for weak in dependents {
            if let Some(inner) = weak.upgrade() {
                Computation { inner }.invalidate();
            }
        }
    }

    /// Returns true if some computation depends on this source.
    pub fn has_dependents(&self) -> bool {
        !self.dependents.borrow().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_autorun_runs_immediately() {
        let tracker = Tracker::new();
        let runs = Rc::new(Cell::new(0));
        let r = runs.clone();
        let c = tracker.autorun(move |c| {
            assert!(c.first_run());
            r.set(r.get() + 1);
        });
        assert_eq!(runs.get(), 1);
        assert!(!c.first_run());
        assert!(!tracker.active());
    }

    #[test]
    fn test_rerun_waits_for_flush() {
        let tracker = Tracker::new();
        let dep = Dependency::new();
        let runs = Rc::new(Cell::new(0));

        let (t, d, r) = (tracker.clone(), dep.clone(), runs.clone());
        tracker.autorun(move |_| {
            d.depend(&t);
            r.set(r.get() + 1);
        });

        dep.changed();
        dep.changed();
        assert_eq!(runs.get(), 1);
        assert!(tracker.has_pending());

        tracker.flush();
        assert_eq!(runs.get(), 2);
        assert!(!tracker.has_pending());
    }

    #[test]
    fn test_stop_prevents_rerun() {
        let tracker = Tracker::new();
        let dep = Dependency::new();
        let runs = Rc::new(Cell::new(0));

        let (t, d, r) = (tracker.clone(), dep.clone(), runs.clone());
        let c = tracker.autorun(move |_| {
            d.depend(&t);
            r.set(r.get() + 1);
        });
        c.stop();
        dep.changed();
        tracker.flush();
        assert_eq!(runs.get(), 1);
        assert!(c.stopped());
        assert!(!dep.has_dependents());
    }

    #[test]
    fn test_on_invalidate() {
        let tracker = Tracker::new();
        let fired = Rc::new(Cell::new(false));
        let c = tracker.autorun(|_| {});

        let f = fired.clone();
        c.on_invalidate(move |_| f.set(true));
        assert!(!fired.get());
        c.invalidate();
        assert!(fired.get());
    }

    #[test]
    fn test_depend_outside_computation() {
        let tracker = Tracker::new();
        let dep = Dependency::new();
        assert!(!dep.depend(&tracker));
        assert!(!dep.has_dependents());
    }

    #[test]
    fn test_nonreactive_hides_current() {
        let tracker = Tracker::new();
        let dep = Dependency::new();
        let (t, d) = (tracker.clone(), dep.clone());
        tracker.autorun(move |_| {
            let registered = t.nonreactive(|| d.depend(&t));
            assert!(!registered);
            assert!(t.active());
        });
        assert!(!dep.has_dependents());
    }

    #[test]
    fn test_nested_autorun_restores_current() {
        let tracker = Tracker::new();
        let t = tracker.clone();
        tracker.autorun(move |outer| {
            let outer_id = outer.id();
            t.autorun(|_| {});
            assert_eq!(t.current().map(|c| c.id()), Some(outer_id));
        });
    }

    #[test]
    fn test_dependency_reregisters_after_rerun() {
        let tracker = Tracker::new();
        let dep = Dependency::new();
        let runs = Rc::new(Cell::new(0));

        let (t, d, r) = (tracker.clone(), dep.clone(), runs.clone());
        tracker.autorun(move |_| {
            d.depend(&t);
            r.set(r.get() + 1);
        });

        for expected in 2..5 {
            dep.changed();
            tracker.flush();
            assert_eq!(runs.get(), expected);
        }
    }
}
