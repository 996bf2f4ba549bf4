//! Per-context completion counter with attached deferred work.
//!
//! `write` counts submissions, `read` counts completions. The backend reports
//! completions in submission order, so `read == n` means everything submitted
//! at or before `n` has finished. Work attached to the fence is tagged with
//! the submission that will cover it (`write + 1` at attach time) and runs
//! once `read` reaches that value.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::backend::{Backend, BackendContextId};
use crate::lock;
use crate::resource::Resource;
use crate::scratch::ScratchBuffer;
use crate::shader::{CompiledVariant, ShaderObject};
use crate::stats::EngineStats;

/// Something to release once in-flight rendering can no longer reference it.
pub enum DeferredWork {
    /// A scratch buffer replaced by a larger one.
    FreeScratch(Arc<ScratchBuffer>),
    /// Drop every compiled variant owned by a deleted shader object.
    ReleaseShader(Arc<ShaderObject>),
    /// Compiled variants that are not owned by a shader object (blend, fetch).
    ReleaseVariants(Vec<CompiledVariant>),
    /// Release the engine-owned storage of a destroyed resource.
    FreeResource(Resource),
    Callback(Box<dyn FnOnce() + Send>),
}

impl DeferredWork {
    pub fn callback(f: impl FnOnce() + Send + 'static) -> Self {
        DeferredWork::Callback(Box::new(f))
    }

    pub fn run(self) {
        match self {
            DeferredWork::FreeScratch(buffer) => {
                tracing::debug!(
                    buffer = buffer.id(),
                    capacity = buffer.capacity(),
                    "freeing retired scratch buffer"
                );
                drop(buffer);
            }
            DeferredWork::ReleaseShader(shader) => shader.release_variants(),
            DeferredWork::ReleaseVariants(variants) => drop(variants),
            DeferredWork::FreeResource(resource) => resource.release_storage(),
            DeferredWork::Callback(f) => f(),
        }
    }
}

impl fmt::Debug for DeferredWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeferredWork::FreeScratch(buffer) => {
                f.debug_tuple("FreeScratch").field(&buffer.id()).finish()
            }
            DeferredWork::ReleaseShader(shader) => {
                f.debug_tuple("ReleaseShader").field(&shader.id()).finish()
            }
            DeferredWork::ReleaseVariants(variants) => f
                .debug_tuple("ReleaseVariants")
                .field(&variants.len())
                .finish(),
            DeferredWork::FreeResource(resource) => {
                f.debug_tuple("FreeResource").field(&resource.id()).finish()
            }
            DeferredWork::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// Attach `work` to `fence`, or run it right away when there is no fence.
///
/// Running inline is deliberate: a caller without an active fence still needs
/// its resource released.
pub fn defer(fence: Option<&Fence>, work: DeferredWork) {
    match fence {
        Some(fence) => fence.attach(work),
        None => work.run(),
    }
}

/// A fence together with the backend context that completes it.
#[derive(Clone, Copy)]
pub struct FenceLink<'a> {
    pub fence: &'a Arc<Fence>,
    pub backend: &'a dyn Backend,
    pub ctx: BackendContextId,
}

impl<'a> FenceLink<'a> {
    pub fn new(fence: &'a Arc<Fence>, backend: &'a dyn Backend, ctx: BackendContextId) -> Self {
        Self {
            fence,
            backend,
            ctx,
        }
    }

    pub fn submit(&self) -> u64 {
        self.fence.submit(self.backend, self.ctx)
    }

    /// Submit, then wait for everything submitted so far.
    pub fn flush_and_finish(&self) {
        self.submit();
        self.fence.finish();
    }

    /// Wait until `value` completes, submitting first if `value` is the
    /// not-yet-issued next submission.
    pub fn wait_for(&self, value: u64) {
        if value > self.fence.write() {
            self.submit();
        }
        self.fence.wait_for(value);
    }
}

struct PendingWork {
    target: u64,
    work: DeferredWork,
}

pub struct Fence {
    write: AtomicU64,
    read: AtomicU64,
    /// Ordered by `target`. Attach and submit both hold this lock, which keeps
    /// targets non-decreasing from front to back.
    queue: Mutex<VecDeque<PendingWork>>,
    stats: Option<Arc<EngineStats>>,
}

impl Fence {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    pub fn with_stats(stats: Arc<EngineStats>) -> Arc<Self> {
        Arc::new(Self::build(Some(stats)))
    }

    fn build(stats: Option<Arc<EngineStats>>) -> Self {
        Self {
            write: AtomicU64::new(0),
            read: AtomicU64::new(0),
            queue: Mutex::new(VecDeque::new()),
            stats,
        }
    }

    /// Value of the most recent submission.
    pub fn write(&self) -> u64 {
        self.write.load(Ordering::Acquire)
    }

    /// Value of the most recent completion.
    pub fn read(&self) -> u64 {
        self.read.load(Ordering::Acquire)
    }

    pub fn is_done(&self) -> bool {
        self.read() >= self.write()
    }

    pub fn is_pending(&self) -> bool {
        !self.is_done()
    }

    /// Deferred work items not yet run.
    pub fn queued_work(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn attach(&self, work: DeferredWork) {
        let mut queue = lock(&self.queue);
        let target = self.write.load(Ordering::Acquire) + 1;
        queue.push_back(PendingWork { target, work });
    }

    /// Start a new submission and ask the backend to report when everything
    /// queued before it has finished.
    pub fn submit(self: &Arc<Self>, backend: &dyn Backend, ctx: BackendContextId) -> u64 {
        let value = {
            let _queue = lock(&self.queue);
            self.write.fetch_add(1, Ordering::AcqRel) + 1
        };
        if let Some(stats) = &self.stats {
            stats.inc_fence_submits();
        }
        tracing::debug!(ctx = ctx.0, value, "fence submit");

        // The backend may complete inline (single-threaded mode), so no lock
        // can be held across this call.
        let fence = Arc::clone(self);
        backend.sync(ctx, value, Box::new(move || fence.complete(value)));
        value
    }

    /// Completion notification for submission `value`.
    ///
    /// Runs every queued item tagged at or below `value`, in attach order, and
    /// only then publishes the new `read` value so a waiter that observes it
    /// also observes the work as done.
    pub fn complete(&self, value: u64) {
        let write = self.write();
        assert!(
            value <= write,
            "fence completion {value} is ahead of the last submission {write}"
        );

        let ready: Vec<DeferredWork> = {
            let mut queue = lock(&self.queue);
            let split = queue
                .iter()
                .position(|pending| pending.target > value)
                .unwrap_or(queue.len());
            queue.drain(..split).map(|pending| pending.work).collect()
        };

        let ran = ready.len() as u64;
        for work in ready {
            work.run();
        }
        if let Some(stats) = &self.stats {
            stats.add_deferred_work_run(ran);
        }

        self.read.fetch_max(value, Ordering::AcqRel);
    }

    /// Yield until `read` reaches `value`.
    pub fn wait_for(&self, value: u64) {
        let write = self.write();
        assert!(
            value <= write,
            "waiting on fence value {value} that was never submitted (write = {write})"
        );
        while self.read() < value {
            std::thread::yield_now();
        }
    }

    /// Yield until every submission so far has completed.
    pub fn finish(&self) {
        self.wait_for(self.write());
    }

    /// Run every queued item regardless of its target. Only valid after a
    /// [`Fence::finish`] with nothing left to submit, e.g. at context teardown.
    pub fn run_all_deferred(&self) {
        let drained: Vec<DeferredWork> = lock(&self.queue)
            .drain(..)
            .map(|pending| pending.work)
            .collect();
        let ran = drained.len() as u64;
        for work in drained {
            work.run();
        }
        if let Some(stats) = &self.stats {
            stats.add_deferred_work_run(ran);
        }
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        let queue = self
            .queue
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if queue.is_empty() {
            return;
        }
        tracing::warn!(
            pending = queue.len(),
            "fence dropped with deferred work attached; running it now"
        );
        for pending in queue.drain(..) {
            pending.work.run();
        }
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("write", &self.write())
            .field("read", &self.read())
            .field("queued_work", &self.queued_work())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::RecordingBackend;
    use std::sync::atomic::AtomicUsize;

    fn counter_work(counter: &Arc<AtomicUsize>) -> DeferredWork {
        let counter = Arc::clone(counter);
        DeferredWork::callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn null_fence_runs_work_inline() {
        let counter = Arc::new(AtomicUsize::new(0));
        defer(None, counter_work(&counter));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn work_waits_for_the_covering_submission() {
        let backend = RecordingBackend::deferred();
        let ctx = BackendContextId(1);
        let fence = Fence::new();
        let counter = Arc::new(AtomicUsize::new(0));

        fence.attach(counter_work(&counter));
        let first = fence.submit(&backend, ctx);
        assert_eq!(first, 1);
        assert!(fence.is_pending());

        // Attached after submission 1, so it belongs to submission 2.
        fence.attach(counter_work(&counter));
        backend.complete_next();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(fence.read(), 1);
        assert!(fence.is_done());
        assert_eq!(fence.queued_work(), 1);

        fence.submit(&backend, ctx);
        backend.complete_next();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(fence.queued_work(), 0);
    }

    #[test]
    fn deferred_work_runs_in_attach_order() {
        let backend = RecordingBackend::inline();
        let fence = Fence::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = Arc::clone(&order);
            fence.attach(DeferredWork::callback(move || order.lock().unwrap().push(i)));
        }
        fence.submit(&backend, BackendContextId(7));
        fence.finish();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn dropping_a_fence_never_leaks_work() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let fence = Fence::new();
            fence.attach(counter_work(&counter));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "never submitted")]
    fn waiting_on_an_unsubmitted_value_panics() {
        Fence::new().wait_for(3);
    }
}
