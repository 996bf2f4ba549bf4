//! Queueing and threading for the software backend.
//!
//! Each context gets one dispatcher thread draining a bounded channel, so
//! work on a context runs strictly in submission order and the frontend
//! blocks once `max_draws_in_flight` items are queued. Pixel work inside an
//! item fans out over a shared rayon pool.

use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::config::EngineConfig;
use crate::lock;
use crate::state::viewport::Rect;

use super::soft::{ApiState, Executor};
use super::{AttachmentMask, BackendContextId, ClearValues, DrawCall, TileState};

pub(super) enum WorkItem {
    Draw {
        state: Arc<ApiState>,
        call: DrawCall,
    },
    Clear {
        state: Arc<ApiState>,
        mask: AttachmentMask,
        values: ClearValues,
        rect: Rect,
    },
    StoreTiles {
        state: Arc<ApiState>,
        mask: AttachmentMask,
        post: TileState,
        rect: Rect,
    },
    InvalidateTiles {
        state: Arc<ApiState>,
        mask: AttachmentMask,
        rect: Rect,
    },
    Sync {
        value: u64,
        callback: Box<dyn FnOnce() + Send>,
    },
    /// Signals once everything queued before it has run.
    Barrier(SyncSender<()>),
    Shutdown,
}

impl WorkItem {
    fn name(&self) -> &'static str {
        match self {
            WorkItem::Draw { .. } => "draw",
            WorkItem::Clear { .. } => "clear",
            WorkItem::StoreTiles { .. } => "store_tiles",
            WorkItem::InvalidateTiles { .. } => "invalidate_tiles",
            WorkItem::Sync { .. } => "sync",
            WorkItem::Barrier(_) => "barrier",
            WorkItem::Shutdown => "shutdown",
        }
    }
}

/// Build the pixel pool, or `None` when work should run on the calling
/// thread.
pub(super) fn build_pool(config: &EngineConfig) -> Option<Arc<rayon::ThreadPool>> {
    let threads = config.worker_threads();
    if threads == 0 {
        return None;
    }
    let topology = config.topology;
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(move |i| format!("kiln-raster-n{}-{i}", topology.node_of(i, threads)))
        .build();
    match pool {
        Ok(pool) => {
            tracing::debug!(
                threads,
                numa_nodes = topology.max_numa_nodes.max(1),
                "started raster worker pool"
            );
            Some(Arc::new(pool))
        }
        Err(err) => {
            tracing::warn!(threads, error = %err, "failed to build raster worker pool; rendering on dispatcher threads");
            None
        }
    }
}

/// Run one item against a context's executor.
pub(super) fn process(executor: &Mutex<Executor>, item: WorkItem) {
    match item {
        WorkItem::Sync { value, callback } => {
            tracing::trace!(value, "sync reached");
            callback();
        }
        WorkItem::Barrier(done) => {
            let _ = done.send(());
        }
        WorkItem::Shutdown => {}
        item => lock(executor).execute(item),
    }
}

enum Mode {
    Threaded {
        sender: SyncSender<WorkItem>,
        thread: Mutex<Option<JoinHandle<()>>>,
    },
    Inline,
}

/// Ordered work queue of one backend context.
pub(super) struct ContextQueue {
    ctx: BackendContextId,
    mode: Mode,
    executor: Arc<Mutex<Executor>>,
}

impl ContextQueue {
    pub(super) fn new(
        ctx: BackendContextId,
        executor: Executor,
        depth: usize,
        inline: bool,
    ) -> Self {
        let executor = Arc::new(Mutex::new(executor));
        let mode = if inline {
            Mode::Inline
        } else {
            spawn_dispatcher(ctx, Arc::clone(&executor), depth)
        };
        Self {
            ctx,
            mode,
            executor,
        }
    }

    pub(super) fn push(&self, item: WorkItem) {
        match &self.mode {
            Mode::Inline => process(&self.executor, item),
            Mode::Threaded { sender, .. } => {
                if let Err(mpsc::SendError(item)) = sender.send(item) {
                    // Dispatcher is gone (it panicked). Keep completion
                    // callbacks flowing so fences still advance.
                    tracing::error!(ctx = self.ctx.0, item = item.name(), "dispatcher thread is gone; running work inline");
                    process(&self.executor, item);
                }
            }
        }
    }

    /// Block until everything queued so far has run.
    pub(super) fn barrier(&self) {
        if let Mode::Threaded { .. } = self.mode {
            let (tx, rx) = mpsc::sync_channel(1);
            self.push(WorkItem::Barrier(tx));
            let _ = rx.recv();
        }
    }

    /// Exclusive access to the executor. Only meaningful after [`Self::barrier`].
    pub(super) fn executor(&self) -> &Mutex<Executor> {
        &self.executor
    }

    /// Drain queued work and stop the dispatcher.
    pub(super) fn shutdown(&self) {
        if let Mode::Threaded { sender, thread } = &self.mode {
            let _ = sender.send(WorkItem::Shutdown);
            if let Some(handle) = lock(thread).take() {
                if handle.join().is_err() {
                    tracing::error!(ctx = self.ctx.0, "dispatcher thread panicked");
                }
            }
        }
    }
}

fn spawn_dispatcher(ctx: BackendContextId, executor: Arc<Mutex<Executor>>, depth: usize) -> Mode {
    let (sender, receiver) = mpsc::sync_channel(depth.max(1));
    let spawned = std::thread::Builder::new()
        .name(format!("kiln-ctx-{}", ctx.0))
        .spawn(move || dispatch(ctx, &executor, receiver));
    match spawned {
        Ok(handle) => Mode::Threaded {
            sender,
            thread: Mutex::new(Some(handle)),
        },
        Err(err) => {
            tracing::warn!(ctx = ctx.0, error = %err, "failed to spawn dispatcher thread; executing inline");
            Mode::Inline
        }
    }
}

fn dispatch(ctx: BackendContextId, executor: &Mutex<Executor>, receiver: Receiver<WorkItem>) {
    tracing::debug!(ctx = ctx.0, "dispatcher started");
    while let Ok(item) = receiver.recv() {
        if matches!(item, WorkItem::Shutdown) {
            break;
        }
        process(executor, item);
    }
    tracing::debug!(ctx = ctx.0, "dispatcher stopped");
}

impl Drop for ContextQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
