//! Coalescing of refresh work triggered by server events.
//!
//! Pushed events tend to come in bursts: a schema migration produces one event
//! per altered table, a rolling restart one per node. Every event schedules a
//! refresh here, and refreshes of the same scope that arrive within the
//! debounce window collapse into one execution.

use std::future::Future;
use std::time::Duration;

use futures::future::{BoxFuture, RemoteHandle};
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::errors::MetadataError;

/// What a refresh covers. Equal scopes replace each other in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum RefreshScope {
    /// Node list, and the token map if it is being kept in sync.
    Topology,
    AllKeyspaces,
    Keyspace(String),
    /// A table, type, function or aggregate, identified by `key` inside `keyspace`.
    Object { keyspace: String, key: String },
}

impl RefreshScope {
    /// Whether running a refresh of `self` makes a refresh of `other` redundant.
    fn covers(&self, other: &RefreshScope) -> bool {
        match (self, other) {
            (RefreshScope::AllKeyspaces, RefreshScope::Keyspace(_)) => true,
            (this, other) => this == other,
        }
    }
}

pub(crate) type RefreshHandler =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<(), MetadataError>> + Send>;

/// A unit of refresh work waiting in the debouncer.
pub(crate) struct RefreshEvent {
    scope: RefreshScope,
    handler: RefreshHandler,
}

impl RefreshEvent {
    pub(crate) fn new<F, Fut>(scope: RefreshScope, handler: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), MetadataError>> + Send + 'static,
    {
        Self {
            scope,
            handler: Box::new(move || handler().boxed()),
        }
    }
}

impl std::fmt::Debug for RefreshEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshEvent")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

type Waiter = oneshot::Sender<Result<(), MetadataError>>;

enum Command {
    Schedule {
        event: RefreshEvent,
        immediate: bool,
        waiter: Waiter,
    },
    Shutdown,
}

/// Handle to the dispatch loop. Dropping it stops the loop.
pub(crate) struct EventDebouncer {
    commands: mpsc::UnboundedSender<Command>,
    _worker_handle: RemoteHandle<()>,
}

impl EventDebouncer {
    /// Starts the dispatch loop on the current runtime.
    ///
    /// Every new event postpones the pending batch by `window`, but a batch is
    /// never postponed past `max_delay` after its first event was queued.
    /// A zero `window` runs every event as soon as it arrives.
    pub(crate) fn new(window: Duration, max_delay: Duration) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let worker = DebouncerWorker {
            commands: receiver,
            window,
            max_delay: max_delay.max(window),
            queue: Vec::new(),
            first_enqueued: None,
            deadline: None,
        };

        let (fut, worker_handle) = worker.work().remote_handle();
        tokio::spawn(fut);

        Self {
            commands,
            _worker_handle: worker_handle,
        }
    }

    /// Queues `event`. With `immediate`, the queue is flushed right away,
    /// otherwise the debounce window applies.
    ///
    /// The event is queued before this returns. The returned future resolves
    /// when the refresh that covered it finished, and may be dropped.
    pub(crate) fn schedule_event(
        &self,
        event: RefreshEvent,
        immediate: bool,
    ) -> impl Future<Output = Result<(), MetadataError>> + Send + 'static {
        let (waiter, completion) = oneshot::channel();
        let sent = self.commands.send(Command::Schedule {
            event,
            immediate,
            waiter,
        });
        if let Err(mpsc::error::SendError(_)) = sent {
            trace!("Refresh scheduled after the debouncer stopped");
        }
        // The dispatch loop answers every waiter, a dropped one means it stopped.
        completion.map(|result| result.unwrap_or(Err(MetadataError::Shutdown)))
    }

    /// Runs `event` without waiting for the debounce window and returns its outcome.
    pub(crate) async fn handle_event(&self, event: RefreshEvent) -> Result<(), MetadataError> {
        self.schedule_event(event, true).await
    }

    /// Stops the dispatch loop. Pending and later events fail with [`MetadataError::Shutdown`].
    pub(crate) fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

struct PendingRefresh {
    scope: RefreshScope,
    handler: RefreshHandler,
    waiters: Vec<Waiter>,
}

struct DebouncerWorker {
    commands: mpsc::UnboundedReceiver<Command>,
    window: Duration,
    max_delay: Duration,

    queue: Vec<PendingRefresh>,
    first_enqueued: Option<Instant>,
    deadline: Option<Instant>,
}

impl DebouncerWorker {
    async fn work(mut self) {
        loop {
            let command = match self.deadline {
                Some(deadline) => {
                    tokio::select! {
                        command = self.commands.recv() => command,
                        _ = tokio::time::sleep_until(deadline) => {
                            self.flush().await;
                            continue;
                        }
                    }
                }
                None => self.commands.recv().await,
            };

            match command {
                Some(Command::Schedule {
                    event,
                    immediate,
                    waiter,
                }) => {
                    self.enqueue(event, waiter);
                    if immediate || self.window.is_zero() {
                        self.flush().await;
                    } else {
                        self.postpone();
                    }
                }
                Some(Command::Shutdown) | None => break,
            }
        }

        self.fail_pending();
    }

    fn enqueue(&mut self, event: RefreshEvent, waiter: Waiter) {
        let RefreshEvent { scope, handler } = event;

        if let Some(pending) = self.queue.iter_mut().find(|p| p.scope.covers(&scope)) {
            if pending.scope == scope {
                trace!(?scope, "Replacing queued refresh");
                pending.handler = handler;
            } else {
                trace!(?scope, covered_by = ?pending.scope, "Refresh already covered by a queued one");
            }
            pending.waiters.push(waiter);
            return;
        }

        let mut waiters = vec![waiter];
        self.queue.retain_mut(|pending| {
            if scope.covers(&pending.scope) {
                trace!(scope = ?pending.scope, superseded_by = ?scope, "Dropping superseded refresh");
                waiters.append(&mut pending.waiters);
                false
            } else {
                true
            }
        });
        self.queue.push(PendingRefresh {
            scope,
            handler,
            waiters,
        });
    }

    fn postpone(&mut self) {
        let now = Instant::now();
        let first = *self.first_enqueued.get_or_insert(now);
        self.deadline = Some((now + self.window).min(first + self.max_delay));
    }

    async fn flush(&mut self) {
        self.first_enqueued = None;
        self.deadline = None;
        let batch = std::mem::take(&mut self.queue);
        if batch.is_empty() {
            return;
        }

        debug!(refreshes = batch.len(), "Processing debounced refresh batch");
        for PendingRefresh {
            scope,
            handler,
            waiters,
        } in batch
        {
            let result = handler().await;
            if let Err(error) = &result {
                warn!(?scope, %error, "Refresh failed");
            }
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        }
    }

    fn fail_pending(&mut self) {
        debug!("Event debouncer stopped");
        self.commands.close();
        let queued = std::mem::take(&mut self.queue)
            .into_iter()
            .flat_map(|pending| pending.waiters);
        let unprocessed = std::iter::from_fn(|| self.commands.try_recv().ok()).filter_map(
            |command| match command {
                Command::Schedule { waiter, .. } => Some(waiter),
                Command::Shutdown => None,
            },
        );
        for waiter in queued.chain(unprocessed).collect::<Vec<_>>() {
            let _ = waiter.send(Err(MetadataError::Shutdown));
        }
    }
}
