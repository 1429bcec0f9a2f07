//! Time-batched event bus.
//!
//! `emit` only records the latest payload per event name. A scheduler task
//! drains those records once per flush interval and broadcasts one
//! notification per name, so a burst of emissions turns into a single
//! delivery carrying the last payload.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// emitted after a batch of author names was resolved
pub const AUTHORS_CHANGED: &str = "authors-changed";

/// emitted after the friend set was replaced
pub const FRIENDS_CHANGED: &str = "friends-changed";

/// a receiver of the payloads delivered for one event name
pub type Subscription = broadcast::Receiver<Value>;

enum Command {
    Emit { name: String, payload: Value },
    Flush(oneshot::Sender<()>),
}

type Channels = Arc<Mutex<HashMap<String, broadcast::Sender<Value>>>>;

/// handle to the event bus; clones share the same scheduler
#[derive(Clone)]
pub struct EventBus {
    command_tx: mpsc::UnboundedSender<Command>,
    halt_tx: Arc<watch::Sender<bool>>,
    channels: Channels,
    channel_capacity: usize,
    scheduler: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl EventBus {
    /// start a bus whose scheduler flushes every `flush_interval`
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(flush_interval: Duration, channel_capacity: usize) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (halt_tx, halt_rx) = watch::channel(false);
        let channels: Channels = Arc::default();

        let join_handle = tokio::spawn(scheduler(
            flush_interval,
            command_rx,
            halt_rx,
            Arc::clone(&channels),
        ));

        EventBus {
            command_tx,
            halt_tx: Arc::new(halt_tx),
            channels,
            channel_capacity: channel_capacity.max(1),
            scheduler: Arc::new(Mutex::new(Some(join_handle))),
        }
    }

    /// queue `payload` for `name`, replacing anything not yet flushed for it
    pub fn emit(&self, name: &str, payload: Value) {
        let command = Command::Emit {
            name: name.to_string(),
            payload,
        };
        if self.command_tx.send(command).is_err() {
            tracing::warn!("event bus: {} emitted after shutdown, dropped", name);
        }
    }

    /// receive every future notification for `name`
    pub fn subscribe(&self, name: &str) -> Subscription {
        self.channels
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
            .subscribe()
    }

    /// call `handler` with the payload of every future notification for `name`
    ///
    /// The handler lives until the bus shuts down.
    pub fn on<F, Fut>(&self, name: &str, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(Value) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut rx = self.subscribe(name);
        let name = name.to_string();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => handler(payload).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            "event bus: handler for {} skipped {} notifications",
                            name,
                            skipped
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!("event bus: handler for {} terminates", name);
        })
    }

    /// dispatch everything pending now instead of waiting for the next tick
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.command_tx.send(Command::Flush(done_tx)).is_ok() {
            // the scheduler dropping the sender means it halted, nothing left to wait for
            let _ = done_rx.await;
        }
    }

    /// flush what is pending and stop the scheduler
    pub async fn shutdown(&self) {
        let _ = self.halt_tx.send(true);
        let join_handle = self.scheduler.lock().take();
        if let Some(join_handle) = join_handle {
            if let Err(err) = join_handle.await {
                tracing::warn!("event bus: scheduler failed: {}", err);
            }
        }
    }
}

async fn scheduler(
    flush_interval: Duration,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
    mut halt_rx: watch::Receiver<bool>,
    channels: Channels,
) {
    let mut pending: HashMap<String, Value> = HashMap::new();
    let mut ticker = time::interval_at(Instant::now() + flush_interval, flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut halt = *halt_rx.borrow();

    while !halt {
        // tick first: a backed-up command queue must not hold back the flush
        tokio::select! {
            biased;
            _ = ticker.tick() => dispatch(&mut pending, &channels),
            changed = halt_rx.changed() => halt = changed.is_err() || *halt_rx.borrow(),
            command = command_rx.recv() => match command {
                Some(Command::Emit { name, payload }) => {
                    pending.insert(name, payload);
                }
                Some(Command::Flush(done_tx)) => {
                    dispatch(&mut pending, &channels);
                    let _ = done_tx.send(());
                }
                None => halt = true,
            },
        }
    }

    // emissions queued before the halt still go out
    command_rx.close();
    while let Some(command) = command_rx.recv().await {
        match command {
            Command::Emit { name, payload } => {
                pending.insert(name, payload);
            }
            Command::Flush(done_tx) => {
                let _ = done_tx.send(());
            }
        }
    }
    dispatch(&mut pending, &channels);

    // closing the channels ends every `on` handler
    channels.lock().clear();
    tracing::debug!("event bus: scheduler terminates");
}

fn dispatch(pending: &mut HashMap<String, Value>, channels: &Channels) {
    if pending.is_empty() {
        return;
    }
    let channels = channels.lock();
    for (name, payload) in pending.drain() {
        match channels.get(&name) {
            Some(tx) => {
                let delivered = tx.send(payload).unwrap_or(0);
                tracing::debug!("event bus: {} delivered to {} subscribers", name, delivered);
            }
            None => tracing::debug!("event bus: {} has no subscribers", name),
        }
    }
}
