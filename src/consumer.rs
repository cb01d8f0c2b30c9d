// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Multi-Queue Consumer Supervisor
//!
//! This module provides [`ConsumerSupervisor`], which runs one independent
//! consumption loop per registered `(queue, handler)` binding on top of a
//! [`ChannelSupervisor`]. Loops progress fully independently: a failing or
//! crashing handler on one binding never affects delivery processing on
//! another.
//!
//! Every delivery reaches exactly one disposition: handler success
//! acknowledges it, handler failure (including a recovered panic) rejects it
//! back to its queue for redelivery. When a delivery stream ends because the
//! channel was closed, re-dialed or the consumer cancelled, the owning loop
//! waits a fixed backoff and re-attaches against whatever channel the
//! [`ChannelSupervisor`] has re-established by then.
//!
//! Shutdown is drain-complete: [`ConsumerSupervisor::stop`] cancels every
//! consumer, waits for all loops to exit and closes the channel before the
//! returned completion token fires. A loop that is mid-handler finishes its
//! current delivery first; cancellation is only observed at loop boundaries.

use crate::{
    channel::ChannelSupervisor,
    connection::SharedConnection,
    errors::AmqpError,
    handler::{ConsumerHandler, HandlerError},
};
use futures_util::{FutureExt, StreamExt};
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicRejectOptions},
};
use std::{
    any::Any,
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};
use tokio::{task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Fixed wait before a loop re-attempts `consume` after a failure or after
/// its delivery stream ends while the supervisor is still running
pub const CONSUME_BACKOFF: Duration = Duration::from_secs(15);

/// Global sequence feeding consumer tag suffixes. Tags stay unique across
/// supervisors and across repeated registrations of the same label.
static CONSUMER_SEQ: AtomicU64 = AtomicU64::new(0);

fn next_consumer_tag(label: &str) -> String {
    let seq = CONSUMER_SEQ.fetch_add(1, Ordering::Relaxed) + 1;
    format!("{}-{}", label, seq)
}

/// Lifecycle of the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Mutex-guarded state machine with only the legal transitions
/// `Idle -> Running -> Stopping -> Stopped`; illegal transitions are no-ops.
struct Lifecycle {
    state: Mutex<State>,
}

impl Lifecycle {
    fn new() -> Lifecycle {
        Lifecycle {
            state: Mutex::new(State::Idle),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `Idle -> Running`; returns false when the supervisor already started.
    fn begin_start(&self) -> bool {
        let mut state = self.lock();
        match *state {
            State::Idle => {
                *state = State::Running;
                true
            }
            _ => false,
        }
    }

    /// `Idle | Running -> Stopping`; returns false when a stop is already
    /// underway or finished, so only one shutdown sequence ever runs.
    fn begin_stop(&self) -> bool {
        let mut state = self.lock();
        match *state {
            State::Idle | State::Running => {
                *state = State::Stopping;
                true
            }
            State::Stopping | State::Stopped => false,
        }
    }

    fn finish_stop(&self) {
        *self.lock() = State::Stopped;
    }

    fn is_running(&self) -> bool {
        *self.lock() == State::Running
    }

    #[cfg(test)]
    fn current(&self) -> State {
        *self.lock()
    }
}

/// One registered `(queue, handler)` pair.
struct ConsumerBinding {
    queue: String,
    handler: Arc<dyn ConsumerHandler>,
}

/// Runs and supervises the consumption loops of all registered bindings.
///
/// Construct with [`ConsumerSupervisor::new`], register bindings, then call
/// [`ConsumerSupervisor::start`]. The registry is effectively frozen at start:
/// bindings registered later are never picked up.
pub struct ConsumerSupervisor {
    channel: Arc<ChannelSupervisor>,
    bindings: Mutex<HashMap<String, ConsumerBinding>>,
    lifecycle: Lifecycle,
    stop: CancellationToken,
    done: CancellationToken,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl ConsumerSupervisor {
    /// Builds the supervisor together with its own [`ChannelSupervisor`].
    ///
    /// # Returns
    /// * `Result<Arc<ConsumerSupervisor>, AmqpError>` - The supervisor, or the
    ///   connection/channel error that prevented constructing it.
    pub async fn new(connection: SharedConnection) -> Result<Arc<ConsumerSupervisor>, AmqpError> {
        let channel = ChannelSupervisor::new(connection).await?;

        Ok(Arc::new(ConsumerSupervisor {
            channel,
            bindings: Mutex::new(HashMap::new()),
            lifecycle: Lifecycle::new(),
            stop: CancellationToken::new(),
            done: CancellationToken::new(),
            loops: Mutex::new(Vec::new()),
        }))
    }

    /// The channel supervisor backing this consumer, for topology setup and
    /// publishing on the same self-healing channel.
    pub fn channel(&self) -> Arc<ChannelSupervisor> {
        self.channel.clone()
    }

    /// Registers a queue consumption binding.
    ///
    /// The assigned consumer tag is the label plus a globally unique sequence
    /// suffix, so identical labels never collide. Must be called before
    /// [`ConsumerSupervisor::start`].
    ///
    /// # Returns
    /// The consumer tag assigned to the binding.
    pub fn register(&self, queue: &str, label: &str, handler: Arc<dyn ConsumerHandler>) -> String {
        let tag = next_consumer_tag(label);

        self.bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                tag.clone(),
                ConsumerBinding {
                    queue: queue.to_owned(),
                    handler,
                },
            );

        tag
    }

    /// Launches one consumption loop per registered binding.
    ///
    /// No-op when the supervisor already started or stopped.
    pub fn start(self: &Arc<ConsumerSupervisor>) {
        if !self.lifecycle.begin_start() {
            return;
        }

        let bindings = self.bindings.lock().unwrap_or_else(PoisonError::into_inner);
        let mut loops = self.loops.lock().unwrap_or_else(PoisonError::into_inner);

        for (tag, binding) in bindings.iter() {
            let supervisor = Arc::clone(self);
            let tag = tag.clone();
            let queue = binding.queue.clone();
            let handler = Arc::clone(&binding.handler);

            loops.push(tokio::spawn(async move {
                supervisor.run(&tag, &queue, handler.as_ref()).await;
            }));
        }
    }

    /// One binding's consumption loop.
    ///
    /// Attaches a delivery stream, drains it one delivery at a time, and
    /// re-attaches after the fixed backoff whenever the stream ends or cannot
    /// be obtained, for as long as the supervisor is running. This backoff is
    /// what absorbs transient channel unavailability during a re-dial.
    async fn run(&self, tag: &str, queue: &str, handler: &dyn ConsumerHandler) {
        while self.lifecycle.is_running() {
            let mut deliveries = match self.channel.consume(queue, tag).await {
                Ok(deliveries) => deliveries,
                Err(err) => {
                    error!(
                        consumer = tag,
                        error = err.to_string(),
                        "failure to start consuming"
                    );
                    if !self.backoff().await {
                        break;
                    }
                    continue;
                }
            };

            while let Some(result) = deliveries.next().await {
                match result {
                    Ok(delivery) => self.dispatch(tag, handler, delivery).await,
                    Err(err) => {
                        error!(
                            consumer = tag,
                            error = err.to_string(),
                            "delivery stream failure"
                        );
                        break;
                    }
                }
            }

            if !self.lifecycle.is_running() {
                break;
            }

            debug!(consumer = tag, "delivery stream ended, re-attaching");
            if !self.backoff().await {
                break;
            }
        }

        debug!(consumer = tag, "consumer loop exited");
    }

    /// Sleeps the consume backoff; returns false when shutdown interrupted it.
    async fn backoff(&self) -> bool {
        tokio::select! {
            _ = self.stop.cancelled() => false,
            _ = time::sleep(CONSUME_BACKOFF) => true,
        }
    }

    /// Runs the handler on one delivery and settles its disposition.
    ///
    /// Ack/reject failures are logged and the loop moves on; the broker will
    /// redeliver unsettled messages once the channel is replaced.
    async fn dispatch(&self, tag: &str, handler: &dyn ConsumerHandler, delivery: Delivery) {
        match recover(handler.handle(&delivery.data)).await {
            Ok(()) => {
                if let Err(err) = delivery.ack(BasicAckOptions { multiple: false }).await {
                    error!(
                        consumer = tag,
                        error = err.to_string(),
                        "error whiling ack msg"
                    );
                }
            }
            Err(err) => {
                warn!(
                    consumer = tag,
                    error = err.to_string(),
                    "handler failure, requeuing message"
                );
                if let Err(err) = delivery.reject(BasicRejectOptions { requeue: true }).await {
                    error!(
                        consumer = tag,
                        error = err.to_string(),
                        "error whiling reject msg"
                    );
                }
            }
        }
    }

    /// Begins graceful shutdown and returns its completion token.
    ///
    /// The token fires only after every registered consumer has been
    /// cancelled, every loop has exited and the channel is closed. Repeated
    /// calls are no-ops that return the same token. The supervisor must not
    /// be reused after the token fires.
    pub fn stop(self: &Arc<ConsumerSupervisor>) -> CancellationToken {
        if self.lifecycle.begin_stop() {
            let supervisor = Arc::clone(self);
            tokio::spawn(async move {
                supervisor.shutdown().await;
            });
        }

        self.done.clone()
    }

    async fn shutdown(&self) {
        self.stop.cancel();

        let tags: Vec<String> = self
            .bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();

        for tag in tags {
            if let Err(err) = self.channel.cancel(&tag).await {
                warn!(
                    consumer = tag.as_str(),
                    error = err.to_string(),
                    "failure to cancel consumer"
                );
            }
        }

        let loops = std::mem::take(&mut *self.loops.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in loops {
            if let Err(err) = handle.await {
                error!(error = err.to_string(), "consumer loop join failure");
            }
        }

        if let Err(err) = self.channel.close().await {
            error!(error = err.to_string(), "error to close the channel");
        }

        self.lifecycle.finish_stop();
        self.done.cancel();
    }
}

/// Runs one handler invocation under a panic recovery boundary.
///
/// A panic raised by the handler is downcast to its message, logged, and
/// mapped to [`HandlerError::Panicked`]; it never propagates to the
/// surrounding loop.
async fn recover<F>(invocation: F) -> Result<(), HandlerError>
where
    F: Future<Output = Result<(), HandlerError>>,
{
    match AssertUnwindSafe(invocation).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => {
            let cause = panic_message(&*panic);
            error!(panic = cause.as_str(), "panic running handler");
            Err(HandlerError::Panicked(cause))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::MockConsumerHandler;
    use async_trait::async_trait;

    struct PanickingHandler;

    #[async_trait]
    impl ConsumerHandler for PanickingHandler {
        async fn handle(&self, _payload: &[u8]) -> Result<(), HandlerError> {
            panic!("boom")
        }
    }

    #[test]
    fn consumer_tags_are_unique_for_identical_labels() {
        let first = next_consumer_tag("worker");
        let second = next_consumer_tag("worker");

        assert!(first.starts_with("worker-"));
        assert!(second.starts_with("worker-"));
        assert_ne!(first, second);
    }

    #[test]
    fn lifecycle_walks_the_legal_transitions() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.current(), State::Idle);
        assert!(!lifecycle.is_running());

        assert!(lifecycle.begin_start());
        assert_eq!(lifecycle.current(), State::Running);
        assert!(lifecycle.is_running());

        assert!(lifecycle.begin_stop());
        assert_eq!(lifecycle.current(), State::Stopping);
        assert!(!lifecycle.is_running());

        lifecycle.finish_stop();
        assert_eq!(lifecycle.current(), State::Stopped);
    }

    #[test]
    fn double_start_is_a_no_op() {
        let lifecycle = Lifecycle::new();

        assert!(lifecycle.begin_start());
        assert!(!lifecycle.begin_start());
        assert_eq!(lifecycle.current(), State::Running);
    }

    #[test]
    fn only_one_stop_sequence_ever_begins() {
        let lifecycle = Lifecycle::new();
        lifecycle.begin_start();

        assert!(lifecycle.begin_stop());
        assert!(!lifecycle.begin_stop());

        lifecycle.finish_stop();
        assert!(!lifecycle.begin_stop());
    }

    #[test]
    fn stop_is_legal_before_start() {
        let lifecycle = Lifecycle::new();

        assert!(lifecycle.begin_stop());
        assert!(!lifecycle.begin_start());
    }

    #[tokio::test]
    async fn recover_passes_success_through() {
        let mut handler = MockConsumerHandler::new();
        handler
            .expect_handle()
            .times(1)
            .withf(|payload: &[u8]| payload == b"payload" as &[u8])
            .returning(|_| Ok(()));

        let result = recover(handler.handle(b"payload")).await;

        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn recover_passes_handler_failure_through() {
        let mut handler = MockConsumerHandler::new();
        handler
            .expect_handle()
            .times(1)
            .returning(|_| Err(HandlerError::Failed("rejected".to_owned())));

        let result = recover(handler.handle(b"payload")).await;

        assert_eq!(result, Err(HandlerError::Failed("rejected".to_owned())));
    }

    #[tokio::test]
    async fn recover_maps_a_panic_to_a_handler_error() {
        let handler = PanickingHandler;

        let result = recover(handler.handle(b"payload")).await;

        assert!(matches!(result, Err(HandlerError::Panicked(msg)) if msg == "boom"));
    }
}
