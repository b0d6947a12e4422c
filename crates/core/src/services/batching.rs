//! Batching wrapper around [`EventBus`].
//!
//! Events are buffered by a background task and flushed as individual
//! `publish` calls, in arrival order, once `max_events` are buffered or the
//! oldest buffered event has waited `max_delay`, whichever comes first.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info};

use super::event_bus::{BusEvent, EventBus};

enum Command {
    Event(BusEvent),
    Flush(oneshot::Sender<usize>),
    Shutdown(oneshot::Sender<usize>),
}

/// Buffers events in front of an [`EventBus`].
#[derive(Clone)]
pub struct BatchingPublisher {
    tx: mpsc::UnboundedSender<Command>,
    bus: EventBus,
}

impl BatchingPublisher {
    /// Start the batching task on the current runtime.
    #[must_use]
    pub fn spawn(bus: EventBus, max_events: usize, max_delay: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            bus: bus.clone(),
            buffer: Vec::new(),
            max_events: max_events.max(1),
            max_delay,
        };
        tokio::spawn(worker.run(rx));
        Self { tx, bus }
    }

    /// The wrapped bus.
    #[must_use]
    pub const fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Buffer an event. After shutdown, events go straight to the bus.
    pub fn publish(&self, event: BusEvent) {
        if let Err(mpsc::error::SendError(Command::Event(event))) =
            self.tx.send(Command::Event(event))
        {
            self.bus.publish(event);
        }
    }

    /// Flush everything buffered so far. Returns the number of events
    /// published.
    pub async fn flush(&self) -> usize {
        let (reply, done) = oneshot::channel();
        if self.tx.send(Command::Flush(reply)).is_err() {
            return 0;
        }
        done.await.unwrap_or(0)
    }

    /// Flush what remains and stop the task.
    pub async fn shutdown(&self) -> usize {
        let (reply, done) = oneshot::channel();
        if self.tx.send(Command::Shutdown(reply)).is_err() {
            return 0;
        }
        done.await.unwrap_or(0)
    }
}

struct Worker {
    bus: EventBus,
    buffer: Vec<BusEvent>,
    max_events: usize,
    max_delay: Duration,
}

impl Worker {
    fn flush(&mut self) -> usize {
        let count = self.buffer.len();
        if count > 0 {
            debug!(count, "Flushing event batch");
        }
        for event in self.buffer.drain(..) {
            self.bus.publish(event);
        }
        count
    }

    fn buffer(&mut self, event: BusEvent, deadline: &mut Option<Instant>) {
        if self.buffer.is_empty() {
            *deadline = Some(Instant::now() + self.max_delay);
        }
        self.buffer.push(event);
        if self.buffer.len() >= self.max_events {
            self.flush();
            *deadline = None;
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let mut deadline: Option<Instant> = None;

        loop {
            let command = match deadline {
                Some(at) => tokio::select! {
                    command = rx.recv() => command,
                    () = tokio::time::sleep_until(at) => {
                        self.flush();
                        deadline = None;
                        continue;
                    }
                },
                None => rx.recv().await,
            };

            match command {
                Some(Command::Event(event)) => self.buffer(event, &mut deadline),
                Some(Command::Flush(reply)) => {
                    deadline = None;
                    let _ = reply.send(self.flush());
                }
                Some(Command::Shutdown(reply)) => {
                    // Stop intake, then take whatever raced in behind us.
                    rx.close();
                    let mut waiting = vec![reply];
                    while let Ok(command) = rx.try_recv() {
                        match command {
                            Command::Event(event) => self.buffer.push(event),
                            Command::Flush(reply) | Command::Shutdown(reply) => {
                                waiting.push(reply);
                            }
                        }
                    }
                    let count = self.flush();
                    for reply in waiting {
                        let _ = reply.send(count);
                    }
                    break;
                }
                None => {
                    self.flush();
                    break;
                }
            }
        }

        info!("Event batching stopped");
    }
}
