use async_trait::async_trait;
use camwatch_common::Event;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::error::Result;
use crate::metrics::Metrics;

mod tracing_sink;

pub use tracing_sink::{LogNotifier, TracingSink};

/// Operational event log. Fire-and-forget: the hub never awaits durability.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: &Event);
}

/// Alert delivery (webhooks, push, ...). Failures are logged by the hub and
/// never retried.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &Event) -> Result<()>;
}

enum Consumer {
    Sink(Arc<dyn EventSink>),
    Notifier(Arc<dyn Notifier>),
}

struct Route {
    name: String,
    tx: mpsc::Sender<Event>,
}

/// Cloneable handle every stream uses to publish events.
///
/// Each consumer owns a bounded channel drained by its own dispatcher task.
/// Publishing uses `try_send`, so a consumer that falls behind only loses its
/// own events and never stalls the stream that produced them.
#[derive(Clone)]
pub struct EventHub {
    sinks: Arc<Vec<Route>>,
    notifiers: Arc<Vec<Route>>,
    metrics: Arc<Metrics>,
}

pub struct EventHubBuilder {
    capacity: usize,
    consumers: Vec<(String, Consumer)>,
}

impl EventHubBuilder {
    pub fn sink(mut self, name: impl Into<String>, sink: Arc<dyn EventSink>) -> Self {
        self.consumers.push((name.into(), Consumer::Sink(sink)));
        self
    }

    pub fn notifier(mut self, name: impl Into<String>, notifier: Arc<dyn Notifier>) -> Self {
        self.consumers.push((name.into(), Consumer::Notifier(notifier)));
        self
    }

    /// Spawns one dispatcher per consumer; must run inside a tokio runtime.
    pub fn build(self, metrics: Arc<Metrics>) -> EventHub {
        let mut sinks = Vec::new();
        let mut notifiers = Vec::new();

        for (name, consumer) in self.consumers {
            let (tx, mut rx) = mpsc::channel::<Event>(self.capacity.max(1));
            let route = Route {
                name: name.clone(),
                tx,
            };

            match consumer {
                Consumer::Sink(sink) => {
                    tokio::spawn(async move {
                        while let Some(event) = rx.recv().await {
                            sink.emit(&event).await;
                        }
                        debug!(consumer = %name, "Event sink dispatcher finished");
                    });
                    sinks.push(route);
                }
                Consumer::Notifier(notifier) => {
                    tokio::spawn(async move {
                        while let Some(event) = rx.recv().await {
                            if let Err(e) = notifier.notify(&event).await {
                                warn!(
                                    consumer = %name,
                                    event_type = %event.event_type,
                                    stream_id = %event.stream_id,
                                    error = %e,
                                    "Notification delivery failed"
                                );
                            }
                        }
                        debug!(consumer = %name, "Notifier dispatcher finished");
                    });
                    notifiers.push(route);
                }
            }
        }

        EventHub {
            sinks: Arc::new(sinks),
            notifiers: Arc::new(notifiers),
            metrics,
        }
    }
}

impl EventHub {
    pub fn builder(capacity: usize) -> EventHubBuilder {
        EventHubBuilder {
            capacity,
            consumers: Vec::new(),
        }
    }

    /// Hands the event to every logging sink.
    pub fn emit(&self, event: Event) {
        debug!(
            event_type = %event.event_type,
            stream_id = %event.stream_id,
            camera_id = %event.camera_id,
            "Event emitted"
        );
        self.dispatch(&self.sinks, event);
    }

    /// Hands the event to every notifier.
    pub fn notify(&self, event: Event) {
        self.dispatch(&self.notifiers, event);
    }

    /// Logs the event and notifies about it.
    pub fn emit_and_notify(&self, event: Event) {
        self.emit(event.clone());
        self.notify(event);
    }

    fn dispatch(&self, routes: &[Route], event: Event) {
        let Some((last, rest)) = routes.split_last() else {
            return;
        };
        for route in rest {
            self.offer(route, event.clone());
        }
        self.offer(last, event);
    }

    fn offer(&self, route: &Route, event: Event) {
        match route.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.metrics.record_fanout_drop(&route.name);
                warn!(
                    consumer = %route.name,
                    event_type = %event.event_type,
                    stream_id = %event.stream_id,
                    "Consumer backlog full, event dropped"
                );
            }
            Err(TrySendError::Closed(_)) => {
                self.metrics.record_fanout_drop(&route.name);
                debug!(consumer = %route.name, "Consumer gone, event dropped");
            }
        }
    }
}
