//! Response channel between the core and the dispatch layer.
//!
//! Every operation takes a [`ResponseSink`]; the caller holds the matching
//! [`ResponseStream`]. Deliveries are ordered per sink and never block the
//! sender. The first terminal delivery (`resolve`, `reject`, `complete`)
//! closes the sink; later sends are dropped.

use crate::error::BleError;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// One item on a response channel
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery<T> {
    /// A value. Terminal only when followed by `Done`.
    Value(T),
    /// Terminal failure
    Error(BleError),
    /// Terminal completion
    Done,
}

impl<T> Delivery<T> {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Delivery::Value(_))
    }
}

/// Create a connected sink/stream pair.
pub fn response_channel<T>() -> (ResponseSink<T>, ResponseStream<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ResponseSink {
            tx: Arc::new(Mutex::new(Some(tx))),
        },
        ResponseStream { rx, finished: false },
    )
}

/// Sending half, cheap to clone. All clones share one open/closed state.
pub struct ResponseSink<T> {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<Delivery<T>>>>>,
}

impl<T> Clone for ResponseSink<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<T> ResponseSink<T> {
    /// Deliver a keep-open value. Returns false if the sink is closed.
    pub fn emit(&self, value: T) -> bool {
        let guard = self.tx.lock();
        match guard.as_ref() {
            Some(tx) => {
                if tx.send(Delivery::Value(value)).is_err() {
                    trace!("Response receiver dropped; value discarded");
                }
                true
            }
            None => false,
        }
    }

    /// Deliver a final value and close the sink.
    pub fn resolve(&self, value: T) -> bool {
        self.finish(|tx| {
            let _ = tx.send(Delivery::Value(value));
            tx.send(Delivery::Done)
        })
    }

    /// Deliver a terminal error and close the sink.
    pub fn reject(&self, error: BleError) -> bool {
        self.finish(|tx| tx.send(Delivery::Error(error)))
    }

    /// Close the sink without a value.
    pub fn complete(&self) -> bool {
        self.finish(|tx| tx.send(Delivery::Done))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }

    fn finish<F>(&self, send: F) -> bool
    where
        F: FnOnce(&mpsc::UnboundedSender<Delivery<T>>) -> Result<(), mpsc::error::SendError<Delivery<T>>>,
    {
        let Some(tx) = self.tx.lock().take() else {
            return false;
        };
        if send(&tx).is_err() {
            trace!("Response receiver dropped; terminal delivery discarded");
        }
        true
    }
}

/// Receiving half held by the caller.
pub struct ResponseStream<T> {
    rx: mpsc::UnboundedReceiver<Delivery<T>>,
    finished: bool,
}

impl<T> ResponseStream<T> {
    /// Next delivery, or `None` once a terminal delivery has been seen or
    /// every sink clone has been dropped.
    pub async fn next(&mut self) -> Option<Delivery<T>> {
        if self.finished {
            return None;
        }
        let item = self.rx.recv().await;
        match &item {
            Some(delivery) if !delivery.is_terminal() => {}
            _ => self.finished = true,
        }
        item
    }

    /// Non-blocking variant of [`next`](Self::next).
    pub fn try_next(&mut self) -> Option<Delivery<T>> {
        if self.finished {
            return None;
        }
        let item = self.rx.try_recv().ok()?;
        if item.is_terminal() {
            self.finished = true;
        }
        Some(item)
    }

    /// Wait for the first value or error of a one-shot operation.
    /// A stream that ends without either reports `Cancelled`.
    pub async fn result(&mut self) -> Result<T, BleError> {
        match self.next().await {
            Some(Delivery::Value(value)) => Ok(value),
            Some(Delivery::Error(err)) => Err(err),
            Some(Delivery::Done) | None => Err(BleError::Cancelled),
        }
    }
}
