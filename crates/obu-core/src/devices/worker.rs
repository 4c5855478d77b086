//! Background polling workers
//!
//! A worker owns one device client and runs a polling loop on its own OS
//! thread. Results go out through a bounded channel; the loop never blocks on
//! a slow consumer. Stopping cancels the loop, joins the thread and hands
//! the client back.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::{ProtocolError, Result, POLL_SLICE};

/// Default capacity of a worker's event channel
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Producer half of a worker's event channel
#[derive(Debug)]
pub struct EventSink<E> {
    tx: mpsc::Sender<E>,
}

impl<E> Clone for EventSink<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<E> EventSink<E> {
    /// Deliver an event without blocking
    ///
    /// Returns `false` when the event was dropped because the channel is full
    /// or the consumer has gone away.
    pub fn emit(&self, event: E) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("event channel full, dropping event");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// The receiving half has been dropped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Sleep for `duration` in poll slices; `false` if cancelled first
pub fn sleep_cancellable(cancel: &CancellationToken, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return true;
        }
        thread::sleep(remaining.min(POLL_SLICE));
    }
}

/// Create a bounded event channel
pub fn event_channel<E>(capacity: usize) -> (EventSink<E>, mpsc::Receiver<E>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSink { tx }, rx)
}

/// A device client running a loop on a background thread
pub struct Worker<C, E> {
    name: String,
    cancel: CancellationToken,
    handle: Option<JoinHandle<(C, Result<()>)>>,
    events: Option<mpsc::Receiver<E>>,
}

impl<C, E> Worker<C, E>
where
    C: Send + 'static,
    E: Send + 'static,
{
    /// Move `client` onto a new thread and run `body` until it returns
    ///
    /// `body` must observe the cancellation token at least once per poll slice.
    pub fn spawn<F>(name: &str, client: C, capacity: usize, body: F) -> Result<Self>
    where
        F: FnOnce(&mut C, &CancellationToken, &EventSink<E>) -> Result<()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let (sink, events) = event_channel(capacity);
        let token = cancel.clone();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut client = client;
                let outcome = body(&mut client, &token, &sink);
                (client, outcome)
            })
            .map_err(|e| ProtocolError::DeviceError(format!("failed to spawn {name}: {e}")))?;

        debug!("worker {} started", name);
        Ok(Self {
            name: name.to_string(),
            cancel,
            handle: Some(handle),
            events: Some(events),
        })
    }
}

impl<C, E> Worker<C, E> {
    /// Thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Receiver for the worker's events
    pub fn events(&mut self) -> Option<&mut mpsc::Receiver<E>> {
        self.events.as_mut()
    }

    /// Take ownership of the event receiver, e.g. to hand it to another task
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<E>> {
        self.events.take()
    }

    /// Token that stops the loop when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The loop has returned on its own
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Cancel the loop, wait for it and return the client with the loop outcome
    ///
    /// Fails only if the loop panicked, in which case the client is lost.
    pub fn stop(mut self) -> Result<(C, Result<()>)> {
        self.cancel.cancel();
        let handle = self
            .handle
            .take()
            .ok_or_else(|| ProtocolError::DeviceError(format!("{} already joined", self.name)))?;
        let joined = handle
            .join()
            .map_err(|_| ProtocolError::DeviceError(format!("{} panicked", self.name)));
        debug!("worker {} stopped", self.name);
        joined
    }
}

impl<C, E> Drop for Worker<C, E> {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("worker {} panicked", self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_cancellable() {
        let cancel = CancellationToken::new();
        assert!(sleep_cancellable(&cancel, Duration::from_millis(20)));

        cancel.cancel();
        let started = Instant::now();
        assert!(!sleep_cancellable(&cancel, Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_stop_returns_client_and_outcome() {
        let worker: Worker<u32, u32> = Worker::spawn("counter", 0u32, 4, |count, cancel, sink| {
            while !cancel.is_cancelled() {
                *count += 1;
                sink.emit(*count);
                thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        })
        .unwrap();

        thread::sleep(Duration::from_millis(30));
        let started = Instant::now();
        let (count, outcome) = worker.stop().unwrap();
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(count > 0);
        assert_eq!(outcome, Ok(()));
    }

    #[test]
    fn test_full_channel_drops_events() {
        let (sink, mut rx) = event_channel::<u8>(2);
        assert!(sink.emit(1));
        assert!(sink.emit(2));
        assert!(!sink.emit(3));
        assert_eq!(rx.try_recv().unwrap(), 1);
        assert_eq!(rx.try_recv().unwrap(), 2);
        assert!(rx.try_recv().is_err());

        drop(rx);
        assert!(sink.is_closed());
        assert!(!sink.emit(4));
    }

    #[test]
    fn test_loop_error_is_returned() {
        let worker: Worker<(), ()> = Worker::spawn("failing", (), 1, |_, _, _| {
            Err(ProtocolError::ReadError("EIO".into()))
        })
        .unwrap();
        while !worker.is_finished() {
            thread::sleep(Duration::from_millis(1));
        }
        let ((), outcome) = worker.stop().unwrap();
        assert_eq!(outcome, Err(ProtocolError::ReadError("EIO".into())));
    }
}
