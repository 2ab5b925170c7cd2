// SPDX-License-Identifier: Apache-2.0

//! Bounded multi-producer channels used between the crawler stages.
//!
//! Every queue in the pipeline is bounded: a full queue blocks the producer,
//! which is how slow downstream consumption turns into slower reads.

use flume::{Receiver, Sender, TrySendError};
use std::fmt;
use tokio::select;
use tokio_util::sync::CancellationToken;

pub struct BoundedSender<T> {
    tx: Sender<T>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    /// Every receiver has been dropped.
    Disconnected,
    /// The channel is at capacity (only returned by `try_send`).
    Full,
    /// The cancellation token fired before capacity became available.
    Cancelled,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Disconnected => write!(f, "channel disconnected"),
            SendError::Full => write!(f, "channel full"),
            SendError::Cancelled => write!(f, "send cancelled"),
        }
    }
}

impl std::error::Error for SendError {}

impl<T> BoundedSender<T> {
    pub async fn send(&self, item: T) -> Result<(), SendError> {
        match self.tx.send_async(item).await {
            Ok(()) => Ok(()),
            Err(_e) => Err(SendError::Disconnected), // receiver closed
        }
    }

    /// Send, giving up as soon as `cancel` fires.
    ///
    /// The item is dropped when the send is cancelled.
    pub async fn send_or_cancel(&self, item: T, cancel: &CancellationToken) -> Result<(), SendError> {
        select! {
            biased;

            _ = cancel.cancelled() => Err(SendError::Cancelled),
            res = self.tx.send_async(item) => res.map_err(|_| SendError::Disconnected),
        }
    }

    /// Non-blocking send.
    pub fn try_send(&self, item: T) -> Result<(), SendError> {
        self.tx.try_send(item).map_err(|e| match e {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Disconnected(_) => SendError::Disconnected,
        })
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.tx.capacity()
    }
}

impl<T> Clone for BoundedSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> fmt::Debug for BoundedSender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedSender")
            .field("len", &self.tx.len())
            .field("capacity", &self.tx.capacity())
            .finish()
    }
}

pub struct BoundedReceiver<T> {
    rx: Receiver<T>,
}

impl<T> Clone for BoundedReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<T> BoundedReceiver<T> {
    pub async fn next(&mut self) -> Option<T> {
        match self.rx.recv_async().await {
            Ok(item) => Some(item),
            Err(_e) => None, // disconnected
        }
    }

    /// Non-blocking receive - returns immediately.
    /// Returns None if no item is available or channel is disconnected.
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Take everything currently queued without waiting.
    pub fn drain(&self) -> Vec<T> {
        self.rx.drain().collect()
    }

    /// True once every sender has been dropped.
    pub fn is_disconnected(&self) -> bool {
        self.rx.is_disconnected()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl<T> fmt::Debug for BoundedReceiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedReceiver")
            .field("len", &self.rx.len())
            .finish()
    }
}

pub fn bounded<T>(size: usize) -> (BoundedSender<T>, BoundedReceiver<T>) {
    let (tx, rx) = flume::bounded::<T>(size);

    (BoundedSender { tx }, BoundedReceiver { rx })
}
