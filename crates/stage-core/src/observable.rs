//! Observable Values
//!
//! Reactive values using `tokio::sync::watch` for multi-subscriber
//! notifications. Every piece of engine state a host wants to follow (axis
//! snapshots, parameter values, the controller `running` flag) is an
//! [`Observable`].
//!
//! # Example
//!
//! ```rust,ignore
//! let running = Observable::new("running", false);
//!
//! let mut rx = running.subscribe();
//! tokio::spawn(async move {
//!     while rx.changed().await.is_ok() {
//!         println!("running = {}", *rx.borrow());
//!     }
//! });
//!
//! running.set(true);
//! ```
//!
//! Clones share the same channel, so a value set through one clone is seen
//! by subscribers obtained from any other.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

/// Descriptive metadata attached to an observable.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ObservableMetadata {
    /// Name (unique within its owner).
    pub name: String,
    /// Human-readable description.
    pub description: Option<String>,
}

/// A thread-safe, observable value with change notifications.
///
/// Uses `tokio::sync::watch` internally for efficient multi-subscriber
/// broadcast. Subscribers can wait for changes asynchronously without polling.
pub struct Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    sender: watch::Sender<T>,
    metadata: Arc<RwLock<ObservableMetadata>>,
}

impl<T: Clone + Send + Sync + 'static> std::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("metadata", &*self.metadata.read())
            .field("subscribers", &self.sender.receiver_count())
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + Sync + 'static> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new observable with an initial value.
    pub fn new(name: impl Into<String>, initial_value: T) -> Self {
        let (sender, _) = watch::channel(initial_value);
        Self {
            sender,
            metadata: Arc::new(RwLock::new(ObservableMetadata {
                name: name.into(),
                ..Default::default()
            })),
        }
    }

    /// Add a description to this observable.
    pub fn with_description(self, description: impl Into<String>) -> Self {
        self.metadata.write().description = Some(description.into());
        self
    }

    /// Get the current value (clone).
    pub fn get(&self) -> T {
        self.sender.borrow().clone()
    }

    /// Set a new value, notifying all subscribers unconditionally.
    pub fn set(&self, value: T) {
        self.sender.send_replace(value);
    }

    /// Subscribe to value changes.
    ///
    /// ```rust,ignore
    /// let mut rx = observable.subscribe();
    /// while rx.changed().await.is_ok() {
    ///     let value = rx.borrow().clone();
    /// }
    /// ```
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.sender.subscribe()
    }
}

impl<T> Observable<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Store `value` and notify only if it differs from the current value.
    ///
    /// Returns whether the stored value changed.
    pub fn set_if_changed(&self, value: T) -> bool {
        self.sender.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        })
    }
}
