//! `stage-core`
//!
//! Core types shared by the stage-daq controller drivers and the `stagectl`
//! host.
//!
//! ## Modules
//!
//! - [`error`]: [`StageError`] and the [`AppResult`] alias
//! - [`serial`]: type-erased serial ports, the [`PortOpener`] seam and port
//!   utilities
//! - [`observable`]: watch-channel backed [`Observable`] values
//! - [`dispatch`]: posting notifications onto the context that owns observers
//! - [`mock_serial`]: scripted serial port and opener for tests
//!
//! ## Example
//!
//! ```rust,no_run
//! use stage_core::{AppResult, Observable};
//!
//! fn example() -> AppResult<()> {
//!     let running = Observable::new("running", false);
//!     let mut rx = running.subscribe();
//!     running.set(true);
//!     assert!(*rx.borrow_and_update());
//!     Ok(())
//! }
//! ```

// Re-export commonly used types
pub use anyhow::{anyhow, Context, Result};

pub mod dispatch;
pub mod error;
pub mod mock_serial;
pub mod observable;
pub mod serial;

pub use dispatch::{Dispatcher, InlineDispatcher, Job, QueueDispatcher};
pub use error::{AppResult, StageError};
pub use observable::Observable;
pub use serial::{DynSerial, PortOpener, SerialOpener};
