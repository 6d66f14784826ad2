//! Hardware access.
//!
//! - [`transport`]: raw HTTP exchange with instrument daemons
//! - [`daemon`]: the send-and-confirm request protocol on top of it
//! - [`setup`]: the [`HardwareSetup`] capability used by the run controller
//! - [`mock`]: recording test double for [`HardwareSetup`]

pub mod daemon;
pub mod mock;
pub mod setup;
pub mod transport;

pub use daemon::{DaemonClient, DaemonMode, DaemonRequest, DaemonStatus, PollPolicy};
pub use setup::{ErdSetup, HardwareSetup};
pub use transport::{DaemonTransport, HttpTransport};
