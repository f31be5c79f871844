//! Control bus shared by supervisors and workers.
//!
//! A bus is a single TCP connection carrying newline-delimited JSON commands in both
//! directions:
//! - **Encoding**: [`Command::encode`] produces one line with a `cmd` discriminator
//! - **Decoding**: lines are decoded one at a time; a bad line is logged and dropped
//!   without affecting its neighbours
//! - **Dispatch**: a [`Dispatcher`] maps each [`CommandKind`] to a handler, either a
//!   closure installed with `on` or the side's default installed with `def`
//!
//! The same machinery serves worker↔supervisor links, operator clients and the
//! old-master↔new-master handoff link.

pub mod bus;
pub mod command;
pub mod dispatch;

pub use bus::{BusEvent, ControlCodec, Frame, Link, LinkId, LinkReader, Outbound};
pub use command::{decode_fragment, Command, CommandKind, DecodeError, LogLevel};
pub use dispatch::{Dispatcher, Side};
