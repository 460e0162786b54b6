//! Tree-wide event notification.
//!
//! Every pipeline tree has one [`EventBus`]. Registering a listener on any
//! node makes it observe events raised on every other node of the same tree.

mod bus;
mod listener;

pub use bus::EventBus;
pub use listener::{CollectingListener, FnListener, LoggingListener, StageEventListener};
