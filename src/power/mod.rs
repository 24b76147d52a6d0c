//! Power events and display wake-up.

pub mod display;
pub mod events;

pub use display::WakeHandler;
pub use events::{PowerCallbacks, PowerEventListener};
