//! Sender pipeline assembly.

mod session;
mod sink;
mod slot;

pub use session::SenderSession;
pub use sink::{new_sender_loop, SenderLoop, SenderSink, SenderTask};
pub use slot::SenderSlot;
