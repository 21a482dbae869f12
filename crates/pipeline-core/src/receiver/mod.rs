//! Receiver pipeline assembly.

mod group;
pub(crate) mod session;
mod slot;
mod source;

pub use group::SessionGroup;
pub use session::ReceiverSession;
pub use slot::ReceiverSlot;
pub use source::{new_receiver_loop, ReceiverLoop, ReceiverSource, ReceiverTask};
