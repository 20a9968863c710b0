//! Stream bookkeeping and the handles applications hold.

mod handle;
mod responder;
mod state;
mod table;

pub use handle::{PayloadStream, ResponseHandle};
pub(crate) use handle::{CancelScope, StartFn, StreamControl, StreamParts};
pub use responder::{EmptyResponder, Responder, ResponderBuilder, ResponseFuture, ResponseStream};
pub use state::{Receiving, Sending, StreamMode, StreamState};
pub use table::StreamTable;
