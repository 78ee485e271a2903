//! Call dispatcher: per-call lifecycle, deadlines and caller handles.

mod call;
mod dispatcher;

pub use call::{CallCanceller, CallHandle, CallId, CallPayload, CallResult, CallStatus};
pub use dispatcher::{CallDispatcher, DispatchParams};
