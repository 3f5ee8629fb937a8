//! Binary subscription protocol: frame codec, per-connection session and
//! per-subscription dispatcher.

pub mod dispatcher;
pub mod frame;
pub mod session;

pub use dispatcher::Dispatcher;
pub use frame::{FrameError, InType, OutType, Request, Response};
pub use session::SubscriptionSession;
