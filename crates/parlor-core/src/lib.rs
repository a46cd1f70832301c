pub mod errors;
pub mod ids;
pub mod protocol;

pub use errors::BrokerError;
pub use protocol::{ClientFrame, FrameError, ServerEvent};
