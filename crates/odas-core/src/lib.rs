pub mod category;
pub mod envelope;
pub mod errors;
pub mod framing;

pub use category::Category;
pub use envelope::{Envelope, MessageKind, StatusEvent};
pub use errors::RelayError;
pub use framing::FrameDecoder;
