pub mod assets;
pub mod client;
pub mod coordinator;
pub mod hub;
pub mod listener;
pub mod server;

pub use coordinator::RelayCoordinator;
pub use hub::{BroadcastHub, PublishReport, PushChannel, SendOutcome, SubscriberId};
pub use listener::{SourceEvent, SourceListener, SourceSink};
pub use server::{start, RelayConfig, ServerHandle};
