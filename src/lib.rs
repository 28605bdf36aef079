pub mod bridge;
pub mod config;
pub mod session;
pub mod supervisor;

pub use bridge::Bridge;
pub use config::{Config, EndpointConfig, TransportKind};
pub use session::{
    BrokerSession, Message, MessageSink, SessionEvent, SessionHandle, Side, SubscriptionPolicy,
};
pub use supervisor::Supervisor;
