pub mod api;
pub mod channel;
pub mod connector;
pub mod loopback;
pub mod transport;

pub use api::{AnswerPoll, ApiError, HttpSignalingApi, SignalingApi};
pub use channel::MessageChannel;
pub use connector::{ConnectError, Connection, Connector, ConnectorConfig, SessionHandle, SessionStatus};
pub use loopback::{LoopbackNetwork, LoopbackTransport};
pub use transport::{FrameSink, LinkEvent, PeerTransport, TransportError};
