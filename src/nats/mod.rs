pub mod client;
pub mod messages;

pub use client::{NatsSessionConnection, NatsSessionProtocol, NatsTrackSink};
pub use messages::{AudioFrameMessage, JoinAck, JoinRequest, RoomEvent};
