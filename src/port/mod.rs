//! Ports to external collaborators.

pub mod stream;

pub use stream::{
    ClientHandle, Connector, StreamMessage, StreamingClient, SubscribeRequest, SubscriptionStream,
};
