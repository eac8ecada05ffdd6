//! Upstream streaming feed port.
//!
//! The pool treats the upstream client as an opaque capability: it can be
//! dialed, it can open bidirectional streams, and streams can be fed a
//! subscription request, read, and cancelled. Message payloads are never
//! interpreted here.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StreamError;

/// Opaque subscription request written to a freshly opened stream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubscribeRequest {
    pub payload: Vec<u8>,
}

impl SubscribeRequest {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
        }
    }
}

/// Opaque message received from the upstream feed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamMessage {
    pub payload: Vec<u8>,
}

impl StreamMessage {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
        }
    }
}

/// A bidirectional upstream stream.
#[async_trait]
pub trait SubscriptionStream: Send {
    /// Write a subscription request.
    async fn send(&mut self, request: SubscribeRequest) -> Result<(), StreamError>;

    /// Next server message; `None` once the stream has ended.
    async fn next_message(&mut self) -> Option<Result<StreamMessage, StreamError>>;

    /// Cancel the stream.
    ///
    /// May fail if the stream is already terminating; callers absorb that.
    async fn cancel(&mut self) -> Result<(), StreamError>;
}

/// A live upstream connection able to open streams.
#[async_trait]
pub trait StreamingClient: Send + Sync {
    /// Open a new bidirectional stream on this connection.
    async fn open_stream(&self) -> Result<Box<dyn SubscriptionStream>, StreamError>;
}

/// Dials new upstream connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a connection to `endpoint` authenticated by `credential`.
    async fn connect(
        &self,
        endpoint: &str,
        credential: &str,
    ) -> Result<Arc<dyn StreamingClient>, StreamError>;
}

/// Handle to a pooled connection, as returned by
/// [`ConnectionPool::acquire`](crate::pool::ConnectionPool::acquire).
#[derive(Clone)]
pub struct ClientHandle {
    connection_id: u64,
    client: Arc<dyn StreamingClient>,
}

impl ClientHandle {
    pub(crate) fn new(connection_id: u64, client: Arc<dyn StreamingClient>) -> Self {
        Self {
            connection_id,
            client,
        }
    }

    /// Pool-assigned id of the underlying connection.
    #[must_use]
    pub const fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// The underlying client.
    #[must_use]
    pub fn client(&self) -> &Arc<dyn StreamingClient> {
        &self.client
    }

    /// True when both handles refer to the same upstream connection.
    #[must_use]
    pub fn same_connection(&self, other: &Self) -> bool {
        self.connection_id == other.connection_id && Arc::ptr_eq(&self.client, &other.client)
    }

    /// Open a stream on the underlying connection.
    ///
    /// # Errors
    ///
    /// Propagates the client's [`StreamError`].
    pub async fn open_stream(&self) -> Result<Box<dyn SubscriptionStream>, StreamError> {
        self.client.open_stream().await
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}
