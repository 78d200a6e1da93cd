//! Transports.
//!
//! The orchestration layer never talks to the network directly.  It goes
//! through two seams:
//!
//! - [`ResponsesTransport`] submits one request and yields either a single
//!   [`Response`] or a stream of [`ServerEvent`]s,
//! - [`EventSink`] sends [`ClientEvent`]s on a persistent duplex session
//!   whose inbound half is a [`ServerEventStream`].
//!
//! [`HttpTransport`] and [`connect_realtime`] are the network
//! implementations; tests substitute scripted ones.

pub mod http;
pub mod sse;
pub mod ws;

use async_trait::async_trait;
use futures::stream::BoxStream;

use turnloop_protocol::{ClientEvent, Response, ResponseRequest, ResponseStatus, ServerEvent};

use crate::error::Result;

pub use http::HttpTransport;
pub use ws::{WsSink, connect_realtime};

/// Inbound events, in arrival order.
pub type ServerEventStream = BoxStream<'static, Result<ServerEvent>>;

/// Request/response access to the model service.
#[async_trait]
pub trait ResponsesTransport: Send + Sync {
    /// Submit `request` and wait for the complete response.
    async fn create_response(&self, request: &ResponseRequest) -> Result<Response>;

    /// Submit `request` and stream its events.
    async fn stream_response(&self, request: &ResponseRequest) -> Result<ServerEventStream>;
}

/// Outbound half of a persistent session.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, event: &ClientEvent) -> Result<()>;

    /// Close the connection.  Idempotent.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Replay a complete response as the events a stream would have carried:
/// one added/done pair per output item, then a single terminal event.
///
/// Lets blocking and streaming responses share one event-processing path.
pub fn synthesize_events(response: Response) -> Vec<ServerEvent> {
    let response_id = Some(response.id.clone()).filter(|id| !id.is_empty());
    let mut sequence = 0u64;
    let mut next_seq = || {
        let n = sequence;
        sequence += 1;
        Some(n)
    };

    let mut events = Vec::with_capacity(response.output.len() * 2 + 1);
    for (index, item) in response.output.iter().enumerate() {
        let output_index = u32::try_from(index).unwrap_or(u32::MAX);
        events.push(ServerEvent::OutputItemAdded {
            sequence_number: next_seq(),
            response_id: response_id.clone(),
            output_index,
            item: item.clone(),
        });
        events.push(ServerEvent::OutputItemDone {
            sequence_number: next_seq(),
            response_id: response_id.clone(),
            output_index,
            item: item.clone(),
        });
    }

    let sequence_number = next_seq();
    let failed = response.error.is_some() || response.status == Some(ResponseStatus::Failed);
    let terminal = if failed {
        ServerEvent::ResponseFailed {
            sequence_number,
            response,
        }
    } else if response.status == Some(ResponseStatus::Incomplete) {
        ServerEvent::ResponseIncomplete {
            sequence_number,
            response,
        }
    } else {
        ServerEvent::ResponseCompleted {
            sequence_number,
            response,
        }
    };
    events.push(terminal);
    events
}
