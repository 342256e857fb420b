mod http;
mod sse;
mod transport;

pub use http::{HttpFrameTransport, HttpTransportConfig};
pub use transport::{
    AbortHandle, BoxFuture, FrameSender, FrameTransport, TransportError, TransportEvent,
    TransportHandle, TransportRequest, TransportResult, TransportStream, TransportWorker,
    transport_channel,
};
