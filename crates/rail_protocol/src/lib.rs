pub mod frame;
pub mod message;
pub mod transport;
pub mod endpoint;
pub mod client;

pub use endpoint::Endpoint;
pub use frame::{FrameError, MAX_FRAME_LEN};
pub use message::{Envelope, FunctionDecl, Language, Manifest, ProtocolError};
pub use transport::{StreamTransport, Transport, TransportExt};
