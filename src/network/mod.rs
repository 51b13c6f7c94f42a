pub mod peer;
pub mod protocol;
pub mod registry;

pub use peer::{Connector, PeerClient, PeerEvent};
pub use protocol::{Frame, RelayCodec};
pub use registry::{ConnectionRegistry, PeerHandle, Role};
