pub mod account;
pub mod config;
pub mod error;
pub mod presence;
pub mod room;
pub mod storage;
pub mod transport;

pub use config::ClientConfig;
pub use error::{SendError, TransportError, UploadError};
pub use presence::{PresenceState, PresenceView, UserPresence};
pub use room::{RoomDeps, RoomSync};
pub use storage::{Attachment, ObjectStorage};
pub use transport::{RelayClient, RelayTransport};
