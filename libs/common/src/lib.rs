pub mod events;
pub mod id;
pub mod message;
pub mod room;
pub mod store;

pub use events::{ClientEvent, MalformedEvent, ServerEvent};
pub use message::{Author, ChatMessage, DeliveryStatus, StatusFlags, WireMessage};
pub use room::room_id;
pub use store::{DocumentStore, MemoryDocumentStore, StoreError};
