pub mod snapshot;
pub mod transfer;

pub use snapshot::StoreSnapshot;
pub use transfer::{StateProvider, StateTransfer};
