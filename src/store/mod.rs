pub mod map;
pub mod server;

pub use map::ReplicatedMapStore;
pub use server::{lock_name, swapped, ReplicatedStocks};
