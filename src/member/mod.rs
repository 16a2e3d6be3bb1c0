//! Member runtime and operator surfaces

pub mod console;
pub mod http;
pub mod node;

pub use console::Command;
pub use node::Member;
