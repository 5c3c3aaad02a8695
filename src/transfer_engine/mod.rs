pub mod engine;
pub mod plan;
pub mod types;

pub use engine::TransferEngine;
pub use plan::NamingScheme;
pub use types::*;
