pub mod config;
pub mod ids;
pub mod messages;

pub use config::*;
pub use ids::*;
pub use messages::*;
