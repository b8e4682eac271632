mod connection_status;
pub use connection_status::*;
mod settings;
pub use settings::*;
