pub mod codec;
pub mod constants;
pub mod registry;
pub mod samples;
pub mod session;
pub mod transport;
pub mod types;
