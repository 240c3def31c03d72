pub mod addr;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod frame;
pub mod mode;
pub mod open_request;
pub mod registry;
pub mod test_util;
pub mod util;

pub use addr::EndpointAddr;
pub use config::MuxConfig;
pub use endpoint::{Endpoint, EndpointData, EndpointSignal, EndpointState};
pub use error::ChannelError;
pub use mode::ChannelMode;
pub use registry::Registry;
