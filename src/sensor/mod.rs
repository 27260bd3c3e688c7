pub mod link;

pub use link::{discover_port, DeviceLink};
