pub mod forwarder;

pub use forwarder::Forwarder;
