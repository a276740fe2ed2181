pub mod listener;
pub mod tcp;

pub use listener::Listener;
pub use tcp::TcpAcceptor;
