pub mod connection;
pub mod dispatcher;
pub mod local;
pub mod session;
