pub mod handler;
pub mod resolver;
pub mod traced_io;
