pub mod definition;
pub mod engine;
pub mod resolver;
pub mod session;
pub mod trigger;
