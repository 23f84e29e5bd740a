pub mod command;
pub mod lock;
pub mod retention;
