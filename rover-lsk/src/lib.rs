pub mod client;
pub mod rover;
pub mod types;
