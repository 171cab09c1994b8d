pub mod exec;
pub mod files;
pub mod sandbox;
pub mod utils;
