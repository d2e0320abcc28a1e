pub mod handler;
pub mod resolver;
pub mod symbol_path;
