pub mod analysis;
pub mod checker;
pub mod config;
pub mod models;
pub mod reporter;
pub mod source;
pub mod store;

#[cfg(test)]
mod testing;
