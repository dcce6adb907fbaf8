pub mod client;
pub mod meter;
pub mod publisher;
pub mod recorder;
pub mod reporter;
pub mod scheduler;
pub mod settings;

#[cfg(test)]
mod testing;
