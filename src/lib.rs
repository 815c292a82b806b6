#![doc = include_str!("../RUSTDOC.md")]

pub mod app;
pub mod component;
pub mod firestore;
pub mod logger;
pub mod platform;
pub mod util;

#[cfg(test)]
pub mod test_support;
