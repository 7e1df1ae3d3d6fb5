#![doc = include_str!("RUSTDOC.md")]

pub mod data;
pub mod database;
pub mod logger;
pub mod model;
pub mod offline;
pub mod platform;
pub mod sync;
pub mod util;
