#![allow(clippy::len_without_is_empty)]

pub mod assembler;
pub mod capture;
pub mod cli;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod eventdev;
pub mod eventq;
pub mod graph;
pub mod lcore;
pub mod link;
pub mod memory;
pub mod node;
pub mod nodes;
pub mod packet;
pub mod prelude;
pub mod service;
pub mod stage;
pub mod vswitch;

pub type Result<T> = std::result::Result<T, crate::error::Error>;
