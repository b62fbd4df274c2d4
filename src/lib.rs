pub mod buffer;
pub mod checkpoint;
pub mod config;
pub mod domain;
pub mod driver;
pub mod error;
pub mod exchange;
pub mod fixup;
pub mod geometry;
pub mod gravity;
pub mod hierarchy;
pub mod message;
pub mod particle;
pub mod patch;
pub mod plan;
pub mod random;
pub mod solvers;
pub mod starform;
