pub mod config;
pub mod disk;
pub mod error;
pub mod layout;
pub mod statemachine;
pub mod steps;
pub mod tools;

#[macro_use]
extern crate log;
