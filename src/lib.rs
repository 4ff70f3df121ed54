pub mod auth;
pub mod battery;
pub mod cancel;
pub mod command;
pub mod config;
pub mod domain;
pub mod error;
pub mod identity;
pub mod navigation;
pub mod orchestrator;
pub mod patrol;
pub mod robot;
pub mod robot_call;
pub mod startup;
pub mod state;
pub mod telemetry;
pub mod timer;
pub mod util;
pub mod web;

#[cfg(test)]
mod mock;
