//! easy-pm - run several web apps behind one port
//!
//! This library provides a small process manager and reverse proxy that:
//! - Reads JSON config files describing apps (directory, command, domains)
//! - Keeps every app running under a supervisor daemon, restarting on crash
//!   and on file changes
//! - Routes HTTP traffic to the right app based on the Host header
//! - Redeploys an app (`git pull`, `git checkout`, `npm install`) when a
//!   signed push webhook arrives

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod paths;
pub mod pool;
pub mod process;
pub mod registry;
pub mod router;
pub mod runas;
pub mod supervisor;
pub mod watch;
pub mod webhook;
