//! Unit tests for the sync module.

mod config;
mod fixtures;
mod remote;
