//! thinboot CLI - build and inspect diskless terminal images.

pub mod commands;
pub mod output;
