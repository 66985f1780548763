//! cimage CLI - drive the local image store and registry client by hand.

pub mod commands;
pub mod output;
