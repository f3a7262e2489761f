#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod bundle;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod installer;
pub mod instance;
pub mod keyscript;
pub mod logging;
pub mod paths;
pub mod progress;
pub mod recognizer;
pub mod restore_image;
