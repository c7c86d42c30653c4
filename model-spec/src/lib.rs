//! Declarative YOLO network descriptions.
//!
//! The crate parses json5 model documents, applies the compound width/depth
//! scaling rules and builds validated assembly plans. It carries no tensor
//! runtime; the companion runtime crate consumes the plans.

mod common;
pub mod config;
pub mod graph;
pub mod module;
pub mod scaling;
pub mod zoo;

pub use config::*;
pub use graph::*;
pub use module::*;
