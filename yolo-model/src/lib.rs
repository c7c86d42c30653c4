//! tch runtime for declaratively assembled YOLO detection networks.
//!
//! The crate instantiates `model-spec` assembly plans under a var store,
//! runs the save-set routed forward pass, decodes detections through the
//! cached-grid head and offers conv+bn fusion and multi-scale augmented
//! inference on top.

mod common;

pub mod augment;
pub mod detect;
pub mod model;
pub mod module;
pub mod utils;

pub use augment::*;
pub use detect::*;
pub use model::*;
pub use module::*;
