//! strongroom-core: shared error type and variant-dictionary primitives
//!
//! Everything in this crate is format- and platform-agnostic; the heavier
//! crates (crypto, model, format, merge) all sit on top of it.

pub mod error;
pub mod variant;

pub use error::{Error, Result};
pub use variant::{Variant, VariantDictionary};
