//! Applications built on the superstep engine.
//!
//! These double as reference material for writing an [`App`]: community
//! detection by label propagation ([`cdlp`]) and a staged value-forwarding
//! pipeline over typed vertices ([`staged_propagation`]).
//!
//! [`App`]: crate::engine::app::App

pub mod cdlp;
pub mod staged_propagation;
