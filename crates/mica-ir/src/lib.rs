//! Minimal mid-level shader IR for geometry-stage lowering.
//!
//! This IR is intentionally small: it only models what the geometry-shader
//! lowering pipeline (`mica-gs`) consumes and produces. The front-end that
//! parses and optimizes shaders into this form lives elsewhere; so does the
//! backend that turns lowered programs into machine code.
//!
//! Programs are structured (nested `If`/`Loop` blocks rather than a CFG) and
//! value-numbered: every instruction may define one [`ValueId`], and sources
//! are either values or inline immediates. Cross-block dataflow goes through
//! local variables, which keeps rewriting passes simple.

mod builder;
mod display;
mod ir;
pub mod opt;
pub mod validate;

pub use builder::{rewrite_program, Builder};
pub use ir::*;
