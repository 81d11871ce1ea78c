//! Flow-sensitive pointer nullability checking and annotation inference
//! for a C/C++-like input language.
//!
//! The engine consumes a parsed translation unit (AST plus per-function
//! CFGs, see [`ast`]) and produces two things:
//!
//! - [`diagnose::diagnose_translation_unit`] reports program points where a
//!   possibly-null pointer reaches a context that demands non-null;
//! - [`infer::infer_translation_unit`] aggregates per-use evidence into
//!   declaration-level nullability annotations, iterating so that one
//!   declaration's inference can strengthen its callers.
//!
//! Abstract state is a pair of boolean formulas per pointer (`from_nullable`
//! and `is_null`, see [`value`]) resolved against the path's flow condition
//! by a bounded solver ([`solver`]). Expression-level nullability vectors
//! ([`nullability`]) are cached per function and resugared through template
//! substitutions. Diagnostics can be rendered as SARIF results via
//! [`report`].

pub mod ast;
pub mod diagnose;
pub mod env;
pub mod formula;
pub mod infer;
pub mod lattice;
pub mod nullability;
pub mod report;
pub mod solver;
pub mod telemetry;
pub mod value;

mod analysis;
mod transfer;

#[cfg(test)]
mod testing;

pub use analysis::{MAX_BLOCK_VISITS, MAX_SAT_ITERATIONS};
pub use ast::{TranslationUnit, Type};
pub use diagnose::{
    diagnose_function, diagnose_translation_unit, Diagnostic, DiagnosticContext, ErrorCode,
};
pub use infer::{infer_translation_unit, Evidence, EvidenceKind, Inference, SlotInference};
pub use nullability::{NullabilityKind, TypeNullability};
