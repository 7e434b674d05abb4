//! Internal building blocks (NIfTI codec, entity model, metadata maps,
//! compatibility predicates, incremental/run/archive types) that power the
//! public APIs.

pub mod archive;
pub mod compat;
pub mod entity;
pub mod incremental;
pub mod metadata;
pub mod nifti;
pub mod run;
