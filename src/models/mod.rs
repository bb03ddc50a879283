//! Models module.
pub mod factorization;
