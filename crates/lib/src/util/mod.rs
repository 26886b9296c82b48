//! Identifier and digest helpers, plus test doubles for the backend traits.

pub mod hash;
