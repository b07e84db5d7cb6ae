//! Object identity for the git-remoting workspace.
//!
//! This crate provides the `ObjectId` type and the `HashAlgorithm`
//! descriptor that the transfer machinery is parameterized over. Content
//! hashing itself lives with the object store; everything here treats
//! identifiers as opaque fixed-width byte strings.

mod algorithm;
mod error;
pub mod hex;
mod oid;

pub use algorithm::HashAlgorithm;
pub use error::HashError;
pub use oid::ObjectId;
