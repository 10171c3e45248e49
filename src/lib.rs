//! git-annex external special remote for Dataverse datasets.
//!
//! A Dataverse dataset (addressed by DOI) acts as the object store;
//! git-annex drives this process over the external special remote
//! protocol on stdin/stdout, and every verb turns into one or more REST
//! calls against the Dataverse instance.

pub mod api;
pub mod bindings;
pub mod cloneurl;
pub mod config;
pub mod credentials;
pub mod dataset;
pub mod error;
pub mod mangle;
pub mod protocol;
pub mod remote;
