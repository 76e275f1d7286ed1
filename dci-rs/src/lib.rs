//! Distributed CI Base Crate
//!
//! This crate contains shared type definitions, collaborator traits, and
//! the decision logic used by the DCI command-line driver and connectors:
//! the action resolver that maps module parameters to a CRUD verb, the run
//! backlog that defers job reporting until a job identifier is known, and
//! the playbook callbacks built on top of it. It does not talk HTTP itself;
//! see the `dci-http-connector` crate for that.

pub mod action;
pub mod api;
pub mod callback;
pub mod client;
pub mod config;
pub mod filters;
pub mod formatter;
pub mod junit;
pub mod module;
pub mod oval;
pub mod session;

#[cfg(test)]
pub(crate) mod mock;
