#![deny(missing_docs)]

//! This crate contains the admin authentication service: credential
//! verification against a relational user table, exposed to the automation
//! host over a small HTTP API.

/// Module containing the credential store, the verifier and the HTTP
/// handlers the host calls.
pub mod auth;
/// Secret derivation strategies used to bind and check passwords.
pub mod secret;
/// This module is used to parse and read from configuration files for the
/// server.
pub mod settings;
mod admin;
mod app;

pub use admin::{apply, prompt_password, run_admin, AdminCommand};
pub use app::{init_tracing, router, run_server};
