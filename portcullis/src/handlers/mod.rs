//! HTTP handlers for the gateway's own surfaces
//!
//! Only the auth surface lives here; the admin CRUD surface is an external
//! collaborator that writes the same data model through the repository
//! layer.

pub mod auth;
