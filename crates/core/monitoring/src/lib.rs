//! Observability helpers for the templatedb workspace.
//!
//! Only logging lives here: the provisioning crates are test infrastructure and export no
//! metrics or traces of their own.

pub mod logging;
