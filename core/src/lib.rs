//! virta-core - Core types for the VIRTA routing engine
//!
//! This crate provides the foundational types shared between the engine and
//! anything that plugs into it (endpoint drivers, processors, the runtime):
//!
//! - [`Message`] - the dynamic envelope that flows through a route
//! - [`keys`] - reserved field-key constants
//! - [`RouteError`] - the error taxonomy surfaced by every driver and stage
//!
//! # Why this crate exists
//!
//! Endpoint and processor implementations outside the engine crate need the
//! `Message` type and the error taxonomy without pulling in the engine's
//! endpoint registry, subprocess driver, and supervisor. Extracting the core
//! types keeps custom drivers cheap to build:
//!
//! ```text
//! virta-core ◄── virta-engine ◄── virta-runtime
//!     ▲
//!     └────────── your endpoint / processor crate
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![warn(missing_docs)]

mod error;
/// Reserved field-key constants for VIRTA messages
pub mod keys;
/// The dynamic message envelope
pub mod message;

pub use error::{ErrorKind, Result, RouteError};
pub use message::Message;
