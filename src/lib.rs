//! pg_shuttle — parallel clone and logical-decoding follow for live
//! PostgreSQL databases.
//!
//! The library is organized around seven cooperating components:
//!
//! - [`catalog`] — the embedded progress catalog owning all persistent
//!   state (tasks, run steps, slot state, apply cursor);
//! - [`introspect`] — the source introspector producing the Work Plan
//!   under the run's REPEATABLE READ snapshot;
//! - [`schema`] — the bridge driving `pg_dump`/`pg_restore` for the
//!   pre-data and post-data sections;
//! - [`copy`] — the parallel binary-COPY supervisor;
//! - [`index`] — the index & constraint supervisor;
//! - [`blobs`] — the large-object pipeline;
//! - [`cdc`] — the receive → transform → apply change-data-capture
//!   pipeline with resumable LSN bookkeeping.
//!
//! The binary (`pgshuttle`) lives in `main.rs` and dispatches through
//! [`cli`].

pub mod blobs;
pub mod cancel;
pub mod catalog;
pub mod cdc;
pub mod cli;
pub mod clone;
pub mod compare;
pub mod config;
pub mod copy;
pub mod error;
pub mod extensions;
pub mod filters;
pub mod index;
pub mod introspect;
pub mod list;
pub mod lsn;
pub mod matviews;
pub mod pgsql;
pub mod plan;
pub mod schema;
pub mod sequences;
pub mod summary;

pub use error::{Result, ShuttleError};
