//! Pipeline stages for batch archive conversion.
//!
//! Each submodule implements exactly one step, so each can be tested on
//! its own and the converter can be swapped without touching the rest.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ archive ──▶ extract ──▶ scheduler ──▶ aggregate ──▶ archive
//! (bytes)   (detect)    (sandbox)   (adapter×W)   (policy)      (zip out)
//! ```
//!
//! 1. [`input`]: load the archive from a path, URL or stdin, with a kind hint
//! 2. [`archive`]: sniff tar / tar.gz / zip and walk entries as streams;
//!    later encodes the outbound zip
//! 3. [`extract`]: validate every entry name and stream eligible documents
//!    into the sandbox; runs in `spawn_blocking`
//! 4. [`scheduler`]: bounded worker pool, one [`adapter`] call per document,
//!    under the request deadline
//! 5. [`aggregate`]: apply the failure policy and assign unique entry names

pub mod adapter;
pub mod aggregate;
pub mod archive;
pub mod extract;
pub mod input;
pub mod scheduler;
