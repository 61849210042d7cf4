//! Operational transform for plain-text documents.
//!
//! A document is the newline-joined string of its lines. Ops are ordered
//! lists of components addressed by character offset into that string:
//!
//! ```text
//! {i: "foo", p: 4}            insert "foo" at offset 4
//! {d: "bar", p: 9}            delete "bar" starting at offset 9
//! {c: "baz", p: 2, t: "t1"}   comment thread t1 anchored on "baz"
//! ```
//!
//! Components of one op apply left to right, each against the result of the
//! previous one. `transform` follows the ShareJS text type: concurrent inserts
//! at the same offset are ordered by side (left stays, right shifts), deletes
//! split around inserts, overlapping deletes drop the shared text.
//!
//! Reference: Ellis & Gibbs — Concurrency Control in Groupware Systems (1989)

pub mod text;

pub use text::{
    apply, compose, transform, transform_position, transform_x, Component, Op, OtError, Side,
};
