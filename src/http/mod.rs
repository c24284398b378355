//! Restricted HTTP/1.x handling: the incremental request parser and the
//! fixed response templates.
//!
//! Only one request shape is understood (a `GET` request line plus the
//! `Host` header); everything else is either skipped or rejected. See
//! [`parser`] for the state machine and [`response`] for the templates.

pub mod parser;
pub mod response;
