//! Capability adapters around local terminals and editors.
//!
//! Servers (`*Server`) live in the operator process and wrap its streams. They are
//! exported as Cap'n Proto interfaces, so the host only ever holds references and every call
//! is forwarded back to the operator. The `Remote*` types are the host-side helpers calling
//! them.
//!
//! Neither input nor output ever claims to be interactive: the peer must not try terminal
//! specific tricks on a remote stream.

pub mod editor;
pub mod reader;
pub mod terminator;
pub mod writer;
