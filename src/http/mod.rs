//! HTTP layer for the asset caching proxy.
//!
//! Managed `GET` requests are answered by the policy executors of the active
//! cache generation; everything else is forwarded to the origin and streamed
//! back untouched.  The control channel, health check and metrics are served
//! alongside.

pub mod handler;
