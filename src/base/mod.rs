//! Base types and error handling.
//!
//! Provides foundational types mirroring Chromium's `net/base/`:
//! - [`NetError`](neterror::NetError): Network error codes matching `net_error_list.h`
//! - [`Timer`](timer::Timer): One-shot timers that report back through the
//!   scheduler's message queue

pub mod neterror;
pub mod timer;

#[cfg(test)]
mod tests;
