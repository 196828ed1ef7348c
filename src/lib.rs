//! Host-side Bluetooth HCI transport.
//!
//! Turns the controller's credit-limited command, event, ACL, and SCO streams
//! into ordered, prioritized, and cancellable request/response semantics for
//! the upper layers of a host stack ([Vol 4] Part E). Everything runs on a
//! single [`dispatch::Dispatcher`] without threads or locks. Completions are
//! delivered through callbacks, and every continuation re-validates its owner
//! after a callback returns, because callbacks may shut down or re-enter the
//! object that invoked them.

pub mod dispatch;
pub mod hci;
pub mod host;

#[cfg(test)]
mod testing;
