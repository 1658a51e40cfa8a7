//! Mail ingress: accept loops that drive protocol sessions and hand the
//! resulting envelopes to a queue.

pub mod smtp;

pub use smtp::{EdgeValidators, NoValidators, SmtpEdge};
