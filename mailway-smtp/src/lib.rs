//! SMTP protocol engine: server- and client-side state machines over a
//! line-buffered, TLS-upgradable framing layer, with extension
//! negotiation, PIPELINING, SASL authentication, and the LMTP
//! per-recipient DATA variant.

pub mod auth;
pub mod client;
pub mod connection;
pub mod data;
pub mod error;
pub mod extensions;
pub mod io;
pub mod reply;
pub mod server;

pub use client::{Client, Credentials, LmtpClient, PendingReply};
pub use connection::{TlsClientContext, TlsServerContext};
pub use error::{SmtpError, SmtpResult};
pub use extensions::Extensions;
pub use reply::Reply;
pub use server::{
    EsmtpParams, HandlerResult, NoHandlers, Server, ServerAuth, ServerOptions, SmtpHandlers,
};
