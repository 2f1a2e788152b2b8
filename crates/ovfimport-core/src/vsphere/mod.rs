//! vSphere implementation of the inventory and management APIs.
//!
//! [`VsphereClient`] speaks the vim25 SOAP protocol over blocking HTTP. It
//! logs in once on connect and reuses the session cookie for every call,
//! including payload uploads to lease device URLs.

mod client;
pub mod soap;

pub use client::{ConnectionConfig, VsphereClient, DEFAULT_TIMEOUT};
