//! # wa-worker
//!
//! Long-running supervisor for concurrent WhatsApp client sessions, bridged
//! to a remote control plane over HTTP.
//!
//! The process discovers which sessions it should run, takes a cluster-wide
//! lock per session, drives each one through its connect/QR/open/close
//! lifecycle with durable on-disk auth material, drains the outbound
//! message queue with delivery confirmation, and relays inbound messages
//! (media included) back to the control plane.
//!
//! See [`worker`] for the component map.

pub mod worker;
