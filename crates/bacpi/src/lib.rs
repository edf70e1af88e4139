//! bacpi - GPIO to BACnet/IP gateway
//!
//! This crate exposes the pins and environmental sensors of a single-board
//! computer as BACnet objects:
//! - Point model and registry of protocol-visible objects
//! - Physical I/O backends (sysfs GPIO, simulated)
//! - Declarative point extensions loaded at startup
//! - The periodic synchronization engine, run as a managed service
//! - BACnet/IP transport with foreign device registration

// Gateway settings
pub mod config;

// Point model
pub mod point;

// Point registry
pub mod registry;

// Physical I/O
pub mod hardware;

// Dynamic extension loader
pub mod extension;

// Shared context, bootstrap and inbound writes
pub mod gateway;

// Synchronization engine
pub mod sync;

// Protocol server collaborator
pub mod protocol;

// Service lifecycle
pub mod service;

pub use gateway::{Bootstrap, Gateway, WriteError};
pub use registry::Registry;
