// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! A per-peer Electrum protocol session: TOFU-pinned TLS transport trust, a
//! framed JSON-RPC 2.0 session with subscription semantics, and the
//! header-chain synchronization state machine that reconciles a peer's
//! advertised tip against a local chain view.
//!
//! The multi-peer supervisor, the header store, and network-wide constants
//! are external collaborators this crate only references through the
//! [`chain::ChainView`], [`chain::ChainParams`], and
//! [`network_handle::NetworkHandle`] traits — this crate never implements
//! header storage, peer selection, or multi-interface orchestration itself.

pub mod address;
pub mod certstore;
pub mod chain;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod headers;
pub mod interface;
pub mod network_handle;
pub mod session;
pub mod sync;

pub use address::{AddressError, Protocol, ServerAddress};
pub use config::InterfaceConfig;
pub use error::{CertificateError, GracefulDisconnect, InterfaceError, InterfaceResult, ProtocolError};
pub use interface::Interface;
