// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! `NetworkHandle` models the multi-peer supervisor that owns the
//! process-wide header-update lock, decides which interfaces survive, and
//! reacts to fork/lag signals. Injected at `Interface` construction —
//! never a global singleton this crate reaches for.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::TimeoutClass;

/// Opaque RAII guard for the process-wide header-update lock
/// (`bhi_lock`). Dropping it releases the lock; callers never need to
/// know its concrete type.
pub type BhiLockGuard = Box<dyn std::any::Any + Send>;

#[async_trait]
pub trait NetworkHandle: Send + Sync {
    /// Serializes header-store mutation across every interface the
    /// supervisor owns. Held only while applying `step`/`sync_until`
    /// outcomes to the chain store.
    async fn acquire_header_lock(&self) -> BhiLockGuard;

    /// Informs the supervisor that this interface has torn down, so it
    /// can be removed from routing and reconnection considered.
    async fn connection_down(&self, peer_label: &str);

    /// Fires a named, fire-and-forget GUI/diagnostic callback
    /// (`network_updated`, `blockchain_updated`, ...).
    fn trigger_callback(&self, event: &str);

    /// Resolves a timeout class to a concrete duration; the supervisor
    /// owns this because the value is configurable (e.g. a "fast
    /// timeouts" debug mode).
    fn network_timeout(&self, class: TimeoutClass, tier: TimeoutTier) -> Duration;

    /// Called after each tip update: gives the supervisor a chance to
    /// switch this interface's bound chain (e.g. if a competing fork now
    /// has more work) or flag it as lagging.
    async fn consider_fork_or_lag(&self, peer_label: &str);

    fn debug(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutTier {
    Normal,
    Relaxed,
    MostRelaxed,
}

impl TimeoutTier {
    pub fn resolve(self, class: TimeoutClass) -> Duration {
        match self {
            TimeoutTier::Normal => class.normal,
            TimeoutTier::Relaxed => class.relaxed,
            TimeoutTier::MostRelaxed => class.most_relaxed,
        }
    }
}
