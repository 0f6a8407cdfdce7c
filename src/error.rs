// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the Electrum peer interface. Every error funnels into one
//! of four buckets so the disconnect handler in [`crate::interface`] can decide,
//! without inspecting variants one by one, whether a peer's certificate file
//! should survive the teardown.

use thiserror::Error;

/// Expected peer misbehavior or slowness. Always leads to an orderly
/// teardown; never a bug in this process.
#[derive(Debug, Error)]
pub enum GracefulDisconnect {
    #[error("Network request timed out.")]
    RequestTimedOut,
    #[error("server.version rejected: {0}")]
    VersionMismatch(String),
    #[error("server tip below max checkpoint")]
    TipBelowCheckpoint,
    #[error("server chain conflicts with checkpoints")]
    ChecksumConflictsWithCheckpoint,
    #[error("server closed session")]
    ServerClosed,
    #[error("connection establishment was too slow; ready future was cancelled")]
    ReadyCancelled,
}

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("error parsing saved certificate: {0}")]
    ErrorParsingSslCert(String),
    #[error("error getting certificate from server: {0}")]
    ErrorGettingSslCert(String),
}

/// Peer sent something that violates the wire contract. Counts toward the
/// peer's error budget in the caller.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("sent unexpected merkle root: expected {expected}, got {got}")]
    UnexpectedMerkleRoot { expected: String, got: String },
    #[error("sent incorrect merkle branch: expected {expected}, proved {proved}")]
    IncorrectMerkleBranch { expected: String, proved: String },
    #[error("received checkpoint validation data even though it wasn't requested")]
    UnrequestedProof,
    #[error("expected checkpoint validation data, did not receive it")]
    MissingProof,
    #[error("chunk data size incorrect: expected at most {expected} headers, got {actual}")]
    OversizeChunk { expected: u32, actual: u32 },
    #[error("server does not support requesting more than 2016 consecutive headers")]
    TooManyHeadersRequested,
    #[error("unexpected notification for unknown subscription: {0}")]
    UnknownSubscription(String),
    #[error("frame exceeded maximum size of {max} bytes")]
    FrameTooLarge { max: usize },
    #[error("malformed JSON-RPC payload: {0}")]
    Malformed(String),
    #[error("cannot request a checkpoint proof above checkpoint height")]
    ProofAboveCheckpoint,
    #[error("expected checkpoint validation data for get_purported_checkpoint")]
    MissingCheckpointEnvelope,
}

/// Top level error type threaded through the whole crate.
#[derive(Debug, Error)]
pub enum InterfaceError {
    #[error(transparent)]
    GracefulDisconnect(#[from] GracefulDisconnect),
    #[error(transparent)]
    Certificate(#[from] CertificateError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl InterfaceError {
    /// Whether this error indicates the session should be torn down
    /// gracefully (vs. being a bug worth a loud log at a higher level).
    pub fn is_graceful(&self) -> bool {
        matches!(
            self,
            InterfaceError::GracefulDisconnect(_)
                | InterfaceError::Transport(_)
                | InterfaceError::Certificate(_)
        )
    }
}

pub type InterfaceResult<T> = Result<T, InterfaceError>;
