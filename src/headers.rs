// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Single-header and chunk header requests, with optional checkpoint
//! Merkle-proof validation folded in at the boundary so nothing
//! downstream ever sees an unvalidated proof.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;

use crate::chain::{deserialize_header, BlockHeader, ChainParams};
use crate::checkpoint::{reversed, validate_checkpoint_proof};
use crate::error::{InterfaceError, InterfaceResult, ProtocolError};
use crate::session::NotificationSession;

/// Which caller is asking, purely for log/trace labeling; carries no
/// behavioral weight beyond that — this crate doesn't special-case
/// timeouts per mode, all header fetches use the Urgent class while the
/// header-update lock is held, which the caller selects by passing the
/// right `timeout` argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Catchup,
    Backward,
    Binary,
}

#[derive(Deserialize)]
struct ProofEnvelope {
    root: String,
    branch: Vec<String>,
    header: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HeaderResponse {
    Proven(ProofEnvelope),
    Bare(String),
}

fn hex32(s: &str) -> InterfaceResult<[u8; 32]> {
    let bytes = hex::decode(s).map_err(|e| {
        InterfaceError::Protocol(ProtocolError::Malformed(format!("bad hex: {e}")))
    })?;
    bytes
        .try_into()
        .map_err(|_| InterfaceError::Protocol(ProtocolError::Malformed("expected 32 bytes".to_string())))
}

fn parse_branch(raw: &[String]) -> InterfaceResult<Vec<[u8; 32]>> {
    raw.iter().map(|s| hex32(s)).collect()
}

/// Fetches and parses the header at `height`. `must_provide_proof` forces
/// the checkpoint-proof path even above the checkpoint height, for callers
/// that need an explicit proof regardless of height.
pub async fn get_block_header(
    session: &NotificationSession,
    params: &dyn ChainParams,
    height: u32,
    timeout: Duration,
    must_provide_proof: bool,
) -> InterfaceResult<(BlockHeader, bool)> {
    let above_checkpoint = height > params.max_checkpoint();
    if above_checkpoint && must_provide_proof {
        return Err(InterfaceError::Protocol(ProtocolError::ProofAboveCheckpoint));
    }

    let cp_height = if above_checkpoint { 0 } else { params.max_checkpoint() };
    let result = session
        .send_request(
            "blockchain.block.header",
            vec![json!(height), json!(cp_height)],
            timeout,
        )
        .await?;

    let response: HeaderResponse = serde_json::from_value(result)
        .map_err(|e| InterfaceError::Protocol(ProtocolError::Malformed(e.to_string())))?;

    match response {
        HeaderResponse::Bare(hex_header) => {
            if cp_height != 0 {
                return Err(InterfaceError::Protocol(ProtocolError::MissingProof));
            }
            let raw = hex::decode(&hex_header)
                .map_err(|e| InterfaceError::Protocol(ProtocolError::Malformed(e.to_string())))?;
            let header = deserialize_header(&raw, height)
                .ok_or_else(|| InterfaceError::Protocol(ProtocolError::Malformed("short header".to_string())))?;
            Ok((header, false))
        }
        HeaderResponse::Proven(envelope) => {
            if cp_height == 0 {
                return Err(InterfaceError::Protocol(ProtocolError::UnrequestedProof));
            }
            let raw = hex::decode(&envelope.header)
                .map_err(|e| InterfaceError::Protocol(ProtocolError::Malformed(e.to_string())))?;
            let merkle_root = reversed(hex32(&envelope.root)?);
            let branch: Vec<[u8; 32]> = parse_branch(&envelope.branch)?
                .into_iter()
                .map(reversed)
                .collect();
            validate_checkpoint_proof(&raw, height, merkle_root, &branch, params.verification_block_merkle_root())?;
            let header = deserialize_header(&raw, height)
                .ok_or_else(|| InterfaceError::Protocol(ProtocolError::Malformed("short header".to_string())))?;
            Ok((header, true))
        }
    }
}

#[derive(Deserialize)]
struct ChunkResponse {
    hex: String,
    count: u32,
    root: Option<String>,
    branch: Option<Vec<String>>,
}

/// Requests `count` (≤ 2016) consecutive raw headers starting at `height`,
/// validating the last header in the batch against the checkpoint when a
/// proof envelope is present. Returns the raw hex payload and whether a
/// proof was supplied.
pub async fn request_headers(
    session: &NotificationSession,
    params: &dyn ChainParams,
    height: u32,
    count: u32,
    timeout: Duration,
) -> InterfaceResult<(String, bool)> {
    if count > 2016 {
        return Err(InterfaceError::Protocol(ProtocolError::TooManyHeadersRequested));
    }
    let above_checkpoint = height + count.saturating_sub(1) > params.max_checkpoint();
    let cp_height = if above_checkpoint { 0 } else { params.max_checkpoint() };

    let result = session
        .send_request(
            "blockchain.block.headers",
            vec![json!(height), json!(count), json!(cp_height)],
            timeout,
        )
        .await?;
    let response: ChunkResponse = serde_json::from_value(result)
        .map_err(|e| InterfaceError::Protocol(ProtocolError::Malformed(e.to_string())))?;

    let actual_header_count = response.hex.len() / 160;
    if actual_header_count as u32 > count {
        return Err(InterfaceError::Protocol(ProtocolError::OversizeChunk {
            expected: count,
            actual: actual_header_count as u32,
        }));
    }

    let proof_was_provided = match (response.root, response.branch) {
        (Some(root), Some(branch)) => {
            if cp_height == 0 {
                return Err(InterfaceError::Protocol(ProtocolError::UnrequestedProof));
            }
            let raw_all = hex::decode(&response.hex)
                .map_err(|e| InterfaceError::Protocol(ProtocolError::Malformed(e.to_string())))?;
            let last_start = (actual_header_count.saturating_sub(1)) * 80;
            let last_header_bytes = &raw_all[last_start..last_start + 80];
            let merkle_root = reversed(hex32(&root)?);
            let branch: Vec<[u8; 32]> = parse_branch(&branch)?.into_iter().map(reversed).collect();
            let last_height = height + actual_header_count as u32 - 1;
            validate_checkpoint_proof(
                last_header_bytes,
                last_height,
                merkle_root,
                &branch,
                params.verification_block_merkle_root(),
            )?;
            true
        }
        (None, None) => {
            if cp_height != 0 {
                return Err(InterfaceError::Protocol(ProtocolError::MissingProof));
            }
            false
        }
        _ => {
            return Err(InterfaceError::Protocol(ProtocolError::Malformed(
                "proof envelope must carry both root and branch".to_string(),
            )))
        }
    };

    Ok((response.hex, proof_was_provided))
}

/// Requests a single chunk (`index = start_height / retarget_interval`)
/// and hands the hex payload to the chain store's `connect_chunk`. Skips
/// the request entirely if `index` is already being fetched and
/// `can_return_early` is set, to suppress duplicate concurrent requests.
pub async fn request_chunk(
    session: &NotificationSession,
    params: &dyn ChainParams,
    chain: &dyn crate::chain::ChainView,
    requested_chunks: &Arc<Mutex<HashSet<u32>>>,
    start_height: u32,
    tip: u32,
    can_return_early: bool,
    timeout: Duration,
) -> InterfaceResult<Option<(crate::chain::ChainId, u32)>> {
    let retarget = params.retarget_interval();
    let index = start_height / retarget;

    if can_return_early && requested_chunks.lock().contains(&index) {
        return Ok(None);
    }
    requested_chunks.lock().insert(index);

    let chunk_start = index * retarget;
    let max_count = tip.saturating_sub(chunk_start) + 1;
    let count = retarget.min(max_count);

    let result = request_headers(session, params, chunk_start, count, timeout).await;
    requested_chunks.lock().remove(&index);
    let (hex, proof_was_provided) = result?;

    Ok(chain.connect_chunk(index, &hex, proof_was_provided))
}

/// Diagnostic, operator-invoked call (never used by the sync state
/// machine itself): fetches the header at a checkpoint height together
/// with its proof, and reports the values an operator needs to extend the
/// hard-coded checkpoint table.
pub struct PurportedCheckpoint {
    pub height: u32,
    pub merkle_root: String,
    pub first_timestamp: u32,
    pub last_chainwork: u128,
    pub last_bits: u32,
}

pub async fn get_purported_checkpoint(
    session: &NotificationSession,
    chain: &dyn crate::chain::ChainView,
    cp_height: u32,
    timeout: Duration,
) -> InterfaceResult<PurportedCheckpoint> {
    let retarget = 2016u32;
    let retarget_first_height = (cp_height / retarget) * retarget;
    let retarget_last_height = (cp_height + 1) / retarget * retarget - 1;
    let retarget_last_chunk_index = (cp_height + 1) / retarget - 1;

    let result = session
        .send_request(
            "blockchain.block.header",
            vec![json!(retarget_first_height), json!(cp_height)],
            timeout,
        )
        .await?;

    let root = result
        .get("root")
        .and_then(|v| v.as_str())
        .ok_or(InterfaceError::Protocol(ProtocolError::MissingCheckpointEnvelope))?;
    let header_hex = result
        .get("header")
        .and_then(|v| v.as_str())
        .ok_or(InterfaceError::Protocol(ProtocolError::MissingCheckpointEnvelope))?;
    let _branch = result
        .get("branch")
        .ok_or(InterfaceError::Protocol(ProtocolError::MissingCheckpointEnvelope))?;

    let raw = hex::decode(header_hex)
        .map_err(|e| InterfaceError::Protocol(ProtocolError::Malformed(e.to_string())))?;
    let first_header = deserialize_header(&raw, retarget_first_height)
        .ok_or_else(|| InterfaceError::Protocol(ProtocolError::Malformed("short header".to_string())))?;
    let mut timestamp_bytes = [0u8; 4];
    timestamp_bytes.copy_from_slice(&first_header.raw[68..72]);
    let first_timestamp = u32::from_le_bytes(timestamp_bytes);

    let last_chainwork = chain.get_chainwork(retarget_last_height);
    let last_bits = chain.target_to_bits(chain.get_target(retarget_last_chunk_index));

    Ok(PurportedCheckpoint {
        height: cp_height,
        merkle_root: root.to_string(),
        first_timestamp,
        last_chainwork,
        last_bits,
    })
}
