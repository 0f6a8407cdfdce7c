// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! `ChainView` is the trait boundary to the external header-chain store:
//! `check_header`, `can_connect`, `connect_chunk`, `save_header`, `fork`,
//! `height`, `get_chainwork`, `get_target`, `target_to_bits`, plus the
//! registry of known chains keyed by forkpoint. Production wiring binds
//! this trait to the real store; this crate never implements header
//! storage itself, and tests substitute [`testutil::MemoryChainView`]
//! instead of branching on test-only fields threaded through production
//! header types.

use sha2::{Digest, Sha256};

/// Opaque handle to one chain among the store's known chains. Never
/// constructed by this crate; always returned by a `ChainView` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainId(pub u64);

/// A parsed block header. `raw` is kept for re-hashing in proof
/// verification; `prev_hash`/`hash` are in the store's internal (not
/// display/reversed) byte order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub height: u32,
    pub prev_hash: [u8; 32],
    pub hash: [u8; 32],
    pub raw: Vec<u8>,
}

/// SHA256d ("double SHA-256"), the hash function Bitcoin-derived chains use
/// for both block headers and Merkle trees.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

/// Deserializes a raw header (80 bytes for plain headers; AuxPoW chains may
/// carry more trailing bytes, which are preserved in `raw` untouched).
pub fn deserialize_header(raw: &[u8], height: u32) -> Option<BlockHeader> {
    if raw.len() < 80 {
        return None;
    }
    let mut prev_hash = [0u8; 32];
    prev_hash.copy_from_slice(&raw[4..36]);
    let hash = sha256d(&raw[..80]);
    Some(BlockHeader {
        height,
        prev_hash,
        hash,
        raw: raw.to_vec(),
    })
}

/// Result of asking the store whether a header can be appended to some
/// known chain tip via proof-of-work linkage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    No,
    /// The header connects; the store may report a different chain object
    /// than the one last bound (this can happen when multiple known chains
    /// share a tip). The caller rebinds to it.
    Yes(ChainId),
}

impl ConnectOutcome {
    pub fn is_connectable(&self) -> bool {
        matches!(self, ConnectOutcome::Yes(_))
    }
}

pub trait ChainView: Send + Sync {
    /// Returns the chain this exact header (by hash) is already known to
    /// belong to, if any. This is distinct from `can_connect`: a header can
    /// be "checked" (already present, possibly not materialized locally)
    /// without this store being able to connect a *new* header to it.
    fn check_header(&self, header: &BlockHeader) -> Option<ChainId>;

    /// Whether `header` extends a known chain by PoW linkage. With
    /// `check_height` set, the header must land exactly at some chain's
    /// `tip + 1`; cleared, only the hash linkage to `header.height - 1` is
    /// checked, regardless of where the chain's own tip currently sits
    /// (used solely to sanity-check a binary search's exit point).
    /// `proof_was_provided` indicates the header arrived with a validated
    /// checkpoint Merkle proof, which some stores use to skip PoW-retarget
    /// verification below the checkpoint.
    fn can_connect(&self, header: &BlockHeader, check_height: bool, proof_was_provided: bool) -> ConnectOutcome;

    /// Appends `header` to the chain it was found to connect to.
    fn save_header(&self, chain: ChainId, header: BlockHeader);

    /// Bulk-connects a hex-encoded run of headers starting at chunk
    /// `index * retarget_interval`. Returns `(chain, header_count)` on
    /// success, or `None` if the chunk does not connect to anything known.
    fn connect_chunk(
        &self,
        index: u32,
        hex: &str,
        proof_was_provided: bool,
    ) -> Option<(ChainId, u32)>;

    /// Materializes a new chain forking off the current chain at
    /// `header`'s height, given that it already connects by PoW.
    fn fork(&self, header: BlockHeader) -> ChainId;

    fn height(&self, chain: ChainId) -> u32;

    fn get_chainwork(&self, height: u32) -> u128;

    fn get_target(&self, retarget_index: u32) -> [u8; 32];

    fn target_to_bits(&self, target: [u8; 32]) -> u32;

    /// Maximum height across every chain this store currently knows about.
    /// Seeds the backward probe's starting point.
    fn max_known_height(&self) -> u32;

    /// The chain judged most-work when no other hint (e.g. a just-arrived
    /// tip header) is available.
    fn best_chain(&self) -> ChainId;
}

/// Network-wide constants: genesis, the hard-coded checkpoint Merkle root,
/// the checkpoint height itself, and the retarget interval. Modeled as an
/// injected trait rather than a global singleton, so tests can substitute
/// a small checkpoint height instead of a mainnet one.
pub trait ChainParams: Send + Sync {
    fn genesis_hash(&self) -> [u8; 32];
    fn verification_block_merkle_root(&self) -> [u8; 32];
    fn max_checkpoint(&self) -> u32;
    fn retarget_interval(&self) -> u32;
}

#[cfg(test)]
pub mod testutil {
    //! An in-memory, single-process [`ChainView`] used to drive the sync
    //! state machine's unit tests without a real header store: a minimal
    //! but behaviorally faithful double, not a production implementation.

    use super::*;
    use parking_lot::RwLock;
    use std::collections::HashMap;

    #[derive(Debug, Clone)]
    struct Chain {
        id: ChainId,
        forkpoint: u32,
        headers: Vec<BlockHeader>, // headers[0] is at `forkpoint`
    }

    impl Chain {
        fn tip_height(&self) -> u32 {
            self.forkpoint + self.headers.len() as u32 - 1
        }

        fn tip_hash(&self) -> [u8; 32] {
            self.headers.last().expect("non-empty chain").hash
        }

        fn header_at(&self, height: u32) -> Option<&BlockHeader> {
            if height < self.forkpoint {
                return None;
            }
            self.headers.get((height - self.forkpoint) as usize)
        }
    }

    pub struct MemoryChainView {
        inner: RwLock<Inner>,
    }

    struct Inner {
        chains: HashMap<u64, Chain>,
        next_id: u64,
        genesis_hash: [u8; 32],
    }

    impl MemoryChainView {
        /// Builds a store with one chain containing `headers`, starting at
        /// height 0. `headers` must be PoW-linked (each `prev_hash` equal
        /// to the previous header's `hash`).
        pub fn new(headers: Vec<BlockHeader>) -> Self {
            assert!(!headers.is_empty(), "chain must have at least genesis");
            let genesis_hash = headers[0].hash;
            let mut chains = HashMap::new();
            chains.insert(
                0,
                Chain {
                    id: ChainId(0),
                    forkpoint: 0,
                    headers,
                },
            );
            Self {
                inner: RwLock::new(Inner {
                    chains,
                    next_id: 1,
                    genesis_hash,
                }),
            }
        }

        pub fn tip_header(&self, chain: ChainId) -> BlockHeader {
            self.inner.read().chains[&chain.0].headers.last().unwrap().clone()
        }

        pub fn push_header(&self, chain: ChainId, header: BlockHeader) {
            self.inner
                .read()
                .chains
                .get(&chain.0)
                .map(|c| c.tip_hash())
                .expect("chain exists");
            let mut inner = self.inner.write();
            let c = inner.chains.get_mut(&chain.0).unwrap();
            c.headers.push(header);
        }
    }

    impl ChainView for MemoryChainView {
        fn check_header(&self, header: &BlockHeader) -> Option<ChainId> {
            let inner = self.inner.read();
            for chain in inner.chains.values() {
                if chain.header_at(header.height).map(|h| h.hash) == Some(header.hash) {
                    return Some(chain.id);
                }
            }
            None
        }

        fn can_connect(&self, header: &BlockHeader, check_height: bool, _proof_was_provided: bool) -> ConnectOutcome {
            let inner = self.inner.read();
            for chain in inner.chains.values() {
                if check_height {
                    if header.height == chain.tip_height() + 1 && header.prev_hash == chain.tip_hash() {
                        return ConnectOutcome::Yes(chain.id);
                    }
                } else if let Some(parent) = chain.header_at(header.height.wrapping_sub(1)) {
                    if header.prev_hash == parent.hash {
                        return ConnectOutcome::Yes(chain.id);
                    }
                }
            }
            ConnectOutcome::No
        }

        fn save_header(&self, chain: ChainId, header: BlockHeader) {
            self.push_header(chain, header);
        }

        fn connect_chunk(
            &self,
            index: u32,
            hex: &str,
            _proof_was_provided: bool,
        ) -> Option<(ChainId, u32)> {
            let raw = hex::decode(hex).ok()?;
            let start_height = index * 2016;
            let header_len = 80;
            let total = (raw.len() / header_len) as u32;
            if total == 0 {
                return None;
            }

            let mut inner = self.inner.write();
            let chain_id = inner
                .chains
                .values()
                .find(|c| start_height <= c.tip_height() + 1 && start_height >= c.forkpoint)
                .map(|c| c.id)?;

            let mut connected_any = false;
            for i in 0..total {
                let bytes = &raw[(i as usize) * header_len..(i as usize + 1) * header_len];
                let height = start_height + i;
                let header = match deserialize_header(bytes, height) {
                    Some(h) => h,
                    None => break,
                };
                let chain = inner.chains.get_mut(&chain_id.0).unwrap();
                if height <= chain.tip_height() {
                    // Already known from a prior fetch; the chunk overlaps.
                    connected_any = true;
                    continue;
                }
                if height == chain.tip_height() + 1 && header.prev_hash == chain.tip_hash() {
                    chain.headers.push(header);
                    connected_any = true;
                } else {
                    break;
                }
            }
            connected_any.then_some((chain_id, total))
        }

        fn fork(&self, header: BlockHeader) -> ChainId {
            let mut inner = self.inner.write();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.chains.insert(
                id,
                Chain {
                    id: ChainId(id),
                    forkpoint: header.height,
                    headers: vec![header],
                },
            );
            ChainId(id)
        }

        fn height(&self, chain: ChainId) -> u32 {
            self.inner.read().chains[&chain.0].tip_height()
        }

        fn get_chainwork(&self, height: u32) -> u128 {
            height as u128
        }

        fn get_target(&self, _retarget_index: u32) -> [u8; 32] {
            [0xff; 32]
        }

        fn target_to_bits(&self, _target: [u8; 32]) -> u32 {
            0x1d00ffff
        }

        fn max_known_height(&self) -> u32 {
            self.inner
                .read()
                .chains
                .values()
                .map(Chain::tip_height)
                .max()
                .unwrap_or(0)
        }

        fn best_chain(&self) -> ChainId {
            let inner = self.inner.read();
            inner
                .chains
                .values()
                .max_by_key(|c| c.tip_height())
                .map(|c| c.id)
                .unwrap_or(ChainId(0))
        }
    }

    /// Builds a deterministic, PoW-linked header chain for tests: each
    /// header's `prev_hash` equals the previous header's `hash`, and the
    /// raw bytes vary by height so hashes differ.
    pub fn build_test_chain(start_height: u32, count: u32, prev: Option<[u8; 32]>) -> Vec<BlockHeader> {
        let mut headers = Vec::with_capacity(count as usize);
        let mut prev_hash = prev.unwrap_or([0u8; 32]);
        for i in 0..count {
            let height = start_height + i;
            let mut raw = vec![0u8; 80];
            raw[0..4].copy_from_slice(&1u32.to_le_bytes());
            raw[4..36].copy_from_slice(&prev_hash);
            raw[68..72].copy_from_slice(&height.to_le_bytes());
            let hash = sha256d(&raw);
            headers.push(BlockHeader {
                height,
                prev_hash,
                hash,
                raw,
            });
            prev_hash = hash;
        }
        headers
    }

    /// A `ChainParams` double with a configurable checkpoint height, for
    /// tests that need to exercise checkpoint-adjacent edge cases without
    /// mainnet-sized heights.
    pub struct TestChainParams {
        pub max_checkpoint: u32,
        pub verification_root: [u8; 32],
    }

    impl Default for TestChainParams {
        fn default() -> Self {
            Self {
                max_checkpoint: 0,
                verification_root: [0u8; 32],
            }
        }
    }

    impl ChainParams for TestChainParams {
        fn genesis_hash(&self) -> [u8; 32] {
            [0u8; 32]
        }

        fn verification_block_merkle_root(&self) -> [u8; 32] {
            self.verification_root
        }

        fn max_checkpoint(&self) -> u32 {
            self.max_checkpoint
        }

        fn retarget_interval(&self) -> u32 {
            2016
        }
    }
}
