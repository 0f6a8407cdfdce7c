// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Merkle-proof validation anchoring a header below the checkpoint height
//! to the hard-coded `VERIFICATION_BLOCK_MERKLE_ROOT`. Never trust a
//! peer-supplied chain of evidence without independently re-deriving the
//! value it's supposed to prove.

use crate::chain::sha256d;
use crate::error::ProtocolError;

/// Reverses a 32-byte hash. Wire hashes (the `root`/`branch` hex fields, and
/// the hard-coded checkpoint constant) are conventional big-endian display
/// order; `sha256d` output — and therefore `header_hash` and every value
/// `root_from_proof` produces or consumes — is internal little-endian byte
/// order. Every wire value has to cross this bridge once before it's
/// compared against or folded into an internal-order hash.
pub(crate) fn reversed(bytes: [u8; 32]) -> [u8; 32] {
    let mut out = bytes;
    out.reverse();
    out
}

/// Recomputes the Merkle root implied by `leaf` at `index` climbing
/// `branch`, one sibling hash per level starting at the leaf's depth and
/// working up toward the root. At each level, `index`'s parity decides
/// whether the running hash is the left or right child. `leaf` and every
/// `branch` entry must already be in internal byte order, matching
/// `sha256d`'s output.
pub fn root_from_proof(leaf: [u8; 32], branch: &[[u8; 32]], index: u32) -> [u8; 32] {
    let mut current = leaf;
    let mut index = index;
    for sibling in branch {
        let mut data = Vec::with_capacity(64);
        if index & 1 == 0 {
            data.extend_from_slice(&current);
            data.extend_from_slice(sibling);
        } else {
            data.extend_from_slice(sibling);
            data.extend_from_slice(&current);
        }
        current = sha256d(&data);
        index >>= 1;
    }
    current
}

/// Validates a checkpoint proof envelope.
///
/// `merkle_root` and `branch` must already be reversed to internal byte
/// order by the caller (the wire carries them in display/big-endian hex);
/// `expected_root` is the hard-coded `VERIFICATION_BLOCK_MERKLE_ROOT`
/// constant in its native (display) convention and is reversed here before
/// use, since everything it's compared against — the received root and the
/// `root_from_proof` reconstruction — is internal-order.
pub fn validate_checkpoint_proof(
    header_bytes: &[u8],
    header_height: u32,
    merkle_root: [u8; 32],
    branch: &[[u8; 32]],
    expected_root: [u8; 32],
) -> Result<(), ProtocolError> {
    let expected_internal = reversed(expected_root);
    if merkle_root != expected_internal {
        return Err(ProtocolError::UnexpectedMerkleRoot {
            expected: hex::encode(expected_root),
            got: hex::encode(reversed(merkle_root)),
        });
    }

    let header_hash = sha256d(header_bytes);
    let reconstructed = root_from_proof(header_hash, branch, header_height);
    if reconstructed != expected_internal {
        return Err(ProtocolError::IncorrectMerkleBranch {
            expected: hex::encode(expected_root),
            proved: hex::encode(reversed(reconstructed)),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(n: u8) -> [u8; 32] {
        let mut h = [0u8; 32];
        h[0] = n;
        h
    }

    fn pair_hash(a: [u8; 32], b: [u8; 32]) -> [u8; 32] {
        let mut data = Vec::with_capacity(64);
        data.extend_from_slice(&a);
        data.extend_from_slice(&b);
        sha256d(&data)
    }

    #[test]
    fn root_from_proof_reconstructs_simple_two_leaf_tree() {
        let left = leaf(1);
        let right = leaf(2);
        let root = pair_hash(left, right);
        assert_eq!(root_from_proof(left, &[right], 0), root);
        assert_eq!(root_from_proof(right, &[left], 1), root);
    }

    #[test]
    fn validate_checkpoint_proof_accepts_matching_root() {
        let header_bytes = vec![0u8; 80];
        let header_hash = sha256d(&header_bytes);
        let sibling = leaf(9);
        let root_internal = pair_hash(header_hash, sibling);
        // `expected_root` is in the hard-coded, display-order convention;
        // the function reverses it internally before comparing.
        let expected_root = reversed(root_internal);
        assert!(validate_checkpoint_proof(&header_bytes, 0, root_internal, &[sibling], expected_root).is_ok());
    }

    #[test]
    fn validate_checkpoint_proof_rejects_root_mismatch() {
        let header_bytes = vec![0u8; 80];
        let wrong_root = leaf(42);
        let expected = leaf(7);
        let err =
            validate_checkpoint_proof(&header_bytes, 0, wrong_root, &[leaf(1)], expected).unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedMerkleRoot { .. }));
    }

    #[test]
    fn validate_checkpoint_proof_rejects_bad_branch() {
        let header_bytes = vec![0u8; 80];
        let header_hash = sha256d(&header_bytes);
        let sibling = leaf(9);
        let root_internal = pair_hash(header_hash, sibling);
        let expected_root = reversed(root_internal);
        // Root matches the expected constant but the branch doesn't
        // actually reconstruct it from this header.
        let wrong_sibling = leaf(99);
        let err = validate_checkpoint_proof(&header_bytes, 0, root_internal, &[wrong_sibling], expected_root)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::IncorrectMerkleBranch { .. }));
    }

    /// Exercises the full wire round trip: values as they'd actually arrive
    /// over JSON-RPC (big-endian display hex, decoded but not yet
    /// reversed) must be reversed to internal order before this function
    /// will accept them — feeding them through unreversed, the historical
    /// bug, must be rejected even when the header and proof are otherwise
    /// entirely valid.
    #[test]
    fn validate_checkpoint_proof_requires_wire_values_reversed_to_internal_order() {
        let header_bytes = vec![7u8; 80];
        let header_hash = sha256d(&header_bytes);
        let sibling_internal = leaf(3);
        let root_internal = pair_hash(header_hash, sibling_internal);

        // What the wire actually carries: the byte-reversed (display-order)
        // form of the internal-order values above.
        let root_wire = reversed(root_internal);
        let sibling_wire = reversed(sibling_internal);
        let expected_root_hardcoded = root_wire;

        // Correct usage: reverse wire values back to internal order first.
        let merkle_root = reversed(root_wire);
        let branch = vec![reversed(sibling_wire)];
        assert!(validate_checkpoint_proof(&header_bytes, 0, merkle_root, &branch, expected_root_hardcoded).is_ok());

        // Historical bug: pass wire-order values straight through.
        let err =
            validate_checkpoint_proof(&header_bytes, 0, root_wire, &[sibling_wire], expected_root_hardcoded)
                .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnexpectedMerkleRoot { .. } | ProtocolError::IncorrectMerkleBranch { .. }
        ));
    }
}
