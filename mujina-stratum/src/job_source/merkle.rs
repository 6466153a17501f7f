//! Coinbase assembly and merkle root computation.
//!
//! Stratum hands out the coinbase transaction split around the extranonce:
//!
//! ```text
//! coinbase = coinbase1 || extranonce1 || extranonce2 || coinbase2
//! ```
//!
//! The coinbase txid is the double-SHA256 of that serialization (pools send
//! the non-witness form). The merkle branch lists the sibling hashes on the
//! path from the coinbase leaf to the root, so the root is a left fold:
//!
//! ```text
//! root = sha256d(... sha256d(sha256d(txid || b0) || b1) ... || bn)
//! ```

use bitcoin::hashes::{sha256d, Hash};
use bitcoin::TxMerkleNode;

use crate::types::Extranonce2;

/// Concatenate the coinbase parts into the full serialized transaction.
pub fn assemble_coinbase(
    coinbase1: &[u8],
    extranonce1: &[u8],
    extranonce2: &Extranonce2,
    coinbase2: &[u8],
) -> Vec<u8> {
    let mut coinbase = Vec::with_capacity(
        coinbase1.len() + extranonce1.len() + extranonce2.size() as usize + coinbase2.len(),
    );
    coinbase.extend_from_slice(coinbase1);
    coinbase.extend_from_slice(extranonce1);
    extranonce2.extend_vec(&mut coinbase);
    coinbase.extend_from_slice(coinbase2);
    coinbase
}

/// Compute the merkle root from a serialized coinbase and its branch.
pub fn compute_merkle_root(coinbase: &[u8], branches: &[TxMerkleNode]) -> TxMerkleNode {
    let mut node = sha256d::Hash::hash(coinbase).to_byte_array();
    let mut buf = [0u8; 64];
    for branch in branches {
        buf[..32].copy_from_slice(&node);
        buf[32..].copy_from_slice(branch.as_byte_array());
        node = sha256d::Hash::hash(&buf).to_byte_array();
    }
    TxMerkleNode::from_byte_array(node)
}
