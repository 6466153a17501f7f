//! Known-good mining data for tests.

/// Bitcoin's genesis block, cut up as if a pool had sent it over Stratum.
///
/// The coinbase split points are arbitrary; only the concatenation matters.
/// With no merkle branches the coinbase txid is the block's merkle root, and
/// nonce 2083236893 meets the difficulty-1 target.
pub mod genesis {
    use bitcoin::block::Version;
    use bitcoin::hashes::Hash;
    use bitcoin::{BlockHash, CompactTarget, TxMerkleNode};

    use crate::job_source::{Job, JobOrigin};
    use crate::types::Extranonce2;

    pub(crate) use crate::job_source::dummy::GENESIS_COINBASE_HEX as COINBASE_HEX;

    /// Merkle root in internal byte order.
    pub const MERKLE_ROOT_HEX: &str =
        "3ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a";

    pub const BLOCK_HASH_DISPLAY: &str =
        "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";

    pub const NONCE: u32 = 2083236893;
    pub(crate) use crate::job_source::dummy::{GENESIS_BITS as BITS, GENESIS_TIME as TIME};

    const EN1_AT: usize = 50;
    const EN2_AT: usize = 54;
    const CB2_AT: usize = 58;

    pub fn coinbase_tx() -> Vec<u8> {
        hex::decode(COINBASE_HEX).unwrap()
    }

    pub fn coinbase1() -> Vec<u8> {
        coinbase_tx()[..EN1_AT].to_vec()
    }

    pub fn extranonce1() -> Vec<u8> {
        coinbase_tx()[EN1_AT..EN2_AT].to_vec()
    }

    pub fn extranonce2() -> Extranonce2 {
        Extranonce2::from_bytes(&coinbase_tx()[EN2_AT..CB2_AT], 4).unwrap()
    }

    pub fn coinbase2() -> Vec<u8> {
        coinbase_tx()[CB2_AT..].to_vec()
    }

    pub fn merkle_root() -> TxMerkleNode {
        TxMerkleNode::from_slice(&hex::decode(MERKLE_ROOT_HEX).unwrap()).unwrap()
    }

    /// The genesis work as a job with the given id and origin.
    pub fn job(id: &str, origin: JobOrigin) -> Job {
        Job {
            id: id.to_string(),
            origin,
            prev_blockhash: BlockHash::all_zeros(),
            coinbase1: coinbase1(),
            coinbase2: coinbase2(),
            merkle_branches: Vec::new(),
            version: Version::ONE,
            version_mask: None,
            bits: CompactTarget::from_consensus(BITS),
            time: TIME,
            extranonce1: extranonce1(),
            extranonce2_size: 4,
        }
    }
}
