//! Mining job and share types.

use bitcoin::block::{Header as BlockHeader, Version};
use bitcoin::hash_types::BlockHash;
use bitcoin::pow::{CompactTarget, Target};
use bitcoin::TxMerkleNode;

use super::merkle::{assemble_coinbase, compute_merkle_root};
use crate::types::{Extranonce2, Extranonce2Error, Extranonce2Range};

/// Identifies one pool session (one subscribe on one connection).
///
/// Incremented on every successful handshake. Work and shares tagged with an
/// older session are void: a reconnect hands out a new extranonce1.
pub type SessionId = u64;

/// Where a job came from, and therefore where its shares may go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobOrigin {
    /// Received from a pool session; shares are submitted back to it.
    Pool { session: SessionId },
    /// Synthesized locally; shares are never submitted anywhere.
    Dummy,
}

/// A unit of work from a job source.
///
/// Immutable once built; the dispatcher shares it with workers behind an
/// `Arc`. Holds everything needed to rebuild any header in its search space:
/// the coinbase parts and merkle branch (for the merkle root given an
/// extranonce2), plus the fixed header fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Identifier assigned by the source
    pub id: String,

    pub origin: JobOrigin,

    pub prev_blockhash: BlockHash,

    /// Coinbase transaction before the extranonce
    pub coinbase1: Vec<u8>,

    /// Coinbase transaction after the extranonce
    pub coinbase2: Vec<u8>,

    pub merkle_branches: Vec<TxMerkleNode>,

    /// Base block version
    pub version: Version,

    /// Version bits the pool allows us to roll, if negotiated
    pub version_mask: Option<u32>,

    /// Network target of the block (not the share target)
    pub bits: CompactTarget,

    pub time: u32,

    /// Session-scoped prefix assigned by the pool at subscribe
    pub extranonce1: Vec<u8>,

    pub extranonce2_size: u8,
}

impl Job {
    /// Whether shares for this job go anywhere.
    pub fn is_submittable(&self) -> bool {
        matches!(self.origin, JobOrigin::Pool { .. })
    }

    pub fn session(&self) -> Option<SessionId> {
        match self.origin {
            JobOrigin::Pool { session } => Some(session),
            JobOrigin::Dummy => None,
        }
    }

    /// Full extranonce2 space for this job.
    pub fn extranonce2_range(&self) -> Result<Extranonce2Range, Extranonce2Error> {
        Extranonce2Range::new(self.extranonce2_size)
    }

    pub fn coinbase(&self, extranonce2: &Extranonce2) -> Result<Vec<u8>, Extranonce2Error> {
        if extranonce2.size() != self.extranonce2_size {
            return Err(Extranonce2Error::WrongLength {
                expected: self.extranonce2_size,
                actual: extranonce2.size() as usize,
            });
        }
        Ok(assemble_coinbase(
            &self.coinbase1,
            &self.extranonce1,
            extranonce2,
            &self.coinbase2,
        ))
    }

    pub fn merkle_root(&self, extranonce2: &Extranonce2) -> Result<TxMerkleNode, Extranonce2Error> {
        let coinbase = self.coinbase(extranonce2)?;
        Ok(compute_merkle_root(&coinbase, &self.merkle_branches))
    }

    /// Header for a given merkle root and the rolled fields.
    pub fn header(
        &self,
        merkle_root: TxMerkleNode,
        ntime: u32,
        version: Version,
        nonce: u32,
    ) -> BlockHeader {
        BlockHeader {
            version,
            prev_blockhash: self.prev_blockhash,
            merkle_root,
            time: ntime,
            bits: self.bits,
            nonce,
        }
    }

    /// Recompute the proof-of-work hash for one point in the search space.
    pub fn block_hash(
        &self,
        extranonce2: &Extranonce2,
        ntime: u32,
        version: Version,
        nonce: u32,
    ) -> Result<BlockHash, Extranonce2Error> {
        let merkle_root = self.merkle_root(extranonce2)?;
        Ok(self.header(merkle_root, ntime, version, nonce).block_hash())
    }

    /// Whether `version` only differs from the base version in rollable bits.
    pub fn version_allowed(&self, version: Version) -> bool {
        let changed = (version.to_consensus() ^ self.version.to_consensus()) as u32;
        changed & !self.version_mask.unwrap_or(0) == 0
    }

    /// Bits to send as the `mining.submit` version parameter, if rolling.
    pub fn version_bits(&self, version: Version) -> Option<u32> {
        self.version_mask
            .map(|mask| (version.to_consensus() ^ self.version.to_consensus()) as u32 & mask)
    }
}

/// A candidate that passed local validation, ready for submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Share {
    pub job_id: String,
    pub origin: JobOrigin,
    pub extranonce2: Extranonce2,
    pub ntime: u32,
    pub nonce: u32,
    pub version: Version,

    /// Rolled version bits to report, when version rolling is active
    pub version_bits: Option<u32>,

    pub hash: BlockHash,

    /// Target the share was validated against
    pub target: Target,

    /// Name of the hash thread that found it
    pub worker: String,
}
