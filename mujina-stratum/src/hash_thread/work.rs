//! Work handed to hash threads, and what they hand back.

use std::sync::Arc;

use bitcoin::block::Version;
use bitcoin::pow::Target;

use crate::job_source::Job;
use crate::types::{Extranonce2, Extranonce2Error, Extranonce2Range};

/// A job plus the slice of its search space one worker owns.
///
/// Built by the dispatcher and handed over by value; the worker only reads
/// it. Workers given the same job get disjoint extranonce2 ranges.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkAssignment {
    pub job: Arc<Job>,

    /// Extranonce2 values this worker may search
    pub en2_range: Extranonce2Range,

    /// Share target in force when the assignment was made.
    ///
    /// Workers may use it to prefilter. The dispatcher still validates every
    /// candidate against the target current at validation time.
    pub target: Target,
}

impl WorkAssignment {
    pub fn new(
        job: Arc<Job>,
        en2_range: Extranonce2Range,
        target: Target,
    ) -> Result<Self, Extranonce2Error> {
        if en2_range.size != job.extranonce2_size {
            return Err(Extranonce2Error::WrongLength {
                expected: job.extranonce2_size,
                actual: en2_range.size as usize,
            });
        }
        Ok(Self {
            job,
            en2_range,
            target,
        })
    }

    /// First extranonce2 of the range.
    pub fn first_extranonce2(&self) -> Result<Extranonce2, Extranonce2Error> {
        Extranonce2::new(self.en2_range.min, self.en2_range.size)
    }

    /// Whether `other` covers the same search space, differing at most in
    /// target. A worker can keep its position across such a change.
    pub fn same_search_space(&self, other: &WorkAssignment) -> bool {
        Arc::ptr_eq(&self.job, &other.job) && self.en2_range == other.en2_range
    }
}

/// A possible solution reported by a worker.
///
/// Carries enough to rebuild the exact header it was found for. Consumed by
/// dispatcher validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub job_id: String,

    /// Session of the job, so candidates from an old session are recognized
    /// even if the pool reuses job ids
    pub session: Option<crate::job_source::SessionId>,

    pub extranonce2: Extranonce2,
    pub ntime: u32,
    pub nonce: u32,
    pub version: Version,
}

impl Candidate {
    /// A candidate for the given assignment's job.
    pub fn for_job(
        job: &Job,
        extranonce2: Extranonce2,
        ntime: u32,
        nonce: u32,
        version: Version,
    ) -> Self {
        Self {
            job_id: job.id.clone(),
            session: job.session(),
            extranonce2,
            ntime,
            nonce,
            version,
        }
    }
}
