//! Core value types shared across the miner.

mod difficulty;
mod extranonce2;
mod hash_rate;

pub use difficulty::{min_leading_zeros, Difficulty, DifficultyError};
pub use extranonce2::{Extranonce2, Extranonce2Error, Extranonce2Iter, Extranonce2Range};
pub use hash_rate::HashRate;
