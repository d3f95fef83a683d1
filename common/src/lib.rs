//! Shared support for the rill runtime: the common error type and the
//! chunk codec used by column vectors.

pub mod codec;
pub mod error;

pub use codec::{decode_i64, encode_i64, Codec};
pub use error::{CommonError, Result};
