//! Core configuration, constants, and error types.

mod config;
mod constants;
mod error;

pub use config::{Config, TransferMode};
pub use constants::*;
pub use error::{MembershipError, ReasonCode, StateError, TransferError};
