//! # Economy Error Types
//!
//! All errors that can occur in the economy system.
//!
//! Player-facing variants are recovered by the presentation layer and shown
//! as a message. `StorageUnavailable` is the only retryable variant.
//! `CatalogLoad` is fatal and only produced at startup.

use thiserror::Error;

/// Errors that can occur in the economy system.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EconomyError {
    /// No record exists for the player.
    #[error("no record for player {0}")]
    NotFound(u64),

    /// The player already has an open mining session.
    #[error("player {0} already has an active mining session")]
    SessionAlreadyActive(u64),

    /// The player has no open mining session to close.
    #[error("player {0} has no active mining session")]
    NoActiveSession(u64),

    /// The operation is not allowed while a session is open.
    #[error("player {0} must end the current mining session first")]
    SessionInProgress(u64),

    /// The gear is already in the player's inventory.
    #[error("{0} is already owned")]
    AlreadyOwned(String),

    /// Balance is below the price.
    #[error("insufficient funds: need {required}, have {available}")]
    InsufficientFunds {
        /// Price of the purchase.
        required: u64,
        /// Current balance.
        available: u64,
    },

    /// None of the requested items produced any proceeds.
    #[error("nothing to sell")]
    NothingToSell,

    /// A recipe input is missing.
    #[error("insufficient materials: need {required} {item}, have {available}")]
    InsufficientMaterials {
        /// The item that was missing.
        item: String,
        /// The amount required.
        required: u64,
        /// The amount available.
        available: u64,
    },

    /// Item key not present in the catalog.
    #[error("unknown item: {0}")]
    UnknownItem(String),

    /// Gear key not sold in the shop.
    #[error("unknown gear: {0}")]
    UnknownGear(String),

    /// Mine key not present in the catalog.
    #[error("unknown mine: {0}")]
    UnknownMine(String),

    /// Recipe key not present in the catalog.
    #[error("unknown recipe: {0}")]
    UnknownRecipe(String),

    /// Mine requires more experience than the player has.
    #[error("{mine} requires {required} xp, player has {current}")]
    MineLocked {
        /// The mine that was requested.
        mine: String,
        /// Experience required to enter.
        required: u64,
        /// Player's current experience.
        current: u64,
    },

    /// A quantity argument was zero or otherwise unusable.
    #[error("invalid quantity: {0}")]
    InvalidQuantity(u64),

    /// Arithmetic overflow in a balance or count.
    #[error("arithmetic overflow in economic calculation")]
    ArithmeticOverflow,

    /// The record store could not complete the operation in time.
    #[error("storage unavailable, try again: {0}")]
    StorageUnavailable(String),

    /// Persisted data could not be decoded.
    #[error("corrupt storage: {0}")]
    CorruptStorage(String),

    /// The progression catalog is malformed or inconsistent.
    #[error("catalog load failed: {0}")]
    CatalogLoad(String),

    /// Invalid engine configuration file.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl EconomyError {
    /// Returns true if repeating the operation may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }

    /// Returns true if the error was caused by the player's request rather
    /// than by storage or configuration.
    #[must_use]
    pub const fn is_player_facing(&self) -> bool {
        !matches!(
            self,
            Self::StorageUnavailable(_)
                | Self::CorruptStorage(_)
                | Self::CatalogLoad(_)
                | Self::InvalidConfig(_)
                | Self::ArithmeticOverflow
        )
    }
}

/// Result type for economy operations.
pub type EconomyResult<T> = Result<T, EconomyError>;
