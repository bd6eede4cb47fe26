use anchor_lang::prelude::*;

#[error_code]
pub enum IicoError {
    #[msg("Current time is outside the bidding window")]
    OutOfWindow,
    #[msg("Insertion hint does not match the sorted position for this cap")]
    BadPosition,
    #[msg("Caller is not the owner of this bid")]
    Unauthorized,
    #[msg("Withdrawals are locked for the remainder of the sale")]
    LockedWindow,
    #[msg("Bid has already been withdrawn")]
    AlreadyWithdrawn,
    #[msg("Bid has already been redeemed")]
    AlreadyRedeemed,
    #[msg("Clearing has not completed yet")]
    NotFinalized,
    #[msg("Sale has not ended yet")]
    TooEarly,
    #[msg("Proceeds have already been swept")]
    AlreadySwept,
    #[msg("Contribution denied by the whitelist policy")]
    InsufficientCapability,

    #[msg("Sale schedule boundaries are not strictly increasing")]
    InvalidSaleSchedule,
    #[msg("Invalid bid id")]
    InvalidBidId,
    #[msg("Cap valuation must be below the tail sentinel key")]
    InvalidCapValuation,
    #[msg("Bid ledger is at capacity")]
    LedgerFull,
    #[msg("Contributor already owns the maximum number of bids")]
    TooManyOwnedBids,
    #[msg("Supply for sale has already been bound")]
    SupplyAlreadyBound,
    #[msg("Supply for sale has not been bound")]
    SupplyNotBound,

    // Internal consistency fault: a computed refund exceeded the remaining
    // contribution. Aborts the instruction before any transfer.
    #[msg("Computed refund exceeds remaining contribution")]
    InconsistentRefund,

    #[msg("Math overflow")]
    MathOverflow,
    #[msg("Settlement amount exceeds u64")]
    AmountTooLarge,
}
