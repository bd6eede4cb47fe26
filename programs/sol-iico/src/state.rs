use anchor_lang::prelude::*;

/// One entry in the sorted bid ledger.
///
/// Bids live in an arena (`AuctionState::bids`); a bid's id is its index.
/// `prev`/`next` are arena indices forming a doubly-linked cycle through the
/// two sentinels (`HEAD_ID`, `TAIL_ID`), kept sorted ascending by
/// `(cap_valuation, id)`.
#[derive(AnchorSerialize, AnchorDeserialize, Clone, Debug, PartialEq, Eq)]
pub struct Bid {
    pub prev: u64,
    pub next: u64,

    // Maximum total raise the bidder tolerates. Fixed at creation.
    pub cap_valuation: u128,
    // Currency atomic units still committed. Only ever decreases.
    pub contribution: u64,
    // Fixed-point bonus (base BONUS_DIVISOR). Fixed except the withdrawal
    // penalty, which divides it by 3 once.
    pub bonus_rate: u64,

    pub owner: Pubkey,

    // Excess truncated off the cutoff bid at clearing, collected at redeem.
    pub refund_credit: u64,

    pub withdrawn: bool,
    pub redeemed: bool,
}

impl Bid {
    pub const LEN: usize = 8 + 8 + 16 + 8 + 8 + 32 + 8 + 1 + 1;
}

#[account]
pub struct AuctionState {
    pub authority: Pubkey,

    // SPL mints
    pub token_mint: Pubkey,
    pub currency_mint: Pubkey,

    // Program vaults (SPL token accounts) holding the lot + escrowed currency
    pub token_vault: Pubkey,
    pub currency_vault: Pubkey,

    // Currency token account that receives the accepted proceeds
    pub beneficiary: Pubkey,

    // PDA bump for signing vault transfers
    pub vault_authority_bump: u8,

    // Sale schedule, strictly increasing:
    // start < full_bonus_end < withdrawal_lock < end
    pub start_time: i64,
    pub full_bonus_end_time: i64,
    pub withdrawal_lock_time: i64,
    pub end_time: i64,

    // Bonus at the very start of the sale (base BONUS_DIVISOR)
    pub max_bonus_rate: u64,

    pub whitelist_required: bool,

    // Lot bound once from the token vault balance, then frozen
    pub supply_for_sale: u64,
    pub supply_bound: bool,

    // Clearing state. `cutoff_bid_id` starts at TAIL_ID and walks toward
    // HEAD_ID across repeated finalize calls; totals are monotone until
    // `finalized`, then frozen.
    pub finalized: bool,
    pub cutoff_bid_id: u64,
    pub accepted_contribution: u64,
    pub accepted_weighted_contribution: u128,

    pub proceeds_swept: bool,

    // Arena capacity fixed at initialization (account space is preallocated)
    pub max_bids: u32,
    pub bids: Vec<Bid>,
}

impl AuctionState {
    pub const FIXED_LEN: usize = 8 // discriminator
        + 32 * 6 // pubkeys
        + 1 // vault_authority_bump
        + 8 * 4 // schedule
        + 8 // max_bonus_rate
        + 1 // whitelist_required
        + 8 + 1 // supply_for_sale, supply_bound
        + 1 + 8 + 8 + 16 // clearing state
        + 1 // proceeds_swept
        + 4; // max_bids

    pub fn space(max_bids: u32) -> usize {
        Self::FIXED_LEN + 4 + (max_bids as usize) * Bid::LEN
    }
}

/// Per-owner ownership index: the ids of every bid this owner created, in
/// creation order. Append-only.
#[account]
pub struct Contributor {
    pub auction: Pubkey,
    pub owner: Pubkey,
    // Lifetime currency deposited (never decreases; used for whitelist
    // ceilings and auditing)
    pub total_deposited: u64,
    pub bid_ids: Vec<u64>,
}

impl Contributor {
    pub const MAX_OWNED_BIDS: usize = 32;
    pub const LEN: usize = 8 + 32 + 32 + 8 + 4 + Self::MAX_OWNED_BIDS * 8;
}

/// Capability grant consulted before accepting a contribution when the sale
/// runs whitelisted. `ceiling == 0` means no per-identity limit.
#[account]
pub struct WhitelistEntry {
    pub auction: Pubkey,
    pub account: Pubkey,
    pub ceiling: u64,
}

impl WhitelistEntry {
    pub const LEN: usize = 8 + 32 + 32 + 8;
}
