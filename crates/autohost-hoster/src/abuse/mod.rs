mod moved_out;
mod spam;
mod votekick;

pub use moved_out::MovedOutTracker;
pub use spam::{ChatSpamState, SpamPolicy, is_spam_signature};
pub use votekick::{VoteKickError, VoteKickPolicy, VoteKickState, VoteOutcome, validate_prefix};

/// Abuse state shared by every instance. Each store owns its map behind its
/// own lock and purges expired entries inside the same critical section as
/// the operation that follows.
#[derive(Debug, Default)]
pub struct AbuseStores {
    pub votekick: VoteKickState,
    pub spam: ChatSpamState,
    pub moved_out: MovedOutTracker,
}
