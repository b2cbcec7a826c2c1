use std::time::Duration;

/// Fixed stream configuration shared by both the `queued` and
/// `completed` streams. See the design ledger for why every field here
/// is hardcoded rather than plumbed through CLI flags: none of the
/// historical revisions this was distilled from exposed them either.
pub const MAX_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);
pub const MAX_MESSAGE_SIZE: i64 = 4 * 1024 * 1024;
pub const DEDUPLICATE_WINDOW: Duration = Duration::from_secs(60 * 60);
pub const REPLICAS: usize = 1;

/// Queue-level redelivery is bounded; this is the "at-least-once" half
/// of the work-queue contract. Application code never retries a publish
/// itself (§7 of the design notes): the upstream webhook sender does.
pub const MAX_DELIVER: i64 = 5;
