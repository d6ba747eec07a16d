pub const TABLE_EVENTS: &str = "events";
pub const COLUMN_ACTOR_ID: &str = "actor_id";
pub const COLUMN_CREATED_AT: &str = "created_at";
pub const COLUMN_EVENT: &str = "event";
pub const COLUMN_PERSON_ID: &str = "person_id";

/// Bucket label the breakdown limiter collapses overflow values into.
pub const OTHER_BUCKET: &str = "Other";

/// Synthetic cohort id that matches every actor.
pub const ALL_USERS_COHORT: u64 = 0;
