/// Longest material or activity name accepted.
pub const MAX_NAME_LEN: usize = 256;

/// Longest user id accepted from the auth collaborator.
pub const MAX_USER_ID_LEN: usize = 128;

/// Longest incident description.
pub const MAX_DESCRIPTION_LEN: usize = 4096;

/// Largest stock a single material record may hold.
pub const MAX_MATERIAL_QUANTITY: u32 = 100_000;

/// Upper bound on activities fetched per scanner batch.
pub const MAX_SCAN_BATCH: usize = 1_000;

/// Records per commit frame when the WAL is compacted.
pub const COMPACT_COMMIT_RECORDS: usize = 512;
