//! Fixed configuration constants. These are deploy-time values, not runtime flags.

use std::time::Duration;

use chrono::NaiveDate;

/// Records published before this date are legacy.
pub const LEGACY_CUTOFF: NaiveDate = match NaiveDate::from_ymd_opt(2023, 4, 27) {
    Some(date) => date,
    None => panic!("legacy cutoff is not a calendar date"),
};

/// Ceiling for direct web fetches against one host.
pub const REQUESTS_PER_SECOND: u32 = 2;

/// Minimum spacing between direct fetches, derived from [`REQUESTS_PER_SECOND`].
pub const DEFAULT_MIN_DELAY: Duration = Duration::from_millis(1000 / REQUESTS_PER_SECOND as u64);

/// Per-request timeout for direct web fetches.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Ceiling for the single bulk query against the search index.
pub const BULK_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest result window the search index serves in one request.
pub const BULK_PAGE_SIZE_MAX: usize = 10_000;

pub const DEFAULT_ELASTIC_URL: &str = "https://elasticsearch.aonprd.com/aon/_search";

pub const DEFAULT_CATEGORY: &str = "trait";

/// Attribution used when a hit carries no `source` field.
pub const DEFAULT_SOURCE_NAME: &str = "Archives of Nethys";

pub const DEFAULT_USER_AGENT: &str = "traitsync-bot/0.1";
