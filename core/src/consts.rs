/// Default significance threshold for deposit/withdrawal flows (0.01 native).
pub const DEFAULT_FLOW_THRESHOLD: u64 = 10_000_000;

/// Placeholder for proof tags and addresses this analysis cannot recover.
pub const UNKNOWN: &str = "unknown";

pub const MS_PER_SECOND: i64 = 1_000;
pub const MS_PER_DAY: i64 = 86_400_000;

/// Default correlation window: 30 days.
pub const DEFAULT_MAX_WINDOW_MS: i64 = 30 * MS_PER_DAY;

/// Basis point denominator.
pub const BPS: u64 = 10_000;

/// Default maximum fee ratio accepted by the candidate filter (5%).
pub const DEFAULT_MAX_FEE_BPS: u64 = 500;

/// Default fee assumed when a withdrawal carries no explicit fee (0.5%).
pub const DEFAULT_EXPECTED_FEE_BPS: u64 = 50;

/// Time score decays as exp(-delta / (window / TIME_DECAY_DIVISOR)).
pub const TIME_DECAY_DIVISOR: f64 = 5.0;

/// Minimum confidence for a unique candidate to mark its deposit spent.
pub const DEFAULT_SPEND_CONFIDENCE: f64 = 0.8;

/// Fetch client defaults.
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 2_000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_REQUEST_INTERVAL_MS: u64 = 250;

/// Largest page accepted by getSignaturesForAddress.
pub const MAX_SIGNATURE_PAGE: usize = 1_000;

/// Indexer defaults.
pub const DEFAULT_BATCH_SIZE: usize = 5;
pub const DEFAULT_BATCH_DELAY_MS: u64 = 500;

/// Token program ids recognised by the confidential-transfer parser.
pub const TOKEN_2022_PROGRAM_ID: &str = "TokenzQdBNbLqP5VEhdkAS6EPFLC1PHnBqCXEpPxuEb";
