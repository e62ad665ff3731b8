pub mod ownership;
pub mod period;
pub mod summary_contracts;

pub use ownership::{normalize_domain, OwnershipMapping, OwnershipMappingError, OwnershipPair};
pub use period::{
    check_anchor, parse_anchor, parse_anchor_str, periods, MonthKey, PeriodKey, ValidationError,
    THIRTY_DAYS_TOKEN, WINDOW_MONTHS,
};
pub use summary_contracts::{
    derive, AggregateSource, CategoryPercentages, CategoryTotals, SourceError, Summary,
};
