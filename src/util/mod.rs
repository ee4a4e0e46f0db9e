mod exp_filter;
pub use exp_filter::ExpFilter;

mod rate_statistics;
pub use rate_statistics::RateStatistics;
