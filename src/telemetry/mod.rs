mod contribution;

pub use contribution::{ContributionMeter, ContributionSnapshot};
