//! CLI command implementations

pub mod consume;
pub mod produce;
pub mod versions;

pub use consume::ConsumeArgs;
pub use produce::ProduceArgs;

/// Split repeated or comma-separated values
pub(crate) fn split_list(values: &[String]) -> Vec<String> {
    values
        .iter()
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}
