//! Command-line entry points.

pub mod models;
pub mod pause;
pub mod report;
pub mod resume;
pub mod start;
pub mod tasks;

/// Split a comma-separated CLI value into trimmed, non-empty parts.
pub fn split_csv(value: Option<&str>) -> Vec<String> {
    value
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}
