pub mod entries;
pub mod routes;
pub mod state;
pub mod values;

pub use routes::router;

/// Keys and channel ids are single path segments of bounded length.
pub(crate) fn valid_segment(segment: &str) -> bool {
    !segment.is_empty() && segment.len() <= 128 && !segment.contains('/')
}
