pub mod config;
pub mod constants;
pub mod error;
pub mod request;
pub mod status;

/// Returns true if the given value is equal to its default value.
/// Useful for #[serde(skip_serializing_if = "is_default")]
pub(crate) fn is_default<T: Default + PartialEq>(t: &T) -> bool {
    *t == Default::default()
}
