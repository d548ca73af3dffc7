pub mod bank;
pub mod lipana;
pub mod mpesa;
pub mod payhero;

/// Trimmed value, or `None` when missing or blank
pub(crate) fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
