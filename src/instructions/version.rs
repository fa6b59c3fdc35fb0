//! Version string encoding.
//!
//! Instruction versions are displayed as `"<major>.<minor>"` and stored
//! zero-padded so the version index (which compares bytes) sorts in numeric
//! order. Both components are padded to four digits; a component past 9999
//! keeps its full width and falls out of numeric order, the documented cliff
//! of the padded encoding.

/// Width each version component is zero-padded to in storage.
const PAD_WIDTH: usize = 4;

/// Version assigned to the first instruction of an agent.
pub const FIRST_VERSION: &str = "1.0";

/// Encode a display version into its padded storage form.
/// A missing minor component defaults to `"0"`: `"2"` becomes `"0002.0000"`.
pub fn pad(version: &str) -> String {
    let mut parts = version.splitn(2, '.');
    let major = parts.next().unwrap_or("0");
    let minor = parts.next().unwrap_or("0");
    format!(
        "{major:0>width$}.{minor:0>width$}",
        major = major,
        minor = minor,
        width = PAD_WIDTH
    )
}

/// Decode a padded storage version back into display form.
pub fn unpad(padded: &str) -> String {
    let mut parts = padded.splitn(2, '.');
    let major = strip_zeros(parts.next().unwrap_or("0"));
    let minor = strip_zeros(parts.next().unwrap_or("0"));
    format!("{major}.{minor}")
}

/// The auto-assigned successor of `latest` (display form): minor + 1.
/// An unparseable minor counts as 0, so the bump still yields a number.
pub fn bump_minor(latest: &str) -> String {
    let mut parts = latest.splitn(2, '.');
    let major = parts.next().unwrap_or("0");
    let minor: u64 = parts.next().unwrap_or("0").parse().unwrap_or(0);
    format!("{major}.{}", minor + 1)
}

fn strip_zeros(component: &str) -> &str {
    let stripped = component.trim_start_matches('0');
    if stripped.is_empty() {
        "0"
    } else {
        stripped
    }
}
