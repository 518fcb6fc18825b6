use crate::error::{Error, Result};

/// Validate a user or sandbox ID: lowercase alphanumeric + `-` + `_`, 1-63 chars.
///
/// IDs end up in filesystem paths and storage keys, so the character set is
/// deliberately narrow.
pub fn validate_id(id: &str, kind: &str) -> Result<()> {
    if id.is_empty() || id.len() > 63 {
        return Err(Error::invalid(format!(
            "{} ID must be 1-63 characters, got {}",
            kind,
            id.len()
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    {
        return Err(Error::invalid(format!(
            "{} ID must be lowercase alphanumeric, hyphens, or underscores: {:?}",
            kind, id
        )));
    }
    if id.starts_with('-') || id.ends_with('-') {
        return Err(Error::invalid(format!(
            "{} ID must not start or end with a hyphen: {:?}",
            kind, id
        )));
    }
    Ok(())
}

/// Generate a sandbox ID: "sbx-" followed by 12 hex chars.
pub fn generate_sandbox_id() -> String {
    format!("sbx-{}", hex_suffix(6))
}

/// Generate a background job ID: "job-" followed by 8 hex chars.
pub fn generate_job_id() -> String {
    format!("job-{}", hex_suffix(4))
}

/// Generate a snapshot ID: `snap_<YYYY_MM_DD_HHMMSS>_<rand8>`.
///
/// The timestamp prefix makes IDs sort chronologically and lets `created_at`
/// be recovered when sidecar metadata is lost.
pub fn generate_snapshot_id() -> String {
    let stamp = chrono::Utc::now().format("%Y_%m_%d_%H%M%S");
    format!("snap_{}_{}", stamp, hex_suffix(4))
}

/// Parse the creation timestamp embedded in a snapshot ID.
pub fn snapshot_created_at(snapshot_id: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    let rest = snapshot_id
        .strip_prefix("snap_")
        .ok_or_else(|| Error::invalid(format!("Not a snapshot ID: {:?}", snapshot_id)))?;
    // snap_YYYY_MM_DD_HHMMSS or snap_YYYY_MM_DD_HHMMSS_<rand>
    let stamp: String = rest.chars().take("YYYY_MM_DD_HHMMSS".len()).collect();
    let naive = chrono::NaiveDateTime::parse_from_str(&stamp, "%Y_%m_%d_%H%M%S")
        .map_err(|_| Error::invalid(format!("Bad snapshot timestamp in {:?}", snapshot_id)))?;
    Ok(naive.and_utc())
}

/// Validate a snapshot ID before using it in a storage key.
pub fn validate_snapshot_id(id: &str) -> Result<()> {
    if !id.starts_with("snap_")
        || !id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(Error::invalid(format!("Malformed snapshot ID: {:?}", id)));
    }
    snapshot_created_at(id)?;
    Ok(())
}

fn hex_suffix(bytes: usize) -> String {
    let id = uuid::Uuid::new_v4();
    id.as_bytes()[..bytes]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
