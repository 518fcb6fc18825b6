pub mod sandboxes;
pub mod snapshots;
pub mod system;

use axum::http::HeaderMap;

use sbx_core::error::Error;
use sbx_core::naming;

use crate::error::ApiError;

/// Header carrying the externally verified user identity.
pub const USER_HEADER: &str = "x-sandbox-user";

/// Extract and validate the caller's user id.
///
/// Identity verification happens upstream of this service; the facade only
/// consumes the already-verified id.
pub fn require_user(headers: &HeaderMap) -> Result<String, ApiError> {
    let user = headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError(Error::invalid(format!("Missing {} header", USER_HEADER))))?;
    naming::validate_id(user, "User")?;
    Ok(user.to_string())
}
