use crate::api::NewSession;
use crate::error::ScanError;
use crate::utils::time::parse_session_date;

/// Checks the session-creation form and builds the request body.
pub fn validate_new_session(
    name: &str,
    date: &str,
    location: Option<&str>,
) -> Result<NewSession, ScanError> {
    let name = name.trim();
    if name.is_empty() || date.trim().is_empty() {
        return Err(ScanError::invalid("session name and date are required"));
    }
    if name.chars().count() > 200 {
        return Err(ScanError::invalid("session name is too long"));
    }

    let date = parse_session_date(date).map_err(|e| ScanError::invalid(e.to_string()))?;
    let location = location
        .map(str::trim)
        .filter(|location| !location.is_empty())
        .map(str::to_string);

    Ok(NewSession {
        name: name.to_string(),
        date,
        location,
    })
}
