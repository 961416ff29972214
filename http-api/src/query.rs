use caw_core::error::Error;

use crate::error::ApiError;

/// Parse a comma-separated query value into a typed list.
///
/// `status=pending,failed` becomes `Some(vec![Pending, Failed])`; an absent
/// parameter stays `None` (no filter); an empty string is an explicit empty
/// set, which the services treat as matching nothing.
pub(crate) fn parse_list<T>(raw: Option<&str>, what: &str) -> Result<Option<Vec<T>>, ApiError>
where
    T: std::str::FromStr<Err = Error>,
{
    let Some(raw) = raw else {
        return Ok(None);
    };
    if raw.is_empty() {
        return Ok(Some(Vec::new()));
    }
    raw.split(',')
        .map(|part| {
            part.trim()
                .parse::<T>()
                .map_err(|_| ApiError(Error::Validation(format!("unknown {what}: '{part}'"))))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}
