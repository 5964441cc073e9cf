//! Header-driven negotiation of content coding and cipher suite.

use axum::http::header::{AsHeaderName, ACCEPT_ENCODING, CONTENT_ENCODING};
use axum::http::HeaderMap;
use base64::Engine;

use crate::transform::cipher::CipherSuite;
use crate::transform::compression::Encoding;
use crate::transform::TransformError;

pub const CIPHER_SUITE_HEADER: &str = "x-cipher-suite";
pub const SESSION_SALT_HEADER: &str = "x-session-salt";

/// Minimum decoded length of `x-session-salt`.
pub const MIN_SALT_LEN: usize = 16;

/// Preference order when several codings share the best q-value.
const PREFERENCE: [Encoding; 3] = [Encoding::Zstd, Encoding::Gzip, Encoding::Deflate];

fn header_str<'a>(
    headers: &'a HeaderMap,
    name: impl AsHeaderName,
) -> Result<Option<&'a str>, TransformError> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => value.to_str().map(Some).map_err(|_| {
            TransformError::MalformedPayload("non-ASCII negotiation header".to_string())
        }),
    }
}

/// Coding the request body arrived in. Stacked codings are not supported.
pub fn request_encoding(headers: &HeaderMap) -> Result<Encoding, TransformError> {
    let Some(value) = header_str(headers, CONTENT_ENCODING)? else {
        return Ok(Encoding::Identity);
    };
    if value.contains(',') {
        return Err(TransformError::UnsupportedAlgorithm(value.to_string()));
    }
    value.parse()
}

/// Best coding the peer accepts for the response, honouring q-values.
pub fn response_encoding(headers: &HeaderMap) -> Encoding {
    let Ok(Some(value)) = header_str(headers, ACCEPT_ENCODING) else {
        return Encoding::Identity;
    };

    let mut wildcard: Option<f32> = None;
    let mut explicit: Vec<(Encoding, f32)> = Vec::new();
    let mut excluded: Vec<Encoding> = Vec::new();

    for item in value.split(',') {
        let mut parts = item.split(';');
        let token = parts.next().unwrap_or("").trim().to_ascii_lowercase();
        let q = parts
            .filter_map(|p| p.trim().strip_prefix("q="))
            .find_map(|q| q.trim().parse::<f32>().ok())
            .unwrap_or(1.0);

        if token == "*" {
            wildcard = Some(q);
            continue;
        }
        if let Ok(encoding) = token.parse::<Encoding>() {
            if encoding.is_identity() {
                continue;
            }
            if q <= 0.0 {
                excluded.push(encoding);
            } else {
                explicit.push((encoding, q));
            }
        }
    }

    let mut best: Option<(Encoding, f32)> = None;
    for encoding in PREFERENCE {
        if excluded.contains(&encoding) {
            continue;
        }
        let q = explicit
            .iter()
            .find(|(e, _)| *e == encoding)
            .map(|(_, q)| *q)
            .or(wildcard.filter(|q| *q > 0.0));
        if let Some(q) = q {
            if best.map_or(true, |(_, b)| q > b) {
                best = Some((encoding, q));
            }
        }
    }

    best.map(|(e, _)| e).unwrap_or(Encoding::Identity)
}

/// Suite requested by the peer, if any. A suite that is not enabled is a
/// negotiation failure, not a silent fallback to plaintext.
pub fn cipher_suite(
    headers: &HeaderMap,
    enabled: &[CipherSuite],
) -> Result<Option<CipherSuite>, TransformError> {
    let Some(value) = header_str(headers, CIPHER_SUITE_HEADER)? else {
        return Ok(None);
    };
    let suite: CipherSuite = value.parse()?;
    if !enabled.contains(&suite) {
        return Err(TransformError::UnsupportedAlgorithm(suite.to_string()));
    }
    Ok(Some(suite))
}

/// Decoded `x-session-salt`. Required whenever a suite is negotiated.
pub fn session_salt(headers: &HeaderMap) -> Result<Vec<u8>, TransformError> {
    let value = header_str(headers, SESSION_SALT_HEADER)?.ok_or_else(|| {
        TransformError::KeyProvisioning(format!("missing {SESSION_SALT_HEADER} header"))
    })?;
    let salt = base64::engine::general_purpose::STANDARD
        .decode(value.trim())
        .map_err(|_| {
            TransformError::KeyProvisioning(format!("{SESSION_SALT_HEADER} is not base64"))
        })?;
    if salt.len() < MIN_SALT_LEN {
        return Err(TransformError::KeyProvisioning(format!(
            "{SESSION_SALT_HEADER} must decode to at least {MIN_SALT_LEN} bytes"
        )));
    }
    Ok(salt)
}
