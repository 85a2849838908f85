//! AWS Signature Version 4 request signing.
//!
//! Pure canonicalisation and HMAC chaining with no I/O. The caller supplies
//! the timestamp, which keeps the output deterministic under a fixed clock
//! and lets tests pin golden signatures.

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::credentials::Credentials;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SCOPE_SUFFIX: &str = "aws4_request";

/// Describes one HTTP request to be signed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RequestDescriptor<'a> {
    /// Service code bound into the credential scope (for example `ecs`).
    pub service: &'a str,
    /// Region bound into the credential scope.
    pub region: &'a str,
    /// Host the request is sent to; signed as the `host` header.
    pub host: &'a str,
    /// HTTP method; upper-cased during canonicalisation.
    pub method: &'a str,
    /// Request path starting with `/`.
    pub path: &'a str,
    /// Query parameters; may be empty.
    pub query: &'a BTreeMap<String, String>,
    /// Headers to include in the signature beyond the required set.
    pub headers: &'a BTreeMap<String, String>,
    /// Raw request body.
    pub payload: &'a [u8],
}

/// Signs a request, returning the full header set to send.
///
/// The output contains the caller's headers unchanged plus `x-amz-date`,
/// `x-amz-content-sha256`, and `Authorization`.
#[must_use]
pub fn sign(
    request: &RequestDescriptor<'_>,
    credentials: &Credentials,
    at: OffsetDateTime,
) -> BTreeMap<String, String> {
    let amz_date = format_amz_date(at);
    let datestamp = format_datestamp(at);
    let scope = format!(
        "{datestamp}/{}/{}/{SCOPE_SUFFIX}",
        request.region, request.service
    );
    let payload_hash = hex::encode(Sha256::digest(request.payload));

    // Canonical headers: caller headers with lower-cased, trimmed names and
    // trimmed values, merged with the required trio. BTreeMap keeps the
    // mandated name ordering.
    let mut canonical_headers: BTreeMap<String, String> = request
        .headers
        .iter()
        .map(|(name, value)| {
            (
                name.to_ascii_lowercase().trim().to_owned(),
                value.trim().to_owned(),
            )
        })
        .collect();
    canonical_headers.insert(String::from("host"), request.host.to_owned());
    canonical_headers.insert(String::from("x-amz-content-sha256"), payload_hash.clone());
    canonical_headers.insert(String::from("x-amz-date"), amz_date.clone());

    let signed_headers = canonical_headers
        .keys()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(";");
    let canonical_header_lines: String = canonical_headers
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect();

    let canonical_uri = percent_encode(request.path, true);
    let canonical_query = request
        .query
        .iter()
        .map(|(key, value)| {
            format!(
                "{}={}",
                percent_encode(key, false),
                percent_encode(value, false)
            )
        })
        .collect::<Vec<_>>()
        .join("&");

    let canonical_request = format!(
        "{}\n{canonical_uri}\n{canonical_query}\n{canonical_header_lines}\n{signed_headers}\n{payload_hash}",
        request.method.to_ascii_uppercase()
    );

    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let seed = format!("AWS4{}", credentials.secret_access_key);
    let date_key = hmac_sha256(seed.as_bytes(), datestamp.as_bytes());
    let region_key = hmac_sha256(&date_key, request.region.as_bytes());
    let service_key = hmac_sha256(&region_key, request.service.as_bytes());
    let request_key = hmac_sha256(&service_key, SCOPE_SUFFIX.as_bytes());
    let signature = hex::encode(hmac_sha256(&request_key, string_to_sign.as_bytes()));

    let mut headers = request.headers.clone();
    headers.insert(String::from("x-amz-date"), amz_date);
    headers.insert(String::from("x-amz-content-sha256"), payload_hash);
    headers.insert(
        String::from("Authorization"),
        format!(
            "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            credentials.access_key_id
        ),
    );
    headers
}

/// UTC timestamp in the `YYYYMMDDTHHMMSSZ` form the scheme requires.
fn format_amz_date(at: OffsetDateTime) -> String {
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        at.year(),
        u8::from(at.month()),
        at.day(),
        at.hour(),
        at.minute(),
        at.second()
    )
}

/// UTC date in the `YYYYMMDD` form used by the credential scope.
fn format_datestamp(at: OffsetDateTime) -> String {
    format!(
        "{:04}{:02}{:02}",
        at.year(),
        u8::from(at.month()),
        at.day()
    )
}

fn hmac_sha256(key: &[u8], message: &[u8]) -> Vec<u8> {
    // HMAC-SHA256 accepts keys of any length, so construction cannot fail.
    let mut mac = Hmac::<Sha256>::new_from_slice(key).unwrap_or_else(|_| unreachable!());
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

/// Percent-encodes everything outside the unreserved set, optionally keeping
/// path separators literal.
fn percent_encode(input: &str, keep_path_separators: bool) -> String {
    let mut encoded = String::with_capacity(input.len());
    for byte in input.bytes() {
        let literal = byte.is_ascii_alphanumeric()
            || matches!(byte, b'-' | b'_' | b'.' | b'~')
            || (keep_path_separators && byte == b'/');
        if literal {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}
