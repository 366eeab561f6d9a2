//! Mirror fetching with conditional re-download.
//!
//! Snapshot archives are large and mirrors publish them infrequently, so
//! downloads are conditional on the local copy's modification time. The
//! cache is shared between sessions without locking; validity is judged by
//! mtime, not by assuming consistency.

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::{header, StatusCode};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use std::time::{Duration, SystemTime};
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

use crate::error::BuildError;

const USER_AGENT: &str = concat!("rootforge/", env!("CARGO_PKG_VERSION"));

/// Connection timeout; downloads themselves are unbounded since snapshot
/// archives run into hundreds of megabytes.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

fn client() -> Result<Client> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(None)
        .user_agent(USER_AGENT)
        .build()
        .context("constructing HTTP client")
}

fn fetch_error(url: &str, reason: impl ToString) -> anyhow::Error {
    BuildError::Fetch {
        url: url.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

/// Fetch a small text resource, typically a mirror manifest.
pub fn fetch_text(url: &str) -> Result<String> {
    let response = client()?
        .get(url)
        .send()
        .map_err(|err| fetch_error(url, err))?;
    if !response.status().is_success() {
        return Err(fetch_error(
            url,
            format!("server answered {}", response.status()),
        ));
    }
    response.text().map_err(|err| fetch_error(url, err))
}

/// Outcome of a conditional download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The server had a newer copy; `dest` was replaced.
    Downloaded,
    /// The local copy is current; `dest` was left untouched.
    NotModified,
}

/// Download `url` to `dest` unless the server copy is no newer than the
/// local one (`If-Modified-Since` from the local mtime).
///
/// The payload lands in a `.part` sibling first and is renamed into place,
/// so `dest` is never observed half-written.
pub fn fetch_conditional(url: &str, dest: &Path) -> Result<FetchOutcome> {
    let mut request = client()?.get(url);
    if let Ok(meta) = fs::metadata(dest) {
        if let Ok(mtime) = meta.modified() {
            request = request.header(header::IF_MODIFIED_SINCE, http_date(mtime)?);
        }
    }

    let mut response = request.send().map_err(|err| fetch_error(url, err))?;
    if response.status() == StatusCode::NOT_MODIFIED {
        return Ok(FetchOutcome::NotModified);
    }
    if !response.status().is_success() {
        return Err(fetch_error(
            url,
            format!("server answered {}", response.status()),
        ));
    }

    let file_name = dest
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".into());
    let partial = dest.with_file_name(format!("{file_name}.part"));

    let mut file = File::create(&partial)
        .with_context(|| format!("creating '{}'", partial.display()))?;
    response
        .copy_to(&mut file)
        .map_err(|err| fetch_error(url, err))?;
    drop(file);

    fs::rename(&partial, dest).with_context(|| {
        format!("moving '{}' into place at '{}'", partial.display(), dest.display())
    })?;

    Ok(FetchOutcome::Downloaded)
}

/// Verify `file` against an upstream `.sha256` sidecar.
///
/// Mirrors that publish no sidecar are tolerated (returns `false`); a
/// sidecar that disagrees with the local file is fatal.
pub fn verify_sha256_sidecar(url: &str, file: &Path) -> Result<bool> {
    let sidecar_url = format!("{url}.sha256");
    let response = match client()?.get(&sidecar_url).send() {
        Ok(response) if response.status().is_success() => response,
        _ => return Ok(false),
    };
    let text = match response.text() {
        Ok(text) => text,
        Err(_) => return Ok(false),
    };

    let expected = text
        .lines()
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_whitespace().next())
        .find(|token| token.len() == 64 && token.chars().all(|c| c.is_ascii_hexdigit()));
    let Some(expected) = expected else {
        return Ok(false);
    };

    let actual = sha256_hex(file)?;
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(fetch_error(
            &sidecar_url,
            format!("checksum mismatch: expected {expected}, got {actual}"),
        ));
    }
    println!(
        "  SHA256 verified: {}...{}",
        &actual[..8],
        &actual[actual.len() - 8..]
    );
    Ok(true)
}

/// Hex SHA-256 of a file, streamed.
pub fn sha256_hex(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("opening '{}' for hashing", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 65536];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("hashing '{}'", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Format a filesystem timestamp as an HTTP date (IMF-fixdate).
fn http_date(timestamp: SystemTime) -> Result<String> {
    let format = format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );
    OffsetDateTime::from(timestamp)
        .to_offset(UtcOffset::UTC)
        .format(&format)
        .context("formatting HTTP date")
}
