use std::process::Command;
use std::time::Duration;
use regex::Regex;
use crate::versions::Version;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Asks an index for the latest version of a package.
///
/// Two response shapes are understood: the structured metadata document
/// (`{"info": {"version": ...}}`) and a legacy HTML directory listing whose
/// release links carry the version. Failures come back as a problem string,
/// never a panic: the caller decides where an abort is warranted.
pub fn latest_version(index: &str, name: &str) -> Result<String, String> {
    let base = index.trim_end_matches('/');
    if let Ok(body) = fetch(&format!("{}/{}/json", base, name)) {
        if let Some(version) = parse_metadata(&body) {
            return Ok(version);
        }
    }
    let body = fetch(&format!("{}/{}/", base, name))?;
    if let Some(version) = parse_metadata(&body) {
        return Ok(version);
    }
    parse_listing(&body, name)
        .ok_or_else(|| format!("no usable version for '{}' in {}", name, index))
}

/// GET with a short timeout; a transport-level failure falls back to curl,
/// which tends to survive odd proxy setups that trip the native client.
fn fetch(url: &str) -> Result<String, String> {
    let client = reqwest::blocking::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| e.to_string())?;
    match client.get(url).header("User-Agent", "pipkin").send() {
        Ok(response) if response.status().is_success() => {
            response.text().map_err(|e| format!("could not read {}: {}", url, e))
        }
        Ok(response) => Err(format!("{} answered {}", url, response.status())),
        Err(_) => fetch_via_curl(url),
    }
}

fn fetch_via_curl(url: &str) -> Result<String, String> {
    let output = Command::new("curl")
        .args(["-s", "-f", "-L", "-m", "5"])
        .arg(url)
        .output()
        .map_err(|e| format!("could not fetch {}: {}", url, e))?;
    if !output.status.success() {
        return Err(format!("could not fetch {}", url));
    }
    String::from_utf8(output.stdout).map_err(|e| format!("bad response from {}: {}", url, e))
}

/// Structured metadata document: `info.version`.
fn parse_metadata(body: &str) -> Option<String> {
    let doc: serde_json::Value = serde_json::from_str(body).ok()?;
    let version = doc.get("info")?.get("version")?.as_str()?;
    if version.is_empty() {
        return None;
    }
    Some(version.to_string())
}

/// Legacy HTML listing: extract `<name>-<version>.tar.gz`-style link
/// targets and keep the greatest parseable version.
fn parse_listing(body: &str, name: &str) -> Option<String> {
    // file names may spell the separators as either dash or underscore;
    // the class has to be assembled before escaping, since escape() would
    // mangle a dash spliced in afterwards
    let stem = name
        .split(['-', '_'])
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join("[-_]");
    let re = Regex::new(&format!(
        r"(?i){}-(\d[A-Za-z0-9.!+_-]*?)\.(?:tar\.gz|zip|whl)",
        stem
    ))
    .ok()?;
    re.captures_iter(body)
        .filter_map(|caps| {
            let text = caps.get(1)?.as_str();
            Version::parse(text).map(|parsed| (parsed, text.to_string()))
        })
        .max_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(_, text)| text)
}
