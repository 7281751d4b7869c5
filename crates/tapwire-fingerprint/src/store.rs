use std::fs;
use std::path::{Path, PathBuf};

use crate::{Fingerprint, FingerprintError};

/// Per-user profile directory, `$HOME/.mitmproxy/fingerprints`. When the
/// home directory cannot be resolved the cwd-relative `fingerprints`
/// directory is used; the fallback is deliberate, not silent.
pub fn profile_dir() -> PathBuf {
    match home_dir() {
        Some(home) => home.join(".mitmproxy").join("fingerprints"),
        None => PathBuf::from("fingerprints"),
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}

/// Saves a profile. Names containing a directory component (or absolute
/// paths) are written verbatim, `.json` appended when extensionless;
/// plain names land in the profile directory.
pub fn save_profile(name: &str, fingerprint: &Fingerprint) -> Result<PathBuf, FingerprintError> {
    let path = save_path(name);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|source| FingerprintError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }

    let json = serde_json::to_string_pretty(fingerprint)?;
    fs::write(&path, json).map_err(|source| FingerprintError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

fn save_path(name: &str) -> PathBuf {
    let as_path = Path::new(name);
    let has_dir_component = as_path.is_absolute() || as_path.parent() != Some(Path::new(""));
    if has_dir_component {
        let mut path = as_path.to_path_buf();
        if path.extension().is_none() {
            path.set_extension("json");
        }
        path
    } else {
        profile_dir().join(format!("{name}.json"))
    }
}

/// Loads a profile: direct filesystem path first, then
/// `<profile_dir>/<name>.json`, then `<profile_dir>/<name>`.
pub fn load_profile(name: &str) -> Result<Fingerprint, FingerprintError> {
    if Path::new(name).is_file() {
        return read_profile(Path::new(name));
    }

    let dir = profile_dir();
    let with_extension = dir.join(format!("{name}.json"));
    if with_extension.is_file() {
        return read_profile(&with_extension);
    }
    let bare = dir.join(name);
    if bare.is_file() {
        return read_profile(&bare);
    }

    Err(FingerprintError::NotFound(name.to_string()))
}

fn read_profile(path: &Path) -> Result<Fingerprint, FingerprintError> {
    let data = fs::read(path).map_err(|source| FingerprintError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_slice(&data)?)
}

/// Names of the `*.json` profiles saved under the profile directory.
pub fn list_profiles() -> Result<Vec<String>, FingerprintError> {
    let dir = profile_dir();
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => return Err(FingerprintError::Io { path: dir, source }),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| FingerprintError::Io {
            path: dir.clone(),
            source,
        })?;
        let path = entry.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                names.push(stem.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}
