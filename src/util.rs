//! Small helpers shared across the engine: random tokens and virtual-path handling.
//! Virtual paths are always `/`-separated and rooted at `/`, regardless of host OS.

use getrandom::getrandom;

const ALPHANUM: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Random alphanumeric string of length `n`.
pub fn rand_string(n: usize) -> String {
    let mut buf = vec![0u8; n];
    if getrandom(&mut buf).is_err() {
        // Fall back to time-derived entropy; only reachable on platforms without an OS RNG.
        let seed = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
        for (i, b) in buf.iter_mut().enumerate() { *b = (seed.rotate_left(i as u32 * 7) & 0xff) as u8; }
    }
    buf.iter().map(|b| ALPHANUM[(*b as usize) % ALPHANUM.len()] as char).collect()
}

/// Lexically clean a virtual path: collapse `//`, resolve `.` and `..`, always rooted.
pub fn clean_path(p: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for seg in p.split('/') {
        match seg {
            "" | "." => {}
            ".." => { out.pop(); }
            s => out.push(s),
        }
    }
    format!("/{}", out.join("/"))
}

pub fn join(base: &str, name: &str) -> String { clean_path(&format!("{}/{}", base, name)) }

/// Split into `["/", "a", "b"]` for `/a/b`; empty input yields nothing.
pub fn split_path(p: &str) -> Vec<String> {
    if p.is_empty() { return vec![]; }
    let cleaned = clean_path(p);
    let mut parts = vec!["/".to_string()];
    parts.extend(cleaned.split('/').filter(|s| !s.is_empty()).map(str::to_string));
    parts
}

/// `(dir, base)` of a virtual path.
pub fn split_dir(p: &str) -> (String, String) {
    let cleaned = clean_path(p);
    match cleaned.rsplit_once('/') {
        Some(("", base)) => ("/".to_string(), base.to_string()),
        Some((dir, base)) => (dir.to_string(), base.to_string()),
        None => ("/".to_string(), cleaned),
    }
}

/// Lowercased extension without the dot.
pub fn file_ext(name: &str) -> Option<String> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() { return None; }
    Some(ext.to_ascii_lowercase())
}

#[cfg(test)]
#[path = "util_tests.rs"]
mod util_tests;
