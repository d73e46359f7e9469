//! Output file names from `%`-templates.
//!
//! | field | value |
//! |-------|-------|
//! | `%a` | artist |
//! | `%t` | title, or the file stem when untagged |
//! | `%b` | album |
//! | `%B` | album artist, falling back to artist |
//! | `%n` | track number, zero-padded to two digits |
//! | `%N` | total tracks |
//! | `%y` | year |
//! | `%g` | genre |
//! | `%c` | comment |
//! | `%C` | composer |
//! | `%r` | copyright |
//! | `%f` | file name |
//! | `%F` | file stem |
//! | `%d` | name of the containing directory |
//! | `%e` | file extension |
//! | `%l` | length as `m:ss` |
//! | `%i` | 1-based position in the selection |
//! | `%%` | `%` |
//!
//! Unknown fields are copied through. Substituted values never contain path
//! separators and are never `.` or `..`. [`output_path`] additionally drops
//! any root, `.` or `..` component the template itself produces, so the
//! output always lands inside the output folder.

use std::path::{Component, Path, PathBuf};

use crate::types::Track;

pub fn format_title(template: &str, track: &Track, index: usize) -> String {
    let mut out = String::with_capacity(template.len() + 32);
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let Some(field) = chars.next() else {
            out.push('%');
            break;
        };
        match field_value(field, track, index) {
            Some(v) => out.push_str(&sanitize(&v)),
            None if field == '%' => out.push('%'),
            None => {
                out.push('%');
                out.push(field);
            }
        }
    }
    out
}

/// Formats `template` for `track` and joins the result below `dir`.
///
/// A name with no usable component falls back to the file stem, then to
/// `track-NN`.
pub fn output_path(dir: &Path, template: &str, track: &Track, index: usize) -> PathBuf {
    let name = format_title(template, track, index);
    let mut path = dir.to_path_buf();
    let mut named = false;
    for part in Path::new(&name).components() {
        if let Component::Normal(part) = part {
            path.push(part);
            named = true;
        }
    }
    if !named {
        let stem = sanitize(&field_value('F', track, index).unwrap_or_default());
        if stem.is_empty() {
            path.push(format!("track-{:02}", index + 1));
        } else {
            path.push(stem);
        }
    }
    path
}

fn field_value(field: char, track: &Track, index: usize) -> Option<String> {
    let meta = |key: &str| track.meta(key).unwrap_or_default().to_string();
    let path: &Path = &track.path;
    let file_stem = || {
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    };

    let v = match field {
        'a' => meta("artist"),
        't' => track.meta("title").map(str::to_string).unwrap_or_else(file_stem),
        'b' => meta("album"),
        'B' => track
            .meta("album artist")
            .or_else(|| track.meta("artist"))
            .unwrap_or_default()
            .to_string(),
        'n' => {
            let n = meta("track");
            // "3/12" style tags carry the total too
            let n = n.split('/').next().unwrap_or_default().trim().to_string();
            match n.parse::<u32>() {
                Ok(num) => format!("{num:02}"),
                Err(_) => n,
            }
        }
        'N' => meta("numtracks"),
        'y' => meta("year"),
        'g' => meta("genre"),
        'c' => meta("comment"),
        'C' => meta("composer"),
        'r' => meta("copyright"),
        'f' => path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
        'F' => file_stem(),
        'd' => path
            .parent()
            .and_then(Path::file_name)
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
        'e' => path
            .extension()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
        'l' => {
            let secs = track.duration.max(0.0).round() as u64;
            format!("{}:{:02}", secs / 60, secs % 60)
        }
        'i' => (index + 1).to_string(),
        _ => return None,
    };
    Some(v)
}

fn sanitize(value: &str) -> String {
    if value == "." || value == ".." {
        return value.replace('.', "_");
    }
    value
        .chars()
        .map(|c| if matches!(c, '/' | '\\') { '-' } else { c })
        .collect()
}
