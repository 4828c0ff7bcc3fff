//! Company snapshot directories and the header-driven window CSV reader.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::Context;
use csv::{ByteRecord, ReaderBuilder, StringRecord, Trim};
use qbank_core::{ProblemRecord, Window};
use thiserror::Error;
use tracing::{debug, warn};

/// Rows of one window file keyed by problem id.
pub type WindowRecords = BTreeMap<i64, ProblemRecord>;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parsing {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{path} has no id column")]
    MissingIdColumn { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompanyDir {
    pub name: String,
    pub path: PathBuf,
}

/// Company directories under `root`, sorted by name. Hidden entries (`.git`)
/// and plain files are skipped.
pub fn list_company_dirs(root: &Path) -> anyhow::Result<Vec<CompanyDir>> {
    let mut dirs = Vec::new();
    for entry in
        fs::read_dir(root).with_context(|| format!("reading snapshot root {}", root.display()))?
    {
        let entry = entry.with_context(|| format!("listing {}", root.display()))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        let is_dir = entry
            .file_type()
            .with_context(|| format!("inspecting {}", entry.path().display()))?
            .is_dir();
        if !is_dir {
            continue;
        }
        dirs.push(CompanyDir {
            name,
            path: entry.path(),
        });
    }
    dirs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(dirs)
}

/// Every window file that could be read for one company. Files that exist but
/// cannot be parsed are logged and listed in `skipped`.
#[derive(Debug, Default)]
pub struct CompanySnapshots {
    pub company: String,
    pub windows: Vec<(Window, WindowRecords)>,
    pub skipped: Vec<Window>,
}

impl CompanySnapshots {
    pub fn row_count(&self) -> usize {
        self.windows.iter().map(|(_, rows)| rows.len()).sum()
    }
}

pub fn load_company_snapshots(dir: &CompanyDir) -> CompanySnapshots {
    let mut out = CompanySnapshots {
        company: dir.name.clone(),
        ..Default::default()
    };
    for window in Window::MERGE_ORDER {
        let path = dir.path.join(window.file_name());
        match read_snapshot(&path) {
            Ok(Some(rows)) => {
                debug!(company = %dir.name, %window, rows = rows.len(), "loaded snapshot");
                out.windows.push((window, rows));
            }
            Ok(None) => debug!(company = %dir.name, %window, "no snapshot file"),
            Err(err) => {
                warn!(company = %dir.name, %window, error = %err, "skipping unreadable snapshot");
                out.skipped.push(window);
            }
        }
    }
    out
}

/// Read one window file. A missing file is `Ok(None)`.
pub fn read_snapshot(path: &Path) -> Result<Option<WindowRecords>, SnapshotError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(SnapshotError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    parse_snapshot(file, path).map(Some)
}

#[derive(Debug, Clone, Copy)]
struct ColumnMap {
    id: usize,
    url: Option<usize>,
    title: Option<usize>,
    difficulty: Option<usize>,
    acceptance: Option<usize>,
    frequency: Option<usize>,
}

impl ColumnMap {
    fn from_headers(headers: &StringRecord) -> Option<Self> {
        let keys = headers.iter().map(normalize_header).collect::<Vec<_>>();
        let find = |variants: &[&str]| keys.iter().position(|k| variants.contains(&k.as_str()));
        Some(Self {
            id: find(&["id"])?,
            url: find(&["url", "link"]),
            title: find(&["title", "name"]),
            difficulty: find(&["difficulty", "level"]),
            acceptance: find(&["acceptance", "acceptancerate"]),
            frequency: find(&["frequency"]),
        })
    }
}

fn normalize_header(raw: &str) -> String {
    raw.trim()
        .trim_start_matches('\u{feff}')
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '%' | '_' | '-'))
        .flat_map(char::to_lowercase)
        .collect()
}

fn cell(record: &StringRecord, idx: Option<usize>) -> &str {
    idx.and_then(|i| record.get(i)).map(str::trim).unwrap_or("")
}

/// Parse a window CSV from any reader. `path` is only used for error and log context.
pub fn parse_snapshot<R: Read>(reader: R, path: &Path) -> Result<WindowRecords, SnapshotError> {
    let csv_err = |source| SnapshotError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(reader);

    let (headers, _) = decode_lossy(reader.byte_headers().map_err(csv_err)?);
    if headers.is_empty() {
        return Ok(WindowRecords::new());
    }
    let columns = ColumnMap::from_headers(&headers).ok_or_else(|| SnapshotError::MissingIdColumn {
        path: path.to_path_buf(),
    })?;

    let mut out = WindowRecords::new();
    for (row_idx, record) in reader.byte_records().enumerate() {
        let line = row_idx + 2;
        let (record, replaced) = decode_lossy(&record.map_err(csv_err)?);
        if replaced {
            warn!(file = %path.display(), line, "replacing invalid utf-8 in row");
        }
        let raw_id = cell(&record, Some(columns.id));
        if raw_id.is_empty() {
            debug!(file = %path.display(), line, "skipping row without id");
            continue;
        }
        let id = match raw_id.parse::<i64>() {
            Ok(id) => id,
            Err(err) => {
                warn!(file = %path.display(), line, id = raw_id, error = %err, "skipping row with invalid id");
                continue;
            }
        };

        out.insert(
            id,
            ProblemRecord {
                id,
                url: cell(&record, columns.url).to_string(),
                title: cell(&record, columns.title).to_string(),
                difficulty: cell(&record, columns.difficulty).to_string(),
                acceptance: percent_cell(&record, columns.acceptance, path, line),
                frequency: percent_cell(&record, columns.frequency, path, line),
            },
        );
    }
    Ok(out)
}

/// Cells that are not valid UTF-8 get replacement characters rather than
/// failing the whole file. The flag reports whether any cell was replaced.
fn decode_lossy(record: &ByteRecord) -> (StringRecord, bool) {
    let mut replaced = false;
    let decoded = record
        .iter()
        .map(|field| {
            let text = String::from_utf8_lossy(field);
            replaced |= matches!(text, Cow::Owned(_));
            text
        })
        .collect::<StringRecord>();
    (decoded, replaced)
}

fn percent_cell(record: &StringRecord, idx: Option<usize>, path: &Path, line: usize) -> Option<f64> {
    let raw = cell(record, idx);
    let parsed = parse_percent(raw);
    if parsed.is_none() && !raw.trim_end_matches('%').trim().is_empty() {
        debug!(file = %path.display(), line, value = raw, "ignoring unparsable percentage");
    }
    parsed
}

/// `"46.8%"` -> `Some(46.8)`. Blank or unparsable cells are absent.
pub fn parse_percent(raw: &str) -> Option<f64> {
    let trimmed = raw.trim().trim_end_matches('%').trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok()
}
