use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::classify::{Bucket, ProjectStats};
use crate::model::{MasterRecord, TagAssignment};

pub const CASES_FILENAME: &str = "cases.tsv";
pub const STATS_FILENAME: &str = "project_stats.tsv";
pub const REPORT_BODY_FILENAME: &str = "unconnected_wikitable_body.txt";
pub const REPORT_FILENAME: &str = "unconnected_wikitable.txt";

/// The four run artifacts in the output directory.
#[derive(Debug, Clone)]
pub struct OutputFiles {
    dir: PathBuf,
}

impl OutputFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, filename: &str) -> PathBuf {
        self.dir.join(filename)
    }

    /// Truncates every artifact; called once at the start of a run.
    pub fn clear(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        for filename in [CASES_FILENAME, STATS_FILENAME, REPORT_BODY_FILENAME, REPORT_FILENAME] {
            let path = self.path(filename);
            fs::write(&path, "").with_context(|| format!("failed to truncate {}", path.display()))?;
        }
        Ok(())
    }

    pub fn append_cases<'r, I>(&self, db_name: &str, records: I) -> Result<()>
    where
        I: IntoIterator<Item = &'r MasterRecord>,
    {
        let mut content = String::new();
        for record in records {
            content.push_str(&case_line(db_name, record));
        }
        self.append(CASES_FILENAME, &content)
    }

    pub fn append_stats(&self, db_name: &str, stats: &ProjectStats) -> Result<()> {
        self.append(STATS_FILENAME, &stats_line(db_name, stats))
    }

    pub fn append_report_fragment(&self, fragment: &str) -> Result<()> {
        self.append(REPORT_BODY_FILENAME, fragment)
    }

    pub fn write_report(&self, table: &str) -> Result<()> {
        let path = self.path(REPORT_FILENAME);
        fs::write(&path, table).with_context(|| format!("failed to write {}", path.display()))
    }

    fn append(&self, filename: &str, content: &str) -> Result<()> {
        if content.is_empty() {
            return Ok(());
        }
        let path = self.path(filename);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        file.write_all(content.as_bytes())
            .with_context(|| format!("failed to append to {}", path.display()))
    }
}

/// One `cases.tsv` line: database name, the redirect columns, then both badge columns.
pub fn case_line(db_name: &str, record: &MasterRecord) -> String {
    let fact = record.redirect.as_ref();
    let mut fields = vec![
        field(Some(db_name)),
        field(fact.map(|fact| fact.redirect_qid.as_str())),
        number(fact.map(|fact| fact.redirect_id)),
        number(fact.map(|fact| fact.redirect_namespace)),
        field(fact.map(|fact| fact.redirect_title.as_str())),
        number(fact.and_then(|fact| fact.target_id)),
        number(fact.and_then(|fact| fact.target_namespace)),
        field(fact.and_then(|fact| fact.target_title.as_deref())),
        field(fact.and_then(|fact| fact.target_fragment.as_deref())),
        field(fact.and_then(|fact| fact.target_interwiki.as_deref())),
        field(fact.and_then(|fact| fact.target_qid.as_deref())),
    ];
    fields.extend(tag_fields(record.kind_a.as_ref()));
    fields.extend(tag_fields(record.kind_b.as_ref()));
    format!("{}\n", fields.join("\t"))
}

pub fn stats_line(db_name: &str, stats: &ProjectStats) -> String {
    let counts = Bucket::ALL
        .into_iter()
        .map(|bucket| stats.get(bucket).to_string())
        .collect::<Vec<_>>()
        .join("\t");
    format!("{}\t{counts}\n", field(Some(db_name)))
}

fn tag_fields(tag: Option<&TagAssignment>) -> [String; 3] {
    [
        field(tag.map(|tag| tag.site_link.as_str())),
        field(tag.map(|tag| tag.display_name.as_str())),
        field(tag.map(|tag| tag.badge.as_str())),
    ]
}

fn field(value: Option<&str>) -> String {
    value
        .unwrap_or_default()
        .replace(['\t', '\n', '\r'], " ")
}

fn number<T: ToString>(value: Option<T>) -> String {
    value.map(|value| value.to_string()).unwrap_or_default()
}
