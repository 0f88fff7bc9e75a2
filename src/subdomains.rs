//! Counts distinct subdomains per root domain in one column of a log.
//!
//! A root domain contacted through many different subdomains is a hint of
//! DNS tunnelling or domain-generation traffic, which the interval scorer
//! does not see.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use csv::{ReaderBuilder, StringRecord};

use crate::error::IngestError;

/// Subdomain count for one root domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootDomainCount {
    pub root: String,
    pub subdomains: usize,
}

/// Collapses a name that was logged twice back to back (`abcabc` -> `abc`).
pub fn collapse_doubled(name: &str) -> &str {
    let half = name.len() / 2;
    if name.len() % 2 == 0 && name.is_char_boundary(half) && name[..half] == name[half..] {
        &name[..half]
    } else {
        name
    }
}

/// Counts distinct first labels for every root (last two labels). Names
/// with two labels or fewer, and names containing any ignore keyword, are
/// skipped. Sorted by count descending, then root.
pub fn count_subdomains<I, S>(names: I, ignore: &[String]) -> Vec<RootDomainCount>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut roots: BTreeMap<String, HashSet<String>> = BTreeMap::new();

    for name in names {
        let name = collapse_doubled(name.as_ref().trim());
        if ignore.iter().any(|keyword| name.contains(keyword.as_str())) {
            continue;
        }

        let labels: Vec<&str> = name.split('.').collect();
        if labels.len() <= 2 {
            continue;
        }
        let root = labels[labels.len() - 2..].join(".");
        roots.entry(root).or_default().insert(labels[0].to_string());
    }

    let mut counts: Vec<RootDomainCount> = roots
        .into_iter()
        .map(|(root, subdomains)| RootDomainCount {
            root,
            subdomains: subdomains.len(),
        })
        .collect();
    counts.sort_by(|a, b| b.subdomains.cmp(&a.subdomains).then_with(|| a.root.cmp(&b.root)));
    counts
}

/// Reads one column from a delimited file.
pub fn read_column(path: &Path, delimiter: u8, column: usize) -> Result<Vec<String>> {
    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open input file: {}", path.display()))?;

    let mut values = Vec::new();
    let mut row = StringRecord::new();
    while reader.read_record(&mut row).map_err(IngestError::from)? {
        let line = row.position().map(|p| p.line()).unwrap_or_default();
        let value = row
            .get(column)
            .ok_or(IngestError::MissingColumn { line, column })?;
        values.push(value.to_string());
    }
    Ok(values)
}
