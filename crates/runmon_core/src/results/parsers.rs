//! Parsers for the downloaded pipeline outputs.
//!
//! All parsers are pure: they take file contents and return rows, so a
//! malformed file surfaces as an error before anything is replaced.

use std::collections::BTreeMap;

use serde::Deserialize;
use thiserror::Error;

use super::enrich::LineageSnapshot;
use crate::models::{AmrCount, Contig, ContigCount, ErccCount, TaxLevel, TaxonByterange, TaxonCount};

/// Taxids below this encode "no call" at a level.
pub const INVALID_CALL_BASE_ID: i64 = -100_000_000;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("line {line}: {message}")]
    Line { line: usize, message: String },
}

impl ParseError {
    fn line(line: usize, message: impl Into<String>) -> Self {
        Self::Line {
            line,
            message: message.into(),
        }
    }
}

pub type ParseResult<T> = Result<T, ParseError>;

/// STAR gene counts: tab-separated `name count ...` for lines mentioning ERCC.
pub fn parse_ercc_counts(content: &str) -> ParseResult<Vec<ErccCount>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| line.contains("ERCC"))
        .map(|(i, line)| {
            let mut fields = line.split('\t');
            let name = fields.next().unwrap_or_default().to_string();
            let count = fields
                .next()
                .and_then(|c| c.trim().parse::<u64>().ok())
                .ok_or_else(|| ParseError::line(i + 1, "missing or invalid ERCC count"))?;
            Ok(ErccCount { name, count })
        })
        .collect()
}

/// ERCC reads across all input files: summed counts times the file count.
pub fn total_ercc_reads(rows: &[ErccCount], input_file_count: u32) -> u64 {
    rows.iter().map(|r| r.count).sum::<u64>() * u64::from(input_file_count)
}

#[derive(Deserialize)]
struct TaxonCountsFile {
    pipeline_output: PipelineOutput,
}

#[derive(Deserialize)]
struct PipelineOutput {
    taxon_counts_attributes: Vec<serde_json::Value>,
}

fn as_i64(value: Option<&serde_json::Value>) -> Option<i64> {
    match value? {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Taxon counts from the pipeline's report JSON.
///
/// Keeps species rows, plus genus and family rows for multihit runs, and
/// drops rows with a "no call" family. Refined counts get `+` appended to
/// their count type.
pub fn parse_taxon_counts(
    content: &str,
    multihit: bool,
    refined: bool,
) -> ParseResult<Vec<TaxonCount>> {
    let file: TaxonCountsFile = serde_json::from_str(content)?;

    let mut rows = Vec::new();
    for raw in file.pipeline_output.taxon_counts_attributes {
        let level = as_i64(raw.get("tax_level"));
        let accepted = match level.and_then(|l| TaxLevel::try_from(l).ok()) {
            Some(TaxLevel::Species) => true,
            Some(TaxLevel::Genus | TaxLevel::Family) => multihit,
            None => false,
        };
        let invalid_family = as_i64(raw.get("family_taxid")).is_some_and(|f| f < INVALID_CALL_BASE_ID);
        if !accepted || invalid_family {
            continue;
        }

        let mut row: TaxonCount = serde_json::from_value(raw)?;
        if refined {
            row.count_type.push('+');
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Byte ranges of each taxon in the sorted annotated FASTA.
pub fn parse_taxon_byteranges(content: &str) -> ParseResult<Vec<TaxonByterange>> {
    Ok(serde_json::from_str(content)?)
}

#[derive(Deserialize)]
struct ContigSummaryEntry {
    count_type: String,
    taxid: i64,
    tax_level: i64,
    contig_counts: BTreeMap<String, u64>,
}

/// Species-level assignment of each contig: contig -> count type -> taxid.
pub type ContigAssignments = BTreeMap<String, BTreeMap<String, i64>>;

/// Contig-to-taxon read counts, and the species assignment of each contig.
pub fn parse_contig_counts(content: &str) -> ParseResult<(Vec<ContigCount>, ContigAssignments)> {
    let entries: Vec<ContigSummaryEntry> = serde_json::from_str(content)?;

    let mut counts = Vec::new();
    let mut assignments = ContigAssignments::new();
    for entry in entries {
        for (contig_name, count) in entry.contig_counts {
            if entry.tax_level == TaxLevel::Species.id() {
                assignments
                    .entry(contig_name.clone())
                    .or_default()
                    .insert(entry.count_type.clone(), entry.taxid);
            }
            counts.push(ContigCount {
                count_type: entry.count_type.clone(),
                taxid: entry.taxid,
                tax_level: entry.tax_level,
                contig_name,
                count,
            });
        }
    }
    Ok((counts, assignments))
}

/// Read count per contig name.
pub fn parse_contig_stats(content: &str) -> ParseResult<BTreeMap<String, u64>> {
    Ok(serde_json::from_str(content)?)
}

/// Contigs from the assembled FASTA, with read counts and lineages.
pub fn parse_contigs(
    fasta: &str,
    read_counts: &BTreeMap<String, u64>,
    assignments: &ContigAssignments,
    snapshot: &LineageSnapshot,
) -> Vec<Contig> {
    let make = |name: &str, sequence: String| {
        let lineage = assignments
            .get(name)
            .map(|by_type| {
                by_type
                    .iter()
                    .map(|(count_type, taxid)| (count_type.clone(), snapshot.lineage_ids(*taxid)))
                    .collect()
            })
            .unwrap_or_default();
        Contig {
            name: name.to_string(),
            sequence,
            read_count: read_counts.get(name).copied().unwrap_or(0),
            lineage,
        }
    };

    let mut contigs = Vec::new();
    let mut header: Option<&str> = None;
    let mut sequence = String::new();
    for line in fasta.lines() {
        if let Some(name) = line.strip_prefix('>') {
            if let Some(prev) = header {
                contigs.push(make(prev, std::mem::take(&mut sequence)));
            }
            header = Some(name.trim_end());
        } else {
            sequence.push_str(line.trim_end());
        }
    }
    if let Some(prev) = header {
        contigs.push(make(prev, sequence));
    }
    contigs
}

/// AMR gene results CSV. The header line is skipped, then two leading
/// columns are dropped from each row.
pub fn parse_amr_counts(content: &str) -> ParseResult<Vec<AmrCount>> {
    content
        .lines()
        .enumerate()
        .skip(1)
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            let fields: Vec<&str> = line.split(',').skip(2).collect();
            let field = |idx: usize| {
                fields
                    .get(idx)
                    .map(|f| f.trim())
                    .ok_or_else(|| ParseError::line(i + 1, format!("missing column {}", idx + 2)))
            };
            let number = |idx: usize| -> ParseResult<f64> {
                let raw = field(idx)?;
                raw.parse()
                    .map_err(|_| ParseError::line(i + 1, format!("'{}' is not a number", raw)))
            };
            Ok(AmrCount {
                gene: field(0)?.to_string(),
                allele: field(1)?.to_string(),
                coverage: number(2)?,
                depth: number(3)?,
                drug_family: field(12)?.to_string(),
            })
        })
        .collect()
}
