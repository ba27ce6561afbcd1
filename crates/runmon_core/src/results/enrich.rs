//! Enrichment of ingested taxon counts from reference lineage data.
//!
//! Everything here is a pure transformation over rows and a
//! [`LineageSnapshot`] supplied by the caller.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::parsers::INVALID_CALL_BASE_ID;
use crate::models::{TaxLevel, TaxonCount};

/// Genus id for species without a genus.
pub const MISSING_GENUS_ID: i64 = -200;
pub const UNCATEGORIZABLE_GENUS_NAME: &str = "Uncategorizable as a genus";

/// Reference lineage of one taxid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaxonLineage {
    pub taxid: i64,
    pub species_taxid: Option<i64>,
    pub genus_taxid: Option<i64>,
    pub family_taxid: Option<i64>,
    pub superkingdom_taxid: Option<i64>,
    pub species_name: Option<String>,
    pub genus_name: Option<String>,
    pub family_name: Option<String>,
    pub species_common_name: Option<String>,
    pub genus_common_name: Option<String>,
    pub family_common_name: Option<String>,
}

impl TaxonLineage {
    fn name_at(&self, level: TaxLevel) -> Option<(&String, Option<&String>)> {
        let (name, common) = match level {
            TaxLevel::Species => (&self.species_name, &self.species_common_name),
            TaxLevel::Genus => (&self.genus_name, &self.genus_common_name),
            TaxLevel::Family => (&self.family_name, &self.family_common_name),
        };
        name.as_ref().map(|n| (n, common.as_ref()))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SnapshotFile {
    lineages: Vec<TaxonLineage>,
    phage_families: Vec<i64>,
    phage_taxids: Vec<i64>,
}

/// Lineage data valid for the ingestion being performed.
#[derive(Debug, Clone, Default)]
pub struct LineageSnapshot {
    lineages: HashMap<i64, TaxonLineage>,
    phage_families: HashSet<i64>,
    phage_taxids: HashSet<i64>,
}

impl LineageSnapshot {
    pub fn new(
        lineages: impl IntoIterator<Item = TaxonLineage>,
        phage_families: impl IntoIterator<Item = i64>,
        phage_taxids: impl IntoIterator<Item = i64>,
    ) -> Self {
        Self {
            lineages: lineages.into_iter().map(|l| (l.taxid, l)).collect(),
            phage_families: phage_families.into_iter().collect(),
            phage_taxids: phage_taxids.into_iter().collect(),
        }
    }

    /// Parse a JSON snapshot:
    /// `{"lineages": [...], "phage_families": [...], "phage_taxids": [...]}`.
    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        let file: SnapshotFile = serde_json::from_str(content)?;
        Ok(Self::new(file.lineages, file.phage_families, file.phage_taxids))
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("reading lineage snapshot {}: {}", path.display(), e))?;
        let snapshot = Self::from_json(&content)
            .map_err(|e| format!("parsing lineage snapshot {}: {}", path.display(), e))?;
        tracing::info!("Loaded {} lineages from {}", snapshot.len(), path.display());
        Ok(snapshot)
    }

    pub fn get(&self, taxid: i64) -> Option<&TaxonLineage> {
        self.lineages.get(&taxid)
    }

    pub fn len(&self) -> usize {
        self.lineages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lineages.is_empty()
    }

    /// `[species, genus, family, superkingdom]` of `taxid`; empty when unknown.
    pub fn lineage_ids(&self, taxid: i64) -> Vec<Option<i64>> {
        match self.get(taxid) {
            Some(l) => vec![
                l.species_taxid.or(Some(taxid)),
                l.genus_taxid,
                l.family_taxid,
                l.superkingdom_taxid,
            ],
            None => Vec::new(),
        }
    }

    fn is_phage(&self, row: &TaxonCount) -> bool {
        row.family_taxid.is_some_and(|f| self.phage_families.contains(&f))
            || self.phage_taxids.contains(&row.tax_id)
    }
}

#[derive(Default)]
struct GenusAccumulator {
    count: u64,
    weighted_identity: f64,
    weighted_length: f64,
    weighted_e_value: f64,
    species_concordant: f64,
    genus_concordant: f64,
    family_concordant: f64,
    rows: usize,
}

/// Genus rows summed from species rows that have a lineage.
///
/// Alignment metrics are count-weighted averages; concordance totals are
/// plain averages.
pub fn aggregate_genus_counts(rows: &[TaxonCount], snapshot: &LineageSnapshot) -> Vec<TaxonCount> {
    let mut groups: BTreeMap<(i64, String, String), GenusAccumulator> = BTreeMap::new();

    for row in rows.iter().filter(|r| r.tax_level == TaxLevel::Species) {
        let Some(lineage) = snapshot.get(row.tax_id) else {
            continue;
        };
        let key = match lineage.genus_taxid {
            Some(genus) => (
                genus,
                lineage.genus_name.clone().unwrap_or_default(),
                row.count_type.clone(),
            ),
            None => (
                MISSING_GENUS_ID,
                UNCATEGORIZABLE_GENUS_NAME.to_string(),
                row.count_type.clone(),
            ),
        };
        let acc = groups.entry(key).or_default();
        let count = row.count as f64;
        acc.count += row.count;
        acc.weighted_identity += row.percent_identity * count;
        acc.weighted_length += row.alignment_length * count;
        acc.weighted_e_value += row.e_value * count;
        acc.species_concordant += row.species_total_concordant;
        acc.genus_concordant += row.genus_total_concordant;
        acc.family_concordant += row.family_total_concordant;
        acc.rows += 1;
    }

    groups
        .into_iter()
        .map(|((tax_id, name, count_type), acc)| {
            let total = acc.count as f64;
            let weighted = |sum: f64| if acc.count == 0 { 0.0 } else { sum / total };
            let avg = |sum: f64| sum / acc.rows as f64;
            TaxonCount {
                tax_id,
                tax_level: TaxLevel::Genus,
                count_type,
                count: acc.count,
                name: Some(name),
                common_name: None,
                percent_identity: weighted(acc.weighted_identity),
                alignment_length: weighted(acc.weighted_length),
                e_value: weighted(acc.weighted_e_value),
                genus_taxid: None,
                family_taxid: None,
                superkingdom_taxid: None,
                species_total_concordant: avg(acc.species_concordant),
                genus_total_concordant: avg(acc.genus_concordant),
                family_total_concordant: avg(acc.family_concordant),
                percent_concordant: weighted(100.0 * avg(acc.genus_concordant)),
                is_phage: false,
            }
        })
        .collect()
}

/// Lineage id for resolving a possibly "no call" taxid.
fn resolvable_taxid(tax_id: i64) -> i64 {
    if tax_id < INVALID_CALL_BASE_ID {
        tax_id.abs() % INVALID_CALL_BASE_ID.abs()
    } else {
        tax_id
    }
}

/// Populate derived taxon data for one ingestion.
///
/// Non-multihit runs get genus rows aggregated from species, then each
/// row's genus, family and superkingdom from its lineage. Multihit runs
/// already carry genus and family rows and only get the superkingdom.
/// Names are taken from the lineage where known; phage rows are tagged.
pub fn enrich_taxon_counts(
    mut rows: Vec<TaxonCount>,
    multihit: bool,
    snapshot: &LineageSnapshot,
) -> Vec<TaxonCount> {
    if !multihit {
        let genera = aggregate_genus_counts(&rows, snapshot);
        let replaced: HashSet<(i64, String)> = genera
            .iter()
            .map(|g| (g.tax_id, g.count_type.clone()))
            .collect();
        rows.retain(|r| {
            r.tax_level != TaxLevel::Genus || !replaced.contains(&(r.tax_id, r.count_type.clone()))
        });
        rows.extend(genera);
    }

    for row in &mut rows {
        if let Some((name, common)) = snapshot
            .get(row.tax_id)
            .and_then(|l| l.name_at(row.tax_level))
        {
            row.name = Some(name.clone());
            row.common_name = common.cloned();
        }

        if multihit {
            if row.tax_id != INVALID_CALL_BASE_ID {
                if let Some(lineage) = snapshot.get(resolvable_taxid(row.tax_id)) {
                    row.superkingdom_taxid = lineage.superkingdom_taxid;
                }
            }
        } else if let Some(lineage) = snapshot.get(row.tax_id) {
            row.genus_taxid = lineage.genus_taxid;
            row.family_taxid = lineage.family_taxid;
            row.superkingdom_taxid = lineage.superkingdom_taxid;
        }

        if snapshot.is_phage(row) {
            row.is_phage = true;
        }
    }
    rows
}
