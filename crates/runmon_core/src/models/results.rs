//! Rows ingested from pipeline outputs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::enums::TaxLevel;

/// Per-step read counter, replaced wholesale on each stats load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStat {
    pub task: String,
    pub reads_after: u64,
}

/// Read count for one ERCC spike-in control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErccCount {
    pub name: String,
    pub count: u64,
}

/// Reads assigned to one taxon at one level, for one database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxonCount {
    pub tax_id: i64,
    pub tax_level: TaxLevel,
    /// `NT` / `NR`, suffixed with `+` for refined (assembly) counts.
    pub count_type: String,
    pub count: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub common_name: Option<String>,
    #[serde(default)]
    pub percent_identity: f64,
    #[serde(default)]
    pub alignment_length: f64,
    #[serde(default)]
    pub e_value: f64,
    #[serde(default)]
    pub genus_taxid: Option<i64>,
    #[serde(default)]
    pub family_taxid: Option<i64>,
    #[serde(default)]
    pub superkingdom_taxid: Option<i64>,
    #[serde(default)]
    pub species_total_concordant: f64,
    #[serde(default)]
    pub genus_total_concordant: f64,
    #[serde(default)]
    pub family_total_concordant: f64,
    #[serde(default)]
    pub percent_concordant: f64,
    #[serde(default)]
    pub is_phage: bool,
}

/// Reads of one assembled contig assigned to one taxon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContigCount {
    pub count_type: String,
    pub taxid: i64,
    pub tax_level: i64,
    pub contig_name: String,
    pub count: u64,
}

/// One assembled contig with its species-level lineage per database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contig {
    pub name: String,
    pub sequence: String,
    pub read_count: u64,
    /// count type -> `[species, genus, family, superkingdom]` taxids.
    pub lineage: BTreeMap<String, Vec<Option<i64>>>,
}

/// Byte range of a taxon's reads inside the sorted annotated FASTA.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxonByterange {
    pub taxid: i64,
    pub hit_type: String,
    pub first_byte: u64,
    pub last_byte: u64,
}

/// Antimicrobial-resistance gene hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmrCount {
    pub gene: String,
    pub allele: String,
    pub coverage: f64,
    pub depth: f64,
    pub drug_family: String,
}

/// Store table that holds ingested rows for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultTable {
    ErccCounts,
    TaxonCounts,
    ContigCounts,
    Contigs,
    TaxonByteranges,
    AmrCounts,
}

/// A complete set of rows for one table, replacing any prior rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", content = "rows", rename_all = "snake_case")]
pub enum ResultRows {
    ErccCounts(Vec<ErccCount>),
    TaxonCounts(Vec<TaxonCount>),
    ContigCounts(Vec<ContigCount>),
    Contigs(Vec<Contig>),
    TaxonByteranges(Vec<TaxonByterange>),
    AmrCounts(Vec<AmrCount>),
}

impl ResultRows {
    pub fn table(&self) -> ResultTable {
        match self {
            ResultRows::ErccCounts(_) => ResultTable::ErccCounts,
            ResultRows::TaxonCounts(_) => ResultTable::TaxonCounts,
            ResultRows::ContigCounts(_) => ResultTable::ContigCounts,
            ResultRows::Contigs(_) => ResultTable::Contigs,
            ResultRows::TaxonByteranges(_) => ResultTable::TaxonByteranges,
            ResultRows::AmrCounts(_) => ResultTable::AmrCounts,
        }
    }

    /// Empty row set for a table.
    pub fn empty(table: ResultTable) -> Self {
        match table {
            ResultTable::ErccCounts => ResultRows::ErccCounts(Vec::new()),
            ResultTable::TaxonCounts => ResultRows::TaxonCounts(Vec::new()),
            ResultTable::ContigCounts => ResultRows::ContigCounts(Vec::new()),
            ResultTable::Contigs => ResultRows::Contigs(Vec::new()),
            ResultTable::TaxonByteranges => ResultRows::TaxonByteranges(Vec::new()),
            ResultTable::AmrCounts => ResultRows::AmrCounts(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ResultRows::ErccCounts(rows) => rows.len(),
            ResultRows::TaxonCounts(rows) => rows.len(),
            ResultRows::ContigCounts(rows) => rows.len(),
            ResultRows::Contigs(rows) => rows.len(),
            ResultRows::TaxonByteranges(rows) => rows.len(),
            ResultRows::AmrCounts(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_report_their_table() {
        let rows = ResultRows::ErccCounts(vec![ErccCount {
            name: "ERCC-00002".to_string(),
            count: 10,
        }]);
        assert_eq!(rows.table(), ResultTable::ErccCounts);
        assert_eq!(rows.len(), 1);
        assert!(ResultRows::empty(ResultTable::Contigs).is_empty());
    }

    #[test]
    fn taxon_count_defaults_optional_fields() {
        let json = r#"{"tax_id": 573, "tax_level": 1, "count_type": "NT", "count": 12}"#;
        let row: TaxonCount = serde_json::from_str(json).unwrap();
        assert_eq!(row.tax_level, TaxLevel::Species);
        assert_eq!(row.genus_taxid, None);
        assert!(!row.is_phage);
    }
}
