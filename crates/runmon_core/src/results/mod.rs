//! Result ingestion: output polling, ingestion tasks, parsers and
//! taxon enrichment.

mod enrich;
mod ingest;
mod monitor;
mod parsers;

pub use enrich::{
    aggregate_genus_counts, enrich_taxon_counts, LineageSnapshot, TaxonLineage, MISSING_GENUS_ID,
    UNCATEGORIZABLE_GENUS_NAME,
};
pub use ingest::{drain_queue, run_worker, IngestError, IngestResult, Ingestor, RetryPolicy};
pub use monitor::ResultMonitor;
pub use parsers::{
    parse_amr_counts, parse_contig_counts, parse_contig_stats, parse_contigs, parse_ercc_counts,
    parse_taxon_byteranges, parse_taxon_counts, total_ercc_reads, ContigAssignments, ParseError,
    ParseResult, INVALID_CALL_BASE_ID,
};
