//! Storage layout of pipeline inputs and outputs.
//!
//! Two layouts coexist. Runs before the assembly version publish taxon
//! counts under the alignment folder; later runs publish refined outputs
//! under `postprocess/.../assembly/`. Versions before 2.0 also nest their
//! outputs in a subsample folder.

use crate::models::{after, OutputKind, PipelineRun, PipelineVersion};

pub const PIPELINE_VERSION_FILE: &str = "pipeline_version.txt";
pub const STATS_JSON_NAME: &str = "stats.json";
pub const ERCC_OUTPUT_NAME: &str = "reads_per_gene.star.tab";
pub const AMR_FULL_RESULTS_NAME: &str = "amr_processed_results.csv";
pub const TAXON_COUNTS_JSON_NAME: &str = "taxon_counts.json";
pub const REFINED_TAXON_COUNTS_JSON_NAME: &str = "assembly/refined_taxon_counts.json";
pub const TAXID_BYTERANGE_JSON_NAME: &str = "taxid_locations_combined.json";
pub const REFINED_TAXID_BYTERANGE_JSON_NAME: &str = "assembly/refined_taxid_locations_combined.json";
pub const CONTIG_COUNTS_JSON_NAME: &str = "assembly/combined_contig_summary.json";
pub const CONTIG_STATS_JSON_NAME: &str = "assembly/contig_stats.json";
pub const ASSEMBLED_CONTIGS_NAME: &str = "assembly/contigs.fasta";
pub const CHUNKS_FOLDER: &str = "chunks";

/// Version gates on the output layout.
fn no_subsample_folder_version() -> PipelineVersion {
    PipelineVersion::new(2, 0)
}

fn multihit_version() -> PipelineVersion {
    PipelineVersion::new(1, 5)
}

/// Resolves blob paths for a run from its sample and pipeline version.
#[derive(Debug, Clone)]
pub struct PathResolver {
    samples_bucket: String,
    assembly_version: PipelineVersion,
}

impl PathResolver {
    pub fn new(samples_bucket: impl Into<String>, assembly_version: PipelineVersion) -> Self {
        Self {
            samples_bucket: samples_bucket.into(),
            assembly_version,
        }
    }

    fn sample_prefix(&self, run: &PipelineRun) -> String {
        format!(
            "s3://{}/samples/{}/{}",
            self.samples_bucket, run.sample.project_id, run.sample.id
        )
    }

    /// Uploaded FASTQ files.
    pub fn sample_input(&self, run: &PipelineRun) -> String {
        format!("{}/fastqs", self.sample_prefix(run))
    }

    pub fn sample_output(&self, run: &PipelineRun) -> String {
        format!("{}/results", self.sample_prefix(run))
    }

    pub fn sample_postprocess(&self, run: &PipelineRun) -> String {
        format!("{}/postprocess", self.sample_prefix(run))
    }

    pub fn sample_expt(&self, run: &PipelineRun) -> String {
        format!("{}/results_expt", self.sample_prefix(run))
    }

    /// Where the first stage publishes the pipeline version.
    pub fn pipeline_version_file(&self, run: &PipelineRun) -> String {
        format!("{}/{}", self.sample_output(run), PIPELINE_VERSION_FILE)
    }

    /// Whether the run publishes the assembly layout.
    pub fn is_assembly(&self, run: &PipelineRun) -> bool {
        run.pipeline_version
            .as_ref()
            .is_some_and(|v| *v >= self.assembly_version)
    }

    /// Whether genus and family counts come straight from the pipeline.
    pub fn is_multihit(run: &PipelineRun) -> bool {
        after(run.pipeline_version.as_ref(), Some(&multihit_version()))
    }

    /// Subsample folder name, `None` for layouts without one.
    pub fn subsample_suffix(run: &PipelineRun) -> Option<String> {
        match &run.pipeline_version {
            Some(v) if *v >= no_subsample_folder_version() => None,
            _ if run.subsamples() => run.subsample.map(|n| format!("subsample_{}", n)),
            Some(_) => Some("subsample_all".to_string()),
            None => None,
        }
    }

    /// `<base>[/<version>]`.
    fn with_version(base: String, run: &PipelineRun) -> String {
        match &run.pipeline_version {
            Some(v) => format!("{}/{}", base, v.as_str()),
            None => base,
        }
    }

    /// `<base>[/<version>][/<subsample suffix>]`.
    fn versioned(base: String, run: &PipelineRun) -> String {
        let path = Self::with_version(base, run);
        match Self::subsample_suffix(run) {
            Some(suffix) => format!("{}/{}", path, suffix),
            None => path,
        }
    }

    /// Host filtering output folder, also home of counters and chunks.
    pub fn output_with_version(&self, run: &PipelineRun) -> String {
        Self::with_version(self.sample_output(run), run)
    }

    pub fn alignment_output(&self, run: &PipelineRun) -> String {
        Self::versioned(self.sample_output(run), run)
    }

    pub fn postprocess_output(&self, run: &PipelineRun) -> String {
        Self::versioned(self.sample_postprocess(run), run)
    }

    pub fn expt_output(&self, run: &PipelineRun) -> String {
        Self::versioned(self.sample_expt(run), run)
    }

    /// The well-known path whose existence means `output` is ready.
    pub fn output_path(&self, run: &PipelineRun, output: OutputKind) -> String {
        match output {
            OutputKind::ErccCounts => {
                format!("{}/{}", self.output_with_version(run), ERCC_OUTPUT_NAME)
            }
            OutputKind::AmrCounts => {
                format!("{}/{}", self.expt_output(run), AMR_FULL_RESULTS_NAME)
            }
            OutputKind::TaxonCounts if self.is_assembly(run) => format!(
                "{}/{}",
                self.postprocess_output(run),
                REFINED_TAXON_COUNTS_JSON_NAME
            ),
            OutputKind::TaxonCounts => {
                format!("{}/{}", self.alignment_output(run), TAXON_COUNTS_JSON_NAME)
            }
            OutputKind::TaxonByteranges if self.is_assembly(run) => format!(
                "{}/{}",
                self.postprocess_output(run),
                REFINED_TAXID_BYTERANGE_JSON_NAME
            ),
            OutputKind::TaxonByteranges => format!(
                "{}/{}",
                self.postprocess_output(run),
                TAXID_BYTERANGE_JSON_NAME
            ),
            OutputKind::ContigCounts => {
                format!("{}/{}", self.postprocess_output(run), CONTIG_COUNTS_JSON_NAME)
            }
        }
    }

    pub fn contig_stats_path(&self, run: &PipelineRun) -> String {
        format!("{}/{}", self.postprocess_output(run), CONTIG_STATS_JSON_NAME)
    }

    pub fn contigs_fasta_path(&self, run: &PipelineRun) -> String {
        format!("{}/{}", self.postprocess_output(run), ASSEMBLED_CONTIGS_NAME)
    }

    pub fn stats_summary_path(&self, run: &PipelineRun) -> String {
        format!("{}/{}", self.output_with_version(run), STATS_JSON_NAME)
    }

    /// Listing prefix (trailing slash) of alignment chunk outputs.
    pub fn chunks_prefix(&self, run: &PipelineRun) -> String {
        format!("{}/{}/", self.output_with_version(run), CHUNKS_FOLDER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewRun, SampleRef};
    use chrono::Utc;

    fn resolver() -> PathResolver {
        PathResolver::new("idseq-samples", PipelineVersion::new(3, 1))
    }

    fn run(version: Option<&str>, subsample: Option<u64>) -> PipelineRun {
        let mut run = PipelineRun::new(
            5,
            NewRun {
                sample: SampleRef {
                    id: 42,
                    project_id: 7,
                    input_file_count: 2,
                },
                alignment_config: "2018-02-15".to_string(),
                subsample,
            },
            Utc::now(),
        );
        run.pipeline_version = version.map(|v| v.parse().unwrap());
        run
    }

    #[test]
    fn unversioned_run_uses_bare_prefixes() {
        let run = run(None, None);
        let r = resolver();
        assert_eq!(r.sample_output(&run), "s3://idseq-samples/samples/7/42/results");
        assert_eq!(r.alignment_output(&run), "s3://idseq-samples/samples/7/42/results");
        assert_eq!(
            r.pipeline_version_file(&run),
            "s3://idseq-samples/samples/7/42/results/pipeline_version.txt"
        );
        assert!(!r.is_assembly(&run));
        assert!(!PathResolver::is_multihit(&run));
    }

    #[test]
    fn legacy_layout_nests_subsample_folders() {
        let r = resolver();

        let sub = run(Some("1.8"), Some(1_000_000));
        assert_eq!(
            r.alignment_output(&sub),
            "s3://idseq-samples/samples/7/42/results/1.8/subsample_1000000"
        );
        assert_eq!(
            r.output_path(&sub, OutputKind::TaxonCounts),
            "s3://idseq-samples/samples/7/42/results/1.8/subsample_1000000/taxon_counts.json"
        );
        assert_eq!(
            r.output_path(&sub, OutputKind::ErccCounts),
            "s3://idseq-samples/samples/7/42/results/1.8/reads_per_gene.star.tab"
        );

        let all = run(Some("1.8"), None);
        assert_eq!(
            r.postprocess_output(&all),
            "s3://idseq-samples/samples/7/42/postprocess/1.8/subsample_all"
        );
        assert!(PathResolver::is_multihit(&all));
    }

    #[test]
    fn dag_layout_has_no_subsample_folder() {
        let r = resolver();
        let run = run(Some("3.0"), Some(1_000_000));
        assert_eq!(PathResolver::subsample_suffix(&run), None);
        assert_eq!(
            r.output_path(&run, OutputKind::AmrCounts),
            "s3://idseq-samples/samples/7/42/results_expt/3.0/amr_processed_results.csv"
        );
        assert_eq!(
            r.output_path(&run, OutputKind::TaxonByteranges),
            "s3://idseq-samples/samples/7/42/postprocess/3.0/taxid_locations_combined.json"
        );
    }

    #[test]
    fn assembly_layout_uses_refined_outputs() {
        let r = resolver();
        let run = run(Some("3.1"), None);
        assert!(r.is_assembly(&run));
        assert_eq!(
            r.output_path(&run, OutputKind::TaxonCounts),
            "s3://idseq-samples/samples/7/42/postprocess/3.1/assembly/refined_taxon_counts.json"
        );
        assert_eq!(
            r.output_path(&run, OutputKind::TaxonByteranges),
            "s3://idseq-samples/samples/7/42/postprocess/3.1/assembly/refined_taxid_locations_combined.json"
        );
        assert_eq!(
            r.output_path(&run, OutputKind::ContigCounts),
            "s3://idseq-samples/samples/7/42/postprocess/3.1/assembly/combined_contig_summary.json"
        );
        assert_eq!(
            r.contigs_fasta_path(&run),
            "s3://idseq-samples/samples/7/42/postprocess/3.1/assembly/contigs.fasta"
        );
    }

    #[test]
    fn stats_and_chunks_live_under_versioned_results() {
        let r = resolver();
        let run = run(Some("3.2"), None);
        assert_eq!(
            r.stats_summary_path(&run),
            "s3://idseq-samples/samples/7/42/results/3.2/stats.json"
        );
        assert_eq!(
            r.chunks_prefix(&run),
            "s3://idseq-samples/samples/7/42/results/3.2/chunks/"
        );
    }
}
