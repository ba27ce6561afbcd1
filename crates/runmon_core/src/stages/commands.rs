//! Stage command builders.
//!
//! Each stage maps to one builder with explicit inputs. The commands are
//! opaque to the monitor: it only records and dispatches them.

use crate::config::PipelineSettings;
use crate::external::JobCommand;
use crate::models::{PipelineRun, StageName};
use crate::paths::PathResolver;

/// Everything a stage command is built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInputs {
    pub sample_id: u64,
    pub alignment_config: String,
    pub input_fastqs: String,
    pub host_filter_output: String,
    pub alignment_output: String,
    pub chunks_prefix: String,
    pub postprocess_output: String,
    pub expt_output: String,
    pub pipeline_version: Option<String>,
    /// Fragments (or pairs) kept after host filtering.
    pub subsample: u64,
    pub max_input_fragments: u64,
    pub paired: bool,
    pub adapter_fasta: String,
}

impl CommandInputs {
    pub fn for_run(run: &PipelineRun, paths: &PathResolver, pipeline: &PipelineSettings) -> Self {
        let paired = run.sample.is_paired();
        let adapter_fasta = if paired {
            pipeline.adapters_paired_end.clone()
        } else {
            pipeline.adapters_single_end.clone()
        };

        Self {
            sample_id: run.sample.id,
            alignment_config: run.alignment_config.clone(),
            input_fastqs: paths.sample_input(run),
            host_filter_output: paths.output_with_version(run),
            alignment_output: paths.alignment_output(run),
            chunks_prefix: paths.chunks_prefix(run),
            postprocess_output: paths.postprocess_output(run),
            expt_output: paths.expt_output(run),
            pipeline_version: run.pipeline_version.as_ref().map(|v| v.to_string()),
            subsample: run
                .subsample
                .filter(|n| *n > 0)
                .unwrap_or(pipeline.default_subsample),
            max_input_fragments: pipeline.max_input_fragments,
            paired,
            adapter_fasta,
        }
    }
}

/// Build the command that runs `stage` with `program`.
pub fn build_command(stage: StageName, program: &str, inputs: &CommandInputs) -> JobCommand {
    match stage {
        StageName::HostFiltering => host_filtering_command(program, inputs),
        StageName::Alignment => alignment_command(program, inputs),
        StageName::Postprocess => postprocess_command(program, inputs),
        StageName::Experimental => experimental_command(program, inputs),
    }
}

fn with_sample(cmd: JobCommand, inputs: &CommandInputs) -> JobCommand {
    let cmd = cmd.flag("--sample-id", inputs.sample_id.to_string());
    match &inputs.pipeline_version {
        Some(version) => cmd.flag("--pipeline-version", version.clone()),
        None => cmd,
    }
}

fn host_filtering_command(program: &str, inputs: &CommandInputs) -> JobCommand {
    let cmd = JobCommand::new(program).arg("host_filter");
    let cmd = with_sample(cmd, inputs)
        .flag("--input", inputs.input_fastqs.clone())
        .flag("--output", inputs.host_filter_output.clone())
        .flag("--max-fragments", inputs.max_input_fragments.to_string())
        .flag("--subsample", inputs.subsample.to_string())
        .flag("--adapter-fasta", inputs.adapter_fasta.clone());
    if inputs.paired {
        cmd.arg("--paired")
    } else {
        cmd
    }
}

fn alignment_command(program: &str, inputs: &CommandInputs) -> JobCommand {
    let cmd = JobCommand::new(program).arg("non_host_alignment");
    with_sample(cmd, inputs)
        .flag("--input", inputs.host_filter_output.clone())
        .flag("--output", inputs.alignment_output.clone())
        .flag("--chunks", inputs.chunks_prefix.clone())
        .flag("--alignment-config", inputs.alignment_config.clone())
}

fn postprocess_command(program: &str, inputs: &CommandInputs) -> JobCommand {
    let cmd = JobCommand::new(program).arg("postprocess");
    with_sample(cmd, inputs)
        .flag("--input", inputs.alignment_output.clone())
        .flag("--output", inputs.postprocess_output.clone())
        .flag("--alignment-config", inputs.alignment_config.clone())
}

fn experimental_command(program: &str, inputs: &CommandInputs) -> JobCommand {
    let cmd = JobCommand::new(program).arg("experimental");
    with_sample(cmd, inputs)
        .flag("--input", inputs.postprocess_output.clone())
        .flag("--output", inputs.expt_output.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewRun, PipelineVersion, SampleRef};
    use chrono::Utc;

    fn inputs(input_file_count: u32, subsample: Option<u64>) -> CommandInputs {
        let run = PipelineRun::new(
            1,
            NewRun {
                sample: SampleRef {
                    id: 9,
                    project_id: 3,
                    input_file_count,
                },
                alignment_config: "2019-01-01".to_string(),
                subsample,
            },
            Utc::now(),
        );
        let paths = PathResolver::new("bucket", PipelineVersion::new(3, 1));
        CommandInputs::for_run(&run, &paths, &PipelineSettings::default())
    }

    #[test]
    fn host_filtering_uses_input_shape() {
        let single = build_command(StageName::HostFiltering, "idseq_dag", &inputs(1, None));
        assert_eq!(single.args[0], "host_filter");
        assert!(!single.args.contains(&"--paired".to_string()));
        assert!(single
            .args
            .iter()
            .any(|a| a.ends_with("illumina_TruSeq3-SE.fasta")));
        // Default subsample applies when the run sets none.
        assert!(single.to_string().contains("--subsample 1000000"));

        let paired = build_command(StageName::HostFiltering, "idseq_dag", &inputs(2, Some(500)));
        assert!(paired.args.contains(&"--paired".to_string()));
        assert!(paired.to_string().contains("--subsample 500"));
    }

    #[test]
    fn each_stage_reads_previous_output() {
        let inputs = inputs(1, None);
        let alignment = build_command(StageName::Alignment, "dag", &inputs);
        assert!(alignment
            .to_string()
            .contains("--input s3://bucket/samples/3/9/results"));
        assert!(alignment.to_string().contains("--alignment-config 2019-01-01"));

        let expt = build_command(StageName::Experimental, "dag", &inputs);
        assert_eq!(expt.program, "dag");
        assert!(expt
            .to_string()
            .contains("--output s3://bucket/samples/3/9/results_expt"));
    }
}
