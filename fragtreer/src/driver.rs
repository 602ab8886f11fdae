use std::fs;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use fragtree::{
    AnalysisConfig, ChemicalAlphabet, FormulaError, FragmentationPatternAnalysis,
    FragmentationTree, ProcessedInput, TreeComputationError,
};

use crate::args::{non_negative_float_f64, ArgTreeBuilder};

/// Read from the working directory when present
pub const CONFIG_FILE_NAME: &str = "fragtreer.toml";
pub const ENV_PREFIX: &str = "FRAGTREER_";

#[derive(Debug, Error)]
pub enum FragTreerError {
    #[error("An IO error occurred: {0}")]
    IOError(
        #[source]
        #[from]
        io::Error,
    ),
    #[error("Failed to read or write JSON: {0}")]
    JSONError(
        #[source]
        #[from]
        serde_json::Error,
    ),
    #[error("Failed to load the configuration: {0}")]
    ConfigurationError(
        #[source]
        #[from]
        figment::Error,
    ),
    #[error("The alphabet {0:?} is invalid: {1}")]
    AlphabetError(String, #[source] FormulaError),
    #[error(transparent)]
    TreeComputationError(#[from] TreeComputationError),
}

/// The ranked trees computed for one spectrum
#[derive(Debug, Serialize)]
pub struct TreeReport<'a> {
    pub name: Option<&'a str>,
    pub precursor_mz: f64,
    pub trees: &'a [FragmentationTree],
}

fn default_output_file() -> PathBuf {
    PathBuf::from("-")
}

fn default_alphabet() -> String {
    "CHNOPS".to_string()
}

/// Compute fragmentation trees for a tandem mass spectrum.
///
/// Read a preprocessed spectrum in JSON, compute the best fragmentation trees over its
/// precursor formula candidates, and write them out as JSON.
#[derive(Parser, Debug, Deserialize, Serialize)]
#[command(author, version)]
pub struct FragTreer {
    /// The path to read the input spectrum from, or if '-' is passed, read from STDIN.
    ///
    /// Paths ending in `.gz` are decompressed while reading.
    #[arg()]
    pub input_file: String,

    /// The path to write the trees to, or if '-' is passed, write to STDOUT.
    #[arg(short = 'o', long = "output-file", default_value = "-")]
    #[serde(default = "default_output_file")]
    pub output_file: PathBuf,

    /// The path to write a log file to, in addition to STDERR
    #[arg(short = 'l', long = "log-file")]
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// A TOML configuration file to read analysis parameters from.
    ///
    /// Configurations are also read from `fragtreer.toml` in the working directory.
    /// Environment variables prefixed with `FRAGTREER_` will be read too.
    #[arg(long = "config-file")]
    #[serde(default)]
    pub config_file: Option<PathBuf>,

    /// The number of threads building graphs concurrently
    #[arg(short = 't', long = "threads")]
    pub threads: Option<usize>,

    /// The maximum number of trees to report
    #[arg(short = 'n', long = "max-trees")]
    pub max_trees: Option<usize>,

    /// The elements used to decompose peaks that carry no candidate formulas
    #[arg(short = 'a', long = "alphabet", default_value = "CHNOPS")]
    #[serde(default = "default_alphabet")]
    pub alphabet: String,

    /// The strategy used to select a tree from each graph
    #[arg(short = 'b', long = "tree-builder")]
    pub tree_builder: Option<ArgTreeBuilder>,

    /// Trees must score strictly above this value to be reported
    #[arg(long = "lowerbound")]
    pub lowerbound: Option<f64>,

    /// The fragment mass accuracy in parts-per-million, overriding the input's
    #[arg(short = 'p', long = "ms2-ppm", value_parser = non_negative_float_f64)]
    pub ms2_ppm: Option<f64>,

    /// Recalibrate each spectrum from its tree and keep the better tree
    #[arg(short = 'r', long = "recalibrate")]
    #[serde(default)]
    pub recalibrate: bool,

    #[arg(skip)]
    #[serde(default)]
    pub analysis: AnalysisConfig,
}

impl FragTreer {
    /// Layer the analysis configuration: the configuration this driver carries, then
    /// `fragtreer.toml`, an explicit configuration file, `FRAGTREER_` environment
    /// variables, and finally command line flags.
    pub fn resolve_config(&self) -> Result<AnalysisConfig, FragTreerError> {
        let mut figment =
            Figment::from(Serialized::defaults(&self.analysis)).merge(Toml::file(CONFIG_FILE_NAME));
        if let Some(path) = self.config_file.as_ref() {
            figment = figment.merge(Toml::file_exact(path));
        }
        let mut config: AnalysisConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        if let Some(threads) = self.threads {
            config.threads = threads;
        }
        if let Some(max_trees) = self.max_trees {
            config.max_trees = max_trees;
        }
        if let Some(tree_builder) = self.tree_builder {
            config.tree_builder = tree_builder.into();
        }
        if let Some(lowerbound) = self.lowerbound {
            config.lowerbound = lowerbound;
        }
        if self.recalibrate {
            config.recalibration = true;
        }
        Ok(config)
    }

    fn read_input(&self) -> Result<ProcessedInput, FragTreerError> {
        let reader: Box<dyn Read> = if self.input_file == "-" {
            Box::new(io::stdin().lock())
        } else {
            let fh = fs::File::open(&self.input_file)?;
            if self.input_file.ends_with(".gz") {
                Box::new(GzDecoder::new(BufReader::new(fh)))
            } else {
                Box::new(fh)
            }
        };
        let mut input: ProcessedInput = serde_json::from_reader(BufReader::new(reader))?;
        input.normalize();
        Ok(input)
    }

    fn write_output(&self, report: &TreeReport) -> Result<(), FragTreerError> {
        if self.output_file.as_os_str() == "-" {
            let mut handle = io::stdout().lock();
            serde_json::to_writer_pretty(&mut handle, report)?;
            writeln!(handle)?;
            handle.flush()?;
        } else {
            let fh = BufWriter::new(fs::File::create(&self.output_file)?);
            let is_gzip = self
                .output_file
                .extension()
                .is_some_and(|ext| ext == "gz");
            if is_gzip {
                let mut writer = GzEncoder::new(fh, Compression::best());
                serde_json::to_writer_pretty(&mut writer, report)?;
                writer.finish()?.flush()?;
            } else {
                let mut writer = fh;
                serde_json::to_writer_pretty(&mut writer, report)?;
                writer.flush()?;
            }
        }
        Ok(())
    }

    pub fn main(&self) -> Result<(), FragTreerError> {
        info!(
            "fragtreer v{}",
            option_env!("CARGO_PKG_VERSION").unwrap_or("unknown")
        );
        info!("Input: {}", self.input_file);
        info!("Output: {}", self.output_file.display());

        let config = self.resolve_config()?;
        if let Ok(text) = toml::to_string_pretty(&config) {
            debug!("Effective configuration:\n{text}");
        }
        let alphabet = ChemicalAlphabet::parse(&self.alphabet)
            .map_err(|e| FragTreerError::AlphabetError(self.alphabet.clone(), e))?;

        let start = Instant::now();
        let mut input = self.read_input()?;
        if let Some(ppm) = self.ms2_ppm {
            input.experiment.ms2_ppm = ppm;
        }

        let max_trees = config.max_trees;
        let analysis = Arc::new(FragmentationPatternAnalysis::new(config));
        let needs_decomposition = input.parent_candidates.is_empty()
            || input
                .peaks
                .iter()
                .any(|p| p.index != input.parent_peak && p.decompositions.is_empty());
        if needs_decomposition {
            analysis.decompose_peaks(&mut input, &alphabet);
        }
        info!(
            "Peaks: {} | Parent Candidates: {}",
            input.len(),
            input.parent_candidates.len()
        );

        let input = Arc::new(input);
        let trees = analysis.compute_trees(input.clone(), max_trees)?;
        if trees.is_empty() {
            warn!("No candidate produced a tree above the lowerbound");
        } else {
            info!(
                "Best Trees: {}",
                trees
                    .iter()
                    .map(|t| format!("{} ({:0.3})", t.candidate.formula, t.score))
                    .join(", ")
            );
        }

        let report = TreeReport {
            name: input.experiment.name.as_deref(),
            precursor_mz: input.experiment.precursor_mz,
            trees: &trees,
        };
        self.write_output(&report)?;
        info!("Total Elapsed Time: {:0.3?}", start.elapsed());
        Ok(())
    }
}
