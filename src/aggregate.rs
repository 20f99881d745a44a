use std::{
    collections::{BTreeMap, BTreeSet},
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use itertools::Itertools;
use traffic_stats::SampleSet;

use crate::{error::Result, metrics::RunSummary};

#[derive(Clone, Debug, PartialEq)]
pub struct RunRecord {
    pub scenario: String,
    pub composition: String,
    pub summary: RunSummary,
}

/// One (scenario, composition) group with `{metric}_{mean|std|count}` columns.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregateRow {
    pub scenario: String,
    pub composition: String,
    pub sample_size: usize,
    pub columns: BTreeMap<String, f64>,
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn csv_field(s: &str) -> String {
    if s.contains(',') || s.contains('"') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_owned()
    }
}

#[derive(Clone, Debug, Default)]
pub struct MetricsAggregator {
    runs: Vec<RunRecord>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_run(&mut self, scenario: &str, composition: &str, summary: RunSummary) {
        self.runs.push(RunRecord {
            scenario: scenario.to_owned(),
            composition: composition.to_owned(),
            summary,
        });
    }

    pub fn runs(&self) -> &[RunRecord] {
        &self.runs
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Groups runs by scenario and composition. A metric's columns only
    /// cover the runs that reported it; `_std` needs at least two of them.
    pub fn aggregate(&self) -> Vec<AggregateRow> {
        let mut groups: BTreeMap<(&str, &str), Vec<&RunSummary>> = BTreeMap::new();
        for run in self.runs.iter() {
            groups
                .entry((run.scenario.as_str(), run.composition.as_str()))
                .or_default()
                .push(&run.summary);
        }

        groups
            .into_iter()
            .map(|((scenario, composition), summaries)| {
                let mut samples: BTreeMap<&str, SampleSet> = BTreeMap::new();
                for summary in summaries.iter() {
                    for (metric, &value) in summary.iter() {
                        samples.entry(metric.as_str()).or_default().push(value);
                    }
                }

                let mut columns = BTreeMap::new();
                for (metric, set) in samples {
                    if let Some(mean) = set.mean() {
                        columns.insert(format!("{}_mean", metric), mean);
                    }
                    if set.len() >= 2 {
                        columns.insert(format!("{}_std", metric), set.std_dev());
                    }
                    columns.insert(format!("{}_count", metric), set.len() as f64);
                }

                AggregateRow {
                    scenario: scenario.to_owned(),
                    composition: composition.to_owned(),
                    sample_size: summaries.len(),
                    columns,
                }
            })
            .collect_vec()
    }

    /// Aggregate table, values rounded to 3 decimals.
    pub fn write_results_csv(&self, path: &Path) -> Result<()> {
        let rows = self.aggregate();
        let header = rows
            .iter()
            .flat_map(|r| r.columns.keys().cloned())
            .collect::<BTreeSet<_>>();

        let mut file = BufWriter::new(File::create(path)?);
        writeln!(
            file,
            "scenario,composition,sample_size{}",
            header.iter().map(|h| format!(",{}", h)).join("")
        )?;
        for row in rows.iter() {
            let values = header
                .iter()
                .map(|h| row.columns.get(h).map_or(String::new(), |v| round3(*v).to_string()))
                .join(",");
            writeln!(
                file,
                "{},{},{},{}",
                csv_field(&row.scenario),
                csv_field(&row.composition),
                row.sample_size,
                values
            )?;
        }
        file.flush()?;
        Ok(())
    }

    /// One line per run under the union of all summary keys.
    pub fn write_runs_csv(&self, path: &Path) -> Result<()> {
        let header = self
            .runs
            .iter()
            .flat_map(|r| r.summary.keys().cloned())
            .collect::<BTreeSet<_>>();

        let mut file = BufWriter::new(File::create(path)?);
        writeln!(
            file,
            "scenario,composition{}",
            header.iter().map(|h| format!(",{}", h)).join("")
        )?;
        for run in self.runs.iter() {
            let values = header
                .iter()
                .map(|h| run.summary.get(h).map_or(String::new(), |v| v.to_string()))
                .join(",");
            writeln!(
                file,
                "{},{},{}",
                csv_field(&run.scenario),
                csv_field(&run.composition),
                values
            )?;
        }
        file.flush()?;
        Ok(())
    }
}
