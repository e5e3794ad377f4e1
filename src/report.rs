//! Report files
//!
//! `index.json` maps agent → case → short verdict, each case gets a JSON
//! file with the full result, and `summary.txt` renders one row per case
//! and one column per agent. The summary is written even when every case
//! failed or was skipped.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::case_id::CaseId;
use crate::catalog::CaseCatalog;
use crate::error::Result;
use crate::outcome::{CloseOutcomeTag, OutcomeTag};
use crate::results::CaseResult;

pub const INDEX_FILE: &str = "index.json";
pub const SUMMARY_FILE: &str = "summary.txt";

/// agent → case → result
pub type ResultTable = BTreeMap<String, BTreeMap<CaseId, Arc<CaseResult>>>;

/// Lowercase, non-alphanumerics become separators, words joined with `_`
pub fn clean_for_filename(s: &str) -> String {
    let spaced: String = s
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { ' ' })
        .collect();
    spaced.split_whitespace().collect::<Vec<_>>().join("_")
}

pub fn case_file_name(agent: &str, id: &CaseId) -> String {
    format!("{}_case_{}.json", clean_for_filename(agent), id.file_stem())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IndexEntry {
    behavior: OutcomeTag,
    behavior_close: CloseOutcomeTag,
    remote_close_code: Option<u16>,
    duration: u64,
    #[serde(rename = "reportfile")]
    report_file: String,
}

/// What [`write_reports`] produced
#[derive(Debug, Clone)]
pub struct ReportFiles {
    pub index: PathBuf,
    pub summary: PathBuf,
    pub case_files: usize,
}

/// Write the index, per-case files and text summary into `outdir`
pub fn write_reports(outdir: &Path, catalog: &CaseCatalog, results: &ResultTable) -> Result<ReportFiles> {
    fs::create_dir_all(outdir)?;

    let mut index: BTreeMap<&str, BTreeMap<String, IndexEntry>> = BTreeMap::new();
    let mut case_files = 0;
    for (agent, cases) in results {
        let entries = index.entry(agent.as_str()).or_default();
        for (id, result) in cases {
            let file = case_file_name(agent, id);
            fs::write(outdir.join(&file), serde_json::to_vec_pretty(&**result)?)?;
            case_files += 1;
            entries.insert(
                id.to_string(),
                IndexEntry {
                    behavior: result.behavior,
                    behavior_close: result.behavior_close,
                    remote_close_code: result.facts.remote_close_code,
                    duration: result.duration,
                    report_file: file,
                },
            );
        }
    }

    let index_path = outdir.join(INDEX_FILE);
    fs::write(&index_path, serde_json::to_vec_pretty(&index)?)?;

    let summary_path = outdir.join(SUMMARY_FILE);
    fs::write(&summary_path, render_summary(catalog, results))?;

    tracing::info!(
        outdir = %outdir.display(),
        agents = results.len(),
        cases = case_files,
        "reports written"
    );
    Ok(ReportFiles {
        index: index_path,
        summary: summary_path,
        case_files,
    })
}

fn cell(result: Option<&Arc<CaseResult>>) -> String {
    let Some(r) = result else {
        return "-".into();
    };
    let mut text = r.behavior.to_string();
    if !matches!(r.behavior_close, CloseOutcomeTag::Ok | CloseOutcomeTag::Informational) {
        let _ = write!(text, " / {}", r.behavior_close);
    }
    if r.report_time {
        let _ = write!(text, " ({} ms)", r.duration);
    }
    if let Some(code) = r.facts.remote_close_code {
        let _ = write!(text, " [{}]", code);
    }
    text
}

/// Plain-text table of every result
pub fn render_summary(catalog: &CaseCatalog, results: &ResultTable) -> String {
    let agents: Vec<&String> = results.keys().collect();
    let ids: BTreeSet<&CaseId> = results.values().flat_map(|cases| cases.keys()).collect();

    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut titles: BTreeMap<usize, String> = BTreeMap::new();
    let mut last_category = None;
    let mut last_sub = None;
    for id in &ids {
        let category = CaseId::new(vec![id.category()]);
        if last_category.as_ref() != Some(&category) {
            if let Some(title) = catalog.title(&category) {
                titles.insert(rows.len(), format!("{} {}", category, title));
            }
            last_category = Some(category);
        }
        let sub = id.subcategory();
        if sub.is_some() && last_sub != sub {
            if let Some(title) = sub.as_ref().and_then(|s| catalog.title(s)) {
                let line = format!("{} {}", sub.as_ref().map(ToString::to_string).unwrap_or_default(), title);
                titles
                    .entry(rows.len())
                    .and_modify(|t| {
                        t.push('\n');
                        t.push_str(&line);
                    })
                    .or_insert(line);
            }
            last_sub = sub;
        }

        let mut row = vec![id.to_string()];
        row.extend(agents.iter().map(|agent| cell(results[*agent].get(*id))));
        rows.push(row);
    }

    let mut header = vec!["Case".to_string()];
    header.extend(agents.iter().map(|a| a.to_string()));
    let mut widths: Vec<usize> = header.iter().map(String::len).collect();
    for row in &rows {
        for (w, c) in widths.iter_mut().zip(row) {
            *w = (*w).max(c.len());
        }
    }

    let render = |cells: &[String]| -> String {
        cells
            .iter()
            .zip(&widths)
            .map(|(c, w)| format!("{:<w$}", c, w = *w))
            .collect::<Vec<_>>()
            .join(" | ")
            .trim_end()
            .to_string()
    };

    let mut out = String::new();
    let _ = writeln!(out, "{}", render(&header));
    let _ = writeln!(
        out,
        "{}",
        widths.iter().map(|w| "-".repeat(*w)).collect::<Vec<_>>().join("-+-")
    );
    for (i, row) in rows.iter().enumerate() {
        if let Some(title) = titles.get(&i) {
            let _ = writeln!(out, "{}", title);
        }
        let _ = writeln!(out, "{}", render(row));
    }
    if rows.is_empty() {
        let _ = writeln!(out, "(no results)");
    }

    let _ = writeln!(out);
    for agent in &agents {
        let mut counts: BTreeMap<OutcomeTag, usize> = BTreeMap::new();
        for r in results[*agent].values() {
            *counts.entry(r.behavior).or_default() += 1;
        }
        let totals: Vec<String> = counts.iter().map(|(tag, n)| format!("{} {}", tag, n)).collect();
        let _ = writeln!(out, "{}: {}", agent, totals.join(", "));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::tests::sample_result;

    fn table(entries: &[(&str, &str)]) -> ResultTable {
        let mut table = ResultTable::new();
        for (agent, id) in entries {
            let r = sample_result(agent, id);
            table.entry(agent.to_string()).or_default().insert(r.id.clone(), r);
        }
        table
    }

    #[test]
    fn test_clean_for_filename() {
        assert_eq!(clean_for_filename("AutobahnPython/0.6.0"), "autobahnpython_0_6_0");
        assert_eq!(clean_for_filename("  My Server!! "), "my_server");
        assert_eq!(
            case_file_name("Agent X", &"9.1.2".parse().unwrap()),
            "agent_x_case_9_1_2.json"
        );
    }

    #[test]
    fn test_write_reports() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = CaseCatalog::standard().unwrap();
        let results = table(&[("Agent A", "1.1.1"), ("Agent A", "1.1.2"), ("B", "1.1.1")]);
        let files = write_reports(dir.path(), &catalog, &results).unwrap();
        assert_eq!(files.case_files, 3);

        let index: serde_json::Value =
            serde_json::from_slice(&fs::read(&files.index).unwrap()).unwrap();
        let entry = &index["Agent A"]["1.1.2"];
        assert_eq!(entry["behavior"], "OK");
        assert_eq!(entry["remoteCloseCode"], 1000);
        assert_eq!(entry["reportfile"], "agent_a_case_1_1_2.json");
        assert!(dir.path().join("b_case_1_1_1.json").exists());

        let summary = fs::read_to_string(&files.summary).unwrap();
        assert!(summary.contains("Agent A"));
        assert!(summary.contains("1 Framing"));
    }

    #[test]
    fn test_summary_marks_missing_results() {
        let catalog = CaseCatalog::standard().unwrap();
        let results = table(&[("A", "1.1.1"), ("B", "2.1")]);
        let summary = render_summary(&catalog, &results);
        let row = summary.lines().find(|l| l.starts_with("2.1 ")).unwrap();
        assert!(row.contains('-'));
        assert!(summary.contains("A: OK 1"));
    }

    #[test]
    fn test_summary_without_results() {
        let catalog = CaseCatalog::standard().unwrap();
        let summary = render_summary(&catalog, &ResultTable::new());
        assert!(summary.contains("(no results)"));
    }
}
