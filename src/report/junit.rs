//! JUnit XML report generation.
//!
//! Writes the verdicts of the most recent run as JUnit XML, one
//! `<testsuite>` per gtest suite. The file is rewritten after every run, so
//! after a session it describes the last run.
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites name="gtest-sieve" tests="3" failures="1" errors="1" skipped="0" time="4.200">
//!   <testsuite name="MathTest" tests="3" failures="1" errors="1" skipped="0">
//!     <testcase classname="MathTest" name="Adds" time="0.010"/>
//!     <testcase classname="MathTest" name="Divides" time="0.020">
//!       <failure message="FAIL">math_test.cc:12: Expected equality</failure>
//!     </testcase>
//!     <testcase classname="MathTest" name="Overflows">
//!       <error message="CRASH">no result file</error>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```
//!
//! Crashes are reported as `<error>`, failures as `<failure>`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use super::Reporter;
use crate::framework::{Batch, TestVerdict, Verdict};
use crate::orchestrator::{Classification, RunResult};

/// Reporter that writes a JUnit XML file after every run.
///
/// Parent directories are created automatically if they don't exist.
///
/// # Example
///
/// ```
/// use gtest_sieve::report::JUnitReporter;
///
/// let reporter = JUnitReporter::new("test-results/junit.xml".into())
///     .with_name("base_unittests");
/// ```
pub struct JUnitReporter {
    output_path: PathBuf,
    name: String,
}

impl JUnitReporter {
    /// Creates a reporter writing to `output_path`.
    pub fn new(output_path: PathBuf) -> Self {
        Self {
            output_path,
            name: "gtest-sieve".to_string(),
        }
    }

    /// Sets the `name` attribute of the root element.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Generates JUnit XML for a run.
    pub fn generate_xml(&self, result: &RunResult) -> anyhow::Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let mut suites: BTreeMap<&str, Vec<&TestVerdict>> = BTreeMap::new();
        for verdict in result.verdicts.values() {
            suites
                .entry(verdict.test.suite().trim_end_matches('.'))
                .or_default()
                .push(verdict);
        }

        let all: Vec<&TestVerdict> = result.verdicts.values().collect();
        let mut testsuites = BytesStart::new("testsuites");
        testsuites.push_attribute(("name", self.name.as_str()));
        push_counts(&mut testsuites, &all);
        testsuites.push_attribute((
            "time",
            format!("{:.3}", result.duration.as_secs_f64()).as_str(),
        ));
        testsuites.push_attribute((
            "timestamp",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string().as_str(),
        ));
        writer.write_event(Event::Start(testsuites))?;

        for (suite, verdicts) in &suites {
            let mut testsuite = BytesStart::new("testsuite");
            testsuite.push_attribute(("name", *suite));
            push_counts(&mut testsuite, verdicts);
            writer.write_event(Event::Start(testsuite))?;

            for verdict in verdicts {
                write_testcase(&mut writer, suite, verdict)?;
            }

            writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

        Ok(String::from_utf8(writer.into_inner())?)
    }
}

fn push_counts(element: &mut BytesStart<'_>, verdicts: &[&TestVerdict]) {
    let count = |wanted: Verdict| verdicts.iter().filter(|v| v.verdict == wanted).count();
    element.push_attribute(("tests", verdicts.len().to_string().as_str()));
    element.push_attribute(("failures", count(Verdict::Fail).to_string().as_str()));
    element.push_attribute(("errors", count(Verdict::Crash).to_string().as_str()));
    element.push_attribute(("skipped", count(Verdict::Skipped).to_string().as_str()));
}

fn write_testcase<W: std::io::Write>(
    writer: &mut Writer<W>,
    suite: &str,
    verdict: &TestVerdict,
) -> anyhow::Result<()> {
    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", suite));
    testcase.push_attribute(("name", verdict.test.name()));
    if let Some(duration) = verdict.duration {
        testcase.push_attribute(("time", format!("{:.3}", duration.as_secs_f64()).as_str()));
    }

    let child = match verdict.verdict {
        Verdict::Fail => Some("failure"),
        Verdict::Crash => Some("error"),
        Verdict::Skipped => Some("skipped"),
        Verdict::Pass | Verdict::Unknown => None,
    };

    let Some(child) = child else {
        writer.write_event(Event::Empty(testcase))?;
        return Ok(());
    };

    writer.write_event(Event::Start(testcase))?;
    let mut element = BytesStart::new(child);
    element.push_attribute(("message", verdict.verdict.label()));
    match verdict.log.as_deref().map(strip_invalid).filter(|l| !l.is_empty()) {
        Some(log) => {
            writer.write_event(Event::Start(element))?;
            writer.write_event(Event::Text(BytesText::new(&log)))?;
            writer.write_event(Event::End(BytesEnd::new(child)))?;
        }
        None => writer.write_event(Event::Empty(element))?,
    }
    writer.write_event(Event::End(BytesEnd::new("testcase")))?;

    Ok(())
}

/// Removes characters XML 1.0 cannot carry.
fn strip_invalid(s: &str) -> String {
    s.chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}'))
        .collect()
}

#[async_trait]
impl Reporter for JUnitReporter {
    async fn on_run_start(&self, _run_index: usize, _total_tests: usize) {}

    async fn on_batch_complete(&self, _: &Batch, _: &Classification, _: usize) {}

    async fn on_run_complete(&self, result: &RunResult) {
        let xml = match self.generate_xml(result) {
            Ok(xml) => xml,
            Err(e) => {
                tracing::error!("Failed to generate JUnit XML: {}", e);
                return;
            }
        };

        if let Some(parent) = self.output_path.parent()
            && !parent.as_os_str().is_empty()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            tracing::error!("Failed to create output directory: {}", e);
            return;
        }

        if let Err(e) = tokio::fs::write(&self.output_path, xml).await {
            tracing::error!("Failed to write JUnit XML: {}", e);
        } else {
            tracing::info!("JUnit XML written to: {}", self.output_path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::Duration;

    use super::*;
    use crate::framework::TestId;
    use crate::framework::results::parse_gtest_xml;

    fn run_result(verdicts: Vec<TestVerdict>) -> RunResult {
        RunResult {
            run_index: 1,
            total_tests: verdicts.len(),
            verdicts: verdicts.into_iter().map(|v| (v.test.clone(), v)).collect(),
            failed: BTreeSet::new(),
            crashed: BTreeSet::new(),
            runtime_excluded: BTreeSet::new(),
            malformed_batches: 0,
            classified_batches: 1,
            interrupted: false,
            duration: Duration::from_millis(4200),
        }
    }

    fn sample() -> RunResult {
        run_result(vec![
            TestVerdict::new(TestId::new("MathTest", "Adds"), Verdict::Pass)
                .with_duration(Duration::from_millis(10)),
            TestVerdict::new(TestId::new("MathTest", "Divides"), Verdict::Fail)
                .with_log("math_test.cc:12: Expected <1> & got <2>"),
            TestVerdict::new(TestId::new("MathTest", "Overflows"), Verdict::Crash),
            TestVerdict::new(TestId::new("NetTest", "Later"), Verdict::Skipped),
        ])
    }

    #[test]
    fn test_generate_xml_counts() {
        let xml = JUnitReporter::new("junit.xml".into())
            .generate_xml(&sample())
            .unwrap();

        assert!(xml.contains(r#"<testsuites name="gtest-sieve" tests="4" failures="1" errors="1" skipped="1""#));
        assert!(xml.contains(r#"<testsuite name="MathTest" tests="3" failures="1" errors="1" skipped="0">"#));
        assert!(xml.contains(r#"<testcase classname="MathTest" name="Adds" time="0.010"/>"#));
        assert!(xml.contains("&lt;1&gt; &amp; got"));
    }

    #[test]
    fn test_generated_xml_reads_back() {
        let xml = JUnitReporter::new("junit.xml".into())
            .generate_xml(&sample())
            .unwrap();
        let cases = parse_gtest_xml(&xml).unwrap();

        let verdict = |name: &str| {
            cases
                .iter()
                .find(|c| c.test.to_string() == name)
                .map(|c| c.verdict)
        };
        assert_eq!(verdict("MathTest.Adds"), Some(Verdict::Pass));
        assert_eq!(verdict("MathTest.Divides"), Some(Verdict::Fail));
        assert_eq!(verdict("MathTest.Overflows"), Some(Verdict::Fail));
        assert_eq!(verdict("NetTest.Later"), Some(Verdict::Skipped));
    }

    #[test]
    fn test_strip_invalid() {
        assert_eq!(strip_invalid("a\u{0}b\u{1b}c"), "abc");
        assert_eq!(strip_invalid("line\nnext"), "line\nnext");
    }

    #[tokio::test]
    async fn test_on_run_complete_writes_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("junit.xml");
        let reporter = JUnitReporter::new(path.clone());

        reporter.on_run_complete(&sample()).await;

        let written = std::fs::read_to_string(path).unwrap();
        assert!(written.starts_with("<?xml"));
    }
}
