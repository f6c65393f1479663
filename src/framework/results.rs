//! Parsing of gtest XML result files into [`BatchOutcome`]s.
//!
//! A batch invocation is judged on three sources, in decreasing order of
//! trust:
//!
//! 1. The XML file written by `--gtest_output=xml:` (per-test verdicts)
//! 2. Progress markers on stdout (last test started, tests that printed OK)
//! 3. The exit code
//!
//! When the XML file is missing or empty the process is assumed to have
//! died mid-run: tests that printed `[       OK ]` keep their pass, every
//! other expected test becomes [`Verdict::Crash`].
//!
//! # Verdict Mapping
//!
//! | XML | Verdict |
//! |-----|---------|
//! | `<failure>` or `<error>` child | `Fail` |
//! | `<skipped>` child, `result="skipped"`, `status="notrun"` | `Skipped` |
//! | otherwise | `Pass` |

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use tracing::debug;

use super::gtest::{StdoutMarkers, scan_stdout};
use super::{BatchOutcome, FrameworkError, FrameworkResult, TestId, TestVerdict, Verdict};
use crate::provider::ExecResult;

/// Turns an invocation's result file and output into a [`BatchOutcome`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultParser;

impl ResultParser {
    pub fn new() -> Self {
        Self
    }

    /// Reads `result_path` and parses it against the expected tests.
    ///
    /// A missing or empty file yields a crash outcome. A file that exists
    /// but is not valid gtest XML is an error; callers treat it the same
    /// way by falling back to [`crash_outcome`](Self::crash_outcome).
    pub async fn parse(
        &self,
        exec: &ExecResult,
        result_path: &Path,
        expected: &[TestId],
    ) -> FrameworkResult<BatchOutcome> {
        let content = match tokio::fs::read_to_string(result_path).await {
            Ok(content) => Some(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(FrameworkError::Io(e)),
        };
        self.parse_content(exec, content.as_deref(), expected)
    }

    /// Parses result file contents that have already been read.
    pub fn parse_content(
        &self,
        exec: &ExecResult,
        content: Option<&str>,
        expected: &[TestId],
    ) -> FrameworkResult<BatchOutcome> {
        let markers = scan_stdout(&exec.stdout);

        let Some(xml) = content.filter(|c| !c.trim().is_empty()) else {
            debug!(
                "No result file for batch of {} (exit code {})",
                expected.len(),
                exec.exit_code
            );
            return Ok(build_crash_outcome(exec, expected, markers));
        };

        let cases = parse_gtest_xml(xml)?;
        let expected_set: BTreeSet<&TestId> = expected.iter().collect();

        let mut outcome = BatchOutcome {
            expected: expected.to_vec(),
            last_running: markers.last_running,
            result_file_present: true,
            exit_code: exec.exit_code,
            timed_out: exec.timed_out,
            ..Default::default()
        };

        for case in cases {
            if !expected_set.contains(&case.test) {
                if !outcome.unexpected.contains(&case.test) {
                    outcome.unexpected.push(case.test);
                }
                continue;
            }

            outcome.executed.insert(case.test.clone());
            // A repeated test keeps its worst verdict.
            let failed_before = outcome
                .verdicts
                .get(&case.test)
                .is_some_and(|v| v.verdict.is_failure());
            if !failed_before {
                outcome.verdicts.insert(case.test.clone(), case);
            }
        }

        Ok(outcome)
    }

    /// Builds the outcome of an invocation whose result file is unusable.
    pub fn crash_outcome(&self, exec: &ExecResult, expected: &[TestId]) -> BatchOutcome {
        build_crash_outcome(exec, expected, scan_stdout(&exec.stdout))
    }
}

fn build_crash_outcome(
    exec: &ExecResult,
    expected: &[TestId],
    markers: StdoutMarkers,
) -> BatchOutcome {
    let reason = if exec.timed_out {
        "timed out before reporting a result".to_string()
    } else {
        format!("exited with code {} before reporting a result", exec.exit_code)
    };

    let verdicts = expected
        .iter()
        .map(|test| {
            let verdict = if markers.passed.contains(test) {
                TestVerdict::new(test.clone(), Verdict::Pass)
            } else {
                TestVerdict::new(test.clone(), Verdict::Crash).with_log(reason.clone())
            };
            (test.clone(), verdict)
        })
        .collect();

    BatchOutcome {
        expected: expected.to_vec(),
        executed: BTreeSet::new(),
        verdicts,
        unexpected: Vec::new(),
        last_running: markers.last_running,
        result_file_present: false,
        exit_code: exec.exit_code,
        timed_out: exec.timed_out,
        well_formed: false,
    }
}

#[derive(Default)]
struct CaseBuilder {
    test: Option<TestId>,
    verdict: Option<Verdict>,
    message: Option<String>,
    body: String,
    duration: Option<Duration>,
}

impl CaseBuilder {
    fn from_start(e: &BytesStart<'_>) -> FrameworkResult<Self> {
        let mut name = None;
        let mut classname = None;
        let mut builder = CaseBuilder::default();

        for attr in e.attributes() {
            let attr = attr.map_err(|e| FrameworkError::ParseError(e.to_string()))?;
            let value = attr
                .unescape_value()
                .map_err(|e| FrameworkError::ParseError(e.to_string()))?
                .into_owned();
            match attr.key.as_ref() {
                b"name" => name = Some(value),
                b"classname" => classname = Some(value),
                b"time" => {
                    builder.duration = value
                        .parse::<f64>()
                        .ok()
                        .filter(|t| t.is_finite() && *t >= 0.0)
                        .map(Duration::from_secs_f64);
                }
                b"status" if value == "notrun" => builder.verdict = Some(Verdict::Skipped),
                b"result" if value == "skipped" || value == "suppressed" => {
                    builder.verdict = Some(Verdict::Skipped)
                }
                _ => {}
            }
        }

        match (classname, name) {
            (Some(classname), Some(name)) if !classname.is_empty() && !name.is_empty() => {
                builder.test = Some(TestId::new(classname, name));
                Ok(builder)
            }
            _ => Err(FrameworkError::ParseError(
                "testcase without name or classname".to_string(),
            )),
        }
    }

    fn mark(&mut self, e: &BytesStart<'_>) -> FrameworkResult<()> {
        let verdict = match e.name().as_ref() {
            b"failure" | b"error" => Verdict::Fail,
            b"skipped" => Verdict::Skipped,
            _ => return Ok(()),
        };

        if verdict == Verdict::Fail || self.verdict != Some(Verdict::Fail) {
            self.verdict = Some(verdict);
        }
        if verdict == Verdict::Fail && self.message.is_none() {
            for attr in e.attributes() {
                let attr = attr.map_err(|e| FrameworkError::ParseError(e.to_string()))?;
                if attr.key.as_ref() == b"message" {
                    let value = attr
                        .unescape_value()
                        .map_err(|e| FrameworkError::ParseError(e.to_string()))?;
                    self.message = Some(value.into_owned());
                }
            }
        }
        Ok(())
    }

    fn finish(self) -> Option<TestVerdict> {
        let test = self.test?;
        let verdict = self.verdict.unwrap_or(Verdict::Pass);
        let mut result = TestVerdict::new(test, verdict);
        result.duration = self.duration;

        if verdict == Verdict::Fail {
            let body = self.body.trim();
            if !body.is_empty() {
                result.log = Some(body.to_string());
            } else {
                result.log = self.message;
            }
        }
        Some(result)
    }
}

/// Parses gtest XML into per-test verdicts, in document order.
///
/// Truncated documents (the process died while the file was being
/// written) are rejected.
pub fn parse_gtest_xml(xml: &str) -> FrameworkResult<Vec<TestVerdict>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut results = Vec::new();
    let mut current: Option<CaseBuilder> = None;
    let mut depth = 0usize;
    let mut saw_root = false;
    let mut in_failure = false;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| FrameworkError::ParseError(e.to_string()))?;

        match event {
            Event::Start(e) => {
                depth += 1;
                match e.name().as_ref() {
                    b"testsuites" | b"testsuite" => saw_root = true,
                    b"testcase" => current = Some(CaseBuilder::from_start(&e)?),
                    b"failure" | b"error" => {
                        if let Some(case) = current.as_mut() {
                            case.mark(&e)?;
                            in_failure = true;
                        }
                    }
                    _ => {
                        if let Some(case) = current.as_mut() {
                            case.mark(&e)?;
                        }
                    }
                }
            }
            Event::Empty(e) => match e.name().as_ref() {
                b"testsuites" | b"testsuite" => saw_root = true,
                b"testcase" => {
                    if let Some(result) = CaseBuilder::from_start(&e)?.finish() {
                        results.push(result);
                    }
                }
                _ => {
                    if let Some(case) = current.as_mut() {
                        case.mark(&e)?;
                    }
                }
            },
            Event::End(e) => {
                depth = depth.saturating_sub(1);
                match e.name().as_ref() {
                    b"testcase" => {
                        if let Some(result) = current.take().and_then(CaseBuilder::finish) {
                            results.push(result);
                        }
                    }
                    b"failure" | b"error" => in_failure = false,
                    _ => {}
                }
            }
            Event::Text(t) if in_failure => {
                if let Some(case) = current.as_mut() {
                    let text = t
                        .unescape()
                        .map_err(|e| FrameworkError::ParseError(e.to_string()))?;
                    append_line(&mut case.body, &text);
                }
            }
            Event::CData(c) if in_failure => {
                if let Some(case) = current.as_mut() {
                    append_line(&mut case.body, &String::from_utf8_lossy(&c));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if depth != 0 {
        return Err(FrameworkError::ParseError(
            "result file is truncated".to_string(),
        ));
    }
    if !saw_root {
        return Err(FrameworkError::ParseError(
            "no testsuites element".to_string(),
        ));
    }

    Ok(results)
}

fn append_line(buf: &mut String, text: &str) {
    if !buf.is_empty() {
        buf.push('\n');
    }
    buf.push_str(text);
}
