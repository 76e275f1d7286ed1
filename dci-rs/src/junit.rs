//! JUnit XML report model.
//!
//! Follows the Jenkins flavour of the schema: `testsuites` containing
//! `testsuite`s containing `testcase`s. Attributes with no value are left
//! out of the document.

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JunitError {
    #[error("failed to write XML: {0}")]
    Xml(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResultKind {
    Failure,
    Error,
}

impl ResultKind {
    fn tag(&self) -> &'static str {
        match self {
            ResultKind::Failure => "failure",
            ResultKind::Error => "error",
        }
    }
}

/// Failure or error details of a test case.
#[derive(Debug, Clone, PartialEq)]
pub struct TestResult {
    pub kind: ResultKind,
    pub message: Option<String>,
    /// Defaults to the element tag when unset.
    pub result_type: Option<String>,
    pub output: Option<String>,
}

impl TestResult {
    pub fn failure(message: impl Into<String>, output: Option<String>) -> Self {
        TestResult {
            kind: ResultKind::Failure,
            message: Some(message.into()),
            result_type: None,
            output,
        }
    }

    pub fn error(message: impl Into<String>, output: Option<String>) -> Self {
        TestResult {
            kind: ResultKind::Error,
            message: Some(message.into()),
            result_type: None,
            output,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestCase {
    pub name: String,
    pub assertions: Option<u32>,
    pub classname: Option<String>,
    pub status: Option<String>,
    /// Duration in seconds.
    pub time: Option<f64>,
    pub errors: Vec<TestResult>,
    pub failures: Vec<TestResult>,
    pub skipped: Option<String>,
    pub system_out: Option<String>,
    pub system_err: Option<String>,
    pub is_disabled: bool,
}

impl TestCase {
    pub fn new(name: impl Into<String>) -> Self {
        TestCase {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn is_failure(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn is_error(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestSuite {
    pub name: String,
    pub hostname: Option<String>,
    pub id: Option<String>,
    pub package: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub properties: BTreeMap<String, String>,
    pub cases: Vec<TestCase>,
    pub system_out: Option<String>,
    pub system_err: Option<String>,
}

impl TestSuite {
    pub fn new(name: impl Into<String>, cases: Vec<TestCase>) -> Self {
        TestSuite {
            name: name.into(),
            cases,
            ..Default::default()
        }
    }

    pub fn disabled(&self) -> usize {
        self.cases.iter().filter(|c| c.is_disabled).count()
    }

    pub fn errors(&self) -> usize {
        self.cases.iter().filter(|c| c.is_error()).count()
    }

    pub fn failures(&self) -> usize {
        self.cases.iter().filter(|c| c.is_failure()).count()
    }

    pub fn skipped(&self) -> usize {
        self.cases.iter().filter(|c| c.is_skipped()).count()
    }

    pub fn tests(&self) -> usize {
        self.cases.len()
    }

    pub fn time(&self) -> f64 {
        self.cases.iter().filter_map(|c| c.time).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestSuites {
    pub name: Option<String>,
    pub suites: Vec<TestSuite>,
}

impl TestSuites {
    pub fn disabled(&self) -> usize {
        self.suites.iter().map(TestSuite::disabled).sum()
    }

    pub fn errors(&self) -> usize {
        self.suites.iter().map(TestSuite::errors).sum()
    }

    pub fn failures(&self) -> usize {
        self.suites.iter().map(TestSuite::failures).sum()
    }

    pub fn tests(&self) -> usize {
        self.suites.iter().map(TestSuite::tests).sum()
    }

    pub fn time(&self) -> f64 {
        self.suites.iter().map(TestSuite::time).sum()
    }

    /// Serialize to an indented XML document.
    pub fn to_pretty_xml(&self) -> Result<String, JunitError> {
        let mut xml = XmlOut {
            writer: Writer::new_with_indent(Vec::new(), b' ', 2),
        };
        xml.emit(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        xml.open(
            "testsuites",
            attributes([
                ("disabled", Some(self.disabled().to_string())),
                ("errors", Some(self.errors().to_string())),
                ("failures", Some(self.failures().to_string())),
                ("name", self.name.clone()),
                ("tests", Some(self.tests().to_string())),
                ("time", Some(format_time(self.time()))),
            ]),
        )?;
        for suite in &self.suites {
            write_suite(&mut xml, suite)?;
        }
        xml.close("testsuites")?;

        String::from_utf8(xml.writer.into_inner()).map_err(|e| JunitError::Xml(e.to_string()))
    }
}

fn format_time(seconds: f64) -> String {
    format!("{seconds:.3}")
}

fn attributes<const N: usize>(
    pairs: [(&'static str, Option<String>); N],
) -> Vec<(&'static str, String)> {
    pairs
        .into_iter()
        .filter_map(|(k, v)| v.map(|v| (k, v)))
        .collect()
}

struct XmlOut {
    writer: Writer<Vec<u8>>,
}

impl XmlOut {
    fn emit(&mut self, event: Event<'_>) -> Result<(), JunitError> {
        self.writer
            .write_event(event)
            .map_err(|e| JunitError::Xml(e.to_string()))
    }

    fn start<'a>(tag: &'a str, attrs: &'a [(&'static str, String)]) -> BytesStart<'a> {
        let mut start = BytesStart::new(tag);
        for (k, v) in attrs {
            start.push_attribute((*k, v.as_str()));
        }
        start
    }

    fn open(&mut self, tag: &str, attrs: Vec<(&'static str, String)>) -> Result<(), JunitError> {
        let start = XmlOut::start(tag, &attrs);
        self.emit(Event::Start(start))
    }

    fn close(&mut self, tag: &str) -> Result<(), JunitError> {
        self.emit(Event::End(BytesEnd::new(tag)))
    }

    fn empty(&mut self, tag: &str, attrs: Vec<(&'static str, String)>) -> Result<(), JunitError> {
        let start = XmlOut::start(tag, &attrs);
        self.emit(Event::Empty(start))
    }

    /// `<tag attrs>text</tag>`, or an empty element without text.
    fn text_element(
        &mut self,
        tag: &str,
        attrs: Vec<(&'static str, String)>,
        text: Option<&str>,
    ) -> Result<(), JunitError> {
        match text {
            Some(text) if !text.is_empty() => {
                self.open(tag, attrs)?;
                self.emit(Event::Text(BytesText::new(text)))?;
                self.close(tag)
            }
            _ => self.empty(tag, attrs),
        }
    }
}

fn write_suite(xml: &mut XmlOut, suite: &TestSuite) -> Result<(), JunitError> {
    xml.open(
        "testsuite",
        attributes([
            ("disabled", Some(suite.disabled().to_string())),
            ("errors", Some(suite.errors().to_string())),
            ("failures", Some(suite.failures().to_string())),
            ("hostname", suite.hostname.clone()),
            ("id", suite.id.clone()),
            ("name", Some(suite.name.clone())),
            ("package", suite.package.clone()),
            ("skipped", Some(suite.skipped().to_string())),
            ("tests", Some(suite.tests().to_string())),
            ("time", Some(format_time(suite.time()))),
            (
                "timestamp",
                suite
                    .timestamp
                    .map(|t| t.format("%Y-%m-%dT%H:%M:%S").to_string()),
            ),
        ]),
    )?;

    if !suite.properties.is_empty() {
        xml.open("properties", Vec::new())?;
        for (name, value) in &suite.properties {
            xml.empty(
                "property",
                vec![("name", name.clone()), ("value", value.clone())],
            )?;
        }
        xml.close("properties")?;
    }

    for case in &suite.cases {
        write_case(xml, case)?;
    }

    if let Some(out) = &suite.system_out {
        xml.text_element("system-out", Vec::new(), Some(out))?;
    }
    if let Some(err) = &suite.system_err {
        xml.text_element("system-err", Vec::new(), Some(err))?;
    }

    xml.close("testsuite")
}

fn write_case(xml: &mut XmlOut, case: &TestCase) -> Result<(), JunitError> {
    xml.open(
        "testcase",
        attributes([
            ("assertions", case.assertions.map(|a| a.to_string())),
            ("classname", case.classname.clone()),
            ("name", Some(case.name.clone())),
            ("status", case.status.clone()),
            ("time", case.time.map(format_time)),
        ]),
    )?;

    if let Some(skipped) = &case.skipped {
        xml.text_element("skipped", Vec::new(), Some(skipped))?;
    }

    for result in case.errors.iter().chain(case.failures.iter()) {
        let tag = result.kind.tag();
        xml.text_element(
            tag,
            attributes([
                ("message", result.message.clone()),
                (
                    "type",
                    Some(result.result_type.clone().unwrap_or_else(|| tag.to_string())),
                ),
            ]),
            result.output.as_deref(),
        )?;
    }

    if let Some(out) = case.system_out.as_deref().filter(|s| !s.is_empty()) {
        xml.text_element("system-out", Vec::new(), Some(out))?;
    }
    if let Some(err) = case.system_err.as_deref().filter(|s| !s.is_empty()) {
        xml.text_element("system-err", Vec::new(), Some(err))?;
    }

    xml.close("testcase")
}
