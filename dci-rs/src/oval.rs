//! OVAL results to JUnit.
//!
//! An OVAL results document lists vulnerability definitions under
//! `oval_definitions/definitions` and the outcome of evaluating each of them
//! under `results/system/definitions`. A definition evaluating to `true`
//! means the system is affected and becomes a failed test case.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::path::Path;
use thiserror::Error;

use crate::junit::{JunitError, TestCase, TestResult, TestSuite, TestSuites};

const SUITE_NAME: &str = "Oval";
const CLASSNAME: &str = "oval";

#[derive(Debug, Error)]
pub enum OvalError {
    #[error("invalid OVAL document: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("element {element} has no {attribute} attribute")]
    MissingAttribute {
        element: &'static str,
        attribute: &'static str,
    },
    #[error("definition {0} has no result")]
    MissingResult(String),
    #[error(transparent)]
    Junit(#[from] JunitError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OvalReference {
    pub source: String,
    pub ref_id: String,
    pub ref_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OvalDefinition {
    pub id: String,
    pub version: String,
    pub class: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub references: Vec<OvalReference>,
    /// `true`, `false`, `unknown`, `not applicable`, ...
    pub result: Option<String>,
}

impl OvalDefinition {
    /// References, one `ref_id`/`ref_url`/`source` block each.
    pub fn message(&self) -> String {
        self.references
            .iter()
            .map(|r| {
                format!(
                    "ref_id: {}\n ref_url: {}\n source: {}\n",
                    r.ref_id, r.ref_url, r.source
                )
            })
            .collect()
    }

    fn test_case(&self) -> Result<TestCase, OvalError> {
        let result = self
            .result
            .as_deref()
            .ok_or_else(|| OvalError::MissingResult(self.id.clone()))?;
        let mut case = TestCase {
            classname: Some(CLASSNAME.to_string()),
            ..TestCase::new(&self.id)
        };
        match result.to_lowercase().as_str() {
            "true" => case.failures.push(TestResult::failure(self.message(), None)),
            "false" => case.system_out = Some(self.message()),
            other => case.skipped = Some(format!("OVAL result: {other}")),
        }
        Ok(case)
    }
}

fn attribute(element: &BytesStart, name: &str) -> Result<Option<String>, OvalError> {
    for attr in element.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        if attr.key.local_name().as_ref() == name.as_bytes() {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

fn required(
    element: &BytesStart,
    tag: &'static str,
    name: &'static str,
) -> Result<String, OvalError> {
    attribute(element, name)?.ok_or(OvalError::MissingAttribute {
        element: tag,
        attribute: name,
    })
}

fn local_name(element: &BytesStart) -> String {
    String::from_utf8_lossy(element.local_name().as_ref()).into_owned()
}

/// Definitions of an OVAL results document, in document order, with their
/// evaluation result.
pub fn parse_results(xml: &str) -> Result<Vec<OvalDefinition>, OvalError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut definitions: Vec<OvalDefinition> = Vec::new();
    let mut current: Option<usize> = None;
    let mut stack: Vec<String> = Vec::new();

    loop {
        let (element, is_empty) = match reader.read_event()? {
            Event::Start(e) => (e, false),
            Event::Empty(e) => (e, true),
            Event::Text(text) => {
                let in_metadata = stack.len() >= 2 && stack[stack.len() - 2] == "metadata";
                if let (Some(index), true) = (current, in_metadata) {
                    let text = text.unescape()?;
                    let definition = &mut definitions[index];
                    let field = match stack.last().map(String::as_str) {
                        Some("title") => &mut definition.title,
                        Some("description") => &mut definition.description,
                        _ => continue,
                    };
                    field.get_or_insert_with(String::new).push_str(&text);
                }
                continue;
            }
            Event::End(_) => {
                if stack.pop().as_deref() == Some("definition") {
                    current = None;
                }
                continue;
            }
            Event::Eof => break,
            _ => continue,
        };

        let name = local_name(&element);
        let parent = stack.last().map(String::as_str);
        let in_definitions = stack.iter().any(|n| n == "oval_definitions");
        let in_results = stack.iter().any(|n| n == "results");

        match (name.as_str(), parent) {
            ("definition", Some("definitions")) if in_definitions => {
                definitions.push(OvalDefinition {
                    id: required(&element, "definition", "id")?,
                    version: required(&element, "definition", "version")?,
                    class: required(&element, "definition", "class")?,
                    ..Default::default()
                });
                current = Some(definitions.len() - 1);
            }
            ("reference", Some("metadata")) if in_definitions => {
                if let Some(index) = current {
                    definitions[index].references.push(OvalReference {
                        source: required(&element, "reference", "source")?,
                        ref_id: required(&element, "reference", "ref_id")?,
                        ref_url: required(&element, "reference", "ref_url")?,
                    });
                }
            }
            ("definition", Some("definitions")) if in_results => {
                let id = required(&element, "definition", "definition_id")?;
                let result = required(&element, "definition", "result")?;
                if let Some(definition) = definitions.iter_mut().find(|d| d.id == id) {
                    definition.result = Some(result);
                }
            }
            _ => {}
        }

        if is_empty {
            if name == "definition" {
                current = None;
            }
        } else {
            stack.push(name);
        }
    }

    Ok(definitions)
}

/// One `Oval` suite with a test case per definition.
pub fn to_junit(definitions: &[OvalDefinition]) -> Result<TestSuites, OvalError> {
    let cases = definitions
        .iter()
        .map(OvalDefinition::test_case)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(TestSuites {
        name: None,
        suites: vec![TestSuite::new(SUITE_NAME, cases)],
    })
}

/// Read the OVAL results at `src` and write the JUnit report to `dest`.
pub fn convert(src: &Path, dest: &Path) -> Result<TestSuites, OvalError> {
    let xml = std::fs::read_to_string(src)?;
    let report = to_junit(&parse_results(&xml)?)?;
    std::fs::write(dest, report.to_pretty_xml()?)?;
    Ok(report)
}
