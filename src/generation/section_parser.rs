//! Incremental reconstruction of description / script / explanation sections
//! from a streamed completion.

use serde::Serialize;
use serde_json::{json, Value};

pub const DESCRIPTION_MARKER: &str = "[DESCRIPTION]";
pub const EXPLANATION_MARKER: &str = "[EXPLANATION]";
pub const CODE_FENCE: &str = "```";
pub const GENERATED_SCRIPT_HEADER: &str = "// Generated ImageJ Macro";
pub const GENERATION_COMPLETE_MESSAGE: &str = "Macro generation complete";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Description,
    Script,
    Explanation,
}

impl Section {
    pub const CYCLE: [Section; 3] = [Section::Description, Section::Script, Section::Explanation];

    pub fn next(self) -> Self {
        let index = Self::CYCLE
            .iter()
            .position(|section| *section == self)
            .unwrap_or(0);
        Self::CYCLE[(index + 1) % Self::CYCLE.len()]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Section::Description => "description",
            Section::Script => "script",
            Section::Explanation => "explanation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    SectionChange { section: Section, content: String },
    Message { content: String, section: Section },
    Complete { message: String },
    Error { error: String },
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::SectionChange { .. } => "section_change",
            StreamEvent::Message { .. } => "message",
            StreamEvent::Complete { .. } => "complete",
            StreamEvent::Error { .. } => "error",
        }
    }

    pub fn data(&self) -> Value {
        match self {
            StreamEvent::SectionChange { section, content } => {
                json!({ "section": section.as_str(), "content": content })
            }
            StreamEvent::Message { content, section } => {
                json!({ "content": content, "section": section.as_str() })
            }
            StreamEvent::Complete { message } => json!({ "message": message }),
            StreamEvent::Error { error } => json!({ "error": error }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Boundary {
    at: usize,
    len: usize,
}

type TransitionPredicate = fn(&str, Section) -> Option<Boundary>;

fn description_marker(delta: &str, _section: Section) -> Option<Boundary> {
    marker_boundary(delta, DESCRIPTION_MARKER)
}

fn fence_opens_script(delta: &str, section: Section) -> Option<Boundary> {
    if section != Section::Description {
        return None;
    }
    delta.find(CODE_FENCE).map(|at| Boundary {
        at,
        len: CODE_FENCE.len(),
    })
}

fn explanation_marker(delta: &str, _section: Section) -> Option<Boundary> {
    marker_boundary(delta, EXPLANATION_MARKER)
}

fn marker_boundary(delta: &str, marker: &str) -> Option<Boundary> {
    let at = delta.find(marker)?;
    let bold_at = at
        .checked_sub(2)
        .filter(|start| delta.get(*start..at) == Some("**"));
    Some(match bold_at {
        Some(start) => Boundary {
            at: start,
            len: marker.len() + 2,
        },
        None => Boundary {
            at,
            len: marker.len(),
        },
    })
}

const TRANSITIONS: [TransitionPredicate; 3] =
    [description_marker, fence_opens_script, explanation_marker];

/// One parser per generation. Feed each delta to [`SectionParser::push`], then
/// end with [`SectionParser::finish`] or [`SectionParser::fail`].
#[derive(Debug)]
pub struct SectionParser {
    section: Section,
    content: String,
}

impl Default for SectionParser {
    fn default() -> Self {
        Self::new()
    }
}

impl SectionParser {
    pub fn new() -> Self {
        Self {
            section: Section::Description,
            content: String::new(),
        }
    }

    pub fn section(&self) -> Section {
        self.section
    }

    /// A delta holding a boundary is split there: the prefix closes the
    /// current section, the rest (marker included) seeds the next one.
    pub fn push(&mut self, delta: &str) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if delta.is_empty() {
            return events;
        }

        let mut pending = delta;
        let mut scan_from = 0usize;
        let mut transitioned = false;
        loop {
            let Some(boundary) = self.find_boundary(&pending[scan_from..]) else {
                self.content.push_str(pending);
                if !transitioned || !pending.trim().is_empty() {
                    events.push(StreamEvent::Message {
                        content: pending.to_string(),
                        section: self.section,
                    });
                }
                return events;
            };
            let at = scan_from + boundary.at;

            let opens_description = pending[at..].trim_start_matches('*').starts_with(DESCRIPTION_MARKER);
            if self.section == Section::Description
                && opens_description
                && self.content.trim().is_empty()
                && pending[..at].trim().is_empty()
            {
                // Leading marker of the first section, not a boundary.
                scan_from = at + boundary.len;
                continue;
            }

            self.content.push_str(&pending[..at]);
            events.push(StreamEvent::SectionChange {
                section: self.section,
                content: clean_section_content(self.section, self.content.as_str()),
            });
            self.section = self.section.next();
            self.content.clear();
            pending = &pending[at..];
            scan_from = boundary.len;
            transitioned = true;
        }
    }

    /// Flushes the open section (when it holds anything) and closes the stream.
    pub fn finish(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if !self.content.trim().is_empty() {
            events.push(StreamEvent::SectionChange {
                section: self.section,
                content: clean_section_content(self.section, self.content.as_str()),
            });
            self.content.clear();
        }
        events.push(StreamEvent::Complete {
            message: String::from(GENERATION_COMPLETE_MESSAGE),
        });
        events
    }

    pub fn fail(self, error: impl Into<String>) -> StreamEvent {
        StreamEvent::Error {
            error: error.into(),
        }
    }

    fn find_boundary(&self, text: &str) -> Option<Boundary> {
        TRANSITIONS
            .iter()
            .filter_map(|predicate| predicate(text, self.section))
            .min_by_key(|boundary| boundary.at)
    }
}

pub fn clean_section_content(section: Section, content: &str) -> String {
    let stripped = content
        .replace("**[DESCRIPTION]**", "")
        .replace(DESCRIPTION_MARKER, "")
        .replace("**[EXPLANATION]**", "")
        .replace(EXPLANATION_MARKER, "");
    if section != Section::Script {
        return stripped.trim().to_string();
    }

    let mut lines = stripped
        .lines()
        .map(strip_fences)
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>();
    if let Some(first) = lines.first() {
        if !first.trim_start().starts_with("//") {
            lines.insert(0, String::from(GENERATED_SCRIPT_HEADER));
        }
    }
    lines.join("\n")
}

/// Removes fence delimiters from one line. An opening fence also drops the
/// language tag that follows it.
fn strip_fences(line: &str) -> String {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix(CODE_FENCE) {
        let tag_len = rest
            .find(|ch: char| !ch.is_ascii_alphanumeric() && ch != '_' && ch != '-')
            .unwrap_or(rest.len());
        return rest[tag_len..].replace(CODE_FENCE, "");
    }
    line.replace(CODE_FENCE, "")
}
