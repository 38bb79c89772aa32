//! Heading-based splitting of documentation files
//!
//! Markdown and reStructuredText files become one `document` chunk per
//! section; plain text stays whole. Section headings end up in
//! `metadata.section` and in the chunk's identity scope, so two sections
//! with the same title get ordinal suffixes to stay distinct.

/// One section of a documentation file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocSection {
    pub heading: String,
    /// 1-indexed, inclusive
    pub start_line: u32,
    pub end_line: u32,
    pub body: String,
}

/// Extensions routed through the splitter instead of the code parser
pub fn is_doc_file(path: &str) -> bool {
    let ext = path.rsplit('.').next().unwrap_or("").to_lowercase();
    matches!(ext.as_str(), "md" | "markdown" | "rst" | "txt")
}

/// Split a documentation file into sections.
pub fn split(path: &str, source: &str) -> Vec<DocSection> {
    let ext = path.rsplit('.').next().unwrap_or("").to_lowercase();
    let mut sections = match ext.as_str() {
        "md" | "markdown" => split_markdown(source),
        "rst" => split_rst(source),
        _ => split_plain(path, source),
    };
    sections.retain(|s| !s.body.trim().is_empty() || !s.heading.is_empty());
    dedupe_headings(&mut sections);
    sections
}

fn file_stem(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name).to_owned()
}

fn split_markdown(source: &str) -> Vec<DocSection> {
    let mut sections: Vec<DocSection> = Vec::new();
    let mut current: Option<DocSection> = None;
    let mut in_code_fence = false;

    for (idx, line) in source.lines().enumerate() {
        let line_no = idx as u32 + 1;

        if line.trim_start().starts_with("```") {
            in_code_fence = !in_code_fence;
        }

        let heading = (!in_code_fence)
            .then(|| line.strip_prefix('#'))
            .flatten()
            .map(|rest| rest.trim_start_matches('#').trim());

        match heading {
            Some(title) if !title.is_empty() => {
                if let Some(mut done) = current.take() {
                    done.end_line = line_no - 1;
                    sections.push(done);
                }
                current = Some(DocSection {
                    heading: title.to_owned(),
                    start_line: line_no,
                    end_line: line_no,
                    body: String::new(),
                });
            }
            _ => match current.as_mut() {
                Some(section) => {
                    section.body.push_str(line);
                    section.body.push('\n');
                    section.end_line = line_no;
                }
                None => {
                    // Preamble before the first heading
                    current = Some(DocSection {
                        heading: String::new(),
                        start_line: line_no,
                        end_line: line_no,
                        body: format!("{line}\n"),
                    });
                }
            },
        }
    }
    if let Some(section) = current.take() {
        sections.push(section);
    }
    sections
}

fn is_rst_underline(line: &str) -> bool {
    let trimmed = line.trim_end();
    trimmed.len() >= 3
        && trimmed
            .chars()
            .all(|c| matches!(c, '=' | '-' | '~' | '^' | '"' | '\'' | '#' | '*' | '+'))
        && trimmed.chars().collect::<std::collections::HashSet<_>>().len() == 1
}

fn split_rst(source: &str) -> Vec<DocSection> {
    let lines: Vec<&str> = source.lines().collect();
    let mut sections: Vec<DocSection> = Vec::new();
    let mut current: Option<DocSection> = None;

    let mut i = 0;
    while i < lines.len() {
        let line_no = i as u32 + 1;
        let is_heading = i + 1 < lines.len()
            && !lines[i].trim().is_empty()
            && is_rst_underline(lines[i + 1])
            && lines[i + 1].trim_end().len() >= lines[i].trim_end().len().min(3);

        if is_heading {
            if let Some(mut done) = current.take() {
                done.end_line = line_no.saturating_sub(1);
                sections.push(done);
            }
            current = Some(DocSection {
                heading: lines[i].trim().to_owned(),
                start_line: line_no,
                end_line: line_no + 1,
                body: String::new(),
            });
            i += 2;
            continue;
        }

        match current.as_mut() {
            Some(section) => {
                section.body.push_str(lines[i]);
                section.body.push('\n');
                section.end_line = line_no;
            }
            None => {
                current = Some(DocSection {
                    heading: String::new(),
                    start_line: line_no,
                    end_line: line_no,
                    body: format!("{}\n", lines[i]),
                });
            }
        }
        i += 1;
    }
    if let Some(section) = current.take() {
        sections.push(section);
    }
    sections
}

fn split_plain(path: &str, source: &str) -> Vec<DocSection> {
    let line_count = source.lines().count().max(1) as u32;
    vec![DocSection {
        heading: file_stem(path),
        start_line: 1,
        end_line: line_count,
        body: source.to_owned(),
    }]
}

fn dedupe_headings(sections: &mut [DocSection]) {
    use std::collections::HashMap;
    let mut seen: HashMap<String, u32> = HashMap::new();
    for section in sections.iter_mut() {
        if section.heading.is_empty() {
            section.heading = "preamble".to_owned();
        }
        let count = seen.entry(section.heading.clone()).or_insert(0);
        *count += 1;
        if *count > 1 {
            section.heading = format!("{} ({})", section.heading, *count);
        }
    }
}

#[cfg(test)]
#[allow(clippy::str_to_string)]
mod tests {
    use super::*;

    #[test]
    fn test_markdown_split_on_headings() {
        let source = "Intro text.\n\n# Install\n\nRun cargo.\n\n## Usage\n\nCall it.\n";
        let sections = split("README.md", source);

        let headings: Vec<&str> = sections.iter().map(|s| s.heading.as_str()).collect();
        assert_eq!(headings, vec!["preamble", "Install", "Usage"]);
        assert!(sections[1].body.contains("Run cargo."));
        assert_eq!(sections[1].start_line, 3);
        assert_eq!(sections[2].heading, "Usage");
    }

    #[test]
    fn test_markdown_ignores_hashes_in_code_fences() {
        let source = "# Top\n\n```bash\n# not a heading\necho hi\n```\n\n# Next\n";
        let sections = split("guide.md", source);
        let headings: Vec<&str> = sections.iter().map(|s| s.heading.as_str()).collect();
        assert_eq!(headings, vec!["Top", "Next"]);
    }

    #[test]
    fn test_duplicate_headings_get_ordinals() {
        let source = "# Setup\none\n# Setup\ntwo\n";
        let sections = split("dup.md", source);
        let headings: Vec<&str> = sections.iter().map(|s| s.heading.as_str()).collect();
        assert_eq!(headings, vec!["Setup", "Setup (2)"]);
    }

    #[test]
    fn test_rst_underlined_headings() {
        let source = "Overview\n========\n\nBody text.\n\nDetails\n-------\n\nMore text.\n";
        let sections = split("doc.rst", source);
        let headings: Vec<&str> = sections.iter().map(|s| s.heading.as_str()).collect();
        assert_eq!(headings, vec!["Overview", "Details"]);
        assert!(sections[0].body.contains("Body text."));
    }

    #[test]
    fn test_plain_text_is_one_chunk() {
        let source = "line one\nline two\n";
        let sections = split("notes/todo.txt", source);
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].heading, "todo");
        assert_eq!(sections[0].end_line, 2);
    }

    #[test]
    fn test_is_doc_file() {
        assert!(is_doc_file("README.md"));
        assert!(is_doc_file("docs/index.rst"));
        assert!(is_doc_file("notes.txt"));
        assert!(!is_doc_file("src/main.rs"));
    }
}
