//! Parses `TASK_START…TASK_END`-delimited proposal blocks out of a seed
//! agent's free-text output (spec §4.8). Grounded on the teacher's
//! `extract_blocks`/`extract_field` substring scan in `pipeline.rs`, tightened
//! to the exact `TITLE:`/`DESCRIPTION:` contract spec.md demands: fields are
//! located by scanning at line granularity (never a naive substring search
//! from offset 0), so a `DESCRIPTION:` occurring inside the `TITLE:` value on
//! the same line is not mistaken for the real description line.

/// Extracts the text between each `start_marker`…`end_marker` pair, in
/// order of appearance.
pub fn extract_blocks<'a>(text: &'a str, start_marker: &str, end_marker: &str) -> Vec<&'a str> {
    let mut blocks = Vec::new();
    let mut remaining = text;
    while let Some(start) = remaining.find(start_marker) {
        remaining = &remaining[start + start_marker.len()..];
        match remaining.find(end_marker) {
            Some(end) => {
                blocks.push(remaining[..end].trim());
                remaining = &remaining[end + end_marker.len()..];
            }
            None => break,
        }
    }
    blocks
}

/// A proposed task title/description pulled out of one `TASK_START…TASK_END`
/// block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskProposal {
    pub title: String,
    pub description: String,
}

/// Parses one block's `TITLE:`/`DESCRIPTION:` lines. Tolerates CRLF line
/// endings, leading whitespace before the field keyword, and either field
/// appearing first. Returns `None` if no `TITLE:` line is found. A missing
/// `DESCRIPTION:` falls back to the title; an explicitly empty
/// `DESCRIPTION:` value stays empty.
pub fn parse_task_block(block: &str) -> Option<TaskProposal> {
    let mut title: Option<String> = None;
    let mut description: Option<String> = None;

    for raw_line in block.split('\n') {
        let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);
        let trimmed = line.trim_start();

        if title.is_none() {
            if let Some(rest) = trimmed.strip_prefix("TITLE:") {
                title = Some(rest.trim().to_string());
                continue;
            }
        }
        if description.is_none() {
            if let Some(rest) = trimmed.strip_prefix("DESCRIPTION:") {
                description = Some(rest.trim().to_string());
                continue;
            }
        }
    }

    let title = title?;
    let description = description.unwrap_or_else(|| title.clone());
    Some(TaskProposal { title, description })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_multiple_blocks_in_order() {
        let text = "noise\nTASK_START\nTITLE: a\nTASK_END\njunk\nTASK_START\nTITLE: b\nTASK_END\n";
        let blocks = extract_blocks(text, "TASK_START", "TASK_END");
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].contains("TITLE: a"));
        assert!(blocks[1].contains("TITLE: b"));
    }

    #[test]
    fn no_title_returns_none() {
        assert_eq!(parse_task_block("DESCRIPTION: only a body"), None);
    }

    #[test]
    fn missing_description_falls_back_to_title() {
        let p = parse_task_block("TITLE: Fix the thing").unwrap();
        assert_eq!(p.title, "Fix the thing");
        assert_eq!(p.description, "Fix the thing");
    }

    #[test]
    fn empty_description_stays_empty() {
        let p = parse_task_block("TITLE: Fix it\nDESCRIPTION:").unwrap();
        assert_eq!(p.description, "");
    }

    #[test]
    fn description_before_title_is_tolerated() {
        let p = parse_task_block("DESCRIPTION: the body\nTITLE: the title").unwrap();
        assert_eq!(p.title, "the title");
        assert_eq!(p.description, "the body");
    }

    #[test]
    fn crlf_and_leading_whitespace_are_tolerated() {
        let p = parse_task_block("TITLE: t\r\n   DESCRIPTION: d\r\n").unwrap();
        assert_eq!(p.title, "t");
        assert_eq!(p.description, "d");
    }

    #[test]
    fn description_substring_inside_title_line_is_not_mistaken_for_the_field() {
        let block = "TITLE: Fix DESCRIPTION: handling\nDESCRIPTION: actual body";
        let p = parse_task_block(block).unwrap();
        assert_eq!(p.title, "Fix DESCRIPTION: handling");
        assert_eq!(p.description, "actual body");
    }
}
