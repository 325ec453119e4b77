//! Plain-text extraction
//!
//! Reduces markdown and HTML sources to plain text before chunking. Block
//! structure is kept as blank lines so the paragraph splitter still sees it.

use ragforge_common::models::SourceFormat;
use regex_lite::Regex;
use std::sync::OnceLock;
use tracing::debug;

struct MarkdownRules {
    fenced_code: Regex,
    inline_code: Regex,
    headers: Regex,
    bold: Regex,
    italic: Regex,
    bold_underscore: Regex,
    italic_underscore: Regex,
    links: Regex,
}

struct HtmlRules {
    drop_blocks: Regex,
    block_breaks: Regex,
    line_breaks: Regex,
    tags: Regex,
    spaces: Regex,
}

fn markdown_rules() -> &'static MarkdownRules {
    static RULES: OnceLock<MarkdownRules> = OnceLock::new();
    RULES.get_or_init(|| MarkdownRules {
        fenced_code: Regex::new(r"(?s)```[a-zA-Z0-9_+-]*\n?(.*?)```").expect("valid regex"),
        inline_code: Regex::new(r"`([^`]+)`").expect("valid regex"),
        headers: Regex::new(r"(?m)^#{1,6}\s+").expect("valid regex"),
        bold: Regex::new(r"\*\*(.+?)\*\*").expect("valid regex"),
        italic: Regex::new(r"\*([^*\n]+?)\*").expect("valid regex"),
        bold_underscore: Regex::new(r"__(.+?)__").expect("valid regex"),
        italic_underscore: Regex::new(r"\b_([^_\n]+?)_\b").expect("valid regex"),
        links: Regex::new(r"!?\[([^\]]*)\]\([^)]*\)").expect("valid regex"),
    })
}

fn html_rules() -> &'static HtmlRules {
    static RULES: OnceLock<HtmlRules> = OnceLock::new();
    RULES.get_or_init(|| HtmlRules {
        drop_blocks: Regex::new(r"(?is)<(script|style|head)[^>]*>.*?</(script|style|head)>")
            .expect("valid regex"),
        block_breaks: Regex::new(r"(?i)</?(p|div|section|article|h[1-6]|li|ul|ol|table|tr|blockquote|pre)[^>]*>")
            .expect("valid regex"),
        line_breaks: Regex::new(r"(?i)<br\s*/?>").expect("valid regex"),
        tags: Regex::new(r"<[^>]+>").expect("valid regex"),
        spaces: Regex::new(r"[ \t]+").expect("valid regex"),
    })
}

/// Plain text of `content` in the given format
pub fn extract_text(content: &str, format: SourceFormat) -> String {
    let text = match format {
        SourceFormat::Text => return content.to_string(),
        SourceFormat::Markdown => markdown_to_text(content),
        SourceFormat::Html => html_to_text(content),
    };

    debug!(
        format = ?format,
        original_len = content.len(),
        extracted_len = text.len(),
        "Text extraction complete"
    );
    text
}

fn markdown_to_text(markdown: &str) -> String {
    let rules = markdown_rules();
    let text = rules.fenced_code.replace_all(markdown, "$1");
    let text = rules.inline_code.replace_all(&text, "$1");
    let text = rules.headers.replace_all(&text, "");
    let text = rules.bold.replace_all(&text, "$1");
    let text = rules.italic.replace_all(&text, "$1");
    let text = rules.bold_underscore.replace_all(&text, "$1");
    let text = rules.italic_underscore.replace_all(&text, "$1");
    let text = rules.links.replace_all(&text, "$1");
    text.trim().to_string()
}

fn html_to_text(html: &str) -> String {
    let rules = html_rules();
    let text = rules.drop_blocks.replace_all(html, "");
    let text = rules.block_breaks.replace_all(&text, "\n\n");
    let text = rules.line_breaks.replace_all(&text, "\n");
    let text = rules.tags.replace_all(&text, " ");
    let text = decode_entities(&text);

    let cleaned: Vec<String> = text
        .lines()
        .map(|line| rules.spaces.replace_all(line.trim(), " ").into_owned())
        .collect();
    cleaned.join("\n").trim().to_string()
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::split_paragraphs;

    #[test]
    fn test_plain_text_passes_through() {
        let text = "  keep *this* as is  ";
        assert_eq!(extract_text(text, SourceFormat::Text), text);
    }

    #[test]
    fn test_markdown_markers_removed() {
        let md = "# Title\n\nSome **bold** and *italic* with `code`.\n\nSee [the docs](https://example.com).\n\n```rust\nfn main() {}\n```";
        let text = extract_text(md, SourceFormat::Markdown);

        assert_eq!(
            split_paragraphs(&text),
            vec![
                "Title",
                "Some bold and italic with code.",
                "See the docs.",
                "fn main() {}",
            ]
        );
    }

    #[test]
    fn test_snake_case_words_survive() {
        let text = extract_text("use max_content_size here", SourceFormat::Markdown);
        assert_eq!(text, "use max_content_size here");
    }

    #[test]
    fn test_html_blocks_become_paragraphs() {
        let html = "<html><head><title>x</title></head><body><h1>Intro</h1><p>First &amp; foremost.</p><script>var a = 1;</script><p>Second<br>line</p></body></html>";
        let text = extract_text(html, SourceFormat::Html);

        assert_eq!(
            split_paragraphs(&text),
            vec!["Intro", "First & foremost.", "Second\nline"]
        );
    }
}
