// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Markdown → Telegram-HTML-subset conversion.
//!
//! Telegram's HTML parse mode accepts only a small tag set.  This converter
//! parses Markdown and emits exactly that subset:
//!
//! - kept: `b`, `i`, `s`, `code`, `pre`, `a href`, `blockquote`
//! - unwrapped with spacing/bullets: paragraphs, headings, lists
//! - dropped entirely: images, tables, horizontal rules, raw HTML
//!
//! Runs of three or more newlines collapse to two.

use pulldown_cmark::{Event, Options, Parser, Tag, TagEnd};

pub fn to_html_subset(markdown: &str) -> String {
    let options = Options::ENABLE_STRIKETHROUGH | Options::ENABLE_TABLES;
    let parser = Parser::new_ext(markdown, options);

    let mut out = String::with_capacity(markdown.len());
    // Depth of containers whose content is dropped (images, tables).
    let mut suppress = 0usize;
    // Ordered-list counters; `None` marks an unordered list level.
    let mut lists: Vec<Option<u64>> = Vec::new();

    for event in parser {
        if suppress > 0 {
            match event {
                Event::Start(Tag::Image { .. }) | Event::Start(Tag::Table(_)) => suppress += 1,
                Event::End(TagEnd::Image) | Event::End(TagEnd::Table) => suppress -= 1,
                _ => {}
            }
            continue;
        }

        match event {
            Event::Start(tag) => match tag {
                Tag::Strong => out.push_str("<b>"),
                Tag::Emphasis => out.push_str("<i>"),
                Tag::Strikethrough => out.push_str("<s>"),
                Tag::Link { dest_url, .. } => {
                    out.push_str("<a href=\"");
                    out.push_str(&escape(&dest_url));
                    out.push_str("\">");
                }
                // Language hints are dropped; Telegram ignores them anyway.
                Tag::CodeBlock(_) => out.push_str("<pre>"),
                Tag::BlockQuote(_) => out.push_str("<blockquote>"),
                Tag::List(start) => lists.push(start),
                Tag::Item => {
                    match lists.last_mut() {
                        Some(Some(n)) => {
                            out.push_str(&format!("{n}. "));
                            *n += 1;
                        }
                        _ => out.push_str("• "),
                    }
                }
                Tag::Image { .. } | Tag::Table(_) => suppress += 1,
                // Paragraphs, headings, and the rest unwrap to bare text.
                _ => {}
            },
            Event::End(tag) => match tag {
                TagEnd::Strong => out.push_str("</b>"),
                TagEnd::Emphasis => out.push_str("</i>"),
                TagEnd::Strikethrough => out.push_str("</s>"),
                TagEnd::Link => out.push_str("</a>"),
                TagEnd::CodeBlock => out.push_str("</pre>\n\n"),
                TagEnd::BlockQuote(_) => out.push_str("</blockquote>\n\n"),
                TagEnd::Paragraph => out.push_str("\n\n"),
                TagEnd::Heading(_) => out.push_str("\n\n"),
                TagEnd::List(_) => {
                    lists.pop();
                    if lists.is_empty() {
                        out.push('\n');
                    }
                }
                TagEnd::Item => out.push('\n'),
                _ => {}
            },
            Event::Text(text) => out.push_str(&escape(&text)),
            Event::Code(code) => {
                out.push_str("<code>");
                out.push_str(&escape(&code));
                out.push_str("</code>");
            }
            // Raw HTML (script, style, anything the author wrote) is dropped.
            Event::Html(_) | Event::InlineHtml(_) => {}
            Event::SoftBreak => out.push('\n'),
            Event::HardBreak => out.push('\n'),
            // Horizontal rules have no Telegram equivalent.
            Event::Rule => {}
            _ => {}
        }
    }

    collapse_newlines(out.trim_end())
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// Collapse runs of three or more newlines to exactly two.
fn collapse_newlines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut run = 0usize;
    for c in text.chars() {
        if c == '\n' {
            run += 1;
            if run <= 2 {
                out.push(c);
            }
        } else {
            run = 0;
            out.push(c);
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
