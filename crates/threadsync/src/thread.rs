//! Render a comment thread as indented text.

use std::fmt::Write as _;
use std::path::Path;

use miette::{IntoDiagnostic, Result, WrapErr};
use threadsync_cache::{Comment, CommentTree, build_comment_tree};
use tracing::debug;

const INDENT: &str = "  ";
const MAX_PREVIEW_CHARS: usize = 80;

/// Read a JSON array of comments from `file` and print the thread.
pub fn run(file: &Path, focus: Option<&str>, max_depth: usize) -> Result<()> {
    let raw = std::fs::read(file)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to read {}", file.display()))?;
    let comments: Vec<Comment> = serde_json::from_slice(&raw)
        .into_diagnostic()
        .wrap_err("comments file is not a JSON array of comments")?;
    debug!(count = comments.len(), ?focus, max_depth, "building thread");

    let tree = build_comment_tree(&comments, focus, max_depth);
    if tree.is_empty() {
        println!("(no comments)");
    } else {
        print!("{}", render(&tree));
    }
    Ok(())
}

pub fn render(tree: &CommentTree<Comment>) -> String {
    let mut out = String::new();
    for (depth, node) in tree.walk_depth_first() {
        let indent = INDENT.repeat(depth);
        let Some(comment) = &node.comment else {
            let _ = writeln!(out, "{indent}[not loaded]");
            continue;
        };

        let text = if comment.effective_deleted() {
            "[deleted]".to_string()
        } else {
            preview(&comment.content)
        };
        let _ = write!(
            out,
            "{indent}[{}] {}: {}",
            comment.effective_score(),
            author_name(&comment.creator_ap_id),
            text
        );
        match node.immediate_children {
            0 => {}
            1 => out.push_str(" (1 reply)"),
            n => {
                let _ = write!(out, " ({n} replies)");
            }
        }
        out.push('\n');
    }
    out
}

/// Last path segment of an actor id, e.g. `ferris` for `https://x/u/ferris`.
fn author_name(ap_id: &str) -> &str {
    ap_id
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(ap_id)
}

fn preview(content: &str) -> String {
    let first = content.lines().next().unwrap_or_default();
    if first.chars().count() > MAX_PREVIEW_CHARS {
        let cut: String = first.chars().take(MAX_PREVIEW_CHARS).collect();
        format!("{cut}...")
    } else {
        first.to_string()
    }
}
