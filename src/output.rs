use std::io::{self, Write};

use colored::Colorize;
use tracing::{debug, warn};

use crate::query::{Hit, LineMatch, SearchQuery};

#[derive(Debug, Default, Clone)]
pub struct OutputOptions {
    pub no_color: bool,
    pub ackmate: bool,
    pub path_only: bool,
    pub no_group: bool,
}

/// Render verified hits the way the CLI prints them. `content_given`
/// distinguishes a content query (per-line match output) from a path-only
/// query (bare paths).
pub fn print_hits(
    out: &mut impl Write,
    query: &SearchQuery,
    hits: &[Hit],
    content_given: bool,
    opts: &OutputOptions,
) -> io::Result<()> {
    // helm and editors consume ackmate; color would corrupt it.
    let no_color = opts.no_color || opts.ackmate;

    for hit in hits {
        if opts.path_only || !content_given {
            print_path(out, hit, opts.ackmate, no_color)?;
            continue;
        }

        let matches = match query.matches(hit) {
            Ok(matches) => matches,
            Err(err) => {
                warn!(%err, path = ?hit.path, "unable to read hit; skipping");
                continue;
            }
        };
        if matches.is_empty() {
            debug!(path = ?hit.path, "no line matches; skipping");
            continue;
        }

        if opts.ackmate {
            print_ackmate(out, hit, &matches)?;
        } else if opts.no_group {
            for m in &matches {
                if no_color {
                    writeln!(out, "{}:{}: {}", hit.path.display(), m.line + 1, m.text)?;
                } else {
                    writeln!(
                        out,
                        "{}:{}: {}",
                        hit.path.display().to_string().green().bold(),
                        (m.line + 1).to_string().yellow().bold(),
                        highlight(m)
                    )?;
                }
            }
        } else {
            print_path(out, hit, false, no_color)?;
            for m in &matches {
                if no_color {
                    writeln!(out, "{}: {}", m.line + 1, m.text)?;
                } else {
                    writeln!(
                        out,
                        "{}: {}",
                        (m.line + 1).to_string().yellow().bold(),
                        highlight(m)
                    )?;
                }
            }
            writeln!(out)?;
        }
    }
    Ok(())
}

fn print_path(out: &mut impl Write, hit: &Hit, ackmate: bool, no_color: bool) -> io::Result<()> {
    let path = hit.path.display();
    if ackmate {
        writeln!(out, ":{path}")
    } else if no_color {
        writeln!(out, "{path}")
    } else {
        writeln!(out, "{}", path.to_string().green().bold())
    }
}

/// `:<path>` then one `<line>;<col> <len>[,<col> <len>]*:<text>` record per
/// matched line, closed by a blank line.
fn print_ackmate(out: &mut impl Write, hit: &Hit, matches: &[LineMatch]) -> io::Result<()> {
    writeln!(out, ":{}", hit.path.display())?;

    let mut current: Option<(usize, String, &str)> = None;
    for m in matches {
        match &mut current {
            Some((line, spans, _)) if *line == m.line => {
                spans.push_str(&format!(",{} {}", m.col, m.len));
            }
            _ => {
                if let Some((line, spans, text)) = current.take() {
                    writeln!(out, "{};{}:{}", line + 1, spans, text)?;
                }
                current = Some((m.line, format!("{} {}", m.col, m.len), m.text.as_str()));
            }
        }
    }
    if let Some((line, spans, text)) = current {
        writeln!(out, "{};{}:{}", line + 1, spans, text)?;
    }
    writeln!(out)
}

fn highlight(m: &LineMatch) -> String {
    let (pre, rest) = m.text.split_at(m.col.min(m.text.len()));
    let split = m.len.min(rest.len());
    let (hit, post) = rest.split_at(split);
    format!("{pre}{}{post}", hit.black().on_yellow())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use pretty_assertions::assert_eq;

    fn hit(path: &str) -> Hit {
        Hit {
            path: PathBuf::from(path),
            modified_time: chrono::DateTime::<chrono::Utc>::MIN_UTC,
        }
    }

    #[test]
    fn ackmate_groups_spans_per_line() {
        let matches = vec![
            LineMatch {
                line: 0,
                col: 0,
                len: 3,
                text: "foo bar foo".into(),
            },
            LineMatch {
                line: 0,
                col: 8,
                len: 3,
                text: "foo bar foo".into(),
            },
        ];
        let mut out = vec![];
        print_ackmate(&mut out, &hit("/tmp/a.txt"), &matches).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            ":/tmp/a.txt\n1;0 3,8 3:foo bar foo\n\n"
        );
    }

    #[test]
    fn ackmate_splits_lines() {
        let matches = vec![
            LineMatch {
                line: 1,
                col: 2,
                len: 1,
                text: "xxax".into(),
            },
            LineMatch {
                line: 3,
                col: 0,
                len: 1,
                text: "a".into(),
            },
        ];
        let mut out = vec![];
        print_ackmate(&mut out, &hit("/tmp/b.txt"), &matches).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            ":/tmp/b.txt\n2;2 1:xxax\n4;0 1:a\n\n"
        );
    }
}
