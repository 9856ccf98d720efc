//! HTML rendering of tail output for the dashboard.

const ESC: char = '\u{1b}';

const PALETTE: [&str; 8] = [
    "000", "ff0000", "209805", "e8bf03", "0000ff", "ff00ff", "00ffee", "f0f0f0",
];
const BRIGHT_BLACK: &str = "888";

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(ch),
        }
    }
    out
}

fn sgr_style(code: u16) -> Option<String> {
    let style = match code {
        1 => "font-weight:bold".to_string(),
        2 => "opacity:0.5".to_string(),
        3 => "font-style:italic".to_string(),
        4 => "text-decoration:underline".to_string(),
        9 => "text-decoration:line-through".to_string(),
        30..=37 => format!("color:#{}", PALETTE[usize::from(code - 30)]),
        40..=47 => format!("background-color:#{}", PALETTE[usize::from(code - 40)]),
        90 => format!("color:#{BRIGHT_BLACK}"),
        91..=97 => format!("color:#{}", PALETTE[usize::from(code - 90)]),
        _ => return None,
    };
    Some(style)
}

fn is_reset(code: u16) -> bool {
    matches!(code, 0 | 21 | 22 | 23 | 24 | 27 | 29 | 39 | 49)
}

/// Converts SGR escapes into nested `<span style>` elements. Any reset code
/// closes every open span; other escape sequences are dropped.
pub fn ansi_to_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut open = 0usize;
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != ESC {
            out.push(ch);
            continue;
        }
        if chars.peek() != Some(&'[') {
            chars.next();
            continue;
        }
        chars.next();
        let mut params = String::new();
        let mut terminator = None;
        for next in chars.by_ref() {
            if ('\u{40}'..='\u{7e}').contains(&next) {
                terminator = Some(next);
                break;
            }
            params.push(next);
        }
        if terminator != Some('m') {
            continue;
        }
        let codes = if params.is_empty() {
            vec![0]
        } else {
            params
                .split(';')
                .map(|part| part.parse::<u16>().unwrap_or(0))
                .collect::<Vec<_>>()
        };
        for code in codes {
            if is_reset(code) {
                for _ in 0..open {
                    out.push_str("</span>");
                }
                open = 0;
            } else if let Some(style) = sgr_style(code) {
                out.push_str("<span style=\"");
                out.push_str(&style);
                out.push_str("\">");
                open += 1;
            }
        }
    }
    for _ in 0..open {
        out.push_str("</span>");
    }
    out
}

/// Renders one tail line: escaped, first whitespace made non-breaking,
/// colours converted, wrapped in a span.
pub fn tail_line_html(line: &str) -> String {
    let escaped = escape_html(line);
    let spaced = match escaped.char_indices().find(|(_, ch)| ch.is_whitespace()) {
        Some((idx, ch)) => format!(
            "{}&nbsp;{}",
            &escaped[..idx],
            &escaped[idx + ch.len_utf8()..]
        ),
        None => escaped,
    };
    format!("<span>{}</span>", ansi_to_html(&spaced))
}

pub fn tail_lines_html<S: AsRef<str>>(lines: &[S]) -> String {
    lines
        .iter()
        .map(|line| tail_line_html(line.as_ref()))
        .collect()
}

pub fn error_line_html(message: &str) -> String {
    format!(
        "<span style=\"color: #ff0000\">Error: {}</span>",
        escape_html(message)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_markup_and_marks_first_space() {
        assert_eq!(
            tail_line_html("a <b> & c"),
            "<span>a&nbsp;&lt;b&gt; &amp; c</span>"
        );
        assert_eq!(tail_line_html("word"), "<span>word</span>");
    }

    #[test]
    fn colours_become_spans_and_close_at_end() {
        assert_eq!(
            ansi_to_html("\u{1b}[31mred\u{1b}[0m plain"),
            "<span style=\"color:#ff0000\">red</span> plain"
        );
        assert_eq!(
            ansi_to_html("\u{1b}[1;32mok"),
            "<span style=\"font-weight:bold\"><span style=\"color:#209805\">ok</span></span>"
        );
        assert_eq!(ansi_to_html("\u{1b}[90mdim\u{1b}[m"), "<span style=\"color:#888\">dim</span>");
    }

    #[test]
    fn non_colour_sequences_are_dropped() {
        assert_eq!(ansi_to_html("\u{1b}[2Kclear\u{1b}[1A"), "clear");
    }

    #[test]
    fn batch_and_error_lines() {
        assert_eq!(tail_lines_html(&["a", "b"]), "<span>a</span><span>b</span>");
        assert_eq!(
            error_line_html("Log file \"/x\" does not exist."),
            "<span style=\"color: #ff0000\">Error: Log file &quot;/x&quot; does not exist.</span>"
        );
    }
}
