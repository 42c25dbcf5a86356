//! Embedded pages, templates and images.
//!
//! Templates use `{{name}}` placeholders. [`fill`] substitutes them in a
//! single pass, so placeholder text appearing inside a substituted value is
//! copied verbatim and never expanded again.

/// Main bulletin board page, installed once per board directory.
pub const MAIN_PAGE: &str = include_str!("../assets/bulletin_board.php");

/// Page returned for an accepted post. Contains `{{url}}` twice.
pub const RESPONSE_OK_TEMPLATE: &str = include_str!("../assets/response_ok.html");

/// Page returned for a rejected post. Contains `{{message}}`.
pub const RESPONSE_ERROR_TEMPLATE: &str = include_str!("../assets/response_error.html");

/// Content entry for posts carrying an image url.
pub const ENTRY_WITH_IMAGE_TEMPLATE: &str = include_str!("../assets/entry_with_image.html");

/// Content entry for posts without an image.
pub const ENTRY_WITHOUT_IMAGE_TEMPLATE: &str = include_str!("../assets/entry_without_image.html");

pub const OK_PNG: &[u8] = include_bytes!("../assets/ok.png");

pub const ERROR_PNG: &[u8] = include_bytes!("../assets/error.png");

/// Replace every `{{key}}` in `template` with its value from `values`.
///
/// Unknown placeholders are left untouched.
pub fn fill(template: &str, values: &[(&str, &str)]) -> String {
    let extra: usize = values.iter().map(|(_, value)| value.len()).sum();
    let mut out = String::with_capacity(template.len() + extra);
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];

        match after_open.find("}}") {
            Some(close) => {
                let key = &after_open[..close];
                match values.iter().find(|(name, _)| *name == key) {
                    Some((_, value)) => out.push_str(value),
                    None => out.push_str(&rest[open..open + 2 + close + 2]),
                }
                rest = &after_open[close + 2..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }

    out.push_str(rest);
    out
}

/// Escape text for inclusion in html element content.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Render the page for an accepted post.
pub fn render_ok_page(url: &str) -> String {
    fill(RESPONSE_OK_TEMPLATE, &[("url", url)])
}

/// Render the page for a rejected post. `message` is escaped.
pub fn render_error_page(message: &str) -> String {
    fill(RESPONSE_ERROR_TEMPLATE, &[("message", &escape_html(message))])
}
