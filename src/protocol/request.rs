//! Request encoding and validation.
//!
//! The server accepts a request only if every byte is printable or
//! whitespace, every `<...>` sequence is one of a handful of whitelisted
//! tags, and the `user=` / optional `img=` header lines are well formed.

/// Tags a message may contain, compared case-sensitively.
pub const ALLOWED_TAGS: [&str; 5] = ["<strong>", "</strong>", "<em>", "</em>", "<br/>"];

/// Maximum number of characters of an offending tag echoed back.
const MAX_TAG_ECHO: usize = 15;

const USER_KEYWORD: &str = "user=";
const IMAGE_KEYWORD: &str = "img=";

/// A validated bulletin board post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Post {
    pub user: String,
    pub image: Option<String>,
    pub message: String,
}

impl Post {
    pub fn new(user: impl Into<String>, image: Option<String>, message: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            image,
            message: message.into(),
        }
    }

    /// Encode the post in request wire form.
    ///
    /// No trailing newline is added; the client signals the end of the
    /// message by half-closing the connection.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            USER_KEYWORD.len() + self.user.len() + self.message.len() + 2,
        );
        out.extend_from_slice(USER_KEYWORD.as_bytes());
        out.extend_from_slice(self.user.as_bytes());
        out.push(b'\n');
        if let Some(image) = &self.image {
            out.extend_from_slice(IMAGE_KEYWORD.as_bytes());
            out.extend_from_slice(image.as_bytes());
            out.push(b'\n');
        }
        out.extend_from_slice(self.message.as_bytes());
        out
    }
}

/// Reason a request was not accepted.
///
/// The text is plain; callers embedding it in html must escape it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("request contains non printable character 0x{byte:02X} at position {position}")]
    NonPrintable { byte: u8, position: usize },

    #[error("request contains unsupported html tag {0}")]
    UnsupportedTag(String),

    #[error("keyword 'user' is missing in the first line of the request")]
    MissingUser,

    #[error("line with keyword 'user' is not newline terminated")]
    UserNotTerminated,

    #[error("line with keyword 'img' is not newline terminated")]
    ImageNotTerminated,

    #[error("keyword 'user' is present but the username is missing")]
    EmptyUser,

    #[error("message is empty")]
    EmptyMessage,

    #[error("keyword 'img' is present but the url of the image is missing")]
    EmptyImage,
}

/// Validate a raw request and split it into its fields.
pub fn validate(input: &[u8]) -> Result<Post, Rejection> {
    if let Some(position) = input.iter().position(|&b| !is_print_or_space(b)) {
        return Err(Rejection::NonPrintable {
            byte: input[position],
            position,
        });
    }

    // Only ASCII remains at this point.
    let text = std::str::from_utf8(input).map_err(|e| Rejection::NonPrintable {
        byte: input[e.valid_up_to()],
        position: e.valid_up_to(),
    })?;

    check_tags(text)?;
    split(text)
}

/// `isprint() || isspace()` in the C locale.
fn is_print_or_space(b: u8) -> bool {
    matches!(b, 0x20..=0x7e | b'\t' | b'\n' | 0x0b | 0x0c | b'\r')
}

/// Find the next `<...>` sequence at or after `from`.
///
/// Returns the byte range of the tag including both delimiters.
fn next_tag(text: &str, from: usize) -> Option<(usize, usize)> {
    let start = from + text[from..].find('<')?;
    let end = start + text[start..].find('>')?;
    Some((start, end + 1))
}

fn check_tags(text: &str) -> Result<(), Rejection> {
    let mut cursor = 0;
    while let Some((start, end)) = next_tag(text, cursor) {
        let tag = &text[start..end];
        if !ALLOWED_TAGS.contains(&tag) {
            return Err(Rejection::UnsupportedTag(abbreviate_tag(tag)));
        }
        cursor = end;
    }
    Ok(())
}

/// Shorten an overlong tag to a recognizable prefix followed by `...>`.
fn abbreviate_tag(tag: &str) -> String {
    if tag.len() < MAX_TAG_ECHO {
        return tag.to_string();
    }
    format!("{}...>", &tag[..MAX_TAG_ECHO - 4])
}

fn split(text: &str) -> Result<Post, Rejection> {
    let rest = text
        .strip_prefix(USER_KEYWORD)
        .ok_or(Rejection::MissingUser)?;
    let (user, rest) = rest.split_once('\n').ok_or(Rejection::UserNotTerminated)?;

    let (image, message) = match rest.strip_prefix(IMAGE_KEYWORD) {
        Some(rest) => {
            let (image, message) = rest.split_once('\n').ok_or(Rejection::ImageNotTerminated)?;
            (Some(image), message)
        }
        None => (None, rest),
    };

    if user.is_empty() {
        return Err(Rejection::EmptyUser);
    }
    if message.is_empty() {
        return Err(Rejection::EmptyMessage);
    }
    if image.is_some_and(str::is_empty) {
        return Err(Rejection::EmptyImage);
    }

    Ok(Post {
        user: user.to_string(),
        image: image.map(str::to_string),
        message: message.to_string(),
    })
}
