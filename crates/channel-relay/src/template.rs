//! Destination file naming.
//!
//! A rename template is plain text with `{placeholder}` tokens, for example
//! `{timestamp}_{message_id}_{filename}`. Supported placeholders:
//!
//! | token          | value                                              |
//! |----------------|----------------------------------------------------|
//! | `{timestamp}`  | message creation time, UTC, `%Y%m%dT%H%M%SZ`        |
//! | `{message_id}` | message snowflake                                  |
//! | `{filename}`   | original attachment filename                       |
//! | `{base}`       | filename without extension                         |
//! | `{ext}`        | extension including the dot, e.g. `.png`           |
//! | `{author_id}`  | author snowflake                                   |
//! | `{channel_id}` | channel snowflake                                  |
//!
//! `{{` and `}}` produce literal braces. If the expanded name has no
//! extension, the attachment's extension is appended.

use crate::error::TemplateError;
use crate::feed::{Attachment, Item};

pub const DEFAULT_TEMPLATE: &str = "{timestamp}_{message_id}_{filename}";

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placeholder {
    Timestamp,
    MessageId,
    Filename,
    Base,
    Ext,
    AuthorId,
    ChannelId,
}

impl Placeholder {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "timestamp" => Some(Self::Timestamp),
            "message_id" => Some(Self::MessageId),
            "filename" => Some(Self::Filename),
            "base" => Some(Self::Base),
            "ext" => Some(Self::Ext),
            "author_id" => Some(Self::AuthorId),
            "channel_id" => Some(Self::ChannelId),
            _ => None,
        }
    }
}

/// Template inputs derived from one message and its selected attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderContext {
    pub timestamp: String,
    pub message_id: String,
    pub filename: String,
    pub base: String,
    pub ext: String,
    pub author_id: String,
    pub channel_id: String,
}

impl RenderContext {
    pub fn new(item: &Item, attachment: &Attachment) -> Self {
        let (base, ext) = split_extension(&attachment.filename);
        // A bare trailing dot is not an extension.
        let ext = if ext.len() <= 1 {
            attachment
                .content_type
                .as_deref()
                .map(extension_for_content_type)
                .unwrap_or_default()
        } else {
            ext.to_string()
        };

        Self {
            timestamp: item.created_at.format(TIMESTAMP_FORMAT).to_string(),
            message_id: item.id.to_string(),
            filename: attachment.filename.clone(),
            base: base.to_string(),
            ext,
            author_id: item.author_id.clone(),
            channel_id: item.channel_id.clone(),
        }
    }

    /// Context used for dry-run validation at startup.
    pub fn sample() -> Self {
        Self {
            timestamp: "20240102T030405Z".to_string(),
            message_id: "1200000000000000042".to_string(),
            filename: "image.png".to_string(),
            base: "image".to_string(),
            ext: ".png".to_string(),
            author_id: "1100000000000000001".to_string(),
            channel_id: "1000000000000000077".to_string(),
        }
    }

    fn value(&self, placeholder: Placeholder) -> &str {
        match placeholder {
            Placeholder::Timestamp => &self.timestamp,
            Placeholder::MessageId => &self.message_id,
            Placeholder::Filename => &self.filename,
            Placeholder::Base => &self.base,
            Placeholder::Ext => &self.ext,
            Placeholder::AuthorId => &self.author_id,
            Placeholder::ChannelId => &self.channel_id,
        }
    }
}

/// A rename template that has passed a dry-run expansion.
#[derive(Debug, Clone)]
pub struct NameResolver {
    template: String,
}

impl NameResolver {
    pub fn new(template: impl Into<String>) -> Result<Self, TemplateError> {
        let template = template.into();
        validate(&template)?;
        Ok(Self { template })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn resolve(&self, ctx: &RenderContext) -> Result<String, TemplateError> {
        resolve(&self.template, ctx)
    }
}

/// Dry-run the template against [`RenderContext::sample`].
pub fn validate(template: &str) -> Result<String, TemplateError> {
    resolve(template, &RenderContext::sample())
}

/// Expand `template` and make sure the result carries an extension.
pub fn resolve(template: &str, ctx: &RenderContext) -> Result<String, TemplateError> {
    let mut name = expand(template, ctx)?;
    if name.is_empty() {
        return Err(TemplateError::EmptyName);
    }

    let (base_len, ext_len) = {
        let (base, ext) = split_extension(&name);
        (base.len(), ext.len())
    };
    // No extension, or only a bare trailing dot.
    if ext_len <= 1 {
        name.truncate(base_len);
        name.push_str(&ctx.ext);
    }

    Ok(name)
}

fn expand(template: &str, ctx: &RenderContext) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len() + 32);
    let mut rest = template;
    let mut offset = 0;

    while let Some(idx) = rest.find(|c: char| c == '{' || c == '}') {
        out.push_str(&rest[..idx]);
        let position = offset + idx;
        let tail = &rest[idx..];

        let consumed = if tail.starts_with("{{") {
            out.push('{');
            2
        } else if tail.starts_with("}}") {
            out.push('}');
            2
        } else if tail.starts_with('}') {
            return Err(TemplateError::UnmatchedClose { position });
        } else {
            let inner = &tail[1..];
            let close = inner
                .find('}')
                .ok_or(TemplateError::Unclosed { position })?;
            let name = &inner[..close];
            if name.contains('{') {
                return Err(TemplateError::Unclosed { position });
            }

            let placeholder =
                Placeholder::from_name(name).ok_or_else(|| TemplateError::UnknownPlaceholder {
                    name: name.to_string(),
                })?;
            out.push_str(&sanitize_for_filename(ctx.value(placeholder)));
            close + 2
        };

        rest = &tail[consumed..];
        offset = position + consumed;
    }

    out.push_str(rest);
    Ok(out)
}

/// Split a name into `(base, ext)` where `ext` keeps its leading dot.
///
/// Only the last path component is considered and leading dots do not start
/// an extension, so `.png` has none while `a.` has `.`.
pub fn split_extension(name: &str) -> (&str, &str) {
    let file_start = name.rfind(|c: char| c == '/' || c == '\\').map_or(0, |i| i + 1);
    let file = &name[file_start..];

    match file.rfind('.') {
        Some(dot) if !file[..dot].trim_start_matches('.').is_empty() => {
            let split = file_start + dot;
            (&name[..split], &name[split..])
        }
        _ => (name, ""),
    }
}

fn extension_for_content_type(content_type: &str) -> String {
    let subtype = content_type
        .split(';')
        .next()
        .map(|mime| mime.trim().to_ascii_lowercase())
        .and_then(|mime| {
            mime.strip_prefix("image/")
                .and_then(|s| s.split('+').next())
                .map(str::to_string)
        })
        .unwrap_or_default();

    if subtype.is_empty() {
        String::new()
    } else {
        format!(".{}", subtype)
    }
}

/// Replace characters that would escape the target directory or upset
/// common filesystems.
fn sanitize_for_filename(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}
