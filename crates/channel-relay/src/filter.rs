//! Decides whether a fetched message is worth relaying.

use crate::cursor::Cursor;
use crate::feed::{Attachment, Item};
use crate::template::split_extension;

/// Extensions accepted as images, compared case-insensitively.
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp", "tiff"];

/// True if the attachment looks like an image by content type or extension
pub fn is_image(attachment: &Attachment) -> bool {
    let by_type = attachment
        .content_type
        .as_deref()
        .is_some_and(|ct| ct.trim().to_ascii_lowercase().starts_with("image/"));

    if by_type {
        return true;
    }

    let (_, ext) = split_extension(&attachment.filename);
    let ext = ext.trim_start_matches('.');
    IMAGE_EXTENSIONS
        .iter()
        .any(|allowed| ext.eq_ignore_ascii_case(allowed))
}

/// First image attachment of the item, if any.
pub fn select_image(item: &Item) -> Option<&Attachment> {
    item.attachments.iter().find(|a| is_image(a))
}

/// Strictly newer than the cursor. Everything is newer than an empty cursor.
pub fn is_newer(item: &Item, cursor: Cursor) -> bool {
    match cursor.last() {
        Some(last) => item.id > last,
        None => true,
    }
}
