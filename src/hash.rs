//! FNV-1a content digests used as cache keys.

use std::hash::Hasher;

use fnv::FnvHasher;

use crate::model::{ContentPart, Message, Source};

/// How much of an inline media payload participates in the digest. Hashing
/// megabytes of base64 on every call would defeat the cache, so only a
/// prefix plus the total length is covered.
const MEDIA_PREFIX_BYTES: usize = 100;

/// 64-bit digest of an arbitrary string.
pub(crate) fn digest_str(s: &str) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(s.as_bytes());
    hasher.finish()
}

/// 64-bit digest of a message sequence, covering each message's role and
/// every content part's tag and payload. Text and URLs are hashed in full;
/// inline media data only up to [`MEDIA_PREFIX_BYTES`] plus its length.
pub(crate) fn digest_messages(messages: &[Message]) -> u64 {
    let mut hasher = FnvHasher::default();
    for msg in messages {
        hasher.write(msg.role.as_str().as_bytes());
        hasher.write_u8(0x1f);
        for part in msg.parts.iter() {
            write_part(&mut hasher, part);
        }
        hasher.write_u8(0x1e);
    }
    hasher.finish()
}

fn write_part(hasher: &mut FnvHasher, part: &ContentPart) {
    hasher.write(part.kind().to_string().as_bytes());
    hasher.write_u8(0x1f);
    match part {
        ContentPart::Text { text } => hasher.write(text.as_bytes()),
        _ => {
            if let Some(source) = part.source() {
                write_source(hasher, source);
            }
        }
    }
    hasher.write_u8(0x1f);
}

fn write_source(hasher: &mut FnvHasher, source: &Source) {
    match source {
        Source::Url { url } => {
            hasher.write_u8(b'u');
            hasher.write(url.as_bytes());
        }
        Source::Base64 { media_type, data } => {
            hasher.write_u8(b'b');
            hasher.write(media_type.as_bytes());
            hasher.write_u8(0x1f);
            let prefix = &data.as_bytes()[..data.len().min(MEDIA_PREFIX_BYTES)];
            hasher.write(prefix);
            hasher.write_u64(data.len() as u64);
        }
    }
}
