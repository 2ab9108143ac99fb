//! Object key layout for derived and extracted files.

use mproc_models::MediaId;

/// `{userId}/{mediaId}/thumbnail.jpg`
pub fn thumbnail_key(user_id: &str, media_id: &MediaId) -> String {
    format!("{}/{}/thumbnail.jpg", user_id, media_id)
}

/// `{userId}/{mediaId}/versions/{label}.{ext}`
pub fn version_key(user_id: &str, media_id: &MediaId, label: &str, ext: &str) -> String {
    format!("{}/{}/versions/{}.{}", user_id, media_id, label, ext)
}

/// `{userId}/{batchId}/entries/{mediaId}/{filename}`, keeping only the
/// final path component of `filename`.
pub fn entry_key(user_id: &str, batch_id: &str, media_id: &MediaId, filename: &str) -> String {
    format!(
        "{}/{}/entries/{}/{}",
        user_id,
        batch_id,
        media_id,
        base_name(filename)
    )
}

fn base_name(filename: &str) -> &str {
    let name = filename
        .rsplit(&['/', '\\'][..])
        .find(|s| !s.is_empty())
        .unwrap_or("");
    if name.is_empty() || name == "." || name == ".." {
        "file"
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let media = MediaId::from_string("m1");
        assert_eq!(thumbnail_key("u1", &media), "u1/m1/thumbnail.jpg");
        assert_eq!(version_key("u1", &media, "720p", "mp4"), "u1/m1/versions/720p.mp4");
        assert_eq!(
            entry_key("u1", "b1", &media, "holiday/day 1/IMG_01.jpg"),
            "u1/b1/entries/m1/IMG_01.jpg"
        );
        assert_eq!(entry_key("u1", "b1", &media, "../"), "u1/b1/entries/m1/file");
    }
}
