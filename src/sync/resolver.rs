use crate::kobo::types::Attachment;

/// Find the attachment backing an image field value.
///
/// Only image attachments whose filename ends with `desired` qualify; among
/// those the highest id (the most recent upload) wins.
pub fn resolve<'a>(
    desired: &str,
    attachments: &'a [Attachment],
    submission_id: i64,
) -> Option<&'a Attachment> {
    let found = attachments
        .iter()
        .filter(|a| a.mimetype.starts_with("image"))
        .filter(|a| a.filename.ends_with(desired))
        .max_by_key(|a| a.id);
    if found.is_none() {
        tracing::debug!(
            submission_id,
            "No image attachment matches '{}' among {} attachment(s)",
            desired,
            attachments.len()
        );
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(id: i64, mimetype: &str, filename: &str) -> Attachment {
        Attachment {
            id,
            mimetype: mimetype.into(),
            filename: filename.into(),
            download_url: format!("media/{id}"),
            instance_id: 101,
        }
    }

    #[test]
    fn test_highest_id_wins() {
        let list = vec![
            attachment(1, "image/jpeg", "a_x.jpg"),
            attachment(5, "image/jpeg", "a_x.jpg"),
        ];
        assert_eq!(resolve("x.jpg", &list, 101).unwrap().id, 5);
    }

    #[test]
    fn test_order_does_not_matter() {
        let list = vec![
            attachment(9, "image/png", "user/att/x.jpg"),
            attachment(3, "image/png", "user/att/x.jpg"),
        ];
        assert_eq!(resolve("x.jpg", &list, 101).unwrap().id, 9);
    }

    #[test]
    fn test_non_image_mimetype_ignored() {
        let list = vec![
            attachment(7, "image/jpeg", "u/cat.jpg"),
            attachment(8, "application/octet-stream", "u/cat.jpg"),
        ];
        assert_eq!(resolve("cat.jpg", &list, 101).unwrap().id, 7);
    }

    #[test]
    fn test_suffix_not_substring() {
        let list = vec![attachment(2, "image/jpeg", "u/cat.jpg.bak")];
        assert!(resolve("cat.jpg", &list, 101).is_none());
    }

    #[test]
    fn test_empty_list() {
        assert!(resolve("cat.jpg", &[], 101).is_none());
    }
}
